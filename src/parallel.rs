//! The parallel query executor: a pool of worker threads sharing a
//! read-only index.
//!
//! The driver stays single-threaded and does only the disk-bound work
//! (loading posting and record blobs); workers do all blob parsing,
//! tallying, and scoring. Results come back on a shared channel and are
//! released in the original query order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::featurizer::{Featurizer, Token};
use crate::index::{format_hits, SearchOptions};
use crate::record::{Record, SearchHit};
use crate::score::{ExtractFn, FieldGrams, ScoreFn};
use crate::storage::{Backend, BackendKind, BackendRegistry};

/// In-flight queries are bounded to this many per worker.
const QUEUE_DEPTH: usize = 3;

enum Work {
    /// One posting blob for a query. The worker accumulates hit counts
    /// until `total` messages have arrived for the query, then emits the
    /// top-`n` candidate rows and discards its per-query state. A `None`
    /// blob contributes nothing but still counts toward `total`.
    CountTokens {
        query_id: usize,
        total: usize,
        blob: Option<Vec<u8>>,
        n: usize,
    },
    /// Candidate record blobs for a query, scored against the
    /// pre-extracted query features; emits the top-`limit`.
    ScoreRecords {
        query_id: usize,
        features: Vec<FieldGrams>,
        extract: ExtractFn,
        score: ScoreFn,
        limit: usize,
        blobs: Vec<(u64, Vec<u8>)>,
    },
    Stop,
}

enum WorkResult {
    Candidates(Vec<u64>),
    Scored(Vec<(f64, u64, Record)>),
    Failed(String),
}

#[derive(Default)]
struct Tally {
    votes: HashMap<u64, u32>,
    seen: usize,
    poisoned: bool,
}

struct Worker {
    kind: BackendKind,
    inbox: Receiver<Work>,
    results: Sender<(usize, WorkResult)>,
    tallies: HashMap<usize, Tally>,
}

impl Worker {
    fn run(mut self) {
        while let Ok(work) = self.inbox.recv() {
            match work {
                Work::Stop => {
                    debug!("worker received sentinel, stopping");
                    break;
                }
                Work::CountTokens {
                    query_id,
                    total,
                    blob,
                    n,
                } => {
                    if let Some(result) = self.count_tokens(query_id, total, blob, n) {
                        if self.results.send((query_id, result)).is_err() {
                            break;
                        }
                    }
                }
                Work::ScoreRecords {
                    query_id,
                    features,
                    extract,
                    score,
                    limit,
                    blobs,
                } => {
                    let result = self.score_records(&features, &extract, &score, limit, blobs);
                    if self.results.send((query_id, result)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn count_tokens(
        &mut self,
        query_id: usize,
        total: usize,
        blob: Option<Vec<u8>>,
        n: usize,
    ) -> Option<WorkResult> {
        let mut failure = None;
        let tally = self.tallies.entry(query_id).or_default();
        tally.seen += 1;
        if let Some(blob) = blob {
            if !tally.poisoned {
                match self.kind.decode_token_blob(&blob) {
                    Ok(ids) => {
                        for id in ids {
                            *tally.votes.entry(id).or_insert(0) += 1;
                        }
                    }
                    Err(e) => {
                        // poison the query: the failure is reported once
                        // and the remaining blob messages are swallowed
                        tally.poisoned = true;
                        tally.votes.clear();
                        failure = Some(WorkResult::Failed(format!("token blob decode: {e}")));
                    }
                }
            }
        }
        if tally.seen >= total.max(1) {
            let tally = self.tallies.remove(&query_id)?;
            if tally.poisoned {
                return failure;
            }
            let mut ranked: Vec<(u64, u32)> = tally.votes.into_iter().collect();
            ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            ranked.truncate(n);
            return Some(WorkResult::Candidates(
                ranked.into_iter().map(|(id, _)| id).collect(),
            ));
        }
        failure
    }

    fn score_records(
        &self,
        features: &[FieldGrams],
        extract: &ExtractFn,
        score: &ScoreFn,
        limit: usize,
        blobs: Vec<(u64, Vec<u8>)>,
    ) -> WorkResult {
        let extract = extract.as_ref();
        let score = score.as_ref();
        let mut scored = Vec::with_capacity(blobs.len());
        for (rownum, blob) in blobs {
            match self.kind.decode_record_blob(&blob) {
                Ok(rec) => {
                    let s = score(features, &extract(&rec.fields));
                    scored.push((s, rownum, rec));
                }
                Err(e) => return WorkResult::Failed(format!("record blob decode: {e}")),
            }
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(limit);
        WorkResult::Scored(scored)
    }
}

struct WorkerPool {
    inboxes: Vec<Sender<Work>>,
    results: Receiver<(usize, WorkResult)>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(kind: BackendKind, n_workers: usize) -> Result<Self> {
        let (result_tx, result_rx) = unbounded();
        let mut inboxes = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let (work_tx, work_rx) = unbounded();
            let worker = Worker {
                kind,
                inbox: work_rx,
                results: result_tx.clone(),
                tallies: HashMap::new(),
            };
            let handle = thread::Builder::new()
                .name(format!("polymr-worker-{i}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::Worker(format!("spawn worker: {e}")))?;
            inboxes.push(work_tx);
            handles.push(handle);
        }
        debug!(workers = n_workers, "started worker pool");
        Ok(WorkerPool {
            inboxes,
            results: result_rx,
            handles,
        })
    }

    /// Broadcast stop sentinels and join every worker. The timeout, when
    /// supplied, bounds each sentinel send; pending work is best-effort
    /// drained by the workers before they exit.
    fn shutdown(&mut self, timeout: Option<Duration>) {
        if self.handles.is_empty() {
            return;
        }
        for (i, inbox) in self.inboxes.iter().enumerate() {
            let sent = match timeout {
                Some(t) => inbox.send_timeout(Work::Stop, t).is_ok(),
                None => inbox.send(Work::Stop).is_ok(),
            };
            if !sent {
                warn!(worker = i, "failed to deliver stop sentinel");
            }
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}

/// A read-only index queried through a worker pool.
pub struct ParallelIndex {
    backend: Box<dyn Backend>,
    featurizer: Featurizer,
    n_workers: usize,
}

impl ParallelIndex {
    pub fn open(url: &str, n_workers: usize, registry: &BackendRegistry) -> Result<Self> {
        Self::from_backend(registry.open(url)?, n_workers)
    }

    pub fn from_backend(backend: Box<dyn Backend>, n_workers: usize) -> Result<Self> {
        let name = backend.get_featurizer_name()?;
        let featurizer = Featurizer::from_name(&name)?;
        Ok(ParallelIndex {
            backend,
            featurizer,
            n_workers: n_workers.max(1),
        })
    }

    /// One query through the pool.
    pub fn search(&self, query: &[String], opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let mut results = self.searchmany(vec![query.to_vec()], opts)?;
        results.next().unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Pipeline many queries through the pool. The iterator yields one
    /// result per query, in input order; a failed query yields its error
    /// in its slot without aborting the batch.
    pub fn searchmany(
        &self,
        queries: Vec<Vec<String>>,
        opts: &SearchOptions,
    ) -> Result<SearchMany<'_>> {
        let pool = WorkerPool::start(self.backend.kind(), self.n_workers)?;
        Ok(SearchMany {
            index: self,
            pool,
            queries,
            opts: opts.clone(),
            next_query: 0,
            in_flight: HashSet::new(),
            ready: BTreeMap::new(),
            n_sent: 0,
            rr: 0,
        })
    }

    /// Close the underlying storage handle.
    pub fn close(mut self) -> Result<()> {
        self.backend.close()
    }
}

/// Driver state for one `searchmany` batch. Dropping it mid-stream shuts
/// the pool down; [`SearchMany::close`] does the same with a bounded
/// sentinel send.
pub struct SearchMany<'a> {
    index: &'a ParallelIndex,
    pool: WorkerPool,
    queries: Vec<Vec<String>>,
    opts: SearchOptions,
    next_query: usize,
    in_flight: HashSet<usize>,
    ready: BTreeMap<usize, Result<Vec<SearchHit>>>,
    n_sent: usize,
    rr: usize,
}

impl SearchMany<'_> {
    pub fn close(mut self, timeout: Option<Duration>) {
        self.pool.shutdown(timeout);
    }

    fn next_worker(&mut self) -> usize {
        let w = self.rr % self.pool.inboxes.len();
        self.rr += 1;
        w
    }

    fn fill_queues(&mut self) {
        let cap = self.pool.inboxes.len() * QUEUE_DEPTH;
        let mut filled = 0;
        while self.in_flight.len() < cap && self.next_query < self.queries.len() {
            let qid = self.next_query;
            self.next_query += 1;
            match self.dispatch_count(qid) {
                Ok(()) => {
                    self.in_flight.insert(qid);
                    filled += 1;
                }
                Err(e) => {
                    self.ready.insert(qid, Err(e));
                }
            }
        }
        if filled > 0 {
            debug!(queries = filled, "dispatched to work queues");
        }
    }

    /// Featurize, select seed tokens, and send every posting blob to one
    /// worker, stamped with the query id. A query with no usable tokens
    /// still gets a single null-blob message so the worker surfaces an
    /// empty candidate set.
    fn dispatch_count(&mut self, qid: usize) -> Result<()> {
        let toks: Vec<Token> = self
            .index
            .featurizer
            .features(&self.queries[qid])?
            .into_iter()
            .collect();
        let toks = self
            .index
            .backend
            .find_least_frequent_tokens(&toks, self.opts.r, self.opts.k)?;
        let worker = self.next_worker();
        let n = self.opts.n;
        if toks.is_empty() {
            return self.send(worker, Work::CountTokens {
                query_id: qid,
                total: 0,
                blob: None,
                n,
            });
        }
        for tok in &toks {
            let blob = match self.index.backend.load_token_blob(tok) {
                Ok(blob) => Some(blob),
                // freq table and postings can drift apart mid-write;
                // a missing posting just contributes no votes
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            self.send(worker, Work::CountTokens {
                query_id: qid,
                total: toks.len(),
                blob,
                n,
            })?;
        }
        Ok(())
    }

    /// Load the candidate record blobs (skipping tombstoned rows) and
    /// hand them to a worker for scoring.
    fn dispatch_score(&mut self, qid: usize, candidate_ids: Vec<u64>) -> Result<()> {
        let features = self.opts.extract.as_ref()(&self.queries[qid]);
        let mut blobs = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            match self.index.backend.load_record_blob(id) {
                Ok(blob) => blobs.push((id, blob)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        let worker = self.next_worker();
        self.send(worker, Work::ScoreRecords {
            query_id: qid,
            features,
            extract: self.opts.extract.clone(),
            score: self.opts.score.clone(),
            limit: self.opts.limit,
            blobs,
        })
    }

    fn send(&self, worker: usize, work: Work) -> Result<()> {
        self.pool.inboxes[worker]
            .send(work)
            .map_err(|_| Error::Worker("worker queue closed".to_string()))
    }

    /// Block for one worker result and advance the protocol. Returns
    /// false when the pool has disconnected.
    fn pump(&mut self) -> bool {
        let (qid, result) = match self.pool.results.recv() {
            Ok(r) => r,
            Err(_) => return false,
        };
        if !self.in_flight.contains(&qid) {
            // late result for a query already failed on the driver side
            return true;
        }
        match result {
            WorkResult::Candidates(ids) => {
                debug!(query = qid, candidates = ids.len(), "tally complete");
                if let Err(e) = self.dispatch_score(qid, ids) {
                    self.in_flight.remove(&qid);
                    self.ready.insert(qid, Err(e));
                }
            }
            WorkResult::Scored(scored) => {
                debug!(query = qid, hits = scored.len(), "scoring complete");
                self.in_flight.remove(&qid);
                self.ready.insert(qid, Ok(format_hits(scored)));
            }
            WorkResult::Failed(msg) => {
                warn!(query = qid, error = %msg, "query failed in worker");
                self.in_flight.remove(&qid);
                self.ready.insert(qid, Err(Error::Worker(msg)));
            }
        }
        true
    }
}

impl Iterator for SearchMany<'_> {
    type Item = Result<Vec<SearchHit>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n_sent >= self.queries.len() {
            return None;
        }
        loop {
            if let Some(result) = self.ready.remove(&self.n_sent) {
                self.n_sent += 1;
                return Some(result);
            }
            self.fill_queues();
            if self.ready.contains_key(&self.n_sent) {
                continue;
            }
            if !self.pump() {
                for qid in self.n_sent..self.queries.len() {
                    self.ready
                        .entry(qid)
                        .or_insert_with(|| Err(Error::Worker("worker pool disconnected".to_string())));
                }
            }
        }
    }
}
