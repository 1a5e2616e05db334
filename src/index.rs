//! The single-threaded query path: open an index, plan a query, tally
//! candidates, re-score, and return the top K. Also the single-writer
//! `add`/`delete` path.

use std::collections::HashMap;

use tracing::debug;

use crate::error::Result;
use crate::featurizer::{Featurizer, Token};
use crate::record::{Record, SearchHit};
use crate::score::{default_extract, default_score, ExtractFn, FieldGrams, ScoreFn};
use crate::storage::Backend;

/// Query-time knobs.
///
/// `r` bounds the summed frequency of the tokens looked up (the "seed"
/// budget), `n` the candidate pool re-scored, `k` optionally caps the
/// token count outright, `limit` the results returned.
#[derive(Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub r: u64,
    pub n: usize,
    pub k: Option<usize>,
    pub extract: ExtractFn,
    pub score: ScoreFn,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 5,
            r: 100_000,
            n: 600,
            k: None,
            extract: default_extract(),
            score: default_score(),
        }
    }
}

impl SearchOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// The token-frequency budget (`--seeds`).
    pub fn seeds(mut self, r: u64) -> Self {
        self.r = r;
        self
    }

    /// The candidate-pool size (`--search-space`).
    pub fn search_space(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Hard cap on the number of tokens looked up.
    pub fn max_tokens(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn extract(mut self, extract: ExtractFn) -> Self {
        self.extract = extract;
        self
    }

    pub fn score(mut self, score: ScoreFn) -> Self {
        self.score = score;
        self
    }
}

/// A searchable index over one storage back-end.
pub struct Index {
    backend: Box<dyn Backend>,
    featurizer: Featurizer,
    rowcount: u64,
}

impl Index {
    /// Bind to an existing index. The featurizer persisted at build time
    /// is looked up by name; an unknown name is a configuration error.
    pub fn open(backend: Box<dyn Backend>) -> Result<Self> {
        let name = backend.get_featurizer_name()?;
        let featurizer = Featurizer::from_name(&name)?;
        let rowcount = backend.get_rowcount()?;
        Ok(Index {
            backend,
            featurizer,
            rowcount,
        })
    }

    pub fn rowcount(&self) -> u64 {
        self.rowcount
    }

    pub fn featurizer(&self) -> Featurizer {
        self.featurizer
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Candidate generation: featurize, pick the least-frequent tokens
    /// under the budget, tally postings hits, and keep the top `n` rows.
    fn candidates(&self, query: &[String], r: u64, n: usize, k: Option<usize>) -> Result<Vec<u64>> {
        let toks: Vec<Token> = self.featurizer.features(query)?.into_iter().collect();
        let toks = self.backend.find_least_frequent_tokens(&toks, r, k)?;
        if toks.is_empty() {
            return Ok(Vec::new());
        }
        let mut votes: HashMap<u64, u32> = HashMap::new();
        for tok in &toks {
            for id in self.backend.get_token(tok)? {
                *votes.entry(id).or_insert(0) += 1;
            }
        }
        debug!(tokens = toks.len(), candidates = votes.len(), "tallied postings");
        let mut ranked: Vec<(u64, u32)> = votes.into_iter().collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        Ok(ranked.into_iter().map(|(id, _)| id).collect())
    }

    /// Score candidates against the query, skipping tombstoned rows, and
    /// keep the `limit` best.
    fn scored(
        &self,
        candidate_ids: &[u64],
        query_features: &[FieldGrams],
        extract: &ExtractFn,
        score: &ScoreFn,
        limit: usize,
    ) -> Result<Vec<(f64, u64, Record)>> {
        let extract = extract.as_ref();
        let score = score.as_ref();
        let mut scored = Vec::with_capacity(candidate_ids.len());
        for &id in candidate_ids {
            let rec = match self.backend.get_record(id) {
                Ok(rec) => rec,
                // deleted rows leave stale postings hits behind
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let s = score(query_features, &extract(&rec.fields));
            scored.push((s, id, rec));
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Top-`limit` records most similar to the query. Returns an empty
    /// list when no query token is known to the index.
    pub fn search(&self, query: &[String], opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let ids = self.candidates(query, opts.r, opts.n, opts.k)?;
        let query_features = opts.extract.as_ref()(query);
        let scored = self.scored(&ids, &query_features, &opts.extract, &opts.score, opts.limit)?;
        Ok(format_hits(scored))
    }

    /// Append records to the index, assigning fresh row ids. On failure
    /// during the save phase the rows persisted by this call are deleted
    /// and the error re-raised; on failure during the token phase the
    /// already-updated postings are compensated (row blobs are left in
    /// place).
    pub fn add(&mut self, records: &[Record]) -> Result<Vec<u64>> {
        let ids = self.save_records(records)?;

        let mut tokmap: HashMap<Token, Vec<u64>> = HashMap::new();
        for (&id, rec) in ids.iter().zip(records) {
            for tok in self.featurizer.features(&rec.fields)? {
                tokmap.entry(tok).or_default().push(id);
            }
        }
        self.update_tokens_and_freqs(&tokmap)?;
        Ok(ids)
    }

    fn save_records(&mut self, records: &[Record]) -> Result<Vec<u64>> {
        let mut completed = Vec::with_capacity(records.len());
        for rec in records {
            match self.backend.save_record(rec) {
                Ok(id) => completed.push(id),
                Err(e) => {
                    for &id in &completed {
                        // best effort; the original failure wins
                        let _ = self.backend.delete_record(id);
                    }
                    return Err(e);
                }
            }
        }
        self.rowcount = self.backend.increment_rowcount(completed.len() as u64)?;
        Ok(completed)
    }

    fn update_tokens_and_freqs(&mut self, tokmap: &HashMap<Token, Vec<u64>>) -> Result<()> {
        // sorted for a deterministic compensation set on failure
        let mut toks: Vec<&Token> = tokmap.keys().collect();
        toks.sort_unstable();

        let mut applied: Vec<&Token> = Vec::new();
        let mut deltas: Vec<(Token, u64)> = Vec::new();
        let result = (|| -> Result<()> {
            for &tok in &toks {
                let ids = &tokmap[tok];
                self.backend.update_token(tok, ids)?;
                applied.push(tok);
                deltas.push((tok.clone(), ids.len() as u64));
            }
            self.backend.update_freqs(&deltas)
        })();
        if let Err(e) = result {
            for tok in applied {
                let _ = self.backend.drop_records_from_token(tok, &tokmap[tok]);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Tombstone a row: the record blob is removed, its row id is never
    /// reused, and stale postings hits are filtered at scoring time.
    pub fn delete(&mut self, row_id: u64) -> Result<()> {
        self.backend.delete_record(row_id)
    }

    pub fn close(mut self) -> Result<()> {
        self.backend.close()
    }
}

pub(crate) fn format_hits(scored: Vec<(f64, u64, Record)>) -> Vec<SearchHit> {
    scored
        .into_iter()
        .map(|(score, rownum, rec)| SearchHit {
            fields: rec.fields,
            pk: rec.pk,
            data: rec.data,
            rownum,
            score,
        })
        .collect()
}
