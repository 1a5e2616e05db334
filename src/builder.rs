//! The index builder: an external-memory shuffle that compiles a record
//! stream into postings, a frequency table, and stored records.
//!
//! Records are ingested in batches and handed to parallel map workers in
//! chunks; each worker featurizes its chunk and writes a sorted,
//! gzip-compressed spill file. Spills are then partially merged in
//! parallel groups (which also tallies per-token frequencies), and a
//! final serial k-way merge produces the compacted postings.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::{ParallelProgressIterator, ProgressBar};
use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::featurizer::{Featurizer, Token};
use crate::range::Posting;
use crate::record::Record;
use crate::storage::{Backend, FreqTable};

/// Records are persisted in batches of this size during ingest.
const RECORD_BATCH: usize = 5_000;

/// Build-time knobs. Query-time parameters live in
/// [`SearchOptions`](crate::index::SearchOptions).
#[derive(Debug, Clone)]
pub struct BuildConfig {
    workers: usize,
    chunk_size: usize,
    tmpdir: Option<PathBuf>,
    featurizer: Featurizer,
    toobig: Option<HashSet<Token>>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            workers: 1,
            chunk_size: 50_000,
            tmpdir: None,
            featurizer: Featurizer::Compress,
            toobig: None,
        }
    }
}

impl BuildConfig {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    /// Number of records each map worker featurizes in memory.
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Where spill files go; a scratch directory is created (and removed)
    /// underneath. Defaults to the system temp dir.
    pub fn tmpdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmpdir = Some(path.into());
        self
    }

    pub fn featurizer(mut self, featurizer: Featurizer) -> Self {
        self.featurizer = featurizer;
        self
    }

    /// Ultra-frequent tokens to drop at map time instead of carrying
    /// their postings through the merge. Unbounded when unset.
    pub fn suppress_tokens(mut self, toobig: HashSet<Token>) -> Self {
        self.toobig = Some(toobig);
        self
    }
}

/// Compile `records` into `backend`. Row ids are assigned densely in
/// input order starting at 0. The index is committed once the frequency
/// table, every posting, the featurizer name, and the row counter have
/// all been written; on failure the scratch directory is removed and the
/// error surfaced.
pub fn build<I>(records: I, backend: &mut dyn Backend, config: &BuildConfig) -> Result<()>
where
    I: IntoIterator<Item = Result<Record>>,
{
    let start = Instant::now();
    let spill_dir = match &config.tmpdir {
        Some(p) => {
            fs::create_dir_all(p)?;
            tempfile::Builder::new().prefix("polymr-").tempdir_in(p)
        }
        None => tempfile::Builder::new().prefix("polymr-").tempdir(),
    }
    .map_err(|e| Error::Build(format!("create spill dir: {e}")))?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()?;

    // Ingest and map. Records are saved in batches with their data
    // payload intact; the spill pipeline downstream only sees fields.
    let bar = ProgressBar::new_spinner();
    bar.set_message("featurizing");
    let mut spills: Vec<PathBuf> = Vec::new();
    let mut total_rows: u64 = 0;
    let mut batch: Vec<(u64, Record)> = Vec::with_capacity(RECORD_BATCH);
    let mut chunk: Vec<(u64, Record)> = Vec::with_capacity(config.chunk_size);
    let mut wave: Vec<(usize, Vec<(u64, Record)>)> = Vec::new();
    let mut chunk_no = 0usize;

    for rec in records {
        let rec = rec?;
        let row_id = total_rows;
        total_rows += 1;
        chunk.push((row_id, rec.without_data()));
        batch.push((row_id, rec));
        if batch.len() >= RECORD_BATCH {
            let mut drain = batch.drain(..);
            backend.save_records(&mut drain)?;
        }
        if chunk.len() >= config.chunk_size {
            wave.push((chunk_no, std::mem::replace(&mut chunk, Vec::with_capacity(config.chunk_size))));
            chunk_no += 1;
            if wave.len() >= config.workers {
                spill_wave(&pool, spill_dir.path(), &mut wave, config, &mut spills, &bar)?;
            }
        }
    }
    if !batch.is_empty() {
        let mut drain = batch.drain(..);
        backend.save_records(&mut drain)?;
    }
    if !chunk.is_empty() {
        wave.push((chunk_no, chunk));
    }
    spill_wave(&pool, spill_dir.path(), &mut wave, config, &mut spills, &bar)?;
    bar.finish_and_clear();
    info!(
        rows = total_rows,
        spills = spills.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "map stage complete"
    );

    // Partial merges: spills are divided into ceil(N/P)-sized groups and
    // each group is k-way merged in parallel, tallying its per-token id
    // counts so frequencies can be summed without rereading.
    let merge_start = Instant::now();
    let group_size = spills.len().div_ceil(config.workers).max(1);
    let groups: Vec<&[PathBuf]> = spills.chunks(group_size).collect();
    let merged: Vec<(PathBuf, HashMap<Token, u64>)> = pool.install(|| {
        groups
            .par_iter()
            .progress_count(groups.len() as u64)
            .enumerate()
            .map(|(no, paths)| merge_group(spill_dir.path(), no, paths))
            .collect::<Result<_>>()
    })?;

    let mut freqs = FreqTable::new();
    for (_, counts) in &merged {
        for (tok, n) in counts {
            *freqs.entry(tok.clone()).or_insert(0) += n;
        }
    }
    info!(
        groups = merged.len(),
        tokens = freqs.len(),
        elapsed_ms = merge_start.elapsed().as_millis() as u64,
        "partial merge complete"
    );

    // Final serial merge: collapse token runs across groups, compact,
    // and stream the postings straight into the backend.
    let group_paths: Vec<PathBuf> = merged.iter().map(|(p, _)| p.clone()).collect();
    let mut merge = KwayMerge::open(&group_paths)?;
    let mut postings = std::iter::from_fn(|| match merge.next_run() {
        Ok(Some((tok, sublists))) => Some(Ok((tok, collapse(sublists)))),
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    });
    backend.save_freqs(&freqs)?;
    backend.save_tokens(&mut postings)?;
    backend.save_featurizer_name(config.featurizer.name())?;
    backend.save_rowcount(total_rows)?;

    info!(
        rows = total_rows,
        tokens = freqs.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "index committed"
    );
    Ok(())
}

/// Concatenate a token's id sublists (disjoint ascending runs) and pick
/// the stored form.
fn collapse(mut sublists: Vec<Vec<u64>>) -> Posting {
    sublists.sort_by_key(|l| l.first().copied());
    let ids: Vec<u64> = sublists.into_iter().flatten().collect();
    Posting::from_sorted_ids(ids)
}

fn spill_wave(
    pool: &rayon::ThreadPool,
    dir: &Path,
    wave: &mut Vec<(usize, Vec<(u64, Record)>)>,
    config: &BuildConfig,
    spills: &mut Vec<PathBuf>,
    bar: &ProgressBar,
) -> Result<()> {
    if wave.is_empty() {
        return Ok(());
    }
    let work = std::mem::take(wave);
    let done = work.len() as u64;
    let paths: Vec<PathBuf> = pool.install(|| {
        work.par_iter()
            .map(|(seq, chunk)| map_chunk(dir, *seq, chunk, config))
            .collect::<Result<_>>()
    })?;
    spills.extend(paths);
    bar.inc(done);
    Ok(())
}

/// One map worker: featurize a chunk, fold duplicates into a per-token
/// id list, and write the sorted table as a gzip spill.
fn map_chunk(dir: &Path, seq: usize, chunk: &[(u64, Record)], config: &BuildConfig) -> Result<PathBuf> {
    let mut table: BTreeMap<Token, Vec<u64>> = BTreeMap::new();
    for (row_id, rec) in chunk {
        for tok in config.featurizer.features(&rec.fields)? {
            if let Some(toobig) = &config.toobig {
                if toobig.contains(&tok) {
                    continue;
                }
            }
            table.entry(tok).or_default().push(*row_id);
        }
    }
    let path = dir.join(format!("spill-{seq:08}.gz"));
    write_spill(&path, table.iter().map(|(t, ids)| (t.as_slice(), ids.as_slice())))?;
    debug!(seq, tokens = table.len(), "wrote spill");
    Ok(path)
}

/// Merge one group of spills into a single spill, recording the group's
/// per-token id counts.
fn merge_group(
    dir: &Path,
    group_no: usize,
    paths: &[PathBuf],
) -> Result<(PathBuf, HashMap<Token, u64>)> {
    let mut merge = KwayMerge::open(paths)?;
    let path = dir.join(format!("merge-{group_no:04}.gz"));
    let file = File::create(&path).map_err(|e| Error::Build(format!("create merge spill: {e}")))?;
    let mut w = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut counts = HashMap::new();
    while let Some((tok, mut sublists)) = merge.next_run()? {
        sublists.sort_by_key(|l| l.first().copied());
        let ids: Vec<u64> = sublists.into_iter().flatten().collect();
        counts.insert(tok.clone(), ids.len() as u64);
        let line = ids.iter().map(|i| i.to_string()).join(",");
        writeln!(w, "{}|{}", B64.encode(&tok), line)
            .map_err(|e| Error::Build(format!("write merge spill: {e}")))?;
    }
    w.finish()
        .and_then(|mut inner| inner.flush().map(|_| ()))
        .map_err(|e| Error::Build(format!("finish merge spill: {e}")))?;
    Ok((path, counts))
}

fn write_spill<'a, I>(path: &Path, rows: I) -> Result<()>
where
    I: Iterator<Item = (&'a [u8], &'a [u64])>,
{
    let file = File::create(path).map_err(|e| Error::Build(format!("create spill: {e}")))?;
    let mut w = GzEncoder::new(BufWriter::new(file), Compression::default());
    for (tok, ids) in rows {
        let line = ids.iter().map(|i| i.to_string()).join(",");
        writeln!(w, "{}|{}", B64.encode(tok), line)
            .map_err(|e| Error::Build(format!("write spill: {e}")))?;
    }
    w.finish()
        .and_then(|mut inner| inner.flush().map(|_| ()))
        .map_err(|e| Error::Build(format!("finish spill: {e}")))?;
    Ok(())
}

/// Streaming reader over one spill file.
struct SpillReader {
    lines: std::io::Lines<BufReader<GzDecoder<File>>>,
}

impl SpillReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Build(format!("open spill: {e}")))?;
        Ok(SpillReader {
            lines: BufReader::new(GzDecoder::new(file)).lines(),
        })
    }
}

impl Iterator for SpillReader {
    type Item = Result<(Token, Vec<u64>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(l) => l,
            Err(e) => return Some(Err(Error::Build(format!("read spill: {e}")))),
        };
        Some(parse_spill_line(&line))
    }
}

fn parse_spill_line(line: &str) -> Result<(Token, Vec<u64>)> {
    let (tok, ids) = line
        .split_once('|')
        .ok_or_else(|| Error::Build(format!("malformed spill line: {line}")))?;
    let tok = B64
        .decode(tok)
        .map_err(|e| Error::Build(format!("malformed spill token: {e}")))?;
    let ids = ids
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|e| Error::Build(format!("malformed spill id: {e}")))
        })
        .collect::<Result<Vec<u64>>>()?;
    Ok((tok, ids))
}

/// K-way merge over spill readers, yielding one token run at a time.
/// Source count is bounded by the group size, so a linear scan for the
/// minimum head is enough.
struct KwayMerge {
    sources: Vec<SpillReader>,
    heads: Vec<Option<(Token, Vec<u64>)>>,
}

impl KwayMerge {
    fn open(paths: &[PathBuf]) -> Result<Self> {
        let mut sources = paths
            .iter()
            .map(|p| SpillReader::open(p))
            .collect::<Result<Vec<_>>>()?;
        let heads = sources
            .iter_mut()
            .map(|s| s.next().transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(KwayMerge { sources, heads })
    }

    /// The smallest pending token together with every source's id
    /// sublist for it, in source order.
    fn next_run(&mut self) -> Result<Option<(Token, Vec<Vec<u64>>)>> {
        let tok = match self.heads.iter().flatten().map(|(t, _)| t).min() {
            Some(t) => t.clone(),
            None => return Ok(None),
        };
        let mut sublists = Vec::new();
        for i in 0..self.sources.len() {
            let hit = matches!(&self.heads[i], Some((t, _)) if *t == tok);
            if hit {
                if let Some((_, ids)) = self.heads[i].take() {
                    sublists.push(ids);
                }
                self.heads[i] = self.sources[i].next().transpose()?;
            }
        }
        Ok(Some((tok, sublists)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use tempfile::tempdir;

    fn corpus(n: u64) -> Vec<Result<Record>> {
        (0..n)
            .map(|i| {
                Ok(Record::new(
                    vec![format!("name-{i}"), format!("street {i} ave")],
                    format!("pk{i}"),
                    vec![format!("payload-{i}")],
                ))
            })
            .collect()
    }

    #[test]
    fn spill_lines_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spill.gz");
        let rows: Vec<(Vec<u8>, Vec<u64>)> = vec![
            (b"abc".to_vec(), vec![1, 2, 3]),
            (b"bcd".to_vec(), vec![7]),
        ];
        write_spill(
            &path,
            rows.iter().map(|(t, ids)| (t.as_slice(), ids.as_slice())),
        )
        .unwrap();
        let got: Vec<(Token, Vec<u64>)> = SpillReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got, rows);
    }

    #[test]
    fn kway_merge_collapses_token_runs() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.gz");
        let b = dir.path().join("b.gz");
        write_spill(&a, vec![(&b"x"[..], &[1u64, 2][..]), (&b"y"[..], &[3u64][..])].into_iter())
            .unwrap();
        write_spill(&b, vec![(&b"x"[..], &[5u64, 6][..]), (&b"z"[..], &[9u64][..])].into_iter())
            .unwrap();

        let mut merge = KwayMerge::open(&[a, b]).unwrap();
        let (tok, sublists) = merge.next_run().unwrap().unwrap();
        assert_eq!(tok, b"x".to_vec());
        assert_eq!(sublists, vec![vec![1, 2], vec![5, 6]]);
        let (tok, _) = merge.next_run().unwrap().unwrap();
        assert_eq!(tok, b"y".to_vec());
        let (tok, _) = merge.next_run().unwrap().unwrap();
        assert_eq!(tok, b"z".to_vec());
        assert!(merge.next_run().unwrap().is_none());
    }

    #[test]
    fn build_satisfies_index_invariants() {
        let mut backend = MemoryBackend::new();
        let config = BuildConfig::default().workers(2).chunk_size(3);
        build(corpus(10), &mut backend, &config).unwrap();

        assert_eq!(backend.get_rowcount().unwrap(), 10);
        assert_eq!(backend.get_featurizer_name().unwrap(), "compress");

        // every frequency equals the decoded posting length
        let freqs = backend.get_freqs().unwrap();
        assert!(!freqs.is_empty());
        for (tok, freq) in &freqs {
            let ids = backend.get_token(tok).unwrap();
            assert_eq!(*freq, ids.len() as u64, "freq mismatch");
            // postings are strictly ascending
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }

        // records round-trip with their data payload
        let rec = backend.get_record(3).unwrap();
        assert_eq!(rec.fields, vec!["name-3".to_string(), "street 3 ave".to_string()]);
        assert_eq!(rec.pk, "pk3");
        assert_eq!(rec.data, vec!["payload-3".to_string()]);
    }

    #[test]
    fn empty_corpus_builds_an_empty_index() {
        let mut backend = MemoryBackend::new();
        build(Vec::new(), &mut backend, &BuildConfig::default()).unwrap();
        assert_eq!(backend.get_rowcount().unwrap(), 0);
        assert!(backend.get_freqs().unwrap().is_empty());
    }

    #[test]
    fn suppressed_tokens_are_absent() {
        let mut backend = MemoryBackend::new();
        let all = Featurizer::Compress
            .features(&["name-1".to_string()])
            .unwrap();
        let victim: Token = all.into_iter().next().unwrap();
        let config = BuildConfig::default()
            .suppress_tokens([victim.clone()].into_iter().collect());
        build(corpus(5), &mut backend, &config).unwrap();
        assert!(backend.get_token(&victim).is_err());
        assert!(!backend.get_freqs().unwrap().contains_key(&victim));
    }
}
