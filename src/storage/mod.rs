//! The storage contract consumed by the builder and the query planner,
//! plus the URL-scheme registry that dispatches to concrete back-ends.
//!
//! Back-ends store records and postings as opaque blobs. Blob decoding is
//! also exposed as free functions keyed on [`BackendKind`] so the parallel
//! query workers can parse blobs without holding a live handle to the
//! back-end.

mod disk;
mod memory;
mod state;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

use std::collections::HashMap;

use tracing::info;

use crate::error::{Error, Result};
use crate::featurizer::Token;
use crate::range::{merge_compact, Posting};
use crate::record::Record;

/// Token -> number of distinct row ids containing the token. The
/// authoritative summary of postings sizes.
pub type FreqTable = HashMap<Token, u64>;

/// Identifies a back-end implementation. Workers look blob decoders up by
/// kind at startup instead of carrying a storage handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Disk,
}

impl BackendKind {
    pub fn scheme(self) -> &'static str {
        match self {
            BackendKind::Memory => "mem",
            BackendKind::Disk => "disk",
        }
    }

    pub fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme {
            "mem" => Ok(BackendKind::Memory),
            "disk" => Ok(BackendKind::Disk),
            other => Err(Error::Config(format!("unrecognized scheme: {other}"))),
        }
    }

    /// Decode a posting blob to its flat ascending id list.
    pub fn decode_token_blob(self, blob: &[u8]) -> Result<Vec<u64>> {
        // both shipped back-ends share the bincode blob format
        let posting: Posting = bincode::deserialize(blob)?;
        Ok(posting.decode())
    }

    /// Decode a record blob.
    pub fn decode_record_blob(self, blob: &[u8]) -> Result<Record> {
        Ok(bincode::deserialize(blob)?)
    }
}

pub fn encode_token_blob(posting: &Posting) -> Result<Vec<u8>> {
    Ok(bincode::serialize(posting)?)
}

pub fn encode_record_blob(rec: &Record) -> Result<Vec<u8>> {
    Ok(bincode::serialize(rec)?)
}

/// The abstract KV contract. One handle is single-writer; readers may
/// share it freely once the index is built.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;
    fn close(&mut self) -> Result<()>;

    fn get_freqs(&self) -> Result<FreqTable>;
    fn save_freqs(&mut self, freqs: &FreqTable) -> Result<()>;
    /// Add per-token deltas to the stored counts.
    fn update_freqs(&mut self, deltas: &[(Token, u64)]) -> Result<()>;
    /// The least-frequent subset of `toks` whose summed frequency stays
    /// within `r`, capped at `k` tokens when supplied. Unknown tokens are
    /// dropped; ties break by token byte order.
    fn find_least_frequent_tokens(
        &self,
        toks: &[Token],
        r: u64,
        k: Option<usize>,
    ) -> Result<Vec<Token>>;

    fn get_rowcount(&self) -> Result<u64>;
    fn save_rowcount(&mut self, n: u64) -> Result<()>;
    fn increment_rowcount(&mut self, n: u64) -> Result<u64>;

    fn get_token(&self, tok: &[u8]) -> Result<Vec<u64>> {
        let blob = self.load_token_blob(tok)?;
        self.kind().decode_token_blob(&blob)
    }
    fn save_token(&mut self, tok: &[u8], posting: &Posting) -> Result<()>;
    /// Bulk-save a stream of postings; the back-end picks its own
    /// batching. Stops at the first stream error.
    fn save_tokens(
        &mut self,
        postings: &mut dyn Iterator<Item = Result<(Token, Posting)>>,
    ) -> Result<()>;
    /// Append new ids to an existing posting, preserving ascending order.
    fn update_token(&mut self, tok: &[u8], new_ids: &[u64]) -> Result<()>;
    /// Remove ids from a posting (compensation for a failed add).
    fn drop_records_from_token(&mut self, tok: &[u8], bad_ids: &[u64]) -> Result<()>;

    fn get_record(&self, id: u64) -> Result<Record> {
        let blob = self.load_record_blob(id)?;
        self.kind().decode_record_blob(&blob)
    }
    fn get_records(&self, ids: &[u64]) -> Result<Vec<Record>> {
        ids.iter().map(|&i| self.get_record(i)).collect()
    }
    fn save_record(&mut self, rec: &Record) -> Result<u64>;
    fn save_records(&mut self, batch: &mut dyn Iterator<Item = (u64, Record)>) -> Result<u64>;
    fn delete_record(&mut self, id: u64) -> Result<()>;

    fn get_featurizer_name(&self) -> Result<String>;
    fn save_featurizer_name(&mut self, name: &str) -> Result<()>;

    fn load_token_blob(&self, tok: &[u8]) -> Result<Vec<u8>>;
    fn load_record_blob(&self, id: u64) -> Result<Vec<u8>>;
}

/// Greedy low-frequency token selection shared by the shipped back-ends.
pub(crate) fn select_least_frequent(
    freqs: &FreqTable,
    toks: &[Token],
    r: u64,
    k: Option<usize>,
) -> Vec<Token> {
    let mut known: Vec<(&Token, u64)> = toks
        .iter()
        .filter_map(|t| freqs.get(t).map(|&f| (t, f)))
        .collect();
    known.sort_unstable_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let mut total = 0u64;
    let mut out = Vec::new();
    for (tok, freq) in known {
        if total + freq > r {
            break;
        }
        if let Some(k) = k {
            if out.len() >= k {
                break;
            }
        }
        total += freq;
        out.push(tok.clone());
    }
    out
}

/// A `scheme://host/path` backend locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

pub fn parse_url(u: &str) -> Result<ParsedUrl> {
    let (scheme, rest) = u
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("not a backend URL: {u}")))?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    Ok(ParsedUrl {
        scheme: scheme.to_string(),
        host: host.to_string(),
        path: path.to_string(),
    })
}

pub type BackendFactory = fn(&ParsedUrl) -> Result<Box<dyn Backend>>;

/// Explicit scheme -> factory map, built once at program start and passed
/// to whoever opens back-ends. Absent schemes are a configuration error.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            factories: HashMap::new(),
        }
    }

    /// The registry with both shipped back-ends: `mem://` and
    /// `disk://localhost/path`.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("mem", |_| Ok(Box::new(MemoryBackend::new())));
        reg.register("disk", |parsed| {
            Ok(Box::new(DiskBackend::open(parsed.path.as_ref())?))
        });
        reg
    }

    pub fn register(&mut self, scheme: &str, factory: BackendFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    pub fn open(&self, url: &str) -> Result<Box<dyn Backend>> {
        let parsed = parse_url(url)?;
        let factory = self
            .factories
            .get(&parsed.scheme)
            .ok_or_else(|| Error::Config(format!("unrecognized scheme: {}", parsed.scheme)))?;
        factory(&parsed)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Re-persist one index onto another back-end, optionally dropping the
/// most frequent fraction of tokens (`droptop`) to shrink hot postings.
pub fn copy(from: &dyn Backend, to: &mut dyn Backend, droptop: Option<f64>) -> Result<()> {
    let cnt = from.get_rowcount()?;
    info!(records = cnt, "copying records");
    let ids: Vec<u64> = (0..cnt).collect();
    let mut batch = ids
        .iter()
        .zip(from.get_records(&ids)?)
        .map(|(&i, r)| (i, r));
    to.save_records(&mut batch)?;
    to.save_rowcount(cnt)?;

    let mut freqs = from.get_freqs()?;
    if let Some(fraction) = droptop {
        let thresh = (freqs.len() as f64 * fraction) as usize;
        let mut by_freq: Vec<(Token, u64)> = freqs.into_iter().collect();
        by_freq.sort_unstable_by(|a, b| (b.1, &b.0).cmp(&(a.1, &a.0)));
        freqs = by_freq.into_iter().skip(thresh).collect();
    }
    info!(tokens = freqs.len(), "copying frequencies");
    to.save_freqs(&freqs)?;
    to.save_featurizer_name(&from.get_featurizer_name()?)?;

    let mut rows = freqs.keys().map(|tok| {
        let ids = from.get_token(tok)?;
        let (spans, compacted) = merge_compact([ids.as_slice()]);
        Ok((tok.clone(), Posting::from_spans(spans, compacted)))
    });
    to.save_tokens(&mut rows)?;
    info!("copy complete");
    Ok(())
}
