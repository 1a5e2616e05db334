//! The in-memory KV state shared by the shipped back-ends. Blobs are kept
//! serialized so the blob-level worker API operates on the real stored
//! bytes, not a shortcut.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use super::{encode_record_blob, encode_token_blob, select_least_frequent, FreqTable};
use crate::error::{Error, Result};
use crate::featurizer::Token;
use crate::range::{merge_compact, Posting};
use crate::record::Record;

#[derive(Debug, Default)]
pub(crate) struct KvState {
    pub(crate) tokens: HashMap<Token, Vec<u8>>,
    pub(crate) records: HashMap<u64, Vec<u8>>,
    pub(crate) freqs: FreqTable,
    pub(crate) rowcount: u64,
    pub(crate) featurizer: Option<String>,
    /// Next row id to hand out; row ids are dense and never reused, so
    /// this only moves forward even when saves are rolled back.
    next_id: u64,
}

impl KvState {
    pub(crate) fn sync_next_id(&mut self) {
        let max_key = self.records.keys().max().map(|&k| k + 1).unwrap_or(0);
        self.next_id = self.next_id.max(self.rowcount).max(max_key);
    }

    pub(crate) fn get_freqs(&self) -> FreqTable {
        self.freqs.clone()
    }

    pub(crate) fn save_freqs(&mut self, freqs: &FreqTable) {
        self.freqs = freqs.clone();
    }

    pub(crate) fn update_freqs(&mut self, deltas: &[(Token, u64)]) {
        for (tok, delta) in deltas {
            *self.freqs.entry(tok.clone()).or_insert(0) += delta;
        }
    }

    pub(crate) fn find_least_frequent_tokens(
        &self,
        toks: &[Token],
        r: u64,
        k: Option<usize>,
    ) -> Vec<Token> {
        select_least_frequent(&self.freqs, toks, r, k)
    }

    pub(crate) fn increment_rowcount(&mut self, n: u64) -> u64 {
        self.rowcount += n;
        self.sync_next_id();
        self.rowcount
    }

    pub(crate) fn save_rowcount(&mut self, n: u64) {
        self.rowcount = n;
        self.sync_next_id();
    }

    pub(crate) fn load_token_blob(&self, tok: &[u8]) -> Result<Vec<u8>> {
        self.tokens
            .get(tok)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("token {}", B64.encode(tok))))
    }

    pub(crate) fn save_token(&mut self, tok: &[u8], posting: &Posting) -> Result<()> {
        let blob = encode_token_blob(posting)?;
        self.tokens.insert(tok.to_vec(), blob);
        Ok(())
    }

    fn decode_token(&self, tok: &[u8]) -> Result<Vec<u64>> {
        let blob = self.load_token_blob(tok)?;
        let posting: Posting = bincode::deserialize(&blob)?;
        Ok(posting.decode())
    }

    pub(crate) fn update_token(&mut self, tok: &[u8], new_ids: &[u64]) -> Result<()> {
        let current = match self.decode_token(tok) {
            Ok(ids) => ids,
            // the token may be new
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let (spans, compacted) = merge_compact([new_ids, current.as_slice()]);
        self.save_token(tok, &Posting::from_spans(spans, compacted))
    }

    pub(crate) fn drop_records_from_token(&mut self, tok: &[u8], bad_ids: &[u64]) -> Result<()> {
        let bad: HashSet<u64> = bad_ids.iter().copied().collect();
        let mut keep = self.decode_token(tok)?;
        keep.retain(|id| !bad.contains(id));
        self.save_token(tok, &Posting::from_sorted_ids(keep))
    }

    pub(crate) fn load_record_blob(&self, id: u64) -> Result<Vec<u8>> {
        self.records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record {id}")))
    }

    pub(crate) fn save_record(&mut self, rec: &Record) -> Result<u64> {
        let id = self.next_id;
        self.records.insert(id, encode_record_blob(rec)?);
        self.next_id += 1;
        Ok(id)
    }

    pub(crate) fn save_records(
        &mut self,
        batch: &mut dyn Iterator<Item = (u64, Record)>,
    ) -> Result<u64> {
        let mut count = 0;
        for (id, rec) in batch {
            self.records.insert(id, encode_record_blob(&rec)?);
            self.next_id = self.next_id.max(id + 1);
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn delete_record(&mut self, id: u64) -> Result<()> {
        self.records
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("record {id}")))
    }

    pub(crate) fn get_featurizer_name(&self) -> Result<String> {
        self.featurizer
            .clone()
            .ok_or_else(|| Error::NotFound("featurizer name".to_string()))
    }
}
