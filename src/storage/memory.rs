//! The `mem://` back-end: everything lives in process memory. Used by the
//! test suites and for ephemeral indexes that never need to survive the
//! process.

use super::state::KvState;
use super::{Backend, BackendKind, FreqTable};
use crate::error::Result;
use crate::featurizer::Token;
use crate::range::Posting;
use crate::record::Record;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: KvState,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_freqs(&self) -> Result<FreqTable> {
        Ok(self.state.get_freqs())
    }

    fn save_freqs(&mut self, freqs: &FreqTable) -> Result<()> {
        self.state.save_freqs(freqs);
        Ok(())
    }

    fn update_freqs(&mut self, deltas: &[(Token, u64)]) -> Result<()> {
        self.state.update_freqs(deltas);
        Ok(())
    }

    fn find_least_frequent_tokens(
        &self,
        toks: &[Token],
        r: u64,
        k: Option<usize>,
    ) -> Result<Vec<Token>> {
        Ok(self.state.find_least_frequent_tokens(toks, r, k))
    }

    fn get_rowcount(&self) -> Result<u64> {
        Ok(self.state.rowcount)
    }

    fn save_rowcount(&mut self, n: u64) -> Result<()> {
        self.state.save_rowcount(n);
        Ok(())
    }

    fn increment_rowcount(&mut self, n: u64) -> Result<u64> {
        Ok(self.state.increment_rowcount(n))
    }

    fn save_token(&mut self, tok: &[u8], posting: &Posting) -> Result<()> {
        self.state.save_token(tok, posting)
    }

    fn save_tokens(
        &mut self,
        postings: &mut dyn Iterator<Item = Result<(Token, Posting)>>,
    ) -> Result<()> {
        for row in postings {
            let (tok, posting) = row?;
            self.state.save_token(&tok, &posting)?;
        }
        Ok(())
    }

    fn update_token(&mut self, tok: &[u8], new_ids: &[u64]) -> Result<()> {
        self.state.update_token(tok, new_ids)
    }

    fn drop_records_from_token(&mut self, tok: &[u8], bad_ids: &[u64]) -> Result<()> {
        self.state.drop_records_from_token(tok, bad_ids)
    }

    fn save_record(&mut self, rec: &Record) -> Result<u64> {
        self.state.save_record(rec)
    }

    fn save_records(&mut self, batch: &mut dyn Iterator<Item = (u64, Record)>) -> Result<u64> {
        self.state.save_records(batch)
    }

    fn delete_record(&mut self, id: u64) -> Result<()> {
        self.state.delete_record(id)
    }

    fn get_featurizer_name(&self) -> Result<String> {
        self.state.get_featurizer_name()
    }

    fn save_featurizer_name(&mut self, name: &str) -> Result<()> {
        self.state.featurizer = Some(name.to_string());
        Ok(())
    }

    fn load_token_blob(&self, tok: &[u8]) -> Result<Vec<u8>> {
        self.state.load_token_blob(tok)
    }

    fn load_record_blob(&self, id: u64) -> Result<Vec<u8>> {
        self.state.load_record_blob(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn tok(s: &str) -> Token {
        s.as_bytes().to_vec()
    }

    #[test]
    fn freqs_round_trip() {
        let mut db = MemoryBackend::new();
        let mut freqs = FreqTable::new();
        freqs.insert(tok("abc"), 3);
        freqs.insert(tok("bcd"), 2);
        db.save_freqs(&freqs).unwrap();
        assert_eq!(db.get_freqs().unwrap(), freqs);
    }

    #[test]
    fn update_freqs_is_additive() {
        let mut db = MemoryBackend::new();
        db.update_freqs(&[(tok("abc"), 2)]).unwrap();
        db.update_freqs(&[(tok("abc"), 3), (tok("xyz"), 1)]).unwrap();
        let freqs = db.get_freqs().unwrap();
        assert_eq!(freqs[&tok("abc")], 5);
        assert_eq!(freqs[&tok("xyz")], 1);
    }

    #[test]
    fn rowcount_round_trip() {
        let mut db = MemoryBackend::new();
        assert_eq!(db.get_rowcount().unwrap(), 0);
        db.save_rowcount(222).unwrap();
        assert_eq!(db.get_rowcount().unwrap(), 222);
        assert_eq!(db.increment_rowcount(3).unwrap(), 225);
    }

    #[test]
    fn flat_and_compacted_tokens_decode_alike() {
        let mut db = MemoryBackend::new();
        db.save_token(b"abc", &Posting::from_sorted_ids(vec![1, 3, 5]))
            .unwrap();
        assert_eq!(db.get_token(b"abc").unwrap(), vec![1, 3, 5]);

        db.save_token(b"bcd", &Posting::from_sorted_ids(vec![1, 2, 3, 4, 5, 6, 7]))
            .unwrap();
        assert_eq!(
            db.get_token(b"bcd").unwrap(),
            (1..=7).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn update_token_appends_in_order() {
        let mut db = MemoryBackend::new();
        db.update_token(b"abc", &[4, 5, 6]).unwrap();
        db.update_token(b"abc", &[1, 2, 3]).unwrap();
        assert_eq!(db.get_token(b"abc").unwrap(), (1..=6).collect::<Vec<u64>>());
    }

    #[test]
    fn drop_records_removes_bad_ids() {
        let mut db = MemoryBackend::new();
        db.save_token(b"abc", &Posting::from_sorted_ids(vec![1, 2, 3, 9]))
            .unwrap();
        db.drop_records_from_token(b"abc", &[2, 9]).unwrap();
        assert_eq!(db.get_token(b"abc").unwrap(), vec![1, 3]);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let db = MemoryBackend::new();
        assert!(matches!(db.get_token(b"nope"), Err(Error::NotFound(_))));
        assert!(matches!(db.get_record(0), Err(Error::NotFound(_))));
        assert!(matches!(
            db.get_featurizer_name(),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn records_round_trip() {
        let mut db = MemoryBackend::new();
        let r1 = Record::new(vec!["abcde".into(), "foo".into()], "1".into(), vec![]);
        let r2 = Record::new(vec!["qwert".into(), "bar".into()], "2".into(), vec![]);
        let mut batch = vec![(0, r1.clone()), (1, r2.clone())].into_iter();
        assert_eq!(db.save_records(&mut batch).unwrap(), 2);
        let got = db.get_records(&[0, 1]).unwrap();
        assert_eq!(got[0], r1);
        assert_eq!(got[1], r2);
    }

    #[test]
    fn save_record_assigns_dense_ids() {
        let mut db = MemoryBackend::new();
        let rec = Record::new(vec!["x".into()], "pk".into(), vec![]);
        assert_eq!(db.save_record(&rec).unwrap(), 0);
        assert_eq!(db.save_record(&rec).unwrap(), 1);
        db.delete_record(0).unwrap();
        // row ids are never reused
        assert_eq!(db.save_record(&rec).unwrap(), 2);
    }
}
