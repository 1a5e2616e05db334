//! The `disk://localhost/path` back-end: a directory of bincode images,
//! loaded wholesale at open and written back on mutation boundaries. The
//! featurizer name lives in an adjacent plain-text file so it can be
//! inspected without decoding anything.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::state::KvState;
use super::{Backend, BackendKind, FreqTable};
use crate::error::Result;
use crate::featurizer::Token;
use crate::range::Posting;
use crate::record::Record;

const FEATURES_FILE: &str = "features.bin";
const RECORDS_FILE: &str = "records.bin";
const FREQS_FILE: &str = "freqs.bin";
const ROWCOUNT_FILE: &str = "rowcount.bin";
const FEATURIZER_FILE: &str = "featurizer";

#[derive(Debug)]
pub struct DiskBackend {
    state: KvState,
    dir: PathBuf,
    dirty: bool,
}

impl DiskBackend {
    /// Open or create an index directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut state = KvState::default();

        let features = dir.join(FEATURES_FILE);
        if features.exists() {
            state.tokens = bincode::deserialize(&fs::read(features)?)?;
        }
        let records = dir.join(RECORDS_FILE);
        if records.exists() {
            state.records = bincode::deserialize::<HashMap<u64, Vec<u8>>>(&fs::read(records)?)?;
        }
        let freqs = dir.join(FREQS_FILE);
        if freqs.exists() {
            state.freqs = bincode::deserialize(&fs::read(freqs)?)?;
        }
        let rowcount = dir.join(ROWCOUNT_FILE);
        if rowcount.exists() {
            state.rowcount = bincode::deserialize(&fs::read(rowcount)?)?;
        }
        let featurizer = dir.join(FEATURIZER_FILE);
        if featurizer.exists() {
            state.featurizer = Some(fs::read_to_string(featurizer)?.trim().to_string());
        }
        state.sync_next_id();

        debug!(dir = %dir.display(), tokens = state.tokens.len(),
               records = state.records.len(), "opened disk backend");
        Ok(DiskBackend {
            state,
            dir: dir.to_path_buf(),
            dirty: false,
        })
    }

    /// Write every image back to the directory.
    pub fn flush(&mut self) -> Result<()> {
        fs::write(
            self.dir.join(FEATURES_FILE),
            bincode::serialize(&self.state.tokens)?,
        )?;
        fs::write(
            self.dir.join(RECORDS_FILE),
            bincode::serialize(&self.state.records)?,
        )?;
        fs::write(
            self.dir.join(FREQS_FILE),
            bincode::serialize(&self.state.freqs)?,
        )?;
        fs::write(
            self.dir.join(ROWCOUNT_FILE),
            bincode::serialize(&self.state.rowcount)?,
        )?;
        if let Some(name) = &self.state.featurizer {
            fs::write(self.dir.join(FEATURIZER_FILE), name)?;
        }
        self.dirty = false;
        debug!(dir = %self.dir.display(), "flushed disk backend");
        Ok(())
    }
}

impl Drop for DiskBackend {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!(dir = %self.dir.display(), error = %e,
                      "failed to flush disk backend on drop");
            }
        }
    }
}

impl Backend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn get_freqs(&self) -> Result<FreqTable> {
        Ok(self.state.get_freqs())
    }

    fn save_freqs(&mut self, freqs: &FreqTable) -> Result<()> {
        self.state.save_freqs(freqs);
        self.dirty = true;
        Ok(())
    }

    fn update_freqs(&mut self, deltas: &[(Token, u64)]) -> Result<()> {
        self.state.update_freqs(deltas);
        self.dirty = true;
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
        self.dirty = true;
        Ok(())
    }

    fn increment_rowcount(&mut self, n: u64) -> Result<u64> {
        self.dirty = true;
        Ok(self.state.increment_rowcount(n))
    }

    fn save_token(&mut self, tok: &[u8], posting: &Posting) -> Result<()> {
        self.dirty = true;
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
        self.dirty = true;
        Ok(())
    }

    fn update_token(&mut self, tok: &[u8], new_ids: &[u64]) -> Result<()> {
        self.dirty = true;
        self.state.update_token(tok, new_ids)
    }

    fn drop_records_from_token(&mut self, tok: &[u8], bad_ids: &[u64]) -> Result<()> {
        self.dirty = true;
        self.state.drop_records_from_token(tok, bad_ids)
    }

    fn save_record(&mut self, rec: &Record) -> Result<u64> {
        self.dirty = true;
        self.state.save_record(rec)
    }

    fn save_records(&mut self, batch: &mut dyn Iterator<Item = (u64, Record)>) -> Result<u64> {
        self.dirty = true;
        self.state.save_records(batch)
    }

    fn delete_record(&mut self, id: u64) -> Result<()> {
        self.dirty = true;
        self.state.delete_record(id)
    }

    fn get_featurizer_name(&self) -> Result<String> {
        self.state.get_featurizer_name()
    }

    fn save_featurizer_name(&mut self, name: &str) -> Result<()> {
        self.state.featurizer = Some(name.to_string());
        self.dirty = true;
        Ok(())
    }

    fn load_token_blob(&self, tok: &[u8]) -> Result<Vec<u8>> {
        self.state.load_token_blob(tok)
    }

    fn load_record_blob(&self, id: u64) -> Result<Vec<u8>> {
        self.state.load_record_blob(id)
    }
}
