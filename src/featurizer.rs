//! Record featurizers: pure functions from searchable fields to token sets.
//!
//! The featurizer used at build time is persisted with the index and bound
//! again at open, so queries always tokenize the same way the corpus did.
//! Tokens are opaque byte strings; nothing downstream interprets them.

use std::collections::HashSet;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::ngram::ngrams;

/// An opaque byte token emitted by a featurizer.
pub type Token = Vec<u8>;

/// The available featurizers, selected at index open from the persisted
/// name. Unknown names are rejected before any work begins.
///
/// The `Compress*` variants run each field through zlib first; n-grams of
/// the compressed bytes capture longer-range structure than raw-text grams
/// while staying cheap to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Featurizer {
    K2,
    K3,
    K4,
    Compress,
    CompressK4,
}

impl Featurizer {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "k2" => Ok(Featurizer::K2),
            "k3" => Ok(Featurizer::K3),
            "k4" => Ok(Featurizer::K4),
            "compress" | "default" => Ok(Featurizer::Compress),
            "compress_k4" => Ok(Featurizer::CompressK4),
            other => Err(Error::Config(format!("unknown featurizer: {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Featurizer::K2 => "k2",
            Featurizer::K3 => "k3",
            Featurizer::K4 => "k4",
            Featurizer::Compress => "compress",
            Featurizer::CompressK4 => "compress_k4",
        }
    }

    /// Tokenize a record's searchable fields. Deterministic, and
    /// order-independent across fields: the result is the deduplicated
    /// union of each field's grams.
    pub fn features(self, fields: &[String]) -> Result<HashSet<Token>> {
        let mut set = HashSet::new();
        for field in fields {
            match self {
                Featurizer::K2 => set.extend(ngrams(field.as_bytes(), 2, 1)),
                Featurizer::K3 => set.extend(ngrams(field.as_bytes(), 3, 1)),
                Featurizer::K4 => set.extend(ngrams(field.as_bytes(), 4, 1)),
                Featurizer::Compress => set.extend(ngrams(&deflate(field.as_bytes())?, 3, 1)),
                Featurizer::CompressK4 => set.extend(ngrams(&deflate(field.as_bytes())?, 4, 1)),
            }
        }
        Ok(set)
    }
}

/// Raw zlib stream for one field, header and checksum included. The output
/// must be byte-identical between build and query time, so the compression
/// level is pinned.
fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)?;
    Ok(enc.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn names_round_trip() {
        for f in [
            Featurizer::K2,
            Featurizer::K3,
            Featurizer::K4,
            Featurizer::Compress,
            Featurizer::CompressK4,
        ] {
            assert_eq!(Featurizer::from_name(f.name()).unwrap(), f);
        }
        assert!(Featurizer::from_name("bogus").is_err());
    }

    #[test]
    fn default_maps_to_compress() {
        assert_eq!(
            Featurizer::from_name("default").unwrap(),
            Featurizer::Compress
        );
    }

    #[test]
    fn deterministic_and_order_independent() {
        let a = fields(&["MELANI", "PICKETT"]);
        let b = fields(&["PICKETT", "MELANI"]);
        for f in [Featurizer::K3, Featurizer::Compress] {
            assert_eq!(f.features(&a).unwrap(), f.features(&a).unwrap());
            assert_eq!(f.features(&a).unwrap(), f.features(&b).unwrap());
        }
    }

    #[test]
    fn k2_emits_raw_bigrams() {
        let toks = Featurizer::K2.features(&fields(&["fish"])).unwrap();
        let expected: HashSet<Token> =
            [b"fi".to_vec(), b"is".to_vec(), b"sh".to_vec()].into();
        assert_eq!(toks, expected);
    }

    #[test]
    fn compressed_grams_differ_from_raw() {
        let f = fields(&["18 PAUL REVERE DR"]);
        assert_ne!(
            Featurizer::Compress.features(&f).unwrap(),
            Featurizer::K3.features(&f).unwrap()
        );
    }

    #[test]
    fn similar_fields_share_tokens() {
        let a = Featurizer::Compress
            .features(&fields(&["01030", "PICKETT"]))
            .unwrap();
        let b = Featurizer::Compress
            .features(&fields(&["01003", "PICKETT"]))
            .unwrap();
        assert!(a.intersection(&b).count() > 0);
    }
}
