//! Re-ranking of candidate records against the query.
//!
//! The canonical scorer compares fields position-wise by 2-gram Jaccard
//! distance and averages the per-field distances. Both the extractor and
//! the scorer are pluggable; custom pairs are forwarded unchanged through
//! the single-threaded and parallel paths.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ngram::{char_ngrams, jaccard};

/// The grams of one field.
pub type FieldGrams = HashSet<String>;

/// Turns a record's fields into per-field gram sets.
pub type ExtractFn = Arc<dyn Fn(&[String]) -> Vec<FieldGrams> + Send + Sync>;

/// Dissimilarity between two extractions; lower is better.
pub type ScoreFn = Arc<dyn Fn(&[FieldGrams], &[FieldGrams]) -> f64 + Send + Sync>;

/// Canonical extractor: the set of character 2-grams of each field.
pub fn features(fields: &[String]) -> Vec<FieldGrams> {
    fields
        .iter()
        .map(|f| char_ngrams(f, 2, 1).into_iter().collect())
        .collect()
}

/// Canonical score: mean Jaccard distance over position-wise field pairs.
/// Extra fields on either side are ignored; no pairs at all scores 0.
pub fn distance(a: &[FieldGrams], b: &[FieldGrams]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = a.iter().zip(b.iter()).map(|(x, y)| jaccard(x, y)).sum();
    total / n as f64
}

pub fn default_extract() -> ExtractFn {
    Arc::new(|fields: &[String]| features(fields))
}

pub fn default_score() -> ScoreFn {
    Arc::new(|a: &[FieldGrams], b: &[FieldGrams]| distance(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_records_score_zero() {
        let f = features(&fields(&["MELANI", "PICKETT"]));
        assert_eq!(distance(&f, &f), 0.0);
    }

    #[test]
    fn disjoint_records_score_one() {
        let a = features(&fields(&["aaaa"]));
        let b = features(&fields(&["zzzz"]));
        assert_eq!(distance(&a, &b), 1.0);
    }

    #[test]
    fn extra_fields_are_ignored() {
        let a = features(&fields(&["MELANI", "PICKETT", "EXTRA"]));
        let b = features(&fields(&["MELANI", "PICKETT"]));
        assert_eq!(distance(&a, &b), 0.0);
    }

    #[test]
    fn near_miss_scores_between_zero_and_one() {
        let a = features(&fields(&["01030"]));
        let b = features(&fields(&["01003"]));
        let s = distance(&a, &b);
        assert!(s > 0.0 && s < 1.0, "got {s}");
    }

    #[test]
    fn empty_on_both_sides_scores_zero() {
        let a = features(&fields(&[""]));
        let b = features(&fields(&[""]));
        // a single pair of empty-ish gram sets
        assert_eq!(distance(&a, &b), 0.0);
        assert_eq!(distance(&[], &[]), 0.0);
    }
}
