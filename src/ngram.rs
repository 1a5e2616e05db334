//! Overlapping n-gram windows and the Jaccard distance used to compare them.

use std::collections::HashSet;
use std::hash::Hash;

/// All windows of `k` bytes at offsets `0, step, 2*step, ...`.
///
/// Inputs shorter than `k` yield the input itself as the only gram, so a
/// two-letter field still produces a usable token.
pub fn ngrams(s: &[u8], k: usize, step: usize) -> Vec<Vec<u8>> {
    if s.len() < k {
        return vec![s.to_vec()];
    }
    (0..=s.len() - k)
        .step_by(step)
        .map(|i| s[i..i + k].to_vec())
        .collect()
}

/// Character-level counterpart of [`ngrams`], windowing over chars rather
/// than bytes so multi-byte text doesn't split mid-character.
pub fn char_ngrams(s: &str, k: usize, step: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < k {
        return vec![s.to_string()];
    }
    (0..=chars.len() - k)
        .step_by(step)
        .map(|i| chars[i..i + k].iter().collect())
        .collect()
}

/// Jaccard distance between two sets, defined as 0 when both are empty.
pub fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let n = a.intersection(b).count();
    1.0 - n as f64 / (a.len() + b.len() - n) as f64
}
