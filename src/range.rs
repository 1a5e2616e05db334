//! Run-length compaction of sorted row-id lists.
//!
//! Posting lists are stored either flat (a packed `Vec<u64>`) or compacted
//! into a mix of single ids and inclusive ranges. Compaction is lossless:
//! `decompact(compact(ids)) == ids` for any strictly ascending input.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// One element of a compacted posting: a lone row id or an inclusive run
/// `[lo, hi]` with `lo < hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Span {
    Id(u64),
    Range(u64, u64),
}

/// Collapse consecutive runs in a strictly ascending id list.
///
/// The flag reports whether any run was formed; when it is false the
/// elements are exactly the input and the posting should be stored flat.
pub fn compact(ids: &[u64]) -> (Vec<Span>, bool) {
    compact_iter(ids.iter().copied())
}

fn compact_iter(ids: impl Iterator<Item = u64>) -> (Vec<Span>, bool) {
    let mut out = Vec::new();
    let mut compacted = false;
    let mut prev: Option<u64> = None;
    for x in ids {
        match (prev, out.last_mut()) {
            (Some(p), Some(Span::Range(_, hi))) if x == p + 1 => *hi = x,
            (Some(p), Some(last)) if x == p + 1 => {
                *last = Span::Range(p, x);
                compacted = true;
            }
            _ => out.push(Span::Id(x)),
        }
        prev = Some(x);
    }
    (out, compacted)
}

/// Merge several ascending id lists and compact the result in one pass.
pub fn merge_compact<'a, I>(lists: I) -> (Vec<Span>, bool)
where
    I: IntoIterator<Item = &'a [u64]>,
{
    compact_iter(lists.into_iter().map(|l| l.iter().copied()).kmerge())
}

/// Expand a compacted posting back to the flat ascending id list.
pub fn decompact(spans: &[Span]) -> Vec<u64> {
    let mut out = Vec::new();
    for span in spans {
        match *span {
            Span::Id(i) => out.push(i),
            Span::Range(lo, hi) => out.extend(lo..=hi),
        }
    }
    out
}

/// A posting list in its stored form. The variant tag doubles as the
/// compaction flag carried by the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Posting {
    Flat(Vec<u64>),
    Compacted(Vec<Span>),
}

impl Posting {
    /// Choose the stored form for a strictly ascending id list.
    pub fn from_sorted_ids(ids: Vec<u64>) -> Self {
        let (spans, compacted) = compact(&ids);
        if compacted {
            Posting::Compacted(spans)
        } else {
            Posting::Flat(ids)
        }
    }

    /// Choose the stored form for a compactor result. When no run was
    /// formed every span is a single id and the posting is stored flat.
    pub fn from_spans(spans: Vec<Span>, compacted: bool) -> Self {
        if compacted {
            Posting::Compacted(spans)
        } else {
            Posting::Flat(decompact(&spans))
        }
    }

    /// Decode to the flat ascending id list.
    pub fn decode(&self) -> Vec<u64> {
        match self {
            Posting::Flat(ids) => ids.clone(),
            Posting::Compacted(spans) => decompact(spans),
        }
    }

    /// Number of distinct row ids in the posting.
    pub fn len(&self) -> u64 {
        match self {
            Posting::Flat(ids) => ids.len() as u64,
            Posting::Compacted(spans) => spans
                .iter()
                .map(|s| match *s {
                    Span::Id(_) => 1,
                    Span::Range(lo, hi) => hi - lo + 1,
                })
                .sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Posting::Flat(ids) => ids.is_empty(),
            Posting::Compacted(spans) => spans.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_collapse() {
        assert_eq!(compact(&[1, 2, 3]), (vec![Span::Range(1, 3)], true));
        assert_eq!(compact(&[1, 2, 3, 4, 5]), (vec![Span::Range(1, 5)], true));
    }

    #[test]
    fn merged_lists_collapse() {
        let (spans, compacted) = merge_compact([&[1u64, 3, 5][..], &[2u64, 4][..]]);
        assert_eq!(spans, vec![Span::Range(1, 5)]);
        assert!(compacted);
    }

    #[test]
    fn gapped_lists_stay_flat() {
        let (spans, compacted) = compact(&[1, 3, 6, 8]);
        assert_eq!(
            spans,
            vec![Span::Id(1), Span::Id(3), Span::Id(6), Span::Id(8)]
        );
        assert!(!compacted);
    }

    #[test]
    fn mixed_runs_and_singles() {
        let (spans, compacted) = compact(&[1, 2, 3, 7, 9, 10]);
        assert_eq!(
            spans,
            vec![Span::Range(1, 3), Span::Id(7), Span::Range(9, 10)]
        );
        assert!(compacted);
    }

    #[test]
    fn round_trip() {
        for ids in [
            vec![],
            vec![0],
            vec![1, 2, 3],
            vec![1, 3, 6, 8],
            vec![0, 1, 5, 6, 7, 100, 102, 103],
        ] {
            let (spans, _) = compact(&ids);
            assert_eq!(decompact(&spans), ids);
            assert_eq!(Posting::from_sorted_ids(ids.clone()).decode(), ids);
        }
    }

    #[test]
    fn posting_len_counts_distinct_ids() {
        assert_eq!(Posting::from_sorted_ids(vec![1, 2, 3, 9]).len(), 4);
        assert_eq!(Posting::from_sorted_ids(vec![4, 8]).len(), 2);
        assert_eq!(Posting::from_sorted_ids(vec![]).len(), 0);
    }
}
