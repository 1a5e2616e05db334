//! Records, search results, and the thin CSV/PSV readers behind the CLI.

use std::io::{BufRead, Read};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An indexed record.
///
/// `fields` are the searchable attributes, `pk` is the opaque identifier
/// handed back to the caller, `data` is stored but never searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub fields: Vec<String>,
    pub pk: String,
    pub data: Vec<String>,
}

impl Record {
    pub fn new(fields: Vec<String>, pk: String, data: Vec<String>) -> Self {
        Record { fields, pk, data }
    }

    /// Copy with `data` dropped; the build pipeline only needs `fields`
    /// downstream of record ingest.
    pub fn without_data(&self) -> Record {
        Record {
            fields: self.fields.clone(),
            pk: self.pk.clone(),
            data: Vec::new(),
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub fields: Vec<String>,
    pub pk: String,
    pub data: Vec<String>,
    pub rownum: u64,
    pub score: f64,
}

/// Column layout for the flat-file readers.
///
/// Defaults mirror the common export shape: every column but the last is
/// searched and the last column is the primary key. A negative `pk_idx`
/// counts from the end.
#[derive(Debug, Clone)]
pub struct ReaderSpec {
    pub search_idxs: Option<Vec<usize>>,
    pub pk_idx: Option<isize>,
    pub include_data: bool,
}

impl Default for ReaderSpec {
    fn default() -> Self {
        ReaderSpec {
            search_idxs: None,
            pk_idx: None,
            include_data: true,
        }
    }
}

struct Layout {
    search_idxs: Vec<usize>,
    pk_idx: usize,
    data_idxs: Vec<usize>,
}

impl Layout {
    fn resolve(spec: &ReaderSpec, ncols: usize) -> Layout {
        let search_idxs = spec
            .search_idxs
            .clone()
            .unwrap_or_else(|| (0..ncols.saturating_sub(1)).collect());
        let pk_idx = match spec.pk_idx {
            None => ncols.saturating_sub(1),
            Some(i) if i < 0 => (ncols as isize + i).max(0) as usize,
            Some(i) => i as usize,
        };
        let data_idxs = if spec.include_data {
            (0..ncols)
                .filter(|i| *i != pk_idx && !search_idxs.contains(i))
                .collect()
        } else {
            Vec::new()
        };
        Layout {
            search_idxs,
            pk_idx,
            data_idxs,
        }
    }

    fn make(&self, row: &[String]) -> Record {
        let get = |i: usize| row.get(i).cloned().unwrap_or_default();
        Record {
            fields: self.search_idxs.iter().map(|&i| get(i)).collect(),
            pk: get(self.pk_idx),
            data: self.data_idxs.iter().map(|&i| get(i)).collect(),
        }
    }
}

/// Read comma-separated rows (no header) as records. The layout is fixed
/// by the first row's width.
pub fn from_csv<R: Read>(
    reader: R,
    spec: ReaderSpec,
) -> impl Iterator<Item = Result<Record>> {
    let rows = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
        .into_records();
    let mut layout: Option<Layout> = None;
    rows.map(move |row| {
        let row = row?;
        let cols: Vec<String> = row.iter().map(str::to_string).collect();
        let layout = layout.get_or_insert_with(|| Layout::resolve(&spec, cols.len()));
        Ok(layout.make(&cols))
    })
}

/// Read pipe-separated rows as records, skipping blank lines.
pub fn from_psv<R: BufRead>(
    reader: R,
    spec: ReaderSpec,
) -> impl Iterator<Item = Result<Record>> {
    let mut layout: Option<Layout> = None;
    reader
        .lines()
        .filter(|l| !matches!(l, Ok(l) if l.trim().is_empty()))
        .map(move |line| {
            let line = line?;
            let cols: Vec<String> = line.trim().split('|').map(str::to_string).collect();
            let layout = layout.get_or_insert_with(|| Layout::resolve(&spec, cols.len()));
            Ok(layout.make(&cols))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "01001,MA,DONNA,AGAWAM,WUCHERT,PO BOX 329,9799PNOVAY\n\
                       01007,MA,BERONE,BELCHERTOWN,BOARDWAY,135 FEDERAL ST,9799JA8CB5\n";

    #[test]
    fn default_layout_searches_all_but_last() {
        let recs: Vec<Record> = from_csv(CSV.as_bytes(), ReaderSpec::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].pk, "9799PNOVAY");
        assert_eq!(recs[0].fields.len(), 6);
        assert!(recs[0].data.is_empty());
    }

    #[test]
    fn explicit_layout_splits_fields_and_data() {
        let spec = ReaderSpec {
            search_idxs: Some(vec![0, 2, 4, 5]),
            pk_idx: Some(-1),
            include_data: true,
        };
        let recs: Vec<Record> = from_csv(CSV.as_bytes(), spec)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            recs[0].fields,
            ["01001", "DONNA", "WUCHERT", "PO BOX 329"]
        );
        assert_eq!(recs[0].pk, "9799PNOVAY");
        assert_eq!(recs[0].data, ["MA", "AGAWAM"]);
    }

    #[test]
    fn psv_skips_blank_lines() {
        let psv = "a|b|pk1\n\n c|d|pk2 \n";
        let recs: Vec<Record> = from_psv(psv.as_bytes(), ReaderSpec::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].pk, "pk2");
    }

    #[test]
    fn without_data_clears_payload() {
        let r = Record::new(
            vec!["a".into()],
            "pk".into(),
            vec!["payload".into()],
        );
        let slim = r.without_data();
        assert_eq!(slim.fields, r.fields);
        assert!(slim.data.is_empty());
    }
}
