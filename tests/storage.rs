//! Backend-contract tests run against every shipped back-end.

use tempfile::tempdir;

use polymr::range::Posting;
use polymr::record::Record;
use polymr::storage::{self, Backend, DiskBackend, FreqTable, MemoryBackend};
use polymr::Token;

fn tok(s: &str) -> Token {
    s.as_bytes().to_vec()
}

fn contract(db: &mut dyn Backend) {
    // freqs
    let mut freqs = FreqTable::new();
    freqs.insert(tok("abc"), 3);
    freqs.insert(tok("bcd"), 2);
    db.save_freqs(&freqs).unwrap();
    assert_eq!(db.get_freqs().unwrap(), freqs);

    // rowcount
    db.save_rowcount(222).unwrap();
    assert_eq!(db.get_rowcount().unwrap(), 222);
    assert_eq!(db.increment_rowcount(3).unwrap(), 225);

    // tokens, flat and compacted
    db.save_token(b"abc", &Posting::from_sorted_ids(vec![1, 2, 3]))
        .unwrap();
    assert_eq!(db.get_token(b"abc").unwrap(), vec![1, 2, 3]);
    db.save_token(b"bcd", &Posting::Compacted(vec![
        polymr::Span::Id(1),
        polymr::Span::Id(2),
        polymr::Span::Range(3, 6),
        polymr::Span::Id(7),
    ]))
    .unwrap();
    assert_eq!(db.get_token(b"bcd").unwrap(), (1..=7).collect::<Vec<u64>>());

    // the worker-facing blob path decodes the same ids
    let blob = db.load_token_blob(b"bcd").unwrap();
    assert_eq!(
        db.kind().decode_token_blob(&blob).unwrap(),
        (1..=7).collect::<Vec<u64>>()
    );

    // records
    let r1 = Record::new(vec!["abcde".into(), "foo".into()], "1".into(), vec![]);
    let r2 = Record::new(vec!["qwert".into(), "bar".into()], "2".into(), vec![]);
    let mut batch = vec![(0u64, r1.clone()), (1u64, r2.clone())].into_iter();
    assert_eq!(db.save_records(&mut batch).unwrap(), 2);
    let got = db.get_records(&[0, 1]).unwrap();
    assert_eq!(got[0].fields, r1.fields);
    assert_eq!(got[0].pk, r1.pk);
    assert_eq!(got[1].fields, r2.fields);
    assert_eq!(got[1].pk, r2.pk);

    let blob = db.load_record_blob(0).unwrap();
    assert_eq!(db.kind().decode_record_blob(&blob).unwrap(), r1);

    db.delete_record(0).unwrap();
    assert!(db.get_record(0).unwrap_err().is_not_found());

    // featurizer name
    db.save_featurizer_name("compress").unwrap();
    assert_eq!(db.get_featurizer_name().unwrap(), "compress");
}

#[test]
fn memory_backend_contract() {
    let mut db = MemoryBackend::new();
    contract(&mut db);
}

#[test]
fn disk_backend_contract() {
    let dir = tempdir().unwrap();
    let mut db = DiskBackend::open(&dir.path().join("db")).unwrap();
    contract(&mut db);
    db.close().unwrap();
}

#[test]
fn copy_replicates_an_index() {
    let mut from = MemoryBackend::new();
    let mut freqs = FreqTable::new();
    freqs.insert(tok("abc"), 3);
    freqs.insert(tok("xyz"), 1);
    from.save_freqs(&freqs).unwrap();
    from.save_token(b"abc", &Posting::from_sorted_ids(vec![0, 1, 2]))
        .unwrap();
    from.save_token(b"xyz", &Posting::from_sorted_ids(vec![1]))
        .unwrap();
    let rec = Record::new(vec!["a".into()], "pk".into(), vec![]);
    let mut batch = vec![(0u64, rec.clone())].into_iter();
    from.save_records(&mut batch).unwrap();
    from.save_rowcount(1).unwrap();
    from.save_featurizer_name("k3").unwrap();

    let mut to = MemoryBackend::new();
    storage::copy(&from, &mut to, None).unwrap();
    assert_eq!(to.get_rowcount().unwrap(), 1);
    assert_eq!(to.get_freqs().unwrap(), freqs);
    assert_eq!(to.get_token(b"abc").unwrap(), vec![0, 1, 2]);
    assert_eq!(to.get_token(b"xyz").unwrap(), vec![1]);
    assert_eq!(to.get_record(0).unwrap(), rec);
    assert_eq!(to.get_featurizer_name().unwrap(), "k3");
}

#[test]
fn copy_droptop_sheds_hot_tokens() {
    let mut from = MemoryBackend::new();
    let mut freqs = FreqTable::new();
    freqs.insert(tok("hot"), 100);
    freqs.insert(tok("warm"), 10);
    freqs.insert(tok("cold"), 1);
    freqs.insert(tok("cool"), 2);
    from.save_freqs(&freqs).unwrap();
    for t in ["hot", "warm", "cold", "cool"] {
        from.save_token(t.as_bytes(), &Posting::from_sorted_ids(vec![0]))
            .unwrap();
    }
    from.save_rowcount(0).unwrap();
    from.save_featurizer_name("k3").unwrap();

    let mut to = MemoryBackend::new();
    storage::copy(&from, &mut to, Some(0.25)).unwrap();
    let copied = to.get_freqs().unwrap();
    assert!(!copied.contains_key(&tok("hot")));
    assert_eq!(copied.len(), 3);
    assert!(to.get_token(b"hot").is_err());
}
