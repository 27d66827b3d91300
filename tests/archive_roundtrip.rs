//! Archive and restore: the bundle must reproduce the compacted directory
//! exactly, with or without gzip, and the restored directory must open as
//! a working database.

use tempfile::tempdir;
use typed_tables::{restore, Database, FieldDef, TypeDef, Value, VariantSpec};

fn str_v(s: &str) -> Value {
    Value::Str(s.to_string())
}

fn populate(db: &mut Database) {
    db.array_type("string").unwrap();
    db.register_type(
        TypeDef::enum_type(
            "Shape",
            vec![
                VariantSpec::bare("Empty"),
                VariantSpec::with_fields("Circle", vec![FieldDef::new("radius", "float64")]),
            ],
            None,
        )
        .unwrap(),
    )
    .unwrap();
    db.register_type(TypeDef::composite(
        "Person",
        vec![
            FieldDef::new("name", "string"),
            FieldDef::new("tags", "string[]"),
            FieldDef::new("shape", "Shape"),
        ],
    ))
    .unwrap();

    db.insert(
        "Person",
        vec![
            ("name", str_v("Alice")),
            ("tags", Value::Array(vec![str_v("a"), str_v("b")])),
            (
                "shape",
                Value::enum_with("Circle", vec![("radius", Value::Float(1.0))]),
            ),
        ],
    )
    .unwrap();
    db.insert(
        "Person",
        vec![
            ("name", str_v("Bob")),
            ("tags", Value::Array(vec![])),
            ("shape", Value::enum_bare("Empty")),
        ],
    )
    .unwrap();
    db.insert("Person", vec![("name", str_v("Doomed"))]).unwrap();
    db.delete("Person", 2).unwrap();
}

#[test]
fn archive_then_restore_reopens_with_all_records() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    populate(&mut db);

    let bundle = dir.path().join("backup.ttar");
    let stats = db.archive_to(&bundle).unwrap();
    assert!(stats.file_count > 0);
    assert!(stats.total_bytes > 0);
    drop(db);

    let out = dir.path().join("restored");
    restore(&bundle, &out).unwrap();

    let db2 = Database::open(&out).unwrap();
    // The archive carries the compacted form: the tombstone is gone.
    assert_eq!(db2.record_count("Person"), 2);
    let alice = db2.read("Person", 0).unwrap();
    assert_eq!(alice.field("name"), Some(&str_v("Alice")));
    assert_eq!(
        alice.field("tags"),
        Some(&Value::Array(vec![str_v("a"), str_v("b")]))
    );
    assert_eq!(
        alice.field("shape"),
        Some(&Value::enum_with("Circle", vec![("radius", Value::Float(1.0))]))
    );
    let bob = db2.read("Person", 1).unwrap();
    assert_eq!(bob.field("shape"), Some(&Value::enum_bare("Empty")));
}

#[test]
fn archive_restore_is_identity_on_compacted_contents() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    populate(&mut db);

    // Compact first; archiving the compacted directory and restoring it
    // must reproduce the same bytes.
    let compacted = dir.path().join("compacted");
    db.compact_to(&compacted).unwrap();
    drop(db);

    let db_c = Database::open(&compacted).unwrap();
    let bundle = dir.path().join("backup.ttar");
    db_c.archive_to(&bundle).unwrap();
    drop(db_c);

    let out = dir.path().join("restored");
    restore(&bundle, &out).unwrap();

    fn walk(root: &std::path::Path, base: &std::path::Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(root).unwrap() {
            let entry = entry.unwrap();
            if entry.metadata().unwrap().is_dir() {
                walk(&entry.path(), base, out);
            } else {
                out.push(
                    entry
                        .path()
                        .strip_prefix(base)
                        .unwrap()
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
    }

    let mut names = Vec::new();
    walk(&compacted, &compacted, &mut names);
    names.sort();
    assert!(!names.is_empty());

    for name in names {
        let a = std::fs::read(compacted.join(&name)).unwrap();
        let b = std::fs::read(out.join(&name)).unwrap();
        assert_eq!(a, b, "file '{}' differs after archive round-trip", name);
    }
}

#[test]
fn gzip_archives_round_trip() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    populate(&mut db);

    let bundle = dir.path().join("backup.ttar.gz");
    db.archive_to(&bundle).unwrap();
    drop(db);

    // Gzip magic on disk.
    let raw = std::fs::read(&bundle).unwrap();
    assert_eq!(&raw[..2], &[0x1F, 0x8B]);

    let out = dir.path().join("restored");
    restore(&bundle, &out).unwrap();
    let db2 = Database::open(&out).unwrap();
    assert_eq!(db2.record_count("Person"), 2);
}

#[test]
fn archiving_an_empty_database_works() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    let bundle = dir.path().join("empty.ttar");
    let stats = db.archive_to(&bundle).unwrap();
    assert_eq!(stats.file_count, 1); // just the metadata document
    drop(db);

    let out = dir.path().join("restored");
    restore(&bundle, &out).unwrap();
    let db2 = Database::open(&out).unwrap();
    assert!(db2.registry().contains("string"));
}
