//! Compaction scenarios: live-record renumbering, global reference
//! remapping, dangling-to-null conversion, element-store garbage
//! reclamation, exact output sizes, and idempotence.

use tempfile::tempdir;
use typed_tables::{Database, FieldDef, TypeDef, Value};

fn str_v(s: &str) -> Value {
    Value::Str(s.to_string())
}

#[test]
fn soft_delete_then_compact_renumbers_references() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.register_type(TypeDef::composite("T", vec![FieldDef::new("n", "uint8")]))
        .unwrap();
    db.register_type(TypeDef::composite("H", vec![FieldDef::new("t", "T")]))
        .unwrap();

    for i in 0..10u8 {
        db.insert("T", vec![("n", Value::UInt(i as u128))]).unwrap();
    }
    // A holder referencing old index 5, which shifts to 4 once records 3
    // and 7 are dropped.
    db.insert("H", vec![("t", Value::reference("T", 5))]).unwrap();
    db.delete("T", 3).unwrap();
    db.delete("T", 7).unwrap();

    assert_eq!(db.scan("T").unwrap().len(), 8);

    let out = dir.path().join("compacted");
    let stats = db.compact_to(&out).unwrap();
    assert_eq!(stats.records_before, 11);
    assert_eq!(stats.records_after, 9);
    drop(db);

    let db2 = Database::open(&out).unwrap();
    assert_eq!(db2.record_count("T"), 8);
    let values: Vec<Value> = db2
        .scan("T")
        .unwrap()
        .into_iter()
        .map(|(_, r)| r.field("n").cloned().unwrap())
        .collect();
    assert_eq!(
        values,
        [0u8, 1, 2, 4, 5, 6, 8, 9]
            .iter()
            .map(|&n| Value::UInt(n as u128))
            .collect::<Vec<_>>()
    );

    let holder = db2.read("H", 0).unwrap();
    assert_eq!(holder.field("t"), Some(&Value::reference("T", 4)));
}

#[test]
fn dangling_references_become_explicit_nulls() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.register_type(TypeDef::composite("T", vec![FieldDef::new("n", "uint8")]))
        .unwrap();
    db.register_type(TypeDef::composite("H", vec![FieldDef::new("t", "T")]))
        .unwrap();

    db.insert("T", vec![("n", Value::UInt(1))]).unwrap();
    db.insert("H", vec![("t", Value::reference("T", 0))]).unwrap();
    db.delete("T", 0).unwrap();

    // Before compaction the live dangling reference reads as null.
    assert_eq!(db.read("H", 0).unwrap().field("t"), Some(&Value::Null));

    let out = dir.path().join("compacted");
    db.compact_to(&out).unwrap();
    drop(db);

    let db2 = Database::open(&out).unwrap();
    assert_eq!(db2.record_count("T"), 0);
    assert_eq!(db2.read("H", 0).unwrap().field("t"), Some(&Value::Null));
}

#[test]
fn element_store_garbage_is_reclaimed() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.register_type(TypeDef::composite("P", vec![FieldDef::new("n", "string")]))
        .unwrap();

    let idx = db.insert("P", vec![("n", str_v("a-long-obsolete-value"))]).unwrap();
    db.update("P", idx, vec![("n", str_v("Hi"))]).unwrap();

    let out = dir.path().join("compacted");
    db.compact_to(&out).unwrap();
    drop(db);

    // Only the two live characters survive: 8-byte header + 2 * 4 bytes.
    let size = std::fs::metadata(out.join("character.bin")).unwrap().len();
    assert_eq!(size, 8 + 8);

    let db2 = Database::open(&out).unwrap();
    assert_eq!(db2.read("P", 0).unwrap().field("n"), Some(&str_v("Hi")));
}

#[test]
fn nested_runs_and_dictionaries_remap() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.array_type("string").unwrap();
    db.dictionary_type("string", "uint8").unwrap();
    db.register_type(TypeDef::composite(
        "Doc",
        vec![
            FieldDef::new("tags", "string[]"),
            FieldDef::new("counts", "dictionary<string,uint8>"),
        ],
    ))
    .unwrap();

    let tags = Value::Array(vec![str_v("alpha"), str_v("beta")]);
    let counts = Value::Dict(vec![
        (str_v("alpha"), Value::UInt(1)),
        (str_v("beta"), Value::UInt(2)),
    ]);
    db.insert(
        "Doc",
        vec![("tags", tags.clone()), ("counts", counts.clone())],
    )
    .unwrap();

    // Churn the element stores so compaction has garbage to drop and
    // non-trivial remapping to do.
    db.update(
        "Doc",
        0,
        vec![("tags", tags.clone()), ("counts", counts.clone())],
    )
    .unwrap();

    let out = dir.path().join("compacted");
    db.compact_to(&out).unwrap();
    drop(db);

    let db2 = Database::open(&out).unwrap();
    let record = db2.read("Doc", 0).unwrap();
    assert_eq!(record.field("tags"), Some(&tags));
    assert_eq!(record.field("counts"), Some(&counts));
}

#[test]
fn interface_and_enum_slots_remap() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.register_type(TypeDef::interface("Named", vec![FieldDef::new("name", "string")], vec![]))
        .unwrap();
    db.register_type(TypeDef::composite_with(
        "Person",
        vec![FieldDef::new("age", "uint8")],
        None,
        vec!["Named".into()],
    ))
    .unwrap();
    db.register_type(
        TypeDef::enum_type(
            "Shape",
            vec![
                typed_tables::VariantSpec::bare("Empty"),
                typed_tables::VariantSpec::with_fields(
                    "Circle",
                    vec![FieldDef::new("radius", "float64")],
                ),
            ],
            None,
        )
        .unwrap(),
    )
    .unwrap();
    db.register_type(TypeDef::composite(
        "Row",
        vec![FieldDef::new("who", "Named"), FieldDef::new("shape", "Shape")],
    ))
    .unwrap();

    // Two people; the first is later deleted so the survivor renumbers.
    db.insert(
        "Person",
        vec![("name", str_v("gone")), ("age", Value::UInt(1))],
    )
    .unwrap();
    db.insert(
        "Person",
        vec![("name", str_v("kept")), ("age", Value::UInt(2))],
    )
    .unwrap();

    db.insert(
        "Row",
        vec![
            ("who", Value::reference("Person", 1)),
            (
                "shape",
                Value::enum_with("Circle", vec![("radius", Value::Float(2.0))]),
            ),
        ],
    )
    .unwrap();
    db.delete("Person", 0).unwrap();

    let out = dir.path().join("compacted");
    db.compact_to(&out).unwrap();
    drop(db);

    let db2 = Database::open(&out).unwrap();
    let row = db2.read("Row", 0).unwrap();
    // Person 1 became person 0; the type-id still resolves to Person.
    assert_eq!(row.field("who"), Some(&Value::reference("Person", 0)));
    assert_eq!(
        row.field("shape"),
        Some(&Value::enum_with("Circle", vec![("radius", Value::Float(2.0))]))
    );
    assert_eq!(
        db2.read("Person", 0).unwrap().field("name"),
        Some(&str_v("kept"))
    );
}

#[test]
fn compaction_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.array_type("string").unwrap();
    db.register_type(TypeDef::composite(
        "P",
        vec![FieldDef::new("name", "string"), FieldDef::new("tags", "string[]")],
    ))
    .unwrap();

    for i in 0..6u8 {
        db.insert(
            "P",
            vec![
                ("name", str_v(&format!("p{}", i))),
                ("tags", Value::Array(vec![str_v("x"), str_v(&format!("t{}", i))])),
            ],
        )
        .unwrap();
    }
    db.delete("P", 1).unwrap();
    db.delete("P", 4).unwrap();

    let once = dir.path().join("once");
    let twice = dir.path().join("twice");
    db.compact_to(&once).unwrap();
    drop(db);

    let db_once = Database::open(&once).unwrap();
    db_once.compact_to(&twice).unwrap();
    drop(db_once);

    // Identical contents, file by file.
    let mut names: Vec<String> = std::fs::read_dir(&once)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        let a = std::fs::read(once.join(&name)).unwrap();
        let b = std::fs::read(twice.join(&name)).unwrap();
        assert_eq!(a, b, "file '{}' differs after a second compaction", name);
    }
}

#[test]
fn empty_database_compacts_to_metadata_only() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("db")).unwrap();
    let out = dir.path().join("compacted");
    let stats = db.compact_to(&out).unwrap();
    assert_eq!(stats.records_before, 0);
    assert_eq!(stats.records_after, 0);
    assert!(out.join("_metadata.json").exists());
    drop(db);

    let db2 = Database::open(&out).unwrap();
    assert!(db2.registry().contains("uint8"));
}

#[test]
fn shared_runs_coalesce_in_the_output() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("db")).unwrap();
    db.register_type(TypeDef::composite(
        "P",
        vec![FieldDef::new("a", "string"), FieldDef::new("b", "string")],
    ))
    .unwrap();

    // Two slots of one record sharing one run is not constructible through
    // the public write path, so exercise the memo with two identical
    // values instead: distinct runs in, distinct runs out, sizes exact.
    db.insert("P", vec![("a", str_v("xy")), ("b", str_v("xy"))]).unwrap();

    let out = dir.path().join("compacted");
    db.compact_to(&out).unwrap();

    let size = std::fs::metadata(out.join("character.bin")).unwrap().len();
    assert_eq!(size, 8 + 4 * 4);
}
