//! Schema and migration tests using in-memory SurrealDB.

use surrealdb::Surreal;
use surrealdb::engine::local::Mem;

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();

    cmp_db::run_migrations(&db).await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();

    let mut result = db.query("SELECT * FROM schema_version").await.unwrap();
    let records: Vec<surrealdb_types::Value> = result.take(0).unwrap();
    assert_eq!(records.len(), 1);

    let mut result = db.query("INFO FOR DB").await.unwrap();
    let info: Option<surrealdb_types::Value> = result.take(0).unwrap();
    let info_str = format!("{:?}", info.expect("INFO FOR DB should return a value"));
    for table in [
        "certificate",
        "issuance_request",
        "approval_workflow",
        "audit_log",
        "adapter_config",
        "private_key",
        "agent",
        "installation_job",
    ] {
        assert!(info_str.contains(table), "missing {table} table");
    }
}

#[tokio::test]
async fn duplicate_fingerprints_are_rejected() {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();

    let insert = "CREATE certificate SET \
        fingerprint = 'ab', common_name = 'x', issuer = 'x', \
        not_before = time::now(), not_after = time::now(), \
        key_algorithm = 'Ecdsa', key_size = 256, status = 'Active'";
    db.query(insert).await.unwrap().check().unwrap();
    let second = db.query(insert).await.unwrap().check();
    assert!(second.is_err());
}

#[tokio::test]
async fn audit_sequence_numbers_are_unique() {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();

    let insert = "CREATE audit_log SET \
        seq = 0, timestamp = time::now(), entity_type = 'certificate', \
        entity_id = 'x', action = 'create', performed_by = 'system', \
        details = '{}', previous_hash = '', hash = 'h'";
    db.query(insert).await.unwrap().check().unwrap();
    let second = db.query(insert).await.unwrap().check();
    assert!(second.is_err());
}

#[tokio::test]
async fn status_values_are_constrained() {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    cmp_db::run_migrations(&db).await.unwrap();

    let result = db
        .query(
            "CREATE certificate SET \
             fingerprint = 'cd', common_name = 'x', issuer = 'x', \
             not_before = time::now(), not_after = time::now(), \
             key_algorithm = 'Ecdsa', key_size = 256, status = 'Suspended'",
        )
        .await
        .unwrap()
        .check();
    assert!(result.is_err());
}
