//! Queries against real servers. Ignored by default; point `DBCAP_CONFIG` at a
//! file with `live-postgres` and `live-mysql` profiles and run
//! `cargo test --test live_test -- --ignored`.

use dbcap::config::load_profile;
use dbcap::{run_query, ConnectionSpec};
use serde_json::{json, Value};

fn profile(name: &str, max_rows: usize) -> ConnectionSpec {
    let mut spec = load_profile(name, None)
        .unwrap_or_else(|e| panic!("profile '{}' is not configured: {}", name, e));
    spec.max_rows = max_rows;
    spec
}

#[tokio::test]
#[ignore = "needs a PostgreSQL server"]
async fn test_postgres_native_types_are_decoded() {
    let sql = "SELECT 1.50::numeric AS price, avg(x) AS mean, \
               interval '1 day' AS span, time '04:05:06' AS at, \
               decode('dead', 'hex') AS blob, ARRAY[1, NULL, 3] AS ids \
               FROM (VALUES (1), (2)) v(x)";
    let result = run_query(sql, &profile("live-postgres", 10))
        .await
        .into_result()
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row["price"], json!("1.50"));
    assert!(row["mean"].as_str().unwrap().starts_with("1.5"), "{:?}", row["mean"]);
    assert_eq!(row["span"], json!("1 day"));
    assert_eq!(row["at"], json!("04:05:06"));
    assert_eq!(row["blob"], json!("\\xdead"));
    assert_eq!(row["ids"], json!([1, null, 3]));
}

#[tokio::test]
#[ignore = "needs a PostgreSQL server"]
async fn test_postgres_unmapped_types_are_not_null() {
    let sql = "SELECT point(1, 2) AS pt, '10.0.0.1'::inet AS addr, 'a=>1'::text::name AS nm";
    let result = run_query(sql, &profile("live-postgres", 10))
        .await
        .into_result()
        .unwrap();

    let row = &result.rows[0];
    for column in ["pt", "addr", "nm"] {
        assert_ne!(row[column], Value::Null, "{} decoded as null", column);
    }
    assert_eq!(row["nm"], json!("a=>1"));
}

#[tokio::test]
#[ignore = "needs a PostgreSQL server"]
async fn test_postgres_cap_marks_incomplete() {
    let result = run_query(
        "SELECT g FROM generate_series(1, 1000) g",
        &profile("live-postgres", 10),
    )
    .await
    .into_result()
    .unwrap();

    assert_eq!(result.rows.len(), 10);
    assert!(result.incomplete);
    assert_eq!(result.rows[9]["g"], json!(10));
}

#[tokio::test]
#[ignore = "needs a PostgreSQL server"]
async fn test_postgres_multi_statement_text_runs_uncapped() {
    let sql = "CREATE TEMP TABLE t (n int); INSERT INTO t VALUES (1), (2), (3); SELECT n FROM t";
    let result = run_query(sql, &profile("live-postgres", 2))
        .await
        .into_result()
        .unwrap();

    assert_eq!(result.rows.len(), 3);
    assert!(!result.incomplete);
    assert_eq!(result.rows[2]["n"], json!(3));
}

#[tokio::test]
#[ignore = "needs a MySQL server"]
async fn test_mysql_values_are_typed() {
    let sql = "SELECT CAST(1.50 AS DECIMAL(5,2)) AS price, 42 AS n, x'CAFE' AS blob, \
               CAST('{\"a\": 1}' AS JSON) AS doc";
    let result = run_query(sql, &profile("live-mysql", 10))
        .await
        .into_result()
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row["price"], json!("1.50"));
    assert_eq!(row["n"], json!(42));
    assert_eq!(row["blob"], json!("0xCAFE"));
    assert_eq!(row["doc"], json!({"a": 1}));
}

#[tokio::test]
#[ignore = "needs a MySQL server"]
async fn test_mysql_cap_marks_incomplete() {
    let sql = "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 1000) \
               SELECT n FROM seq";
    let result = run_query(sql, &profile("live-mysql", 10))
        .await
        .into_result()
        .unwrap();

    assert_eq!(result.rows.len(), 10);
    assert!(result.incomplete);
}
