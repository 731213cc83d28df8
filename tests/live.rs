//! Tests against a real server.
//!
//! Set `PGCONNECTOR_TEST_HOST` (and optionally `_PORT`, `_USER`, `_PASSWORD`,
//! `_DATABASE`) to run them; without it every test returns early.

use std::env;

use pgconnector::{Connector, Opts, TransactionStatus, Value};

fn live_opts() -> Option<Opts> {
    let host = env::var("PGCONNECTOR_TEST_HOST").ok()?;
    let var = |name: &str| env::var(format!("PGCONNECTOR_TEST_{}", name)).ok();
    Some(Opts {
        host,
        port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(5432),
        user: var("USER").unwrap_or_else(|| "postgres".into()),
        password: var("PASSWORD"),
        database: var("DATABASE"),
        pooling: false,
        ..Default::default()
    })
}

async fn get_conn() -> Option<Connector> {
    let opts = live_opts()?;
    Some(Connector::open(opts).await.expect("Failed to connect"))
}

#[tokio::test]
async fn test_live_scalars_round_trip() {
    let Some(conn) = get_conn().await else {
        return;
    };

    let n: i64 = conn
        .query_scalar("SELECT $1::int8 * 2", &[Value::from(21_i64)])
        .await
        .unwrap();
    assert_eq!(n, 42);

    let row = conn
        .query_one(
            "SELECT $1::text AS s, $2::bool AS b, NULL::int4 AS missing",
            &[Value::from("héllo"), Value::from(true)],
        )
        .await
        .unwrap();
    assert_eq!(row.get_by_name::<String>("s").unwrap(), "héllo");
    assert!(row.get_by_name::<bool>("b").unwrap());
    assert_eq!(row.get_by_name::<Option<i32>>("missing").unwrap(), None);
}

#[tokio::test]
async fn test_live_series_streams() {
    let Some(conn) = get_conn().await else {
        return;
    };

    let mut rows = conn
        .query("SELECT generate_series(1, 1000) AS n", &[])
        .await
        .unwrap();
    let mut sum = 0_i64;
    while let Some(row) = rows.next().await.unwrap() {
        sum += row.get::<i32>(0).unwrap() as i64;
    }
    assert_eq!(sum, 500_500);
    assert_eq!(rows.rows_affected(), 1000);
}

#[tokio::test]
async fn test_live_server_error_then_recover() {
    let Some(conn) = get_conn().await else {
        return;
    };

    let err = conn.execute("SELECT 1/0", &[]).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("22012"));
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_live_transaction_and_copy() {
    let Some(conn) = get_conn().await else {
        return;
    };

    let tx = conn.begin().await.unwrap();
    tx.execute(
        "CREATE TEMP TABLE live_points (id int4, label text) ON COMMIT DROP",
        &[],
    )
    .await
    .unwrap();

    let mut import = conn
        .begin_binary_import("COPY live_points (id, label) FROM STDIN (FORMAT BINARY)")
        .await
        .unwrap();
    for id in 0..100_i32 {
        import
            .write_row([Value::from(id), Value::from(format!("p{}", id))])
            .await
            .unwrap();
    }
    assert_eq!(import.finish().await.unwrap(), 100);

    let mut export = conn
        .begin_text_export("COPY (SELECT id, label FROM live_points ORDER BY id LIMIT 2) TO STDOUT")
        .await
        .unwrap();
    assert_eq!(export.read_line().await.unwrap().as_deref(), Some("0\tp0"));
    assert_eq!(export.read_line().await.unwrap().as_deref(), Some("1\tp1"));
    assert_eq!(export.read_line().await.unwrap(), None);
    export.finish().await.unwrap();

    tx.rollback().await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}
