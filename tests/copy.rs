//! COPY streaming against a scripted backend.

mod common;

use common::{FakeServer, binary_copy_header};
use pgconnector::{Connector, ConnectorState, CopyDirection, Error, Value};

const IMPORT_SQL: &str = "COPY points (id, label) FROM STDIN (FORMAT BINARY)";
const EXPORT_SQL: &str = "COPY points (id, label) TO STDOUT (FORMAT BINARY)";

fn field(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as i32).to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out
}

fn points_binary() -> Vec<u8> {
    let mut data = binary_copy_header();
    data.extend_from_slice(&2_i16.to_be_bytes());
    data.extend_from_slice(&field(&7_i32.to_be_bytes()));
    data.extend_from_slice(&field(b"x"));
    data.extend_from_slice(&2_i16.to_be_bytes());
    data.extend_from_slice(&field(&8_i32.to_be_bytes()));
    data.extend_from_slice(&(-1_i32).to_be_bytes());
    data.extend_from_slice(&(-1_i16).to_be_bytes());
    data
}

#[tokio::test]
async fn test_binary_import() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        assert_eq!(be.expect_query().await?, IMPORT_SQL);
        be.copy_in_response(1, 2).await?;
        let data = be.read_copy_in().await?.expect("COPY was failed");

        let mut expected = binary_copy_header();
        expected.extend_from_slice(&2_i16.to_be_bytes());
        expected.extend_from_slice(&field(&1_i32.to_be_bytes()));
        expected.extend_from_slice(&field(b"a"));
        expected.extend_from_slice(&2_i16.to_be_bytes());
        expected.extend_from_slice(&field(&2_i32.to_be_bytes()));
        expected.extend_from_slice(&(-1_i32).to_be_bytes());
        expected.extend_from_slice(&(-1_i16).to_be_bytes());
        assert_eq!(data, expected);

        be.complete("COPY 2").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut import = conn.begin_binary_import(IMPORT_SQL).await.unwrap();
    assert_eq!(import.num_columns(), 2);
    assert_eq!(conn.state(), ConnectorState::CopyIn);

    assert!(matches!(import.write(0_i32), Err(Error::InvalidUsage(_))));
    import.start_row().await.unwrap();
    import.write(1_i32).unwrap();
    import.write_typed("a", "text").unwrap();
    assert!(matches!(import.write(3_i32), Err(Error::InvalidUsage(_))));

    import
        .write_row([Value::from(2_i32), Value::Null])
        .await
        .unwrap();
    assert_eq!(import.rows(), 2);
    assert_eq!(import.finish().await.unwrap(), 2);
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn test_incomplete_row_is_rejected() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_in_response(1, 2).await?;
        let reason = be.read_copy_in().await?.unwrap_err();
        assert_eq!(reason, "COPY abandoned by the client");
        be.error("57014", "COPY from stdin failed").await?;
        be.ready(b'I').await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut import = conn.begin_binary_import(IMPORT_SQL).await.unwrap();
    import.start_row().await.unwrap();
    import.write(1_i32).unwrap();
    assert!(matches!(import.start_row().await, Err(Error::InvalidUsage(_))));
    assert!(matches!(import.finish().await, Err(Error::InvalidUsage(_))));

    // The COPY is failed on the connector's next use.
    conn.ping().await.unwrap();
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn test_binary_export_across_messages() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        assert_eq!(be.expect_query().await?, EXPORT_SQL);
        be.copy_out_response(1, 2).await?;
        let data = points_binary();
        // Split inside the first field's length prefix.
        let split = binary_copy_header().len() + 4;
        be.copy_data(&data[..split]).await?;
        be.copy_data(&data[split..]).await?;
        be.copy_done().await?;
        be.complete("COPY 2").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut export = conn.begin_binary_export(EXPORT_SQL).await.unwrap();
    assert_eq!(export.num_columns(), 2);

    assert_eq!(export.start_row().await.unwrap(), Some(2));
    assert_eq!(export.read("int4").await.unwrap(), Value::Int4(7));
    assert_eq!(export.read_as::<String>("text").await.unwrap(), "x");
    assert!(matches!(export.read("int4").await, Err(Error::InvalidUsage(_))));

    assert_eq!(export.start_row().await.unwrap(), Some(2));
    assert_eq!(export.read_as::<i32>("int4").await.unwrap(), 8);
    assert!(export.is_null().await.unwrap());
    assert_eq!(export.read("text").await.unwrap(), Value::Null);

    assert_eq!(export.start_row().await.unwrap(), None);
    assert_eq!(export.finish().await.unwrap(), 2);
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn test_binary_export_skips_unread_fields() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_out_response(1, 2).await?;
        be.copy_data(&points_binary()).await?;
        be.copy_done().await?;
        be.complete("COPY 2").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut export = conn.begin_binary_export(EXPORT_SQL).await.unwrap();
    export.start_row().await.unwrap();
    export.start_row().await.unwrap();
    assert_eq!(export.read_as::<i32>("int4").await.unwrap(), 8);
    export.skip().await.unwrap();
    assert_eq!(export.finish().await.unwrap(), 2);
}

#[tokio::test]
async fn test_text_export_lines_span_messages() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_out_response(0, 2).await?;
        be.copy_data(b"1\tfoo\n2\tb").await?;
        be.copy_data(b"ar\n").await?;
        be.copy_done().await?;
        be.complete("COPY 2").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut export = conn
        .begin_text_export("COPY points TO STDOUT")
        .await
        .unwrap();
    assert_eq!(export.read_line().await.unwrap().as_deref(), Some("1\tfoo"));
    assert_eq!(export.read_line().await.unwrap().as_deref(), Some("2\tbar"));
    assert_eq!(export.read_line().await.unwrap(), None);
    assert_eq!(export.finish().await.unwrap(), 2);
}

#[tokio::test]
async fn test_text_import_and_cancel() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_in_response(0, 2).await?;
        let data = be.read_copy_in().await?.expect("COPY was failed");
        assert_eq!(data, b"1\tfoo\n2\tbar\n");
        be.complete("COPY 2").await?;

        be.expect_query().await?;
        be.copy_in_response(0, 2).await?;
        let reason = be.read_copy_in().await?.unwrap_err();
        assert_eq!(reason, "COPY cancelled by the client");
        be.error("57014", "COPY from stdin failed: COPY cancelled by the client")
            .await?;
        be.ready(b'I').await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut import = conn
        .begin_text_import("COPY points FROM STDIN")
        .await
        .unwrap();
    import.write_line("1\tfoo").await.unwrap();
    import.write(b"2\tbar\n").await.unwrap();
    assert_eq!(import.finish().await.unwrap(), 2);

    let mut import = conn
        .begin_text_import("COPY points FROM STDIN")
        .await
        .unwrap();
    import.write_line("3\tbaz").await.unwrap();
    import.cancel().await.unwrap();
    assert_eq!(conn.state(), ConnectorState::Ready);
}

#[tokio::test]
async fn test_dropped_copy_out_is_drained() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_out_response(0, 1).await?;
        for line in ["a\n", "b\n", "c\n"] {
            be.copy_data(line.as_bytes()).await?;
        }
        be.copy_done().await?;
        be.complete("COPY 3").await?;
        assert_eq!(be.expect_query().await?, "SELECT 1");
        be.complete("SELECT 1").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    {
        let mut export = conn.begin_text_export("COPY t TO STDOUT").await.unwrap();
        assert_eq!(export.read_line().await.unwrap().as_deref(), Some("a"));
    }
    assert_eq!(conn.execute("SELECT 1", &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_wrong_copy_direction_recovers() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_out_response(1, 2).await?;
        be.copy_data(&points_binary()).await?;
        be.copy_done().await?;
        be.complete("COPY 2").await?;

        be.expect_query().await?;
        be.complete("SELECT 0").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    assert!(matches!(
        conn.begin_binary_import(EXPORT_SQL).await,
        Err(Error::InvalidUsage(_))
    ));
    assert_eq!(conn.state(), ConnectorState::Ready);

    // Not a COPY statement at all
    assert!(matches!(
        conn.begin_binary_export("SELECT 1").await,
        Err(Error::InvalidUsage(_))
    ));
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_raw_copy_both_directions() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        be.expect_query().await?;
        be.copy_out_response(1, 2).await?;
        be.copy_data(b"abc").await?;
        be.copy_data(b"def").await?;
        be.copy_done().await?;
        be.complete("COPY 1").await?;

        be.expect_query().await?;
        be.copy_in_response(1, 2).await?;
        let data = be.read_copy_in().await?.expect("COPY was failed");
        assert_eq!(data, b"abcdef");
        be.complete("COPY 1").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut out = conn
        .begin_raw_binary_copy(EXPORT_SQL, CopyDirection::Out)
        .await
        .unwrap();
    assert_eq!(out.direction(), CopyDirection::Out);
    assert!(matches!(out.write(b"x").await, Err(Error::InvalidUsage(_))));
    let mut bytes = Vec::new();
    while let Some(chunk) = out.read().await.unwrap() {
        bytes.extend_from_slice(&chunk);
    }
    assert_eq!(out.finish().await.unwrap(), 1);
    assert_eq!(bytes, b"abcdef");

    let mut input = conn
        .begin_raw_binary_copy(IMPORT_SQL, CopyDirection::In)
        .await
        .unwrap();
    input.write(&bytes).await.unwrap();
    assert_eq!(input.finish().await.unwrap(), 1);
}

#[tokio::test]
async fn test_binary_import_cancel() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        assert_eq!(be.expect_query().await?, IMPORT_SQL);
        be.copy_in_response(1, 2).await?;
        let reason = be.read_copy_in().await?.unwrap_err();
        assert_eq!(reason, "COPY cancelled by the client");
        be.error("57014", "COPY from stdin failed: COPY cancelled by the client")
            .await?;
        be.ready(b'I').await?;
        assert_eq!(be.expect_query().await?, "SELECT 1");
        be.complete("SELECT 1").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    let mut import = conn.begin_binary_import(IMPORT_SQL).await.unwrap();
    import
        .write_row([Value::from(1_i32), Value::from("a")])
        .await
        .unwrap();
    // Half a row is fine too: nothing of it reaches the table.
    import.start_row().await.unwrap();
    import.write(2_i32).unwrap();
    import.cancel().await.unwrap();

    assert_eq!(conn.state(), ConnectorState::Ready);
    assert_eq!(conn.execute("SELECT 1", &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_binary_import_is_failed_on_next_use() {
    let server = FakeServer::start(|mut be| async move {
        be.handshake().await?;
        assert_eq!(be.expect_query().await?, IMPORT_SQL);
        be.copy_in_response(1, 2).await?;
        let reason = be.read_copy_in().await?.unwrap_err();
        assert_eq!(reason, "COPY abandoned by the client");
        be.error("57014", "COPY from stdin failed: COPY abandoned by the client")
            .await?;
        be.ready(b'I').await?;
        assert_eq!(be.expect_query().await?, "SELECT 1");
        be.complete("SELECT 1").await?;
        be.serve_idle().await
    })
    .await;

    let conn = Connector::open(server.opts()).await.unwrap();
    {
        let mut import = conn.begin_binary_import(IMPORT_SQL).await.unwrap();
        for id in 0..3_i32 {
            import
                .write_row([Value::from(id), Value::from("p")])
                .await
                .unwrap();
        }
        assert_eq!(conn.state(), ConnectorState::CopyIn);
    }

    // Still mid-COPY on the wire until the next operation fails it.
    assert_eq!(conn.state(), ConnectorState::CopyIn);
    assert_eq!(conn.execute("SELECT 1", &[]).await.unwrap(), 1);
    assert_eq!(conn.state(), ConnectorState::Ready);
    assert!(!conn.is_broken());
}
