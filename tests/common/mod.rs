//! A scripted PostgreSQL backend on a loopback listener.
//!
//! Every accepted startup connection runs the test's script with a
//! [`Backend`]; cancel requests are acknowledged through `FakeServer::cancelled`.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pgconnector::Opts;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const CANCEL_REQUEST_CODE: i32 = 80877102;
const FIRST_PID: u32 = 1000;

pub const BOOL: u32 = 16;
pub const BYTEA: u32 = 17;
pub const INT4: u32 = 23;
pub const TEXT: u32 = 25;
pub const OID: u32 = 26;
pub const INT4_ARRAY: u32 = 1007;

/// Statement text and declared parameter types of a Parse message.
#[derive(Debug)]
pub struct Parsed {
    pub sql: String,
    pub param_oids: Vec<u32>,
}

pub struct FakeServer {
    pub port: u16,
    pub cancelled: Arc<Notify>,
    sessions: Arc<AtomicU32>,
}

impl FakeServer {
    pub async fn start<F, Fut>(script: F) -> Self
    where
        F: Fn(Backend) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancelled = Arc::new(Notify::new());
        let sessions = Arc::new(AtomicU32::new(0));

        let script = Arc::new(script);
        let accept_cancelled = Arc::clone(&cancelled);
        let accept_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = Arc::clone(&script);
                let cancelled = Arc::clone(&accept_cancelled);
                let sessions = Arc::clone(&accept_sessions);
                tokio::spawn(async move {
                    if let Err(err) = serve(socket, script, cancelled, sessions).await {
                        if err.kind() != io::ErrorKind::UnexpectedEof {
                            eprintln!("fake backend: {}", err);
                        }
                    }
                });
            }
        });

        Self {
            port,
            cancelled,
            sessions,
        }
    }

    /// Startup connections accepted so far.
    pub fn sessions(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".into(),
            port: self.port,
            user: "tester".into(),
            pooling: false,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }
}

async fn serve<F, Fut>(
    mut socket: TcpStream,
    script: Arc<F>,
    cancelled: Arc<Notify>,
    sessions: Arc<AtomicU32>,
) -> io::Result<()>
where
    F: Fn(Backend) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let len = socket.read_i32().await?;
    let code = socket.read_i32().await?;
    let mut rest = vec![0; len as usize - 8];
    socket.read_exact(&mut rest).await?;
    if code == CANCEL_REQUEST_CODE {
        cancelled.notify_one();
        return Ok(());
    }
    let pid = FIRST_PID + sessions.fetch_add(1, Ordering::SeqCst);
    (*script)(Backend {
        socket,
        pid,
        cancelled,
    })
    .await
}

/// Server side of one session.
pub struct Backend {
    socket: TcpStream,
    pub pid: u32,
    /// Signalled when a CancelRequest arrives on any connection
    pub cancelled: Arc<Notify>,
}

impl Backend {
    pub async fn send(&mut self, type_byte: u8, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(type_byte);
        frame.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        frame.extend_from_slice(payload);
        self.socket.write_all(&frame).await
    }

    pub async fn recv(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let type_byte = self.socket.read_u8().await?;
        let len = self.socket.read_i32().await?;
        let mut payload = vec![0; len as usize - 4];
        self.socket.read_exact(&mut payload).await?;
        Ok((type_byte, payload))
    }

    pub async fn expect(&mut self, type_byte: u8) -> io::Result<Vec<u8>> {
        let (actual, payload) = self.recv().await?;
        assert_eq!(
            actual as char, type_byte as char,
            "unexpected frontend message"
        );
        Ok(payload)
    }

    pub async fn expect_query(&mut self) -> io::Result<String> {
        let mut payload = self.expect(b'Q').await?;
        assert_eq!(payload.pop(), Some(0));
        Ok(String::from_utf8(payload).unwrap())
    }

    /// AuthenticationOk, server parameters, BackendKeyData and ReadyForQuery.
    pub async fn handshake(&mut self) -> io::Result<()> {
        self.send(b'R', &0_i32.to_be_bytes()).await?;
        self.parameter_status("server_version", "16.2").await?;
        self.parameter_status("client_encoding", "UTF8").await?;
        self.parameter_status("standard_conforming_strings", "on").await?;
        self.parameter_status("integer_datetimes", "on").await?;
        let mut key = self.pid.to_be_bytes().to_vec();
        key.extend_from_slice(&42_u32.to_be_bytes());
        self.send(b'K', &key).await?;
        self.ready(b'I').await
    }

    pub async fn parameter_status(&mut self, name: &str, value: &str) -> io::Result<()> {
        let mut payload = cstr(name);
        payload.extend_from_slice(&cstr(value));
        self.send(b'S', &payload).await
    }

    pub async fn ready(&mut self, status: u8) -> io::Result<()> {
        self.send(b'Z', &[status]).await
    }

    /// `(name, type oid, format)` per column.
    pub async fn row_description(&mut self, columns: &[(&str, u32, i16)]) -> io::Result<()> {
        let mut payload = (columns.len() as i16).to_be_bytes().to_vec();
        for (name, type_oid, format) in columns {
            payload.extend_from_slice(&cstr(name));
            payload.extend_from_slice(&0_u32.to_be_bytes());
            payload.extend_from_slice(&0_i16.to_be_bytes());
            payload.extend_from_slice(&type_oid.to_be_bytes());
            payload.extend_from_slice(&(-1_i16).to_be_bytes());
            payload.extend_from_slice(&(-1_i32).to_be_bytes());
            payload.extend_from_slice(&format.to_be_bytes());
        }
        self.send(b'T', &payload).await
    }

    pub async fn data_row(&mut self, values: &[Option<&[u8]>]) -> io::Result<()> {
        let mut payload = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        self.send(b'D', &payload).await
    }

    pub async fn text_row(&mut self, values: &[Option<&str>]) -> io::Result<()> {
        let values: Vec<Option<&[u8]>> = values.iter().map(|v| v.map(str::as_bytes)).collect();
        self.data_row(&values).await
    }

    pub async fn command_complete(&mut self, tag: &str) -> io::Result<()> {
        self.send(b'C', &cstr(tag)).await
    }

    /// CommandComplete followed by ReadyForQuery(Idle).
    pub async fn complete(&mut self, tag: &str) -> io::Result<()> {
        self.command_complete(tag).await?;
        self.ready(b'I').await
    }

    pub async fn error(&mut self, code: &str, message: &str) -> io::Result<()> {
        self.send(b'E', &fields("ERROR", code, message)).await
    }

    /// ErrorResponse with severity FATAL, sent before the server hangs up.
    pub async fn fatal(&mut self, code: &str, message: &str) -> io::Result<()> {
        self.send(b'E', &fields("FATAL", code, message)).await
    }

    pub async fn notice(&mut self, message: &str) -> io::Result<()> {
        self.send(b'N', &fields("NOTICE", "00000", message)).await
    }

    pub async fn notification(&mut self, channel: &str, payload: &str) -> io::Result<()> {
        let mut body = self.pid.to_be_bytes().to_vec();
        body.extend_from_slice(&cstr(channel));
        body.extend_from_slice(&cstr(payload));
        self.send(b'A', &body).await
    }

    pub async fn copy_in_response(&mut self, format: u8, columns: i16) -> io::Result<()> {
        self.send(b'G', &copy_response(format, columns)).await
    }

    pub async fn copy_out_response(&mut self, format: u8, columns: i16) -> io::Result<()> {
        self.send(b'H', &copy_response(format, columns)).await
    }

    pub async fn copy_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.send(b'd', data).await
    }

    pub async fn copy_done(&mut self) -> io::Result<()> {
        self.send(b'c', &[]).await
    }

    /// Collect CopyData until CopyDone (`Ok`) or CopyFail (`Err` with the reason).
    pub async fn read_copy_in(&mut self) -> io::Result<Result<Vec<u8>, String>> {
        let mut data = Vec::new();
        loop {
            let (type_byte, mut payload) = self.recv().await?;
            match type_byte {
                b'd' => data.extend_from_slice(&payload),
                b'c' => return Ok(Ok(data)),
                b'f' => {
                    payload.pop();
                    return Ok(Err(String::from_utf8(payload).unwrap()));
                }
                other => panic!("unexpected message '{}' during COPY IN", other as char),
            }
        }
    }

    /// Parse / Describe statement / Sync, as sent before a statement is bound.
    pub async fn expect_parse(&mut self) -> io::Result<Parsed> {
        let payload = self.expect(b'P').await?;
        let (_name, rest) = split_cstr(&payload);
        let (sql, mut rest) = split_cstr(rest);
        let count = take_i16(&mut rest) as usize;
        let param_oids = rest[..count * 4]
            .chunks_exact(4)
            .map(|oid| u32::from_be_bytes([oid[0], oid[1], oid[2], oid[3]]))
            .collect();
        self.expect(b'D').await?;
        self.expect(b'S').await?;
        Ok(Parsed {
            sql: sql.to_string(),
            param_oids,
        })
    }

    /// ParseComplete, ParameterDescription, the statement's text-format
    /// RowDescription (NoData without columns) and ReadyForQuery.
    pub async fn describe(&mut self, params: &[u32], columns: &[(&str, u32)]) -> io::Result<()> {
        self.send(b'1', &[]).await?;
        let mut payload = (params.len() as i16).to_be_bytes().to_vec();
        for oid in params {
            payload.extend_from_slice(&oid.to_be_bytes());
        }
        self.send(b't', &payload).await?;
        if columns.is_empty() {
            self.send(b'n', &[]).await?;
        } else {
            let text: Vec<(&str, u32, i16)> = columns.iter().map(|&(n, oid)| (n, oid, 0)).collect();
            self.row_description(&text).await?;
        }
        self.ready(b'I').await
    }

    /// Bind / Describe portal / Execute / Sync. Returns the bound parameter values.
    pub async fn expect_bind(&mut self) -> io::Result<Vec<Option<Vec<u8>>>> {
        let payload = self.expect(b'B').await?;
        self.expect(b'D').await?;
        self.expect(b'E').await?;
        self.expect(b'S').await?;
        Ok(bind_values(&payload))
    }

    /// BindComplete and a binary RowDescription; rows and completion follow.
    pub async fn bound(&mut self, columns: &[(&str, u32)]) -> io::Result<()> {
        self.send(b'2', &[]).await?;
        if columns.is_empty() {
            return self.send(b'n', &[]).await;
        }
        let binary: Vec<(&str, u32, i16)> = columns.iter().map(|&(n, oid)| (n, oid, 1)).collect();
        self.row_description(&binary).await
    }

    /// Answer one extended-protocol query with binary `rows`. Parameters the
    /// client left untyped are described as text.
    ///
    /// Returns the statement text and the bound parameter values.
    pub async fn extended_query(
        &mut self,
        columns: &[(&str, u32)],
        rows: &[&[Option<&[u8]>]],
    ) -> io::Result<(String, Vec<Option<Vec<u8>>>)> {
        let parsed = self.expect_parse().await?;
        let params: Vec<u32> = parsed
            .param_oids
            .iter()
            .map(|&oid| if oid == 0 { TEXT } else { oid })
            .collect();
        self.describe(&params, columns).await?;
        let values = self.expect_bind().await?;
        self.bound(columns).await?;
        for row in rows {
            self.data_row(row).await?;
        }
        self.complete(&format!("SELECT {}", rows.len())).await?;
        Ok((parsed.sql, values))
    }

    /// The `to_regtype` lookup that resolves an enum, then its `pg_enum` labels.
    pub async fn enum_catalog(
        &mut self,
        name: &str,
        oid: u32,
        array_oid: u32,
        labels: &[&str],
    ) -> io::Result<()> {
        let (sql, values) = self
            .extended_query(
                &[("oid", OID), ("typarray", OID)],
                &[&[Some(&oid.to_be_bytes()[..]), Some(&array_oid.to_be_bytes()[..])]],
            )
            .await?;
        assert!(sql.contains("to_regtype"), "{}", sql);
        assert_eq!(values, vec![Some(name.as_bytes().to_vec())]);

        let rows: Vec<[Option<&[u8]>; 1]> = labels.iter().map(|l| [Some(l.as_bytes())]).collect();
        let rows: Vec<&[Option<&[u8]>]> = rows.iter().map(|r| &r[..]).collect();
        let (sql, values) = self.extended_query(&[("enumlabel", TEXT)], &rows).await?;
        assert!(sql.contains("pg_enum"), "{}", sql);
        assert_eq!(values, vec![Some(oid.to_be_bytes().to_vec())]);
        Ok(())
    }

    /// Answer simple queries with an empty result until Terminate or EOF.
    pub async fn serve_idle(&mut self) -> io::Result<()> {
        loop {
            let (type_byte, payload) = match self.recv().await {
                Ok(message) => message,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            };
            match type_byte {
                b'Q' if payload == [0] => {
                    self.send(b'I', &[]).await?;
                    self.ready(b'I').await?;
                }
                b'Q' => self.complete("SELECT 0").await?,
                b'X' => return Ok(()),
                other => panic!("unexpected message '{}' while idle", other as char),
            }
        }
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn split_cstr(bytes: &[u8]) -> (&str, &[u8]) {
    let end = bytes.iter().position(|&b| b == 0).expect("unterminated string");
    (std::str::from_utf8(&bytes[..end]).unwrap(), &bytes[end + 1..])
}

fn take_i16(bytes: &mut &[u8]) -> i16 {
    let (head, rest) = bytes.split_at(2);
    *bytes = rest;
    i16::from_be_bytes([head[0], head[1]])
}

fn take_i32(bytes: &mut &[u8]) -> i32 {
    let (head, rest) = bytes.split_at(4);
    *bytes = rest;
    i32::from_be_bytes([head[0], head[1], head[2], head[3]])
}

fn bind_values(payload: &[u8]) -> Vec<Option<Vec<u8>>> {
    let (_portal, rest) = split_cstr(payload);
    let (_statement, mut rest) = split_cstr(rest);
    let formats = take_i16(&mut rest) as usize;
    rest = &rest[formats * 2..];
    let count = take_i16(&mut rest) as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_i32(&mut rest);
        if len < 0 {
            values.push(None);
            continue;
        }
        let (value, tail) = rest.split_at(len as usize);
        values.push(Some(value.to_vec()));
        rest = tail;
    }
    values
}

fn fields(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (tag, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        payload.push(tag);
        payload.extend_from_slice(&cstr(value));
    }
    payload.push(0);
    payload
}

fn copy_response(format: u8, columns: i16) -> Vec<u8> {
    let mut payload = vec![format];
    payload.extend_from_slice(&columns.to_be_bytes());
    for _ in 0..columns {
        payload.extend_from_slice(&(format as i16).to_be_bytes());
    }
    payload
}

/// Binary COPY header with no extension.
pub fn binary_copy_header() -> Vec<u8> {
    let mut header = b"PGCOPY\n\xff\r\n\0".to_vec();
    header.extend_from_slice(&0_i32.to_be_bytes());
    header.extend_from_slice(&0_i32.to_be_bytes());
    header
}
