//! Transport under a connector.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::TlsStream;

use crate::error::{Error, Result};
use crate::opts::Opts;

pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tokio-tls")]
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl Stream {
    /// Open the plain transport described by `opts`. The Unix socket wins over host/port.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        if let Some(path) = &opts.socket {
            return Ok(Stream::Unix(UnixStream::connect(path).await?));
        }
        let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        tcp.set_nodelay(true)?;
        Ok(Stream::Tcp(tcp))
    }

    /// Append whatever the transport has ready to `buf`, waiting for at least one byte.
    ///
    /// Cancel safe: if the future is dropped, no bytes are lost.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.read_buf(buf).await,
            Stream::Unix(s) => s.read_buf(buf).await,
        }
    }

    /// Non-blocking read. Fails with `WouldBlock` when nothing is pending.
    pub fn try_read_buf(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read_buf(buf),
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "non-blocking reads are not available on TLS streams",
            )),
            Stream::Unix(s) => s.try_read_buf(buf),
        }
    }

    /// Best-effort non-blocking write, used where no runtime can be awaited on.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_write(buf),
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "non-blocking writes are not available on TLS streams",
            )),
            Stream::Unix(s) => s.try_write(buf),
        }
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        match self {
            Stream::Tcp(s) => s.read_u8().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.read_u8().await,
            Stream::Unix(s) => s.read_u8().await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.write_all(buf).await,
            Stream::Unix(s) => s.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.flush().await,
            Stream::Unix(s) => s.flush().await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.shutdown().await,
            Stream::Unix(s) => s.shutdown().await,
        }
    }

    pub fn is_tls(&self) -> bool {
        match self {
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_) => true,
            _ => false,
        }
    }

    #[cfg(feature = "tokio-tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        let Stream::Tcp(tcp) = self else {
            return Err(Error::Unsupported(
                "TLS is only negotiated over TCP connections".into(),
            ));
        };
        let connector = native_tls::TlsConnector::new()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector.connect(host, tcp).await?;
        Ok(Stream::Tls(Box::new(tls)))
    }

    #[cfg(not(feature = "tokio-tls"))]
    pub async fn upgrade_to_tls(self, _host: &str) -> Result<Self> {
        Err(Error::Unsupported(
            "TLS requested but tokio-tls feature not enabled".into(),
        ))
    }
}
