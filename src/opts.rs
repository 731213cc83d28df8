//! Connection options.
//!
//! `Opts` is the already-parsed configuration bag. The crate never parses
//! connection-string text; callers fill the fields directly.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer_pool::{BufferPool, GLOBAL_BUFFER_POOL};
use crate::error::{Error, Result};
use crate::pool::PoolKey;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SslMode {
    /// Don't use SSL
    #[default]
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    Prefer,
    /// Require SSL connection
    Require,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path. Takes precedence over `host` when set.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name. The server defaults to the user name.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode. Requires the `tokio-tls` feature for anything but `Disable`.
    ///
    /// Default: `SslMode::Disable`
    pub ssl_mode: SslMode,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// Hand out connectors from a shared pool.
    ///
    /// Default: `true`
    pub pooling: bool,

    /// Connectors the pool keeps open even when idle.
    ///
    /// Default: `0`
    pub min_pool_size: usize,

    /// Upper bound on open connectors per pool.
    ///
    /// Default: `100`
    pub max_pool_size: usize,

    /// Idle time after which a pooled connector becomes eligible for pruning.
    ///
    /// Default: `15s`
    pub connection_lifetime: Duration,

    /// Time allowed to establish and authenticate a connection. Also bounds
    /// how long a pool acquisition waits for a free connector.
    ///
    /// Default: `15s`
    pub connect_timeout: Duration,

    /// Time allowed for each command round trip. `None` waits forever.
    ///
    /// Default: `Some(30s)`
    pub command_timeout: Option<Duration>,

    /// Interval of the idle keepalive ping. `None` disables it.
    ///
    /// Default: `None`
    pub keepalive: Option<Duration>,

    /// Deliver notifications while the connector is idle, without waiting
    /// for the next command. Not available with SSL.
    ///
    /// Default: `false`
    pub continuous_processing: bool,

    /// Buffer pool shared by connectors.
    ///
    /// Default: the global buffer pool
    pub buffer_pool: Arc<BufferPool>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Disable,
            params: Vec::new(),
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connection_lifetime: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Some(Duration::from_secs(30)),
            keepalive: None,
            continuous_processing: false,
            buffer_pool: Arc::clone(&GLOBAL_BUFFER_POOL),
        }
    }
}

impl Opts {
    /// Reject option combinations that can never produce a working connector.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::InvalidUsage("user is empty".into()));
        }
        if self.socket.is_none() && self.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }
        if self.max_pool_size == 0 {
            return Err(Error::InvalidUsage("max_pool_size must be positive".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::InvalidUsage(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.continuous_processing && self.ssl_mode != SslMode::Disable {
            return Err(Error::InvalidUsage(
                "continuous_processing cannot be combined with SSL".into(),
            ));
        }
        if self.keepalive == Some(Duration::ZERO) {
            return Err(Error::InvalidUsage("keepalive interval must be positive".into()));
        }
        Ok(())
    }

    /// Database the server will open: the explicit one, or the user name.
    pub fn effective_database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.user)
    }

    /// Normalized key under which pooled connectors for these options are shared.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self)
    }

    /// Socket address used for logging and errors.
    pub(crate) fn endpoint(&self) -> String {
        match &self.socket {
            Some(path) => path.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Opts {
        Opts {
            host: "localhost".into(),
            user: "postgres".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        opts().validate().unwrap();
        assert_eq!(opts().effective_database(), "postgres");
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            Opts { user: String::new(), ..opts() },
            Opts { host: String::new(), ..opts() },
            Opts { max_pool_size: 0, ..opts() },
            Opts { min_pool_size: 5, max_pool_size: 2, ..opts() },
            Opts { keepalive: Some(Duration::ZERO), ..opts() },
        ];
        for case in cases {
            assert!(matches!(case.validate(), Err(Error::InvalidUsage(_))));
        }
    }

    #[test]
    fn test_continuous_processing_excludes_ssl() {
        for ssl_mode in [SslMode::Prefer, SslMode::Require] {
            let tls = Opts {
                continuous_processing: true,
                ssl_mode,
                ..opts()
            };
            assert!(matches!(tls.validate(), Err(Error::InvalidUsage(_))));
        }

        let plain = Opts {
            continuous_processing: true,
            ..opts()
        };
        plain.validate().unwrap();
    }

    #[test]
    fn test_socket_without_host() {
        let unix = Opts {
            host: String::new(),
            socket: Some("/var/run/postgresql/.s.PGSQL.5432".into()),
            ..opts()
        };
        unix.validate().unwrap();
        assert_eq!(unix.endpoint(), "/var/run/postgresql/.s.PGSQL.5432");
    }
}
