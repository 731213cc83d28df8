use std::fmt;
use std::time::Duration;

use crate::opts::{Opts, SslMode};

/// Connection parameters that decide which pool a connector belongs to.
///
/// Two [`Opts`] that differ only in spelling (host case, an explicit
/// database equal to the user, the order of extra parameters) share a key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
    socket: Option<String>,
    user: String,
    database: String,
    password: Option<String>,
    application_name: Option<String>,
    ssl_mode: SslMode,
    params: Vec<(String, String)>,
    min_pool_size: usize,
    max_pool_size: usize,
    connection_lifetime: Duration,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
    keepalive: Option<Duration>,
    continuous_processing: bool,
}

impl PoolKey {
    pub(crate) fn new(opts: &Opts) -> Self {
        let mut params = opts.params.clone();
        params.sort();
        Self {
            host: opts.host.to_ascii_lowercase(),
            port: opts.port,
            socket: opts.socket.clone(),
            user: opts.user.clone(),
            database: opts.effective_database().to_owned(),
            password: opts.password.clone(),
            application_name: opts.application_name.clone(),
            ssl_mode: opts.ssl_mode,
            params,
            min_pool_size: opts.min_pool_size,
            max_pool_size: opts.max_pool_size,
            connection_lifetime: opts.connection_lifetime,
            connect_timeout: opts.connect_timeout,
            command_timeout: opts.command_timeout,
            keepalive: opts.keepalive,
            continuous_processing: opts.continuous_processing,
        }
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("max_pool_size", &self.max_pool_size)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.socket {
            Some(path) => write!(f, "{}@{}/{}", self.user, path, self.database),
            None => write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}
