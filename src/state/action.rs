//! Action types for state machine I/O requests.

/// Action requested by the startup state machine.
///
/// The caller performs the requested I/O and feeds the result back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write the output buffer, then read a single byte.
    ///
    /// Used for SSL negotiation: the server answers 'S' or 'N'.
    WriteAndReadByte,

    /// Write the output buffer, then read the next message.
    WriteAndReadMessage,

    /// Read the next message.
    ReadMessage,

    /// Perform the TLS handshake, then call `tls_established()`.
    TlsHandshake,

    /// ReadyForQuery was received; the session is usable.
    Finished,
}
