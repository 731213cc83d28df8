//! Connector lifecycle states and their public projection.

use std::ops::BitOr;

/// Protocol state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectorState {
    Closed = 0,
    Connecting = 1,
    Authenticating = 2,
    /// Idle, accepts the next command
    Ready = 3,
    /// A command was sent, no result rows yet
    Executing = 4,
    /// A result set is being read
    Fetching = 5,
    CopyIn = 6,
    CopyOut = 7,
    /// Terminal; every operation fails
    Broken = 8,
}

impl ConnectorState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectorState::Closed,
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Authenticating,
            3 => ConnectorState::Ready,
            4 => ConnectorState::Executing,
            5 => ConnectorState::Fetching,
            6 => ConnectorState::CopyIn,
            7 => ConnectorState::CopyOut,
            _ => ConnectorState::Broken,
        }
    }

    /// Returns true while a command owns the session.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConnectorState::Executing
                | ConnectorState::Fetching
                | ConnectorState::CopyIn
                | ConnectorState::CopyOut
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectorState) -> bool {
        use ConnectorState::*;

        if self == next || next == Broken {
            return true;
        }
        match self {
            Closed => next == Connecting,
            Connecting => matches!(next, Authenticating | Closed),
            Authenticating => matches!(next, Ready | Closed),
            Ready => matches!(next, Executing | Closed),
            // Closed: the connector was closed under a live result set or COPY.
            Executing => matches!(next, Fetching | CopyIn | CopyOut | Ready | Closed),
            Fetching => matches!(next, Executing | CopyIn | CopyOut | Ready | Closed),
            CopyIn | CopyOut => matches!(next, Executing | Ready | Closed),
            Broken => next == Closed,
        }
    }

    /// Flags as exposed to callers.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            ConnectorState::Closed => ConnectionState::CLOSED,
            ConnectorState::Connecting | ConnectorState::Authenticating => {
                ConnectionState::CONNECTING
            }
            ConnectorState::Ready => ConnectionState::OPEN,
            ConnectorState::Executing => ConnectionState::OPEN | ConnectionState::EXECUTING,
            ConnectorState::Fetching | ConnectorState::CopyIn | ConnectorState::CopyOut => {
                ConnectionState::OPEN | ConnectionState::FETCHING
            }
            ConnectorState::Broken => ConnectionState::BROKEN,
        }
    }
}

/// Combinable connection state flags, derived from [`ConnectorState`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionState(u8);

impl ConnectionState {
    pub const CLOSED: Self = Self(0);
    pub const OPEN: Self = Self(1);
    pub const CONNECTING: Self = Self(2);
    pub const EXECUTING: Self = Self(4);
    pub const FETCHING: Self = Self(8);
    pub const BROKEN: Self = Self(16);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The state without the executing/fetching activity flags.
    pub fn base(self) -> Self {
        Self(self.0 & !(Self::EXECUTING.0 | Self::FETCHING.0))
    }
}

impl BitOr for ConnectionState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("Closed");
        }
        let names = [
            (Self::OPEN, "Open"),
            (Self::CONNECTING, "Connecting"),
            (Self::EXECUTING, "Executing"),
            (Self::FETCHING, "Fetching"),
            (Self::BROKEN, "Broken"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
