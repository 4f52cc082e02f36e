//! Connection lifecycle state machines.
//!
//! [`SenderPhase`] models the logical sender as seen by the application;
//! [`WriterState`] models the writer task that owns the socket. Both
//! validate transitions and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::IoError;

// ── SenderPhase ──────────────────────────────────────────────────

/// The logical sender's phase.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲                │              │
///       │                ▼              ▼
///       └──────────── Disconnecting ◄───┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SenderPhase {
    #[default]
    Disconnected,

    /// Socket up; handshake record and writer start in progress.
    Connecting,

    /// Writer started; submissions accepted.
    Connected {
        since: Instant,
    },

    /// Stop requested; outstanding jobs are being failed.
    Disconnecting,
}

impl std::fmt::Display for SenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl SenderPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns `None` outside `Connected`.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), IoError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(IoError::InvalidState("cannot connect: not in Disconnected state")),
        }
    }

    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), IoError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(IoError::InvalidState(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Connected`.
    pub fn begin_disconnect(&mut self) -> Result<(), IoError> {
        match self {
            Self::Connecting | Self::Connected { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(IoError::InvalidState(
                "cannot disconnect: not in Connecting or Connected state",
            )),
        }
    }

    /// Valid from: `Disconnecting`, `Connecting` (startup failure).
    pub fn finish_disconnect(&mut self) -> Result<(), IoError> {
        match self {
            Self::Disconnecting | Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(IoError::InvalidState(
                "cannot finish disconnect: not in a disconnectable state",
            )),
        }
    }

    /// For unrecoverable errors.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── WriterState ──────────────────────────────────────────────────

/// Writer task state: `Stopped → Starting → Started → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriterState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl std::fmt::Display for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Started => write!(f, "Started"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

impl WriterState {
    /// Move to `next` if the lifecycle allows it. Startup failure may
    /// collapse `Starting` straight back to `Stopped`.
    pub fn transition(&mut self, next: WriterState) -> Result<(), IoError> {
        use WriterState::*;
        let ok = matches!(
            (*self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stopped)
                | (Starting, Stopping)
                | (Started, Stopping)
                | (Stopping, Stopped)
        );
        if !ok {
            return Err(IoError::InvalidState("illegal writer state transition"));
        }
        *self = next;
        Ok(())
    }

    /// Settled states nobody is waiting to leave.
    pub fn is_settled(self) -> bool {
        matches!(self, WriterState::Stopped | WriterState::Started)
    }
}

// ── Tests ────────────────────────────────────────────────────────
