//! Command identifier space.
//!
//! The transport never interprets commands; these values exist so route
//! tables and the control path (heartbeat, detach) can name them.
//!
//! Layout:
//! - `0x0001..0x00FF`: transport control
//! - `0x0100..0x01FF`: interactive session traffic
//! - `0x1000..0x14FF`: bulk streams, one 256-id range per family

use std::fmt;
use std::ops::RangeInclusive;

// ── Control (0x00xx) ─────────────────────────────────────────────

/// Keep-alive emitted by the writer's reserved heartbeat slot.
pub const HEARTBEAT: u32 = 0x0001;
/// Sent urgently before a connection is handed to another consumer.
pub const DETACH_REQUEST: u32 = 0x0002;
pub const AUTHENTICATE: u32 = 0x0010;
pub const SESSION_ATTACH: u32 = 0x0011;

// ── Interactive (0x01xx) ─────────────────────────────────────────

pub const KEYBOARD_SCANCODE: u32 = 0x0101;
pub const CLIPBOARD: u32 = 0x0102;

// ── Bulk ranges ──────────────────────────────────────────────────

pub const FILE_COPY: RangeInclusive<u32> = 0x1000..=0x10FF;
pub const VM_MIGRATION: RangeInclusive<u32> = 0x1100..=0x11FF;
pub const BACKUP: RangeInclusive<u32> = 0x1200..=0x12FF;
pub const PROXY_TUNNEL: RangeInclusive<u32> = 0x1300..=0x13FF;
pub const CONTAINER_MIGRATION: RangeInclusive<u32> = 0x1400..=0x14FF;

/// Named families of bulk commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandRange {
    FileCopy,
    VmMigration,
    Backup,
    ProxyTunnel,
    ContainerMigration,
}

impl CommandRange {
    pub const ALL: [CommandRange; 5] = [
        CommandRange::FileCopy,
        CommandRange::VmMigration,
        CommandRange::Backup,
        CommandRange::ProxyTunnel,
        CommandRange::ContainerMigration,
    ];

    pub fn ids(self) -> RangeInclusive<u32> {
        match self {
            CommandRange::FileCopy => FILE_COPY,
            CommandRange::VmMigration => VM_MIGRATION,
            CommandRange::Backup => BACKUP,
            CommandRange::ProxyTunnel => PROXY_TUNNEL,
            CommandRange::ContainerMigration => CONTAINER_MIGRATION,
        }
    }

    /// The family a command id belongs to, if any.
    pub fn of(command: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.ids().contains(&command))
    }
}

impl fmt::Display for CommandRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandRange::FileCopy => write!(f, "file-copy"),
            CommandRange::VmMigration => write!(f, "vm-migration"),
            CommandRange::Backup => write!(f, "backup"),
            CommandRange::ProxyTunnel => write!(f, "proxy-tunnel"),
            CommandRange::ContainerMigration => write!(f, "container-migration"),
        }
    }
}

/// Short label for log lines.
pub fn describe(command: u32) -> String {
    match command {
        HEARTBEAT => "heartbeat".into(),
        DETACH_REQUEST => "detach-request".into(),
        AUTHENTICATE => "authenticate".into(),
        SESSION_ATTACH => "session-attach".into(),
        KEYBOARD_SCANCODE => "keyboard-scancode".into(),
        CLIPBOARD => "clipboard".into(),
        other => match CommandRange::of(other) {
            Some(range) => format!("{range}:{other:#06x}"),
            None => format!("{other:#06x}"),
        },
    }
}
