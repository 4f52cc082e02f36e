//! Route selection: which transport mode a command travels over.
//!
//! A [`RouteTable`] is an ordered list of `(id or id range) -> Route`
//! entries plus a fallback. The first matching entry wins. Tables are built
//! once per security level and never change afterwards.

use std::fmt;
use std::ops::RangeInclusive;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::command::{self, CommandRange};

bitflags! {
    /// Set of transport modes a route may use.
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct TransportModes: u8 {
        const PLAIN = 0b01;
        const SSL   = 0b10;
    }
}

/// How one package travels on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Marker, header and buffers written directly.
    Plain,
    /// The same bytes sealed into TLS records.
    Ssl,
}

impl TransportMode {
    pub fn as_flag(self) -> TransportModes {
        match self {
            TransportMode::Plain => TransportModes::PLAIN,
            TransportMode::Ssl => TransportModes::SSL,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Plain => write!(f, "plain"),
            TransportMode::Ssl => write!(f, "ssl"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criticality {
    /// The package must go over `mode`; if that is impossible the send fails.
    Required,
    /// `mode` is preferred; another permitted mode may be used instead.
    Optional,
}

/// Operator-selected security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Everything plaintext; encryption permitted as a fallback.
    Low,
    /// Mostly plaintext; interactive and auth commands encrypted.
    #[default]
    Normal,
    /// Everything encrypted.
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub mode: TransportMode,
    pub criticality: Criticality,
    /// All modes this route may use, always including `mode`.
    pub permitted: TransportModes,
}

impl Route {
    pub fn new(mode: TransportMode, criticality: Criticality) -> Self {
        Self {
            mode,
            criticality,
            permitted: mode.as_flag(),
        }
    }

    pub fn permits(&self, mode: TransportMode) -> bool {
        self.permitted.contains(mode.as_flag())
    }

    /// Pick the mode to use given whether an encrypted channel exists.
    /// `None` means the package cannot be sent.
    pub fn resolve(&self, ssl_available: bool) -> Option<TransportMode> {
        match (self.mode, ssl_available) {
            (TransportMode::Plain, _) | (TransportMode::Ssl, true) => Some(self.mode),
            (TransportMode::Ssl, false) => {
                let fallback = self.criticality == Criticality::Optional
                    && self.permits(TransportMode::Plain);
                fallback.then_some(TransportMode::Plain)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    Command(u32),
    Range(RangeInclusive<u32>),
}

impl RouteKey {
    fn matches(&self, command: u32) -> bool {
        match self {
            RouteKey::Command(id) => *id == command,
            RouteKey::Range(range) => range.contains(&command),
        }
    }
}

impl From<u32> for RouteKey {
    fn from(id: u32) -> Self {
        RouteKey::Command(id)
    }
}

impl From<RangeInclusive<u32>> for RouteKey {
    fn from(range: RangeInclusive<u32>) -> Self {
        RouteKey::Range(range)
    }
}

impl From<CommandRange> for RouteKey {
    fn from(range: CommandRange) -> Self {
        RouteKey::Range(range.ids())
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<(RouteKey, Route)>,
    default: Route,
}

impl RouteTable {
    pub fn new(default: Route) -> Self {
        Self {
            entries: Vec::new(),
            default,
        }
    }

    pub fn add_route(
        &mut self,
        key: impl Into<RouteKey>,
        mode: TransportMode,
        criticality: Criticality,
    ) -> &mut Self {
        self.add_route_with(key, mode, criticality, TransportModes::empty())
    }

    /// Like [`add_route`](Self::add_route) with additional permitted modes.
    pub fn add_route_with(
        &mut self,
        key: impl Into<RouteKey>,
        mode: TransportMode,
        criticality: Criticality,
        extra: TransportModes,
    ) -> &mut Self {
        let mut route = Route::new(mode, criticality);
        route.permitted |= extra;
        self.entries.push((key.into(), route));
        self
    }

    pub fn find_route(&self, command: u32) -> Route {
        self.entries
            .iter()
            .find(|(key, _)| key.matches(command))
            .map(|(_, route)| *route)
            .unwrap_or(self.default)
    }

    pub fn default_route(&self) -> Route {
        self.default
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a connection using this table cannot run without TLS.
    pub fn requires_ssl_by_default(&self) -> bool {
        self.default.mode == TransportMode::Ssl && self.default.criticality == Criticality::Required
    }

    /// Whether any entry, or the fallback, asks for TLS.
    pub fn uses_ssl(&self) -> bool {
        self.default.mode == TransportMode::Ssl
            || self.entries.iter().any(|(_, r)| r.mode == TransportMode::Ssl)
    }

    pub fn for_level(level: SecurityLevel) -> Self {
        use Criticality::Required;
        use TransportMode::{Plain, Ssl};

        match level {
            SecurityLevel::Low => {
                let mut default = Route::new(Plain, Required);
                default.permitted |= TransportModes::SSL;
                RouteTable::new(default)
            }
            SecurityLevel::High => RouteTable::new(Route::new(Ssl, Required)),
            SecurityLevel::Normal => {
                let mut table = RouteTable::new(Route::new(Plain, Required));
                for id in [
                    command::KEYBOARD_SCANCODE,
                    command::CLIPBOARD,
                    command::SESSION_ATTACH,
                    command::AUTHENTICATE,
                ] {
                    table.add_route(id, Ssl, Required);
                }
                for range in CommandRange::ALL {
                    table.add_route(range, Plain, Required);
                }
                table
            }
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::for_level(SecurityLevel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_level_encrypts_keyboard() {
        let table = RouteTable::for_level(SecurityLevel::Normal);
        let route = table.find_route(command::KEYBOARD_SCANCODE);
        assert_eq!(route.mode, TransportMode::Ssl);
        assert_eq!(route.criticality, Criticality::Required);

        let bulk = table.find_route(*command::VM_MIGRATION.start() + 3);
        assert_eq!(bulk.mode, TransportMode::Plain);
        assert_eq!(bulk.criticality, Criticality::Required);
    }

    #[test]
    fn unknown_command_uses_default() {
        let table = RouteTable::for_level(SecurityLevel::Normal);
        assert_eq!(table.find_route(0xFFFF_0000), table.default_route());
        assert!(!table.requires_ssl_by_default());
        assert!(table.uses_ssl());
    }

    #[test]
    fn high_and_low_levels() {
        let high = RouteTable::for_level(SecurityLevel::High);
        assert!(high.requires_ssl_by_default());
        assert_eq!(high.find_route(command::CLIPBOARD).mode, TransportMode::Ssl);

        let low = RouteTable::for_level(SecurityLevel::Low);
        let route = low.find_route(command::KEYBOARD_SCANCODE);
        assert_eq!(route.mode, TransportMode::Plain);
        assert!(route.permits(TransportMode::Ssl));
        assert!(!low.uses_ssl());
    }

    #[test]
    fn first_match_wins() {
        let mut table = RouteTable::new(Route::new(TransportMode::Plain, Criticality::Required));
        table
            .add_route(0x1005, TransportMode::Ssl, Criticality::Optional)
            .add_route(command::FILE_COPY, TransportMode::Plain, Criticality::Required);
        assert_eq!(table.find_route(0x1005).mode, TransportMode::Ssl);
        assert_eq!(table.find_route(0x1006).mode, TransportMode::Plain);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resolve_without_tls() {
        let required = Route::new(TransportMode::Ssl, Criticality::Required);
        assert_eq!(required.resolve(false), None);
        assert_eq!(required.resolve(true), Some(TransportMode::Ssl));

        let mut optional = Route::new(TransportMode::Ssl, Criticality::Optional);
        assert_eq!(optional.resolve(false), None);
        optional.permitted |= TransportModes::PLAIN;
        assert_eq!(optional.resolve(false), Some(TransportMode::Plain));
    }

    #[test]
    fn level_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            level: SecurityLevel,
        }
        let w: Wrap = toml::from_str("level = \"high\"").unwrap();
        assert_eq!(w.level, SecurityLevel::High);
    }
}
