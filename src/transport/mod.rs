//! Byte transports for network device sessions.
//!
//! A transport moves raw bytes to and from a remote device. It knows nothing
//! about prompts, commands or framing; higher layers drive it through the
//! [`Transport`] trait.
//!
//! # Main Components
//!
//! - [`Transport`] - Capability set every transport variant implements
//! - [`SystemTransport`] - Spawns `ssh` (or another program) on a pseudo-terminal
//! - [`StandardTransport`] - Native SSH via russh
//! - [`AnyTransport`] - Variant selected by name with [`new_transport`]
//! - [`run_with_timeout`] - Bounds a blocking operation by a deadline

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::Level;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config;
use crate::error::TransportError;

pub use guard::run_with_timeout;
pub use security::SecurityLevel;
pub use standard::{StandardTransport, StandardTransportArgs};
pub use system::{SystemTransport, SystemTransportArgs, build_netconf_cmd, build_open_cmd};

/// Capabilities shared by every transport variant.
///
/// Implementations are not internally synchronized. One logical caller
/// drives an instance at a time.
pub trait Transport: Send {
    /// Establishes an interactive shell session.
    fn open(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Establishes a session bound to the NETCONF subsystem.
    fn open_netconf(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Releases the session. The handle is cleared even if releasing fails.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reports whether a session handle is held. Never touches the resource.
    fn is_alive(&self) -> bool;

    /// Reads the next chunk, bounded by the transport timeout.
    fn read(&mut self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Writes all of `data` to the session.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Formats a log line attributed to this transport's host and port.
    fn format_log_message(&self, level: Level, message: &str) -> String;
}

/// A duration that can be retuned while transports are using it.
///
/// Clones share the same cell, so an update made through any clone is
/// seen by every transport holding one. Transports read the value at the
/// start of each operation; an operation already in flight keeps the
/// value it started with.
#[derive(Debug, Clone)]
pub struct SharedTimeout(Arc<AtomicU64>);

impl SharedTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(duration_as_nanos(timeout))))
    }

    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, timeout: Duration) {
        self.0.store(duration_as_nanos(timeout), Ordering::Release);
    }
}

fn duration_as_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

impl Serialize for SharedTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(self.get().as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }
}

impl<'de> Deserialize<'de> for SharedTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Self::new(Duration::from_millis(millis)))
    }
}

/// Connection parameters required by every transport.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BaseTransportArgs {
    pub host: String,
    pub port: u16,
    /// Login user. Empty means "let the transport decide".
    pub auth_username: String,
    /// Bound on establishing the TCP/SSH connection, in milliseconds when serialized.
    #[schemars(with = "u64")]
    pub timeout_socket: SharedTimeout,
    /// Bound on a single read, in milliseconds when serialized.
    #[schemars(with = "u64")]
    pub timeout_transport: SharedTimeout,
    pub pty_rows: u16,
    pub pty_cols: u16,
}

impl Default for BaseTransportArgs {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: config::DEFAULT_PORT,
            auth_username: String::new(),
            timeout_socket: SharedTimeout::new(config::DEFAULT_TIMEOUT_SOCKET),
            timeout_transport: SharedTimeout::new(config::DEFAULT_TIMEOUT_TRANSPORT),
            pty_rows: config::DEFAULT_PTY_ROWS,
            pty_cols: config::DEFAULT_PTY_COLS,
        }
    }
}

impl BaseTransportArgs {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

/// Builds a log line carrying the level, host and port of a transport.
pub fn format_log_message(args: &BaseTransportArgs, level: Level, message: &str) -> String {
    format!(
        "level={} host={} port={} message={}",
        level.as_str().to_ascii_lowercase(),
        args.host,
        args.port,
        message
    )
}

/// Arguments for every transport variant, so a variant can be picked by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TransportArgs {
    pub base: BaseTransportArgs,
    pub system: SystemTransportArgs,
    pub standard: StandardTransportArgs,
}

/// Transport variants known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    System,
    Standard,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::System => config::SYSTEM_TRANSPORT_NAME,
            TransportKind::Standard => config::STANDARD_TRANSPORT_NAME,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            config::SYSTEM_TRANSPORT_NAME => Ok(TransportKind::System),
            config::STANDARD_TRANSPORT_NAME => Ok(TransportKind::Standard),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

/// A transport variant chosen at runtime.
pub enum AnyTransport {
    System(SystemTransport),
    Standard(StandardTransport),
}

/// Creates the transport registered under `name`.
///
/// Nothing is spawned or connected here; an unknown name fails before any
/// resource exists.
pub fn new_transport(name: &str, args: TransportArgs) -> Result<AnyTransport, TransportError> {
    let kind = name.parse::<TransportKind>()?;
    Ok(AnyTransport::new(kind, args))
}

impl AnyTransport {
    pub fn new(kind: TransportKind, args: TransportArgs) -> Self {
        match kind {
            TransportKind::System => {
                AnyTransport::System(SystemTransport::new(args.base, args.system))
            }
            TransportKind::Standard => {
                AnyTransport::Standard(StandardTransport::new(args.base, args.standard))
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            AnyTransport::System(_) => TransportKind::System,
            AnyTransport::Standard(_) => TransportKind::Standard,
        }
    }

    /// Reads at most `n` bytes, bounded by the transport timeout.
    pub async fn read_n(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        match self {
            AnyTransport::System(t) => t.read_n(n).await,
            AnyTransport::Standard(t) => t.read_n(n).await,
        }
    }
}

impl Transport for AnyTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        match self {
            AnyTransport::System(t) => t.open().await,
            AnyTransport::Standard(t) => t.open().await,
        }
    }

    async fn open_netconf(&mut self) -> Result<(), TransportError> {
        match self {
            AnyTransport::System(t) => t.open_netconf().await,
            AnyTransport::Standard(t) => t.open_netconf().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            AnyTransport::System(t) => t.close().await,
            AnyTransport::Standard(t) => t.close().await,
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            AnyTransport::System(t) => t.is_alive(),
            AnyTransport::Standard(t) => t.is_alive(),
        }
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        match self {
            AnyTransport::System(t) => t.read().await,
            AnyTransport::Standard(t) => t.read().await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            AnyTransport::System(t) => t.write(data).await,
            AnyTransport::Standard(t) => t.write(data).await,
        }
    }

    fn format_log_message(&self, level: Level, message: &str) -> String {
        match self {
            AnyTransport::System(t) => t.format_log_message(level, message),
            AnyTransport::Standard(t) => t.format_log_message(level, message),
        }
    }
}

/// Lifecycle of a single transport instance: `Idle` -> `Open` -> `Closed`.
enum SessionState<S> {
    Idle,
    Open(S),
    Closed,
}

impl<S> SessionState<S> {
    fn ensure_openable(&self) -> Result<(), TransportError> {
        match self {
            SessionState::Idle => Ok(()),
            SessionState::Open(_) => Err(TransportError::AlreadyOpen),
            SessionState::Closed => Err(TransportError::Closed),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self, SessionState::Open(_))
    }

    fn session_mut(&mut self) -> Result<&mut S, TransportError> {
        match self {
            SessionState::Open(session) => Ok(session),
            _ => Err(TransportError::NotOpen),
        }
    }

    /// Moves an open session out, leaving the state `Closed`.
    fn take(&mut self) -> Option<S> {
        if !self.is_open() {
            return None;
        }
        match std::mem::replace(self, SessionState::Closed) {
            SessionState::Open(session) => Some(session),
            _ => None,
        }
    }
}

mod guard;
mod security;
mod standard;
mod system;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_timeout_updates_are_seen_by_clones() {
        let args = BaseTransportArgs::new("10.0.0.1", 22);
        let handle = args.timeout_transport.clone();

        handle.set(Duration::from_secs(42));

        assert_eq!(args.timeout_transport.get(), Duration::from_secs(42));
        assert_eq!(args.clone().timeout_transport.get(), Duration::from_secs(42));
    }

    #[test]
    fn format_log_message_names_level_host_and_port() {
        let args = BaseTransportArgs::new("10.0.0.1", 830);
        let line = format_log_message(&args, Level::Error, "boom");
        assert_eq!(line, "level=error host=10.0.0.1 port=830 message=boom");
    }

    #[test]
    fn unknown_transport_name_is_rejected() {
        let err = match new_transport("telnet", TransportArgs::default()) {
            Ok(_) => panic!("telnet is not a registered transport"),
            Err(err) => err,
        };
        assert!(matches!(err, TransportError::UnknownTransport(ref name) if name == "telnet"));
    }

    #[test]
    fn registered_names_select_their_variant() {
        let system = new_transport("system", TransportArgs::default()).expect("system");
        let standard = new_transport("standard", TransportArgs::default()).expect("standard");

        assert_eq!(system.kind(), TransportKind::System);
        assert_eq!(standard.kind(), TransportKind::Standard);
        assert!(!system.is_alive());
        assert!(!standard.is_alive());
        assert_eq!(TransportKind::Standard.to_string(), "standard");
    }

    #[test]
    fn args_load_from_json_with_defaults() {
        let json = r#"{
            "base": {"host": "10.0.0.1", "auth_username": "admin", "timeout_transport": 30000},
            "system": {"auth_strict_key": false}
        }"#;
        let args: TransportArgs = serde_json::from_str(json).expect("parse args");

        assert_eq!(args.base.port, 22);
        assert_eq!(args.base.timeout_transport.get(), Duration::from_secs(30));
        assert_eq!(args.base.timeout_socket.get(), config::DEFAULT_TIMEOUT_SOCKET);
        assert!(!args.system.auth_strict_key);
        assert!(args.standard.auth_strict_key);

        let value = serde_json::to_value(&args.base).expect("serialize");
        assert_eq!(value["timeout_transport"], 30000);
    }

    #[test]
    fn args_schema_describes_timeouts_as_integers() {
        let schema = schemars::schema_for!(BaseTransportArgs);
        let value = serde_json::to_value(&schema).expect("schema json");
        assert_eq!(
            value["properties"]["timeout_socket"]["type"],
            serde_json::json!("integer")
        );
    }

    #[test]
    fn session_state_is_single_use() {
        let mut state: SessionState<u8> = SessionState::Idle;
        assert!(state.ensure_openable().is_ok());
        assert!(matches!(state.session_mut(), Err(TransportError::NotOpen)));
        assert!(state.take().is_none());

        state = SessionState::Open(7);
        assert!(matches!(state.ensure_openable(), Err(TransportError::AlreadyOpen)));
        assert_eq!(state.take(), Some(7));
        assert!(!state.is_open());
        assert!(matches!(state.ensure_openable(), Err(TransportError::Closed)));
    }
}
