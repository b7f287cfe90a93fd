//! # rneter-transport - Byte Transports for Network Device Sessions
//!
//! `rneter-transport` moves raw bytes between automation code and network
//! devices (routers, switches, anything speaking an SSH CLI or NETCONF). It
//! does not detect prompts or parse output; it opens a session, reads and
//! writes bytes with a bounded wait, and closes it again.
//!
//! ## Features
//!
//! - **System Transport**: Runs the local `ssh` binary on a pseudo-terminal, so
//!   anything `ssh` supports (agents, jump hosts via config files) just works
//! - **Standard Transport**: Native SSH through russh with selectable algorithm policies
//! - **NETCONF**: Both transports can open the `netconf` subsystem instead of a shell
//! - **Bounded Reads**: Every read is raced against a live-tunable idle timeout
//! - **Reproducible Commands**: The `ssh` argument vector is built in a fixed order
//!   and ignores ambient ssh config unless one is given explicitly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rneter_transport::transport::{Transport, TransportArgs, new_transport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut args = TransportArgs::default();
//!     args.base.host = "192.168.1.1".to_string();
//!     args.base.auth_username = "admin".to_string();
//!     args.system.auth_private_key = Some("/home/admin/.ssh/id_ed25519".to_string());
//!
//!     let idle = args.base.timeout_transport.clone();
//!     let mut transport = new_transport("system", args)?;
//!     transport.open().await?;
//!
//!     // Give slow commands more room without touching the transport.
//!     idle.set(Duration::from_secs(60));
//!
//!     transport.write(b"show version\n").await?;
//!     let output = transport.read().await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`transport::Transport`] - Operations every transport provides
//! - [`transport::SystemTransport`] - `ssh` spawned on a pseudo-terminal
//! - [`transport::StandardTransport`] - Native russh session
//! - [`transport::run_with_timeout`] - Deadline guard used for blocking reads
//! - [`error::TransportError`] - Error types surfaced to callers
//! - [`config`] - Defaults and SSH algorithm lists

pub mod config;
pub mod error;
pub mod transport;
