//! tunlink - VPN client session and tunnel lifecycle management
//!
//! This crate drives one logical VPN session on a host machine: it
//! negotiates a connection to a remote endpoint through a pluggable
//! protocol engine, tracks session state, and - once authenticated -
//! establishes and tears down a kernel tunnel device together with the
//! routing changes that divert traffic through it. Teardown is exact: the
//! pre-tunnel default gateway is captured before any mutation and every
//! installed route is tracked, so the host's network configuration is
//! restored even after partial failures.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `policy`: Host-validation policy (allow/deny predicate)
//! - `engine`: Protocol engine boundary and TLS transport probe
//! - `tun`: Tunnel device management and the app-managed fallback
//! - `route`: Route table management and the gateway snapshot
//! - `session`: The connection state machine
//! - `probe`: Public-IP diagnostic probe
//!
//! # Usage
//!
//! ```no_run
//! use tunlink::{Config, Session};
//!
//! # fn main() -> Result<(), tunlink::SessionError> {
//! let config: Config = toml::from_str(r#"
//!     [server]
//!     hostname = "vpn.example.net"
//! "#).expect("config");
//!
//! let mut session = Session::new(config)?;
//! session.connect("vpn.example.net", 443)?;
//! session.authenticate("user", "secret")?;
//! session.establish_tunnel()?;
//! println!("{}", session.describe_tunnel_interface()?);
//! session.close_tunnel()?;
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod policy;
pub mod probe;
pub mod route;
pub mod session;
pub mod tun;

pub use config::Config;
pub use probe::IpProbe;
pub use session::{Session, SessionError, SharedSession, Status, TunnelDescriptor, TunnelMode};
