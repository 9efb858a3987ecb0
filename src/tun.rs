//! Virtual tunnel interface management
//!
//! Obtains a kernel point-to-point tunnel device where the platform allows
//! it. Where it does not (sandboxed or managed environments), creation
//! reports an explicit app-managed outcome instead of a device so the rest
//! of the stack can skip local route mutation: the host's own VPN service
//! is expected to carry the traffic in that mode.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};
use tun::AbstractDevice;

#[derive(Error, Debug)]
pub enum TunError {
    #[error("insufficient privileges to open the tunnel device")]
    PermissionDenied,
    #[error("failed to create tunnel device: {0}")]
    Create(String),
    #[error("failed to configure tunnel device: {0}")]
    Configure(String),
}

/// Chosen once at startup; the session never branches on the platform again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCapability {
    /// The OS exposes a raw tunnel device this process can manage
    NativeDevice,
    /// Tunnel provisioning is delegated to a host-provided VPN service
    AppManagedOnly,
}

/// Probe what the current platform permits
pub fn detect_capability() -> PlatformCapability {
    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/dev/net/tun").exists() {
            return PlatformCapability::NativeDevice;
        }
        PlatformCapability::AppManagedOnly
    }
    #[cfg(not(target_os = "linux"))]
    {
        PlatformCapability::AppManagedOnly
    }
}

/// Addressing applied to a freshly created device
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub local_addr: Ipv4Addr,
    pub peer_addr: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
    pub name_servers: Vec<Ipv4Addr>,
}

impl From<&crate::config::TunnelConfig> for TunnelParams {
    fn from(config: &crate::config::TunnelConfig) -> Self {
        Self {
            local_addr: config.address,
            peer_addr: config.gateway,
            prefix_len: config.prefix_len,
            mtu: config.mtu,
            name_servers: config.name_servers.clone(),
        }
    }
}

impl Default for TunnelParams {
    fn default() -> Self {
        (&crate::config::TunnelConfig::default()).into()
    }
}

pub fn netmask_from_prefix(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix.min(32))))
    }
}

/// An owned kernel tunnel device
pub trait TunDevice: Send {
    fn name(&self) -> &str;
    /// Assign the address and bring the device up. A partial failure puts
    /// the device back down before the error is reported, so it is never
    /// left up without a verified address.
    fn configure(
        &mut self,
        address: Ipv4Addr,
        peer: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), TunError>;
    /// Best-effort release; dropping the handle closes the device, and the
    /// owning session takes the handle out of its slot so a second release
    /// cannot happen.
    fn close(&mut self);
}

/// Result of a creation request
pub enum TunOutcome {
    Device(Box<dyn TunDevice>),
    /// No local device; a host-provided tunnel service is in charge
    AppManaged,
}

/// Creates tunnel devices; a seam so tests substitute a fake
pub trait TunProvider: Send {
    fn capability(&self) -> PlatformCapability;
    fn create(&mut self, params: &TunnelParams) -> Result<TunOutcome, TunError>;
}

const IFACE_PREFIX: &str = "tl";
static IFACE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Fixed prefix plus an instance discriminator, so repeated sessions in one
/// process never collide on a name
fn next_interface_name() -> String {
    format!("{}{}", IFACE_PREFIX, IFACE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Platform provider backed by the `tun` crate
pub struct NativeTunProvider {
    capability: PlatformCapability,
}

impl NativeTunProvider {
    pub fn new() -> Self {
        Self {
            capability: detect_capability(),
        }
    }
}

impl Default for NativeTunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TunProvider for NativeTunProvider {
    fn capability(&self) -> PlatformCapability {
        self.capability
    }

    fn create(&mut self, params: &TunnelParams) -> Result<TunOutcome, TunError> {
        if self.capability == PlatformCapability::AppManagedOnly {
            info!("No raw tunnel device on this platform, using app-managed mode");
            return Ok(TunOutcome::AppManaged);
        }

        let name = next_interface_name();
        let mut config = tun::Configuration::default();
        config.tun_name(&name).mtu(params.mtu);

        let device = tun::create(&config).map_err(|e| match e {
            tun::Error::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                #[cfg(unix)]
                if !nix::unistd::Uid::effective().is_root() {
                    warn!("Tunnel device creation needs root or CAP_NET_ADMIN");
                }
                TunError::PermissionDenied
            }
            other => TunError::Create(other.to_string()),
        })?;

        let name = device.tun_name().unwrap_or(name);
        info!("Created tunnel device {}", name);
        Ok(TunOutcome::Device(Box::new(NativeTun { name, device })))
    }
}

struct NativeTun {
    name: String,
    device: tun::Device,
}

impl NativeTun {
    fn apply(&mut self, address: Ipv4Addr, peer: Ipv4Addr, prefix: u8) -> Result<(), TunError> {
        self.device
            .set_address(IpAddr::V4(address))
            .map_err(|e| TunError::Configure(format!("address assignment: {e}")))?;
        self.device
            .set_netmask(IpAddr::V4(netmask_from_prefix(prefix)))
            .map_err(|e| TunError::Configure(format!("netmask assignment: {e}")))?;
        self.device
            .set_destination(IpAddr::V4(peer))
            .map_err(|e| TunError::Configure(format!("peer assignment: {e}")))?;
        self.device
            .enabled(true)
            .map_err(|e| TunError::Configure(format!("link up: {e}")))?;
        debug!("{} configured as {}/{} peer {}", self.name, address, prefix, peer);
        Ok(())
    }
}

impl TunDevice for NativeTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, address: Ipv4Addr, peer: Ipv4Addr, prefix: u8) -> Result<(), TunError> {
        if let Err(e) = self.apply(address, peer, prefix) {
            if let Err(down) = self.device.enabled(false) {
                warn!("Could not bring {} back down: {}", self.name, down);
            }
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.device.enabled(false) {
            debug!("Link down on {} failed during release: {}", self.name, e);
        }
        info!("Released tunnel device {}", self.name);
    }
}
