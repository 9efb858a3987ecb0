//! Linux route backend
//!
//! Reads the kernel's route table from `/proc/net/route` and mutates it
//! through the `SIOCADDRT`/`SIOCDELRT` ioctls, so no external tool is
//! spawned and no command output is parsed.

use super::{GatewaySnapshot, Route, RouteBackend, RouteError, RouteTarget};
use std::ffi::CString;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

const PROC_ROUTE: &str = "/proc/net/route";

pub struct LinuxRouteBackend {
    proc_path: String,
}

impl LinuxRouteBackend {
    pub fn new() -> Self {
        Self {
            proc_path: PROC_ROUTE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_proc_path(path: String) -> Self {
        Self { proc_path: path }
    }
}

impl Default for LinuxRouteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteBackend for LinuxRouteBackend {
    fn query_default_route(&self) -> Result<Option<GatewaySnapshot>, RouteError> {
        let table = std::fs::read_to_string(&self.proc_path)
            .map_err(|e| RouteError::Backend(format!("reading {}: {e}", self.proc_path)))?;
        parse_default_route(&table)
    }

    fn add_route(&mut self, route: &Route) -> Result<(), RouteError> {
        route_ioctl(libc::SIOCADDRT, route)
    }

    fn delete_route(&mut self, route: &Route) -> Result<(), RouteError> {
        route_ioctl(libc::SIOCDELRT, route)
    }
}

/// `/proc/net/route` prints one entry per line: interface, then
/// destination/gateway/mask as hex words, flags and metric in between.
fn parse_default_route(table: &str) -> Result<Option<GatewaySnapshot>, RouteError> {
    let mut best: Option<GatewaySnapshot> = None;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let dest = parse_hex_word(fields[1])?;
        let gateway = parse_hex_word(fields[2])?;
        let flags = u16::from_str_radix(fields[3], 16)
            .map_err(|e| RouteError::Backend(format!("bad flags field: {e}")))?;
        let metric: u32 = fields[6]
            .parse()
            .map_err(|e| RouteError::Backend(format!("bad metric field: {e}")))?;
        let mask = parse_hex_word(fields[7])?;

        if dest != Ipv4Addr::UNSPECIFIED || mask != Ipv4Addr::UNSPECIFIED {
            continue;
        }
        if flags & libc::RTF_GATEWAY == 0 || flags & libc::RTF_UP == 0 {
            continue;
        }
        let candidate = GatewaySnapshot {
            gateway,
            interface: fields[0].to_string(),
            metric,
        };
        match best {
            Some(ref current) if current.metric <= candidate.metric => {}
            _ => best = Some(candidate),
        }
    }
    Ok(best)
}

/// The kernel prints addresses as the in-memory 32-bit word, so the hex
/// value's low byte is the first octet.
fn parse_hex_word(field: &str) -> Result<Ipv4Addr, RouteError> {
    let raw = u32::from_str_radix(field, 16)
        .map_err(|e| RouteError::Backend(format!("bad address field {field:?}: {e}")))?;
    Ok(Ipv4Addr::from(raw.to_le_bytes()))
}

fn sockaddr_from(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    };
    // sockaddr_in and sockaddr are layout-compatible 16-byte structs
    unsafe { std::mem::transmute(sin) }
}

fn route_ioctl(op: libc::c_ulong, route: &Route) -> Result<(), RouteError> {
    let (dst, mask, host) = match route.target {
        RouteTarget::Default => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, false),
        RouteTarget::Host(IpAddr::V4(addr)) => (addr, Ipv4Addr::BROADCAST, true),
        RouteTarget::Host(IpAddr::V6(_)) => return Err(RouteError::Unsupported),
    };

    let mut entry: libc::rtentry = unsafe { std::mem::zeroed() };
    entry.rt_dst = sockaddr_from(dst);
    entry.rt_genmask = sockaddr_from(mask);
    entry.rt_flags = libc::RTF_UP;
    if host {
        entry.rt_flags |= libc::RTF_HOST;
    }
    if let Some(gateway) = route.gateway {
        entry.rt_gateway = sockaddr_from(gateway);
        entry.rt_flags |= libc::RTF_GATEWAY;
    }
    if let Some(metric) = route.metric {
        // the kernel stores metric - 1
        entry.rt_metric = (metric + 1) as libc::c_short;
    }
    let device = route
        .interface
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| RouteError::Backend("interface name contains NUL".to_string()))?;
    if let Some(ref name) = device {
        entry.rt_dev = name.as_ptr() as *mut libc::c_char;
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(map_os_error(io::Error::last_os_error()));
    }
    let rc = unsafe { libc::ioctl(fd, op, &entry as *const libc::rtentry) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc < 0 {
        debug!("Route ioctl {:#x} failed for {:?}: {}", op, route.target, err);
        return Err(map_os_error(err));
    }
    Ok(())
}

fn map_os_error(err: io::Error) -> RouteError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => RouteError::PermissionDenied,
        Some(libc::ESRCH) => RouteError::NotFound,
        Some(libc::EEXIST) => RouteError::AlreadyExists,
        _ => RouteError::Backend(err.to_string()),
    }
}
