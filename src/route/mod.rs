//! Route table management for the VPN tunnel
//!
//! Makes the tunnel device carry default traffic while keeping the path to
//! the VPN server itself outside the tunnel, and guarantees that teardown
//! removes exactly what was installed. Mutation goes through the
//! [`RouteBackend`] trait so tests substitute a fake table instead of
//! touching the host.

#[cfg(target_os = "linux")]
pub mod linux;

use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("no default route present")]
    NoDefaultRoute,
    #[error("insufficient privileges to modify the route table")]
    PermissionDenied,
    #[error("route not found")]
    NotFound,
    #[error("route already present")]
    AlreadyExists,
    #[error("route management is not supported on this platform")]
    Unsupported,
    #[error("route operation failed: {0}")]
    Backend(String),
}

/// The pre-tunnel default route, captured before any mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySnapshot {
    pub gateway: Ipv4Addr,
    pub interface: String,
    pub metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Default,
    Host(IpAddr),
}

/// One routing-table entry as this crate models it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub target: RouteTarget,
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub metric: Option<u32>,
}

/// Structured route-table access; no command output is ever parsed
pub trait RouteBackend: Send {
    fn query_default_route(&self) -> Result<Option<GatewaySnapshot>, RouteError>;
    fn add_route(&mut self, route: &Route) -> Result<(), RouteError>;
    fn delete_route(&mut self, route: &Route) -> Result<(), RouteError>;
}

/// Backend for the running platform
pub fn platform_backend() -> Box<dyn RouteBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxRouteBackend::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullRouteBackend)
    }
}

/// Placeholder for platforms where the session runs app-managed and never
/// mutates routes
pub struct NullRouteBackend;

impl RouteBackend for NullRouteBackend {
    fn query_default_route(&self) -> Result<Option<GatewaySnapshot>, RouteError> {
        Ok(None)
    }

    fn add_route(&mut self, _route: &Route) -> Result<(), RouteError> {
        Err(RouteError::Unsupported)
    }

    fn delete_route(&mut self, _route: &Route) -> Result<(), RouteError> {
        Err(RouteError::Unsupported)
    }
}

/// Tracks every route this session installs so restoration is exact
pub struct RouteTable {
    backend: Box<dyn RouteBackend>,
    installed: Vec<Route>,
}

impl RouteTable {
    pub fn new(backend: Box<dyn RouteBackend>) -> Self {
        Self {
            backend,
            installed: Vec::new(),
        }
    }

    /// Read the current default route's next hop. Must run before any
    /// mutation; without it no VPN route is ever installed.
    pub fn snapshot_default_gateway(&self) -> Result<GatewaySnapshot, RouteError> {
        let snapshot = self
            .backend
            .query_default_route()?
            .ok_or(RouteError::NoDefaultRoute)?;
        info!(
            "Default gateway snapshot: {} dev {} metric {}",
            snapshot.gateway, snapshot.interface, snapshot.metric
        );
        Ok(snapshot)
    }

    /// Host route sending the VPN server's own traffic via the pre-tunnel
    /// gateway, so the tunnel's carrier packets never loop back into it
    pub fn install_server_bypass(
        &mut self,
        server: IpAddr,
        snapshot: &GatewaySnapshot,
    ) -> Result<(), RouteError> {
        self.install(Route {
            target: RouteTarget::Host(server),
            gateway: Some(snapshot.gateway),
            interface: None,
            metric: None,
        })
    }

    /// Default route via the tunnel at metric 1. The original default route
    /// stays in the table; it loses on metric while the tunnel is up and
    /// regains precedence the moment the tunnel route is removed.
    pub fn install_tunnel_default(
        &mut self,
        interface: &str,
        tunnel_gateway: Ipv4Addr,
    ) -> Result<(), RouteError> {
        self.install(Route {
            target: RouteTarget::Default,
            gateway: Some(tunnel_gateway),
            interface: Some(interface.to_string()),
            metric: Some(1),
        })
    }

    /// Host routes pinning the configured resolvers to the tunnel, so name
    /// resolution cannot be bypassed by a route priority tie
    pub fn install_nameserver_routes(
        &mut self,
        servers: &[Ipv4Addr],
        interface: &str,
        tunnel_gateway: Ipv4Addr,
    ) -> Result<(), RouteError> {
        for server in servers {
            self.install(Route {
                target: RouteTarget::Host(IpAddr::V4(*server)),
                gateway: Some(tunnel_gateway),
                interface: Some(interface.to_string()),
                metric: Some(1),
            })?;
        }
        Ok(())
    }

    fn install(&mut self, route: Route) -> Result<(), RouteError> {
        match self.backend.add_route(&route) {
            Ok(()) => {}
            Err(RouteError::AlreadyExists) => {
                warn!("Route {:?} already present, treating as installed", route.target);
            }
            Err(e) => return Err(e),
        }
        debug!("Installed route {:?} via {:?}", route.target, route.gateway);
        self.installed.push(route);
        Ok(())
    }

    /// Remove everything this table installed, newest first. Routes that
    /// are already gone count as removed; teardown after a partial setup
    /// must never fail for having nothing to clean up.
    pub fn restore(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        while let Some(route) = self.installed.pop() {
            match self.backend.delete_route(&route) {
                Ok(()) => debug!("Removed route {:?}", route.target),
                Err(RouteError::NotFound) => {
                    debug!("Route {:?} already absent", route.target);
                }
                Err(e) => warn!("Failed to remove route {:?}: {}", route.target, e),
            }
        }
        info!("Route table restored");
    }

    pub fn installed(&self) -> &[Route] {
        &self.installed
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRouteBackend;
    use super::*;

    fn snapshot() -> GatewaySnapshot {
        GatewaySnapshot {
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface: "eth0".to_string(),
            metric: 100,
        }
    }

    #[test]
    fn test_snapshot_requires_default_route() {
        let table = RouteTable::new(Box::new(FakeRouteBackend::default()));
        assert_eq!(
            table.snapshot_default_gateway(),
            Err(RouteError::NoDefaultRoute)
        );

        let backend = FakeRouteBackend::with_default_route(Ipv4Addr::new(10, 1, 1, 1), "wlan0");
        let table = RouteTable::new(Box::new(backend));
        let snap = table.snapshot_default_gateway().unwrap();
        assert_eq!(snap.gateway, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(snap.interface, "wlan0");
    }

    #[test]
    fn test_install_restore_round_trip() {
        let backend = FakeRouteBackend::default();
        let mut table = RouteTable::new(Box::new(backend.clone()));

        let server = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let tunnel_gw = Ipv4Addr::new(10, 0, 0, 1);
        table.install_server_bypass(server, &snapshot()).unwrap();
        table.install_tunnel_default("tl0", tunnel_gw).unwrap();
        table
            .install_nameserver_routes(
                &[Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
                "tl0",
                tunnel_gw,
            )
            .unwrap();

        assert_eq!(table.installed().len(), 4);
        assert_eq!(backend.route_count(), 4);

        table.restore();
        assert!(table.installed().is_empty());
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_restore_tolerates_missing_routes() {
        let backend = FakeRouteBackend::default();
        let mut table = RouteTable::new(Box::new(backend.clone()));
        table
            .install_tunnel_default("tl0", Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();

        // Someone else removed the route underneath us
        backend.0.lock().unwrap().routes.clear();

        table.restore();
        assert!(table.installed().is_empty());
    }

    #[test]
    fn test_partial_install_restores_only_what_was_added() {
        let backend = FakeRouteBackend::default();
        backend.0.lock().unwrap().fail_after = Some(2);
        let mut table = RouteTable::new(Box::new(backend.clone()));

        let tunnel_gw = Ipv4Addr::new(10, 0, 0, 1);
        table
            .install_server_bypass(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), &snapshot())
            .unwrap();
        table.install_tunnel_default("tl0", tunnel_gw).unwrap();
        let err = table
            .install_nameserver_routes(&[Ipv4Addr::new(8, 8, 8, 8)], "tl0", tunnel_gw)
            .unwrap_err();
        assert!(matches!(err, RouteError::Backend(_)));
        assert_eq!(table.installed().len(), 2);

        table.restore();
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_duplicate_install_is_tolerated() {
        let backend = FakeRouteBackend::default();
        let mut table = RouteTable::new(Box::new(backend.clone()));
        let tunnel_gw = Ipv4Addr::new(10, 0, 0, 1);
        table.install_tunnel_default("tl0", tunnel_gw).unwrap();
        table.install_tunnel_default("tl0", tunnel_gw).unwrap();
        // both recorded; restore drains both without error
        assert_eq!(table.installed().len(), 2);
        table.restore();
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_null_backend_reports_unsupported() {
        let mut backend = NullRouteBackend;
        assert_eq!(backend.query_default_route(), Ok(None));
        let route = Route {
            target: RouteTarget::Default,
            gateway: None,
            interface: None,
            metric: None,
        };
        assert_eq!(backend.add_route(&route), Err(RouteError::Unsupported));
        assert_eq!(backend.delete_route(&route), Err(RouteError::Unsupported));
    }
}
