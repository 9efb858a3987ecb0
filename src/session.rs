//! VPN session state machine
//!
//! A [`Session`] owns one logical connection to a VPN endpoint and walks it
//! through connect → authenticate → establish tunnel → close tunnel →
//! disconnect. It is the only owner of the tunnel device handle and the
//! only writer of the status field; the gateway snapshot and every
//! installed route are tracked so teardown restores the host exactly, from
//! any state, including after partial failures.
//!
//! All operations are synchronous and run to completion. Callers are
//! expected to serialize access to one session; [`SharedSession`] is the
//! mutual-exclusion wrapper for callers that share one across threads.

use crate::config::Config;
use crate::engine::{EngineError, ProtocolEngine, RejectAll, TlsProbeEngine};
use crate::policy::{HostPolicy, ListHostPolicy, hostname_is_well_formed};
use crate::probe::{IpProbe, ProbeError};
use crate::route::{GatewaySnapshot, RouteError, RouteTable, platform_backend};
use crate::tun::{
    NativeTunProvider, PlatformCapability, TunDevice, TunError, TunOutcome, TunProvider,
    TunnelParams, netmask_from_prefix,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("tunnel setup failed: {0}")]
    TunnelFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Tunneling,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Tunneling => "tunneling",
        };
        f.write_str(label)
    }
}

/// How the active tunnel is provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// This session owns a kernel tunnel device and its routes
    Native,
    /// A host-provided VPN service carries the traffic; no local device
    AppManaged,
}

#[derive(Debug, Clone)]
struct Endpoint {
    hostname: String,
    port: u16,
}

struct Credentials {
    username: String,
    #[allow(dead_code)]
    password: String,
}

/// Device name plus addressing, for display and verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub interface: String,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

impl TunnelDescriptor {
    pub fn network(&self) -> Ipv4Addr {
        let mask = u32::from(netmask_from_prefix(self.prefix_len));
        Ipv4Addr::from(u32::from(self.address) & mask)
    }
}

impl fmt::Display for TunnelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}/{}",
            self.interface,
            self.address,
            self.gateway,
            self.network(),
            self.prefix_len
        )
    }
}

pub struct Session {
    config: Config,
    engine: Box<dyn ProtocolEngine>,
    policy: Box<dyn HostPolicy>,
    tun_provider: Box<dyn TunProvider>,
    routes: RouteTable,
    status: Status,
    endpoint: Option<Endpoint>,
    credentials: Option<Credentials>,
    device: Option<Box<dyn TunDevice>>,
    interface_name: Option<String>,
    mode: Option<TunnelMode>,
    gateway_snapshot: Option<GatewaySnapshot>,
}

impl Session {
    /// Session with the platform backends and the default transport-probe
    /// engine (which rejects all credentials offline; supply an engine via
    /// [`Session::with_parts`] for anything beyond diagnostics)
    pub fn new(config: Config) -> Result<Self, SessionError> {
        let engine = Box::new(TlsProbeEngine::new(
            config.server.hub.clone(),
            Duration::from_secs(config.server.timeout_secs),
            Box::new(RejectAll),
        ));
        Self::with_parts(
            config,
            engine,
            Box::new(NativeTunProvider::new()),
            RouteTable::new(platform_backend()),
        )
    }

    /// Session with explicit collaborators; the seam tests use to supply
    /// fakes instead of mutating a real host
    pub fn with_parts(
        config: Config,
        engine: Box<dyn ProtocolEngine>,
        tun_provider: Box<dyn TunProvider>,
        routes: RouteTable,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        let policy = Box::new(ListHostPolicy::from_config(&config.policy));
        Ok(Self {
            config,
            engine,
            policy,
            tun_provider,
            routes,
            status: Status::Disconnected,
            endpoint: None,
            credentials: None,
            device: None,
            interface_name: None,
            mode: None,
            gateway_snapshot: None,
        })
    }

    /// Pure read; never fails and has no side effects
    pub fn status(&self) -> Status {
        self.status
    }

    /// Provisioning mode of the active tunnel, if any
    pub fn tunnel_mode(&self) -> Option<TunnelMode> {
        self.mode
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.interface_name.as_deref()
    }

    /// Validate the endpoint and hand the handshake to the protocol engine
    pub fn connect(&mut self, hostname: &str, port: u16) -> Result<(), SessionError> {
        if self.status != Status::Disconnected {
            return Err(SessionError::InvalidParameter(
                "connect is only valid while disconnected".to_string(),
            ));
        }
        if !hostname_is_well_formed(hostname) {
            return Err(SessionError::InvalidParameter(format!(
                "malformed hostname {hostname:?}"
            )));
        }
        if port == 0 {
            return Err(SessionError::InvalidParameter(
                "port must be in 1-65535".to_string(),
            ));
        }
        if !self.policy.allows(hostname) {
            return Err(SessionError::ConnectionFailed(format!(
                "host {hostname:?} rejected by policy"
            )));
        }

        self.status = Status::Connecting;
        info!("Connecting to {}:{}", hostname, port);
        match self.engine.connect(hostname, port) {
            Ok(()) => {
                self.endpoint = Some(Endpoint {
                    hostname: hostname.to_string(),
                    port,
                });
                self.status = Status::Connected;
                info!("Connected to {}:{}", hostname, port);
                Ok(())
            }
            Err(EngineError::Timeout) => {
                self.status = Status::Disconnected;
                Err(SessionError::Timeout(format!(
                    "connect to {hostname}:{port} exceeded the deadline"
                )))
            }
            Err(e) => {
                self.status = Status::Disconnected;
                Err(SessionError::ConnectionFailed(e.to_string()))
            }
        }
    }

    /// Hand the credentials to the engine. A rejection leaves the session
    /// connected; no fresh connect is needed to retry.
    pub fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        if self.status != Status::Connected {
            return Err(SessionError::InvalidParameter(
                "authenticate requires a connected session".to_string(),
            ));
        }
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::AuthFailed(
                "username and password must be non-empty".to_string(),
            ));
        }
        match self.engine.authenticate(username, password) {
            Ok(()) => {
                info!("Authenticated as {}", username);
                self.credentials = Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                });
                Ok(())
            }
            Err(EngineError::Timeout) => Err(SessionError::Timeout(
                "authentication exceeded the deadline".to_string(),
            )),
            Err(e) => Err(SessionError::AuthFailed(e.to_string())),
        }
    }

    /// Bring up the tunnel: snapshot the default gateway, obtain and
    /// configure a tunnel device, divert traffic through it.
    ///
    /// A failure after the device exists leaves the session Tunneling with
    /// whatever was set up tracked for exact teardown; the caller decides
    /// between retrying the routing and closing the tunnel.
    pub fn establish_tunnel(&mut self) -> Result<(), SessionError> {
        if self.status != Status::Connected {
            return Err(SessionError::ConnectionFailed(
                "tunnel requires a connected session".to_string(),
            ));
        }

        let params = TunnelParams::from(&self.config.tunnel);
        let native = self.tun_provider.capability() == PlatformCapability::NativeDevice;
        let route_mutation = native && self.config.routing.auto_route;

        // the snapshot precedes any mutation; without it no route changes
        if route_mutation {
            match self.routes.snapshot_default_gateway() {
                Ok(snapshot) => self.gateway_snapshot = Some(snapshot),
                Err(e) => {
                    return Err(SessionError::TunnelFailed(format!("gateway snapshot: {e}")));
                }
            }
        }

        let outcome = match self.tun_provider.create(&params) {
            Ok(outcome) => outcome,
            Err(TunError::PermissionDenied) => {
                // degraded but well-defined: the host service has to carry
                // the traffic, and the caller learns it should elevate
                self.gateway_snapshot = None;
                self.enter_app_managed();
                return Err(SessionError::PermissionDenied(
                    "tunnel device creation denied; session continues app-managed".to_string(),
                ));
            }
            Err(e) => {
                self.gateway_snapshot = None;
                return Err(SessionError::TunnelFailed(e.to_string()));
            }
        };

        let mut device = match outcome {
            TunOutcome::AppManaged => {
                self.gateway_snapshot = None;
                self.enter_app_managed();
                return Ok(());
            }
            TunOutcome::Device(device) => device,
        };

        if let Err(e) = device.configure(params.local_addr, params.peer_addr, params.prefix_len) {
            // the device came up but could not be addressed; release it so
            // the observable state is app-managed, never half-configured
            device.close();
            self.gateway_snapshot = None;
            self.enter_app_managed();
            return Err(SessionError::TunnelFailed(format!(
                "device configuration: {e}"
            )));
        }

        let interface = device.name().to_string();
        self.device = Some(device);
        self.interface_name = Some(interface.clone());
        self.mode = Some(TunnelMode::Native);
        self.status = Status::Tunneling;

        if route_mutation {
            if let Err(e) = self.install_routes(&interface, &params) {
                // device stays up: packets can be captured even though
                // traffic is not diverted yet, and installed routes are
                // tracked for teardown
                warn!("Tunnel up on {} but routing incomplete", interface);
                return Err(e);
            }
        }

        info!("Tunnel established on {}", interface);
        Ok(())
    }

    fn enter_app_managed(&mut self) {
        self.mode = Some(TunnelMode::AppManaged);
        self.status = Status::Tunneling;
        info!("Tunnel up in app-managed mode");
    }

    fn install_routes(
        &mut self,
        interface: &str,
        params: &TunnelParams,
    ) -> Result<(), SessionError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| SessionError::TunnelFailed("no endpoint recorded".to_string()))?;
        let snapshot = self
            .gateway_snapshot
            .as_ref()
            .ok_or_else(|| SessionError::TunnelFailed("no gateway snapshot captured".to_string()))?;

        let server = resolve_server(&endpoint.hostname, endpoint.port)
            .map_err(SessionError::TunnelFailed)?;
        self.routes
            .install_server_bypass(server, snapshot)
            .map_err(map_route_err)?;
        self.routes
            .install_tunnel_default(interface, params.peer_addr)
            .map_err(map_route_err)?;
        if self.config.routing.dns_override {
            self.routes
                .install_nameserver_routes(&params.name_servers, interface, params.peer_addr)
                .map_err(map_route_err)?;
        }
        Ok(())
    }

    /// Reverse the routing and release the device. Calling this without an
    /// active tunnel is a successful no-op; cleanup never fails for having
    /// nothing to clean up.
    pub fn close_tunnel(&mut self) -> Result<(), SessionError> {
        if self.status != Status::Tunneling {
            debug!("No tunnel to close");
            return Ok(());
        }
        self.routes.restore();
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.interface_name = None;
        self.mode = None;
        self.gateway_snapshot = None;
        self.status = Status::Connected;
        info!("Tunnel closed");
        Ok(())
    }

    /// Close the tunnel if one is up, then drop the protocol connection
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.status == Status::Tunneling {
            self.close_tunnel()?;
        }
        if self.status != Status::Disconnected {
            self.engine.disconnect();
            if let Some(endpoint) = self.endpoint.take() {
                info!("Disconnected from {}:{}", endpoint.hostname, endpoint.port);
            }
        }
        self.endpoint = None;
        self.status = Status::Disconnected;
        Ok(())
    }

    /// Release everything the session owns. Safe from any status and
    /// idempotent; also run on Drop.
    pub fn close(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Cleanup during close failed: {}", e);
        }
        if let Some(credentials) = self.credentials.take() {
            debug!("Cleared credentials for {}", credentials.username);
        }
    }

    /// Device name plus addressing for display; only meaningful while a
    /// native tunnel is up
    pub fn describe_tunnel_interface(&self) -> Result<TunnelDescriptor, SessionError> {
        if self.status != Status::Tunneling {
            return Err(SessionError::InvalidParameter(
                "no tunnel established".to_string(),
            ));
        }
        let interface = self.interface_name.clone().ok_or_else(|| {
            SessionError::InvalidParameter(
                "tunnel is app-managed; no local device to describe".to_string(),
            )
        })?;
        let tunnel = &self.config.tunnel;
        Ok(TunnelDescriptor {
            interface,
            address: tunnel.address,
            gateway: tunnel.gateway,
            prefix_len: tunnel.prefix_len,
        })
    }

    /// Ask the external lookup services for this host's public address.
    /// Diagnostic only; the session state is never affected by the result.
    pub fn probe_external_address(&self) -> Result<IpAddr, ProbeError> {
        IpProbe::default().probe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_route_err(e: RouteError) -> SessionError {
    match e {
        RouteError::PermissionDenied => {
            SessionError::PermissionDenied("route table modification denied".to_string())
        }
        other => SessionError::TunnelFailed(format!("route setup: {other}")),
    }
}

fn resolve_server(hostname: &str, port: u16) -> Result<IpAddr, String> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {hostname}: {e}"))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| format!("no addresses found for {hostname}"))
}

/// Mutual-exclusion wrapper for callers sharing one session across threads
#[derive(Clone)]
pub struct SharedSession(Arc<Mutex<Session>>);

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};
    use crate::route::testing::FakeRouteBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum ConnectBehavior {
        Succeed,
        Refuse,
        TimeOut,
    }

    struct FakeEngine {
        connect: ConnectBehavior,
        auth_ok: bool,
        disconnects: Arc<AtomicUsize>,
    }

    impl FakeEngine {
        fn ok() -> Self {
            Self {
                connect: ConnectBehavior::Succeed,
                auth_ok: true,
                disconnects: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ProtocolEngine for FakeEngine {
        fn connect(&mut self, _hostname: &str, _port: u16) -> Result<(), EngineError> {
            match self.connect {
                ConnectBehavior::Succeed => Ok(()),
                ConnectBehavior::Refuse => Err(EngineError::Handshake("refused".to_string())),
                ConnectBehavior::TimeOut => Err(EngineError::Timeout),
            }
        }

        fn authenticate(&mut self, _username: &str, _password: &str) -> Result<(), EngineError> {
            if self.auth_ok {
                Ok(())
            } else {
                Err(EngineError::Auth("bad credentials".to_string()))
            }
        }

        fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct TunCounters {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    enum CreateBehavior {
        Device,
        AppManaged,
        Denied,
        Fail,
    }

    struct FakeTunProvider {
        capability: PlatformCapability,
        behavior: CreateBehavior,
        configure_fails: bool,
        counters: Arc<TunCounters>,
    }

    impl FakeTunProvider {
        fn native(counters: Arc<TunCounters>) -> Self {
            Self {
                capability: PlatformCapability::NativeDevice,
                behavior: CreateBehavior::Device,
                configure_fails: false,
                counters,
            }
        }
    }

    impl TunProvider for FakeTunProvider {
        fn capability(&self) -> PlatformCapability {
            self.capability
        }

        fn create(&mut self, _params: &TunnelParams) -> Result<TunOutcome, TunError> {
            match self.behavior {
                CreateBehavior::Device => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    Ok(TunOutcome::Device(Box::new(FakeTun {
                        name: "tl-test0".to_string(),
                        configure_fails: self.configure_fails,
                        counters: self.counters.clone(),
                    })))
                }
                CreateBehavior::AppManaged => Ok(TunOutcome::AppManaged),
                CreateBehavior::Denied => Err(TunError::PermissionDenied),
                CreateBehavior::Fail => Err(TunError::Create("no such device".to_string())),
            }
        }
    }

    struct FakeTun {
        name: String,
        configure_fails: bool,
        counters: Arc<TunCounters>,
    }

    impl TunDevice for FakeTun {
        fn name(&self) -> &str {
            &self.name
        }

        fn configure(
            &mut self,
            _address: Ipv4Addr,
            _peer: Ipv4Addr,
            _prefix: u8,
        ) -> Result<(), TunError> {
            if self.configure_fails {
                Err(TunError::Configure("address assignment failed".to_string()))
            } else {
                Ok(())
            }
        }

        fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                // IP literal so route installation needs no resolver
                hostname: "203.0.113.7".to_string(),
                ..ServerConfig::default()
            },
            ..Config::default()
        }
    }

    fn session_with(
        config: Config,
        engine: FakeEngine,
        provider: FakeTunProvider,
        backend: FakeRouteBackend,
    ) -> Session {
        Session::with_parts(
            config,
            Box::new(engine),
            Box::new(provider),
            RouteTable::new(Box::new(backend)),
        )
        .unwrap()
    }

    fn routed_backend() -> FakeRouteBackend {
        FakeRouteBackend::with_default_route(Ipv4Addr::new(192, 168, 1, 1), "eth0")
    }

    #[test]
    fn test_full_lifecycle() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );

        assert_eq!(session.status(), Status::Disconnected);
        session.connect("203.0.113.7", 443).unwrap();
        assert_eq!(session.status(), Status::Connected);

        session.authenticate("user", "pass").unwrap();
        assert_eq!(session.status(), Status::Connected);

        session.establish_tunnel().unwrap();
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::Native));
        // server bypass + tunnel default + two name servers
        assert_eq!(backend.route_count(), 4);

        let descriptor = session.describe_tunnel_interface().unwrap();
        assert_eq!(descriptor.interface, "tl-test0");
        assert_eq!(descriptor.to_string(), "tl-test0:10.0.0.2:10.0.0.1:10.0.0.0/24");

        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(backend.route_count(), 0);
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);

        session.disconnect().unwrap();
        assert_eq!(session.status(), Status::Disconnected);
    }

    #[test]
    fn test_connect_rejects_malformed_hostnames() {
        for hostname in ["", ".example.net", "example.net.", "vpn..example.net"] {
            let mut session = session_with(
                test_config(),
                FakeEngine::ok(),
                FakeTunProvider::native(Arc::new(TunCounters::default())),
                FakeRouteBackend::default(),
            );
            let err = session.connect(hostname, 443).unwrap_err();
            assert!(matches!(err, SessionError::InvalidParameter(_)), "{hostname:?}");
            assert_eq!(session.status(), Status::Disconnected);
        }
    }

    #[test]
    fn test_connect_rejects_port_zero() {
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        let err = session.connect("vpn.example.net", 0).unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
        assert_eq!(session.status(), Status::Disconnected);
    }

    #[test]
    fn test_connect_honors_policy() {
        let mut config = test_config();
        config.policy.allow = vec!["example.net".to_string()];
        let mut session = session_with(
            config,
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );

        let err = session.connect("vpn.other.org", 443).unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed(_)));
        assert_eq!(session.status(), Status::Disconnected);

        session.connect("vpn.example.net", 443).unwrap();
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        let mut engine = FakeEngine::ok();
        engine.connect = ConnectBehavior::Refuse;
        let mut session = session_with(
            test_config(),
            engine,
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        let err = session.connect("203.0.113.7", 443).unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed(_)));
        assert_eq!(session.status(), Status::Disconnected);
    }

    #[test]
    fn test_connect_timeout_is_distinguished() {
        let mut engine = FakeEngine::ok();
        engine.connect = ConnectBehavior::TimeOut;
        let mut session = session_with(
            test_config(),
            engine,
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        let err = session.connect("203.0.113.7", 443).unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert_eq!(session.status(), Status::Disconnected);
    }

    #[test]
    fn test_connect_twice_is_invalid() {
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        session.connect("203.0.113.7", 443).unwrap();
        let err = session.connect("203.0.113.7", 443).unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_authenticate_requires_connected() {
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        let err = session.authenticate("user", "pass").unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
    }

    #[test]
    fn test_failed_authenticate_stays_connected() {
        let mut engine = FakeEngine::ok();
        engine.auth_ok = false;
        let mut session = session_with(
            test_config(),
            engine,
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        );
        session.connect("203.0.113.7", 443).unwrap();

        let err = session.authenticate("user", "wrong").unwrap_err();
        assert!(matches!(err, SessionError::AuthFailed(_)));
        assert_eq!(session.status(), Status::Connected);

        // empty credentials are rejected locally, same status rule
        let err = session.authenticate("", "pass").unwrap_err();
        assert!(matches!(err, SessionError::AuthFailed(_)));
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_establish_requires_connected() {
        let backend = FakeRouteBackend::default();
        let counters = Arc::new(TunCounters::default());
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed(_)));
        assert_eq!(session.status(), Status::Disconnected);
        assert_eq!(counters.created.load(Ordering::Relaxed), 0);
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_establish_without_default_route_fails_cleanly() {
        let counters = Arc::new(TunCounters::default());
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            FakeRouteBackend::default(), // no default route to snapshot
        );
        session.connect("203.0.113.7", 443).unwrap();
        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::TunnelFailed(_)));
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(counters.created.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_permission_denied_falls_back_to_app_managed() {
        let counters = Arc::new(TunCounters::default());
        let mut provider = FakeTunProvider::native(counters);
        provider.behavior = CreateBehavior::Denied;
        let backend = routed_backend();
        let mut session = session_with(test_config(), FakeEngine::ok(), provider, backend.clone());
        session.connect("203.0.113.7", 443).unwrap();

        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::AppManaged));
        assert_eq!(backend.route_count(), 0);

        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_create_failure_stays_connected() {
        let counters = Arc::new(TunCounters::default());
        let mut provider = FakeTunProvider::native(counters);
        provider.behavior = CreateBehavior::Fail;
        let backend = routed_backend();
        let mut session = session_with(test_config(), FakeEngine::ok(), provider, backend.clone());
        session.connect("203.0.113.7", 443).unwrap();

        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::TunnelFailed(_)));
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_configure_failure_releases_device() {
        let counters = Arc::new(TunCounters::default());
        let mut provider = FakeTunProvider::native(counters.clone());
        provider.configure_fails = true;
        let backend = routed_backend();
        let mut session = session_with(test_config(), FakeEngine::ok(), provider, backend.clone());
        session.connect("203.0.113.7", 443).unwrap();

        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::TunnelFailed(_)));
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::AppManaged));
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);
        assert_eq!(backend.route_count(), 0);
    }

    #[test]
    fn test_route_failure_leaves_tunnel_up() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        backend.0.lock().unwrap().fail_after = Some(1);
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();

        let err = session.establish_tunnel().unwrap_err();
        assert!(matches!(err, SessionError::TunnelFailed(_)));
        // device present, bypass route installed, default route missing
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::Native));
        assert_eq!(backend.route_count(), 1);

        // teardown removes exactly the partial install
        session.close_tunnel().unwrap();
        assert_eq!(backend.route_count(), 0);
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_app_managed_capability_skips_route_mutation() {
        let counters = Arc::new(TunCounters::default());
        let mut provider = FakeTunProvider::native(counters);
        provider.capability = PlatformCapability::AppManagedOnly;
        provider.behavior = CreateBehavior::AppManaged;
        let backend = FakeRouteBackend::default(); // would fail if consulted
        let mut session = session_with(test_config(), FakeEngine::ok(), provider, backend.clone());
        session.connect("203.0.113.7", 443).unwrap();

        session.establish_tunnel().unwrap();
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::AppManaged));
        assert_eq!(backend.route_count(), 0);
        assert!(session.describe_tunnel_interface().is_err());

        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Connected);
    }

    #[test]
    fn test_auto_route_off_creates_device_without_routes() {
        let counters = Arc::new(TunCounters::default());
        let mut config = test_config();
        config.routing.auto_route = false;
        let backend = FakeRouteBackend::default();
        let mut session = session_with(
            config,
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();

        session.establish_tunnel().unwrap();
        assert_eq!(session.status(), Status::Tunneling);
        assert_eq!(session.tunnel_mode(), Some(TunnelMode::Native));
        assert_eq!(backend.route_count(), 0);

        session.close_tunnel().unwrap();
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dns_override_off_skips_resolver_routes() {
        let mut config = test_config();
        config.routing.dns_override = false;
        let backend = routed_backend();
        let mut session = session_with(
            config,
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();
        session.establish_tunnel().unwrap();
        // bypass + tunnel default only
        assert_eq!(backend.route_count(), 2);
    }

    #[test]
    fn test_close_tunnel_is_idempotent() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();
        session.establish_tunnel().unwrap();

        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Connected);
        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);

        // closing while disconnected is also a no-op success
        session.disconnect().unwrap();
        session.close_tunnel().unwrap();
        assert_eq!(session.status(), Status::Disconnected);
    }

    #[test]
    fn test_route_round_trip_over_repeated_tunnels() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();

        for _ in 0..3 {
            session.establish_tunnel().unwrap();
            assert_eq!(backend.route_count(), 4);
            session.close_tunnel().unwrap();
            assert_eq!(backend.route_count(), 0);
        }
    }

    #[test]
    fn test_disconnect_closes_tunnel_first() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        let engine = FakeEngine::ok();
        let disconnects = engine.disconnects.clone();
        let mut session = session_with(
            test_config(),
            engine,
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();
        session.establish_tunnel().unwrap();

        session.disconnect().unwrap();
        assert_eq!(session.status(), Status::Disconnected);
        assert_eq!(backend.route_count(), 0);
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);
        assert_eq!(disconnects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_close_is_idempotent_from_any_state() {
        let counters = Arc::new(TunCounters::default());
        let backend = routed_backend();
        let mut session = session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(counters.clone()),
            backend.clone(),
        );
        session.connect("203.0.113.7", 443).unwrap();
        session.authenticate("user", "pass").unwrap();
        session.establish_tunnel().unwrap();

        session.close();
        assert_eq!(session.status(), Status::Disconnected);
        assert_eq!(backend.route_count(), 0);
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);

        session.close();
        assert_eq!(counters.closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Disconnected.to_string(), "disconnected");
        assert_eq!(Status::Tunneling.to_string(), "tunneling");
    }

    #[test]
    fn test_descriptor_network() {
        let descriptor = TunnelDescriptor {
            interface: "tl0".to_string(),
            address: Ipv4Addr::new(172, 16, 4, 2),
            gateway: Ipv4Addr::new(172, 16, 4, 1),
            prefix_len: 28,
        };
        assert_eq!(descriptor.network(), Ipv4Addr::new(172, 16, 4, 0));
        assert_eq!(descriptor.to_string(), "tl0:172.16.4.2:172.16.4.1:172.16.4.0/28");
    }

    #[test]
    fn test_shared_session_serializes_access() {
        let shared = SharedSession::new(session_with(
            test_config(),
            FakeEngine::ok(),
            FakeTunProvider::native(Arc::new(TunCounters::default())),
            FakeRouteBackend::default(),
        ));
        let clone = shared.clone();
        let handle = std::thread::spawn(move || clone.with(|s| s.status()));
        assert_eq!(handle.join().unwrap(), Status::Disconnected);
        shared.with(|s| s.connect("203.0.113.7", 443)).unwrap();
        assert_eq!(shared.with(|s| s.status()), Status::Connected);
    }

    #[test]
    fn test_invalid_config_is_rejected_at_creation() {
        let mut config = test_config();
        config.server.port = 0;
        let result = Session::with_parts(
            config,
            Box::new(FakeEngine::ok()),
            Box::new(FakeTunProvider::native(Arc::new(TunCounters::default()))),
            RouteTable::new(Box::new(FakeRouteBackend::default())),
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }
}
