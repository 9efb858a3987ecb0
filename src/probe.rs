//! Public-IP diagnostic probe
//!
//! Asks a list of interchangeable lookup services for this host's public
//! address, in priority order with a bounded per-provider timeout. Purely
//! diagnostic: the session surfaces the result but its state never depends
//! on it.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),
    #[error("no lookup service returned a plausible public address")]
    AllProvidersFailed,
}

#[derive(Debug, Clone)]
pub struct ProbeProvider {
    pub name: &'static str,
    pub url: &'static str,
}

const DEFAULT_PROVIDERS: &[ProbeProvider] = &[
    ProbeProvider {
        name: "ipify",
        url: "https://api.ipify.org",
    },
    ProbeProvider {
        name: "amazonaws",
        url: "https://checkip.amazonaws.com",
    },
    ProbeProvider {
        name: "icanhazip",
        url: "https://icanhazip.com",
    },
    ProbeProvider {
        name: "ifconfig.me",
        url: "https://ifconfig.me/ip",
    },
];

const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IpProbe {
    providers: Vec<ProbeProvider>,
    timeout: Duration,
}

impl Default for IpProbe {
    fn default() -> Self {
        Self {
            providers: DEFAULT_PROVIDERS.to_vec(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }
}

impl IpProbe {
    pub fn new(providers: Vec<ProbeProvider>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    /// Try each provider until one yields a syntactically plausible public
    /// address
    pub fn probe(&self) -> Result<IpAddr, ProbeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        for provider in &self.providers {
            debug!("Trying IP lookup service {}", provider.name);
            let body = match client.get(provider.url).send().and_then(|r| r.text()) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Lookup via {} failed: {}", provider.name, e);
                    continue;
                }
            };
            match body.trim().parse::<IpAddr>() {
                Ok(ip) if is_plausible_public(ip) => {
                    info!("Public address {} (via {})", ip, provider.name);
                    return Ok(ip);
                }
                Ok(ip) => warn!("{} returned non-public address {}", provider.name, ip),
                Err(_) => warn!("{} returned an unparseable response", provider.name),
            }
        }
        Err(ProbeError::AllProvidersFailed)
    }
}

/// A lookup response only counts if it could actually be a public address
fn is_plausible_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
