//! Host-validation policy
//!
//! Syntactic hostname checks live here together with the pluggable
//! allow/deny policy consulted at connect time. The policy decides which
//! endpoints a session may talk to; it is supplied through configuration
//! rather than baked into the state machine.

use crate::config::PolicyConfig;
use tracing::debug;

/// Syntactic well-formedness: non-empty, no leading/trailing dot, no
/// empty label.
pub fn hostname_is_well_formed(hostname: &str) -> bool {
    !(hostname.is_empty()
        || hostname.starts_with('.')
        || hostname.ends_with('.')
        || hostname.contains(".."))
}

/// Decides whether a session may connect to a given host
pub trait HostPolicy: Send {
    fn allows(&self, hostname: &str) -> bool;
}

/// Allow/deny suffix lists from configuration
///
/// An entry matches a hostname exactly or as a domain suffix
/// ("example.net" matches "vpn.example.net"). Deny wins over allow; an
/// empty allow list admits every host that is not denied.
pub struct ListHostPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl ListHostPolicy {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.allow.clone(), config.deny.clone())
    }

    fn matches(pattern: &str, hostname: &str) -> bool {
        hostname == pattern
            || hostname
                .strip_suffix(pattern)
                .is_some_and(|head| head.ends_with('.'))
    }
}

impl HostPolicy for ListHostPolicy {
    fn allows(&self, hostname: &str) -> bool {
        if self.deny.iter().any(|p| Self::matches(p, hostname)) {
            debug!("Host {} rejected by deny list", hostname);
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        let allowed = self.allow.iter().any(|p| Self::matches(p, hostname));
        if !allowed {
            debug!("Host {} not covered by allow list", hostname);
        }
        allowed
    }
}
