//! Sandbox policy derivation. A pure function plus a policy table.

use super::models::{NetworkPolicy, ResourceLimits, SandboxConfiguration, SecurityContext, TrustLevel};
use tracing::warn;

/// Per-trust-level defaults.
fn default_runtime_class(trust_level: TrustLevel) -> &'static str {
    match trust_level {
        TrustLevel::Trusted => "runc",
        TrustLevel::Standard => "gvisor",
        TrustLevel::Untrusted => "kata",
        TrustLevel::Confidential => "kata-cc",
    }
}

fn default_network_policy(trust_level: TrustLevel) -> NetworkPolicy {
    match trust_level {
        TrustLevel::Trusted => NetworkPolicy::AllowEgress,
        TrustLevel::Standard => NetworkPolicy::Restricted,
        TrustLevel::Untrusted | TrustLevel::Confidential => NetworkPolicy::Isolated,
    }
}

fn default_read_only_root(trust_level: TrustLevel) -> bool {
    !matches!(trust_level, TrustLevel::Trusted)
}

/// Derives a `SandboxConfiguration` from a trust level, falling back to the
/// configured default runtime class (with a warning) when the requested
/// class is not in `available_runtimes`.
pub struct SandboxManager {
    available_runtimes: Vec<String>,
}

impl SandboxManager {
    pub fn new(available_runtimes: Vec<String>) -> Self {
        Self { available_runtimes }
    }

    pub fn derive(
        &self,
        trust_level: TrustLevel,
        requested_runtime_class: Option<&str>,
        resource_limits: ResourceLimits,
    ) -> SandboxConfiguration {
        let default_class = default_runtime_class(trust_level);
        let runtime_class = match requested_runtime_class {
            Some(requested) if self.available_runtimes.iter().any(|r| r == requested) => {
                requested.to_string()
            }
            Some(requested) => {
                warn!(
                    requested_runtime_class = requested,
                    fallback = default_class,
                    "requested runtime class unavailable, falling back to trust-level default"
                );
                default_class.to_string()
            }
            None => default_class.to_string(),
        };

        SandboxConfiguration {
            runtime_class,
            trust_level,
            security_context: SecurityContext {
                read_only_root: default_read_only_root(trust_level),
                ..SecurityContext::standard_non_root()
            },
            network_policy: default_network_policy(trust_level),
            resource_limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 1000 }
    }

    #[test]
    fn trusted_gets_runc_and_egress() {
        let mgr = SandboxManager::new(vec!["runc".into(), "gvisor".into(), "kata".into()]);
        let sandbox = mgr.derive(TrustLevel::Trusted, None, limits());
        assert_eq!(sandbox.runtime_class, "runc");
        assert_eq!(sandbox.network_policy, NetworkPolicy::AllowEgress);
        assert!(!sandbox.security_context.read_only_root);
    }

    #[test]
    fn untrusted_gets_kata_and_isolated() {
        let mgr = SandboxManager::new(vec!["runc".into(), "kata".into()]);
        let sandbox = mgr.derive(TrustLevel::Untrusted, None, limits());
        assert_eq!(sandbox.runtime_class, "kata");
        assert_eq!(sandbox.network_policy, NetworkPolicy::Isolated);
        assert!(sandbox.security_context.read_only_root);
    }

    #[test]
    fn unavailable_requested_class_falls_back() {
        let mgr = SandboxManager::new(vec!["runc".into()]);
        let sandbox = mgr.derive(TrustLevel::Trusted, Some("kata-cc"), limits());
        assert_eq!(sandbox.runtime_class, "runc"); // fell back to trusted default
    }

    #[test]
    fn confidential_gets_kata_cc() {
        let mgr = SandboxManager::new(vec!["kata-cc".into()]);
        let sandbox = mgr.derive(TrustLevel::Confidential, None, limits());
        assert_eq!(sandbox.runtime_class, "kata-cc");
        assert_eq!(sandbox.network_policy, NetworkPolicy::Isolated);
    }
}
