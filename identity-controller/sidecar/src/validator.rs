use crate::reload::ConfigHandle;
use identity_controller_core::inbound::{Decision, TokenClaims};
use tracing::debug;

/// Checks inbound bearer tokens against the currently active rules.
///
/// Each request is evaluated against the configuration snapshot taken when
/// the request arrives: a rule swap mid-request never changes the decision
/// already made, and the next request sees the new rules immediately.
#[derive(Clone)]
pub struct InboundValidator {
    config: ConfigHandle,
}

impl InboundValidator {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    pub fn authorize(&self, claims: &TokenClaims) -> Decision {
        let config = self.config.current();
        let decision = config.inbound.rules.check(claims);
        if let Decision::Deny(reason) = &decision {
            debug!(subject = %claims.subject, %reason, "Denying inbound request");
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{bundle_for, defaults};
    use crate::reload::ConfigWatch;
    use identity_controller_core::bundle::SidecarConfig;
    use identity_controller_core::inbound::{DenyReason, ScopeSet};

    fn claims(scope: &str) -> TokenClaims {
        TokenClaims {
            issuer: "http://keycloak.keycloak.svc.cluster.local:8080/realms/master".to_string(),
            subject: "spiffe://cluster.local/ns/agents/sa/caller".to_string(),
            audience: vec!["math-agent".to_string()],
            scopes: ScopeSet::from_claim(scope),
        }
    }

    #[test]
    fn scope_tightening_takes_effect_at_the_swap() {
        let mut config = SidecarConfig::defaults(&defaults(), "agents", "math-agent");
        config.inbound.rules.required_scopes = ["agent:invoke"].into_iter().collect();
        let (mut watch, handle) = ConfigWatch::new(config.clone());
        let validator = InboundValidator::new(handle);

        // Before the update a token bearing only agent:invoke is accepted.
        assert_eq!(validator.authorize(&claims("agent:invoke")), Decision::Allow);

        config.inbound.rules.required_scopes =
            ["agent:invoke", "agent:stream"].into_iter().collect();
        watch.apply(&bundle_for(&config)).unwrap();

        // After the swap the same token is rejected; there is no window in
        // which a post-swap request is evaluated under the old rules.
        assert_eq!(
            validator.authorize(&claims("agent:invoke")),
            Decision::Deny(DenyReason::InsufficientScope(vec![
                "agent:stream".to_string()
            ])),
        );
        assert_eq!(
            validator.authorize(&claims("agent:invoke agent:stream")),
            Decision::Allow,
        );
    }
}
