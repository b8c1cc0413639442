use crate::reload::ConfigHandle;
use identity_controller_core::outbound::ExchangeTarget;
use tracing::trace;

pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Plans the token exchange for an intercepted outbound connection.
///
/// The destination is matched against the active ordered rule list (first
/// match wins, default fallback) and the result is the broker request the
/// proxy performs before forwarding.
#[derive(Clone)]
pub struct ExchangePlanner {
    config: ConfigHandle,
}

/// An RFC 8693 token-exchange request, ready to be posted as a form body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub token_endpoint: String,
    pub form: Vec<(&'static str, String)>,
}

impl ExchangePlanner {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    pub fn plan(&self, host: &str, port: u16, subject_token: &str) -> ExchangeRequest {
        let config = self.config.current();
        let target = config.outbound.exchange.resolve(host, port);
        trace!(%host, port, audience = %target.audience, "Planned token exchange");

        let token_endpoint = format!(
            "{}/realms/{}/protocol/openid-connect/token",
            config.registration.broker_url, config.registration.realm,
        );

        let mut form = vec![
            ("grant_type", TOKEN_EXCHANGE_GRANT.to_string()),
            ("subject_token", subject_token.to_string()),
            ("subject_token_type", JWT_TOKEN_TYPE.to_string()),
            ("audience", target.audience.clone()),
        ];
        if !target.scopes.is_empty() {
            form.push(("scope", target.scopes.join(" ")));
        }

        ExchangeRequest {
            token_endpoint,
            form,
        }
    }

    /// The target that would be used for a destination, without building the
    /// broker request.
    pub fn target_for(&self, host: &str, port: u16) -> ExchangeTarget {
        self.config.current().outbound.exchange.resolve(host, port).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{bundle_for, defaults};
    use crate::reload::ConfigWatch;
    use identity_controller_core::bundle::SidecarConfig;
    use identity_controller_core::outbound::{
        DestinationMatch, ExchangeRule, ExchangeRules, ExchangeTarget,
    };

    fn rule(host: &str, audience: &str) -> ExchangeRule {
        ExchangeRule {
            destination: DestinationMatch {
                host: host.parse().unwrap(),
                port: None,
            },
            target: ExchangeTarget {
                audience: audience.to_string(),
                scopes: vec![],
            },
        }
    }

    fn planner(rules: Vec<ExchangeRule>) -> ExchangePlanner {
        let mut config = SidecarConfig::defaults(&defaults(), "agents", "math-agent");
        config.outbound.exchange = ExchangeRules::new(
            rules,
            ExchangeTarget {
                audience: "fallback".to_string(),
                scopes: vec!["agent:invoke".to_string()],
            },
        );
        let (mut watch, handle) = ConfigWatch::new(SidecarConfig::defaults(
            &defaults(),
            "agents",
            "math-agent",
        ));
        watch.apply(&bundle_for(&config)).unwrap();
        ExchangePlanner::new(handle)
    }

    #[test]
    fn builds_an_exchange_request_for_the_first_match() {
        let planner = planner(vec![
            rule("api.example.com", "x"),
            rule("*.example.com", "y"),
        ]);
        let req = planner.plan("api.example.com", 443, "header.payload.sig");
        assert!(req.token_endpoint.ends_with("/realms/master/protocol/openid-connect/token"));
        assert!(req
            .form
            .contains(&("grant_type", TOKEN_EXCHANGE_GRANT.to_string())));
        assert!(req.form.contains(&("audience", "x".to_string())));
        assert_eq!(planner.target_for("api.example.com", 443).audience, "x");
    }

    #[test]
    fn unmatched_destinations_use_the_default_rule() {
        let planner = planner(vec![rule("api.example.com", "x")]);
        let req = planner.plan("db.internal", 5432, "t");
        assert!(req.form.contains(&("audience", "fallback".to_string())));
        assert!(req.form.contains(&("scope", "agent:invoke".to_string())));
    }
}
