use identity_controller_core::bundle::{InboundConfig, InterceptionConfig};
use std::time::Duration;
use tracing::info;

/// A single nat-table rule the bootstrap step installs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RedirectRule {
    /// Skip interception for a destination network.
    ExemptNetwork(identity_controller_core::IpNet),
    /// Skip interception for a destination port.
    ExemptPort(u16),
    /// Skip traffic originating from the chain's own proxies so their
    /// upstream calls are not re-intercepted.
    ExemptOwner { uid: u32 },
    /// Redirect remaining outbound TCP connections to a loopback port.
    RedirectOutbound { to_port: u16 },
    /// Redirect inbound TCP connections on the application port to the
    /// validator.
    RedirectInbound { from_port: u16, to_port: u16 },
}

/// The UID the chain's proxy containers run as; their own traffic must not
/// loop back through the redirect rules.
pub const PROXY_UID: u32 = 2102;

/// Computes the redirect ruleset for a pod.
///
/// The plan is a pure function of the rendered configuration: applying it
/// twice yields the same ruleset, which is what makes the init step safe to
/// re-run on container restart.
pub fn plan(interception: &InterceptionConfig, inbound: &InboundConfig) -> Vec<RedirectRule> {
    let mut rules = Vec::with_capacity(
        interception.excluded_networks.len() + interception.excluded_ports.len() + 3,
    );

    rules.push(RedirectRule::ExemptOwner { uid: PROXY_UID });
    for net in &interception.excluded_networks {
        rules.push(RedirectRule::ExemptNetwork(*net));
    }
    for port in &interception.excluded_ports {
        rules.push(RedirectRule::ExemptPort(*port));
    }
    rules.push(RedirectRule::RedirectOutbound {
        to_port: interception.redirect_port,
    });
    rules.push(RedirectRule::RedirectInbound {
        from_port: inbound.target_port,
        to_port: inbound.proxy_port,
    });

    rules
}

/// Applies a plan through the given installer, bounded by `timeout` so a
/// wedged netfilter never blocks pod start-up indefinitely.
///
/// The installer receives the full ruleset and is expected to replace any
/// previously installed chain wholesale, keeping re-runs idempotent.
pub async fn apply<F, Fut>(
    rules: Vec<RedirectRule>,
    timeout: Duration,
    install: F,
) -> anyhow::Result<()>
where
    F: FnOnce(Vec<RedirectRule>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let count = rules.len();
    tokio::time::timeout(timeout, install(rules))
        .await
        .map_err(|_| anyhow::anyhow!("traffic redirection did not complete within {timeout:?}"))??;
    info!(rules = count, "Installed traffic redirection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_controller_core::bundle::{SidecarConfig, EGRESS_PROXY_PORT, INBOUND_PROXY_PORT};

    fn config() -> SidecarConfig {
        let mut config =
            SidecarConfig::defaults(&crate::config::tests::defaults(), "agents", "math-agent");
        config.outbound.interception.excluded_networks = vec!["169.254.0.0/16".parse().unwrap()];
        config.outbound.interception.excluded_ports = vec![5432];
        config
    }

    #[test]
    fn plan_is_deterministic() {
        let config = config();
        let a = plan(&config.outbound.interception, &config.inbound);
        let b = plan(&config.outbound.interception, &config.inbound);
        assert_eq!(a, b);
    }

    #[test]
    fn exemptions_precede_redirects() {
        let config = config();
        let rules = plan(&config.outbound.interception, &config.inbound);
        let redirect_at = rules
            .iter()
            .position(|r| matches!(r, RedirectRule::RedirectOutbound { .. }))
            .unwrap();
        assert!(rules[..redirect_at].iter().all(|r| matches!(
            r,
            RedirectRule::ExemptOwner { .. }
                | RedirectRule::ExemptNetwork(_)
                | RedirectRule::ExemptPort(_)
        )));
        assert!(rules.contains(&RedirectRule::RedirectOutbound {
            to_port: EGRESS_PROXY_PORT
        }));
        assert!(rules.contains(&RedirectRule::RedirectInbound {
            from_port: 8000,
            to_port: INBOUND_PROXY_PORT
        }));
    }

    #[tokio::test]
    async fn apply_times_out_rather_than_blocking_startup() {
        let rules = {
            let config = config();
            plan(&config.outbound.interception, &config.inbound)
        };
        let res = apply(rules, Duration::from_millis(10), |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(res.is_err());
    }
}
