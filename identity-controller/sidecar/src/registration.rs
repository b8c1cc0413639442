use crate::identity::{subject_of, Backoff, TokenSink};
use identity_controller_core::bundle::RegistrationConfig;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The broker-side client record created for a workload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub name: String,
    pub standard_flow_enabled: bool,
    pub direct_access_grants_enabled: bool,
    pub full_scope_allowed: bool,
    /// `false` enables client authentication, so the broker issues a secret.
    pub public_client: bool,
    pub attributes: BTreeMap<String, String>,
}

/// The broker's admin surface, an external collaborator.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Returns the broker-internal id of an existing client, if any.
    async fn find_client(&self, realm: &str, client_id: &str) -> anyhow::Result<Option<String>>;

    /// Creates a client and returns its broker-internal id.
    async fn create_client(
        &self,
        realm: &str,
        registration: &ClientRegistration,
    ) -> anyhow::Result<String>;

    /// Fetches the client's secret.
    async fn client_secret(&self, realm: &str, internal_id: &str) -> anyhow::Result<String>;
}

/// Registers the workload with the identity broker.
///
/// The client id is derived from the identity token's subject, so a
/// re-registration after a pod restart finds the existing client instead of
/// creating a second one. Broker unavailability is retried with backoff
/// forever and surfaced through the readiness channel; it never crashes the
/// chain.
pub struct Registrar<B, S> {
    broker: B,
    sink: S,
    config: RegistrationConfig,
    backoff: Backoff,
    ready: watch::Sender<bool>,
}

impl<B: Broker, S: TokenSink> Registrar<B, S> {
    pub fn new(broker: B, sink: S, config: RegistrationConfig) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            broker,
            sink,
            config,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
            ready,
        }
    }

    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Ensures the broker-side client exists and its credentials are stored
    /// locally. Idempotent: an existing client is reused.
    pub async fn ensure(&self, token: &str) -> anyhow::Result<()> {
        let client_id = subject_of(token)?;
        let realm = &self.config.realm;

        let internal_id = match self.broker.find_client(realm, &client_id).await? {
            Some(id) => {
                info!(%client_id, "Client already registered");
                id
            }
            None => {
                let registration = ClientRegistration::confidential(&client_id, &self.config.client_name);
                let id = self.broker.create_client(realm, &registration).await?;
                info!(%client_id, "Registered client");
                id
            }
        };

        let secret = self.broker.client_secret(realm, &internal_id).await?;
        self.sink.store(&secret).await?;
        Ok(())
    }

    /// Runs registration to completion, retrying on broker unavailability.
    pub async fn run(mut self, token: String) {
        if !self.config.enabled {
            info!("Broker registration disabled");
            return;
        }
        loop {
            match self.ensure(&token).await {
                Ok(()) => {
                    self.ready.send_replace(true);
                    return;
                }
                Err(error) => {
                    let delay = self.backoff.fail();
                    self.ready.send_replace(false);
                    warn!(%error, ?delay, "Broker registration failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// === impl ClientRegistration ===

impl ClientRegistration {
    /// A confidential client with token exchange enabled, the shape every
    /// chain-registered workload uses.
    pub fn confidential(client_id: &str, name: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            name: name.to_string(),
            standard_flow_enabled: true,
            direct_access_grants_enabled: true,
            full_scope_allowed: false,
            public_client: false,
            attributes: [(
                "standard.token.exchange.enabled".to_string(),
                "true".to_string(),
            )]
            .into_iter()
            .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::jwt_with_sub;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeBroker {
        clients: Mutex<BTreeMap<String, String>>,
        created: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl Broker for Arc<FakeBroker> {
        async fn find_client(&self, _realm: &str, client_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.clients.lock().get(client_id).cloned())
        }

        async fn create_client(
            &self,
            _realm: &str,
            registration: &ClientRegistration,
        ) -> anyhow::Result<String> {
            *self.created.lock() += 1;
            let internal = format!("internal-{}", registration.client_id);
            self.clients
                .lock()
                .insert(registration.client_id.clone(), internal.clone());
            Ok(internal)
        }

        async fn client_secret(&self, _realm: &str, internal_id: &str) -> anyhow::Result<String> {
            Ok(format!("secret-for-{internal_id}"))
        }
    }

    struct MemorySink(Arc<Mutex<Option<String>>>);

    #[async_trait::async_trait]
    impl TokenSink for MemorySink {
        async fn store(&self, secret: &str) -> anyhow::Result<()> {
            *self.0.lock() = Some(secret.to_string());
            Ok(())
        }
    }

    fn config() -> RegistrationConfig {
        RegistrationConfig {
            enabled: true,
            broker_url: "http://keycloak.keycloak.svc.cluster.local:8080"
                .parse()
                .unwrap(),
            realm: "master".to_string(),
            client_name: "agents-math-agent".to_string(),
            credentials_path: "/shared/secret.txt".to_string(),
        }
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let broker = Arc::new(FakeBroker::default());
        let stored = Arc::new(Mutex::new(None));
        let registrar = Registrar::new(broker.clone(), MemorySink(stored.clone()), config());

        let token = jwt_with_sub("spiffe://cluster.local/ns/agents/sa/math-agent");
        registrar.ensure(&token).await.unwrap();
        registrar.ensure(&token).await.unwrap();

        assert_eq!(*broker.created.lock(), 1, "existing client must be reused");
        assert_eq!(
            stored.lock().as_deref(),
            Some("secret-for-internal-spiffe://cluster.local/ns/agents/sa/math-agent"),
        );
    }

    #[test]
    fn confidential_clients_enable_token_exchange() {
        let reg = ClientRegistration::confidential("spiffe://td/ns/a/sa/b", "a-b");
        assert!(!reg.public_client);
        assert_eq!(
            reg.attributes.get("standard.token.exchange.enabled"),
            Some(&"true".to_string()),
        );
    }
}
