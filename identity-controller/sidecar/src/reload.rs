use crate::config::{parse_bundle, BundleData, ConfigError};
use identity_controller_core::bundle::SidecarConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Publishes the chain's active configuration.
///
/// A single watch task owns a `ConfigWatch` and feeds it every observed
/// state of the rendered bundle. Parsed updates are swapped in atomically;
/// a bundle that fails to parse leaves the previously published
/// configuration in place. Request-handling paths hold a [`ConfigHandle`]
/// and snapshot the current config per request, so an in-flight request
/// completes under the configuration that was active when it arrived.
pub struct ConfigWatch {
    defaults: Arc<SidecarConfig>,
    tx: watch::Sender<Arc<SidecarConfig>>,
}

/// A read handle onto the currently active configuration.
#[derive(Clone)]
pub struct ConfigHandle(watch::Receiver<Arc<SidecarConfig>>);

// === impl ConfigWatch ===

impl ConfigWatch {
    /// Starts from the injected defaults, which remain active until a
    /// bundle is observed.
    pub fn new(defaults: SidecarConfig) -> (Self, ConfigHandle) {
        let defaults = Arc::new(defaults);
        let (tx, rx) = watch::channel(defaults.clone());
        (Self { defaults, tx }, ConfigHandle(rx))
    }

    /// Applies an observed bundle state. Returns whether the active
    /// configuration changed.
    ///
    /// On a parse failure the last known-good configuration stays active
    /// and the error is returned for the watch task to log and retry.
    pub fn apply(&mut self, data: &BundleData) -> Result<bool, ConfigError> {
        let config = parse_bundle(data)?;

        let changed = **self.tx.borrow() != config;
        if changed {
            info!("Applying updated configuration");
            self.tx.send_replace(Arc::new(config));
        } else {
            debug!("Configuration unchanged");
        }
        Ok(changed)
    }

    /// Handles deletion of the bundle: the chain falls back to the injected
    /// defaults rather than keeping configuration whose source is gone.
    pub fn handle_deleted(&mut self) {
        if *self.tx.borrow() != self.defaults {
            warn!("Configuration bundle deleted; reverting to injected defaults");
            self.tx.send_replace(self.defaults.clone());
        }
    }
}

// === impl ConfigHandle ===

impl ConfigHandle {
    /// Snapshots the currently active configuration. The snapshot is stable
    /// for as long as the caller holds it, regardless of later swaps.
    pub fn current(&self) -> Arc<SidecarConfig> {
        self.0.borrow().clone()
    }

    /// Waits for the active configuration to change.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.0.changed().await
    }
}
