//! A read-through cache of namespace opt-in labels.
//!
//! The admission hot path must not call the API, so namespace labels are
//! served from this watch-fed index.

use crate::k8s::{self, ResourceExt};
use ahash::AHashMap as HashMap;
use futures::StreamExt;
use kube::runtime::watcher;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

pub(crate) type SharedNamespaceIndex = Arc<RwLock<NamespaceIndex>>;

#[derive(Debug, Default)]
pub(crate) struct NamespaceIndex {
    labels: HashMap<String, k8s::Labels>,
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    pub fn shared() -> SharedNamespaceIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn injection_enabled(&self, ns: &str) -> bool {
        self.labels
            .get(ns)
            .and_then(|labels| labels.get(k8s::NAMESPACE_INJECT_LABEL))
            .map(|v| v == k8s::INJECT_ENABLED)
            .unwrap_or(false)
    }

    pub(crate) fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_unchecked();
        trace!(%name, "Indexing namespace");
        self.labels.insert(name, ns.metadata.labels.into());
    }

    pub(crate) fn delete(&mut self, name: &str) {
        self.labels.remove(name);
    }
}

/// Drives the namespace index from a watch event stream.
pub(crate) async fn process(
    index: SharedNamespaceIndex,
    events: impl futures::Stream<Item = watcher::Event<k8s::Namespace>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Apply(ns) | watcher::Event::InitApply(ns) => {
                index.write().apply(ns);
            }
            watcher::Event::Delete(ns) => {
                index.write().delete(&ns.name_unchecked());
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}
