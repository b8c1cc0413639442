use crate::status::Target;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts status patch outcomes in the patch controller.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patches: Family<PatchLabels, Counter>,
}

/// Counts reconciliation outcomes.
#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    reconciles: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PatchLabels {
    target: String,
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches = Family::default();
        prom.register(
            "patches",
            "Count of status patches by target and outcome",
            patches.clone(),
        );
        Self { patches }
    }

    pub fn patch_succeeded(&self, target: Target) {
        self.observe(target, "success");
    }

    pub fn patch_failed(&self, target: Target) {
        self.observe(target, "error");
    }

    pub fn patch_timed_out(&self, target: Target) {
        self.observe(target, "timeout");
    }

    fn observe(&self, target: Target, outcome: &str) {
        let target = match target {
            Target::Policy => "policy",
            Target::Discovery => "discovery",
        };
        self.patches
            .get_or_create(&PatchLabels {
                target: target.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of policy reconciliations by outcome",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    pub fn reconciled(&self, outcome: &str) {
        self.reconciles
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
