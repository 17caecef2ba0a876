use consul_controller_k8s_sync::Error;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Counts reconciles per kind and the failures among them.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<KindLabels, Counter>,
    failures: Family<FailureLabels, Counter>,
    durations: Family<KindLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    kind: &'static str,
    reason: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<KindLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of reconciles run by each controller",
            reconciles.clone(),
        );

        let failures = Family::<FailureLabels, Counter>::default();
        reg.register(
            "failures",
            "Total number of reconciles that returned an error",
            failures.clone(),
        );

        let durations = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // Most reconciles are a handful of API round trips.
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
        });
        reg.register_with_unit(
            "duration",
            "Histogram of reconcile latency",
            Unit::Seconds,
            durations.clone(),
        );

        Self {
            reconciles,
            failures,
            durations,
        }
    }

    pub(crate) fn reconciled(&self, kind: &'static str, started: time::Instant) {
        let labels = KindLabels { kind };
        self.reconciles.get_or_create(&labels).inc();
        self.durations
            .get_or_create(&labels)
            .observe(started.elapsed().as_secs_f64());
    }

    pub(crate) fn failed(&self, kind: &'static str, error: &Error) {
        let labels = FailureLabels {
            kind,
            reason: reason(error),
        };
        self.failures.get_or_create(&labels).inc();
    }
}

/// A coarse, low-cardinality label for a reconcile error.
fn reason(error: &Error) -> &'static str {
    match error {
        Error::Kube(_) | Error::AddFinalizer(_) => "kubernetes",
        Error::Consul(_) | Error::ConsulAction { .. } => "consul",
        Error::ResourceExists | Error::EntryExists | Error::OtherDatacenter(_) => {
            "externally_managed"
        }
        Error::MigrationMismatch { .. } => "migration",
        Error::BackendChanged | Error::MissingSecret | Error::PeeringVersion(_) => "internal",
    }
}
