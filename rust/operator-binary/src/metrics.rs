//! Reconciliation metrics, pushed to a Prometheus pushgateway when one is related.
use std::{future::Future, time::Duration};

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    exponential_buckets,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{constants::METRICS_JOB_NAME, reconciler::ReconcileResult, s3::PushGatewayEndpoint};

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to register metric {name}"))]
    RegisterMetric {
        source: prometheus::Error,
        name: &'static str,
    },

    #[snafu(display("failed to encode metrics"))]
    EncodeMetrics { source: prometheus::Error },

    #[snafu(display("failed to push metrics to {url}"))]
    Push { source: reqwest::Error, url: String },

    #[snafu(display("failed to build the HTTP client"))]
    BuildClient { source: reqwest::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Counters and durations of reconciliations, kept in a registry private to the hub.
pub struct ReconcileMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    writes: IntCounterVec,
    duration: HistogramVec,
}

impl ReconcileMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let reconciles = IntCounterVec::new(
            Opts::new(
                "spark_integration_hub_reconcile_total",
                "Number of finished reconciliations",
            ),
            &["operation", "outcome"],
        )
        .context(RegisterMetricSnafu {
            name: "reconcile_total",
        })?;
        let writes = IntCounterVec::new(
            Opts::new(
                "spark_integration_hub_object_writes_total",
                "Number of Kubernetes objects created, patched or deleted",
            ),
            &["operation"],
        )
        .context(RegisterMetricSnafu {
            name: "object_writes_total",
        })?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "spark_integration_hub_reconcile_duration_seconds",
                "Duration of reconciliations",
            )
            .buckets(exponential_buckets(0.01, 2.0, 14).context(RegisterMetricSnafu {
                name: "reconcile_duration_seconds",
            })?),
            &["operation"],
        )
        .context(RegisterMetricSnafu {
            name: "reconcile_duration_seconds",
        })?;

        registry
            .register(Box::new(reconciles.clone()))
            .context(RegisterMetricSnafu {
                name: "reconcile_total",
            })?;
        registry
            .register(Box::new(writes.clone()))
            .context(RegisterMetricSnafu {
                name: "object_writes_total",
            })?;
        registry
            .register(Box::new(duration.clone()))
            .context(RegisterMetricSnafu {
                name: "reconcile_duration_seconds",
            })?;

        Ok(Self {
            registry,
            reconciles,
            writes,
            duration,
        })
    }

    pub fn observe(&self, result: &ReconcileResult) {
        let operation: &'static str = result.operation.into();
        let outcome: &'static str = (&result.outcome).into();
        self.reconciles
            .with_label_values(&[operation, outcome])
            .inc();
        self.writes
            .with_label_values(&[operation])
            .inc_by(u64::from(result.writes));
        self.duration
            .with_label_values(&[operation])
            .observe(result.duration.as_secs_f64());
    }

    /// The metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context(EncodeMetricsSnafu)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[derive(Clone)]
pub struct PushGateway {
    url: String,
    client: reqwest::Client,
}

impl PushGateway {
    pub fn new(endpoint: &PushGatewayEndpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self {
            url: format!(
                "{}/metrics/job/{METRICS_JOB_NAME}",
                endpoint.url().as_str().trim_end_matches('/')
            ),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Replaces the metrics of the hub's job on the gateway.
    pub async fn push(&self, body: String) -> Result<()> {
        self.client
            .put(&self.url)
            .header(
                reqwest::header::CONTENT_TYPE,
                TextEncoder::new().format_type(),
            )
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(PushSnafu { url: &self.url })?;
        Ok(())
    }
}

/// Forwards reconciliation metrics to the pushgateway, if there is one.
///
/// A single background task pushes the most recent snapshot. Snapshots recorded while a push
/// is in progress replace each other, so the gateway never receives an older one after a newer
/// one. Pushing is best-effort: failures are logged and otherwise ignored.
#[derive(Default)]
pub enum MetricsRelay {
    Enabled {
        url: String,
        snapshots: watch::Sender<Option<String>>,
    },
    #[default]
    Disabled,
}

impl MetricsRelay {
    /// Starts a pusher for `endpoint`. It stops once the returned relay is dropped.
    pub fn for_endpoint(endpoint: Option<&PushGatewayEndpoint>) -> Self {
        let Some(endpoint) = endpoint else {
            return MetricsRelay::Disabled;
        };
        let gateway = match PushGateway::new(endpoint) {
            Ok(gateway) => gateway,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "metrics relay disabled"
                );
                return MetricsRelay::Disabled;
            }
        };
        let url = gateway.url().to_string();
        tracing::info!(url = %url, "metrics relay enabled");

        let (snapshots, latest) = watch::channel(None);
        tokio::spawn(
            push_latest(latest, move |body| {
                let gateway = gateway.clone();
                async move { gateway.push(body).await }
            })
            .instrument(info_span!("metrics_relay", url = %url)),
        );
        MetricsRelay::Enabled { url, snapshots }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, MetricsRelay::Enabled { .. })
    }

    /// Records `result` and hands the updated metrics to the pusher.
    pub fn record(&self, metrics: &ReconcileMetrics, result: &ReconcileResult) {
        metrics.observe(result);

        let MetricsRelay::Enabled { snapshots, .. } = self else {
            return;
        };
        match metrics.encode() {
            Ok(body) => {
                snapshots.send_replace(Some(body));
            }
            Err(error) => {
                tracing::warn!(error = &error as &dyn std::error::Error, "skipping metrics push")
            }
        }
    }
}

/// Pushes each new snapshot until the sending side is dropped.
async fn push_latest<F, Fut>(mut snapshots: watch::Receiver<Option<String>>, push: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while snapshots.changed().await.is_ok() {
        let Some(body) = snapshots.borrow_and_update().clone() else {
            continue;
        };
        if let Err(error) = push(body).await {
            tracing::warn!(error = &error as &dyn std::error::Error, "metrics push failed");
        }
    }
    tracing::debug!("metrics relay stopped");
}
