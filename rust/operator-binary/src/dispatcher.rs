//! The hub's event loop.
//!
//! A single task owns the [`Registry`], the [`RelationPublisher`] and the [`MetricsRelay`] and
//! handles [`HubEvent`]s one at a time, in arrival order. Reconciliations run as separate
//! tasks and report back through the same channel, so the registry never needs a lock.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use strum::IntoStaticStr;
use tokio::sync::mpsc;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    cluster::{ClusterApi, ManagedObject},
    constants::{LABEL_TENANT, STATUS_DATA_BAG},
    metrics::{self, MetricsRelay, ReconcileMetrics},
    publisher::RelationPublisher,
    reconciler::{DiscoveredTenant, Outcome, ReconcileResult, Reconciler},
    registry::{Registry, TenantAccount, TenantPhase, TenantStatus},
    relation::RelationStore,
    resources,
    s3::{self, CredentialError, RawRelationData, S3Credentials},
    storage::CredentialVerifier,
};

pub const EVENT_CHANNEL_CAPACITY: usize = 128;

pub const STATUS_KEY: &str = "status";
pub const MESSAGE_KEY: &str = "message";
const TENANT_KEY_PREFIX: &str = "tenant.";

/// Relation data that may hold secrets. Only the keys show up in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct RelationData(pub RawRelationData);

impl fmt::Debug for RelationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, IntoStaticStr)]
pub enum HubEvent {
    S3CredentialsChanged(RelationData),
    S3CredentialsGone,
    /// A bucket listing with `credentials` finished; `error` is set when it failed.
    S3Verified {
        credentials: S3Credentials,
        error: Option<String>,
    },
    PushGatewayChanged(RelationData),
    PushGatewayGone,
    AccountRequested {
        tenant_id: String,
        namespace: String,
    },
    AccountReleased {
        tenant_id: String,
    },
    /// The request watcher finished its initial listing; `tenants` is everything requested.
    RequestsSynced {
        tenants: BTreeSet<String>,
    },
    ManagedObjectApplied(ManagedObject),
    ManagedObjectDeleted(ManagedObject),
    Discovered(Vec<DiscoveredTenant>),
    DiscoveryFailed {
        untrusted: bool,
    },
    /// Periodic tick: retries failed tenants and republishes the status.
    UpdateStatus,
    Reconciled(ReconcileResult),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubStatus {
    Active,
    Maintenance(String),
    Blocked(String),
}

impl HubStatus {
    fn data(&self) -> (&'static str, String) {
        match self {
            HubStatus::Active => ("active", String::new()),
            HubStatus::Maintenance(message) => ("maintenance", message.clone()),
            HubStatus::Blocked(message) => ("blocked", message.clone()),
        }
    }
}

pub struct Hub<C, S, V> {
    registry: Registry,
    reconciler: Reconciler<C>,
    publisher: RelationPublisher<S>,
    verifier: Arc<V>,
    metrics: ReconcileMetrics,
    relay: MetricsRelay,
    tx: mpsc::Sender<HubEvent>,
    credential_error: Option<CredentialError>,
    /// Why the current credentials were refused by the object store.
    verification_error: Option<String>,
    trusted: bool,
    discovered: bool,
    requested: Option<BTreeSet<String>>,
    in_flight: usize,
}

impl<C: ClusterApi, S: RelationStore, V: CredentialVerifier> Hub<C, S, V> {
    pub fn new(
        reconciler: Reconciler<C>,
        publisher: RelationPublisher<S>,
        verifier: V,
        tx: mpsc::Sender<HubEvent>,
    ) -> Result<Self, metrics::Error> {
        Ok(Self {
            registry: Registry::default(),
            reconciler,
            publisher,
            verifier: Arc::new(verifier),
            metrics: ReconcileMetrics::new()?,
            relay: MetricsRelay::Disabled,
            tx,
            credential_error: None,
            verification_error: None,
            trusted: true,
            discovered: false,
            requested: None,
            in_flight: 0,
        })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<HubEvent>) {
        self.discover_in_background();
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
    }

    pub async fn handle(&mut self, event: HubEvent) {
        let name: &'static str = (&event).into();
        tracing::debug!(event = name, "handling event");

        match event {
            HubEvent::S3CredentialsChanged(RelationData(raw)) => self.s3_changed(&raw),
            HubEvent::S3CredentialsGone => {
                self.credential_error = None;
                self.verification_error = None;
                if self.registry.credentials().is_some() {
                    tracing::info!("S3 credentials are gone, removing them from all tenants");
                    let accounts = self.registry.set_credentials(None);
                    self.schedule_all(accounts);
                }
            }
            HubEvent::S3Verified { credentials, error } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.registry.credentials() == Some(&credentials) {
                    self.verification_error = error;
                }
            }
            HubEvent::PushGatewayChanged(RelationData(raw)) => match s3::parse_pushgateway(&raw) {
                Ok(endpoint) => {
                    if self.registry.pushgateway() != Some(&endpoint) {
                        tracing::info!(endpoint = %endpoint.url(), "pushgateway changed");
                        self.relay = MetricsRelay::for_endpoint(Some(&endpoint));
                        let accounts = self.registry.set_pushgateway(Some(endpoint));
                        self.schedule_all(accounts);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "ignoring invalid pushgateway relation data"
                    );
                    self.pushgateway_gone();
                }
            },
            HubEvent::PushGatewayGone => self.pushgateway_gone(),
            HubEvent::AccountRequested {
                tenant_id,
                namespace,
            } => {
                // Keeps the synced snapshot current for discoveries that finish later.
                if let Some(requested) = &mut self.requested {
                    requested.insert(tenant_id.clone());
                }
                self.account_requested(&tenant_id, &namespace)
            }
            HubEvent::AccountReleased { tenant_id } => {
                if let Some(requested) = &mut self.requested {
                    requested.remove(&tenant_id);
                }
                if let Some(account) = self.registry.remove(&tenant_id) {
                    tracing::info!(tenant = %tenant_id, "service account released");
                    self.schedule(account);
                }
            }
            HubEvent::RequestsSynced { tenants } => {
                self.requested = Some(tenants);
                self.prune_unrequested();
            }
            HubEvent::ManagedObjectApplied(object) => self.object_drifted(&object, false),
            HubEvent::ManagedObjectDeleted(object) => self.object_drifted(&object, true),
            HubEvent::Discovered(tenants) => {
                self.trusted = true;
                self.discovered = true;
                for DiscoveredTenant {
                    tenant_id,
                    namespace,
                } in tenants
                {
                    if let Some(account) = self.registry.restore(&tenant_id, &namespace) {
                        tracing::info!(tenant = %tenant_id, %namespace, "restored tenant");
                        self.schedule(account);
                    }
                }
                self.prune_unrequested();
            }
            HubEvent::DiscoveryFailed { untrusted } => {
                if untrusted {
                    self.trusted = false;
                }
            }
            HubEvent::UpdateStatus => {
                let accounts = self.registry.retry_failed();
                self.schedule_all(accounts);
                if self.verification_error.is_some() {
                    if let Some(credentials) = self.registry.credentials().cloned() {
                        self.verify_in_background(credentials);
                    }
                }
                if !self.discovered {
                    self.discover_in_background();
                }
            }
            HubEvent::Reconciled(result) => self.reconciled(result),
        }

        self.publish().await;
    }

    fn s3_changed(&mut self, raw: &RawRelationData) {
        match s3::parse(raw) {
            Ok(credentials) => {
                self.credential_error = None;
                if self.registry.credentials() != Some(&credentials) {
                    tracing::info!(?credentials, "S3 credentials changed");
                    self.verification_error = None;
                    self.verify_in_background(credentials.clone());
                    let accounts = self.registry.set_credentials(Some(credentials));
                    self.schedule_all(accounts);
                }
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    category = error.category(),
                    "dropping invalid S3 credentials"
                );
                self.credential_error = Some(error);
                self.verification_error = None;
                if self.registry.credentials().is_some() {
                    let accounts = self.registry.set_credentials(None);
                    self.schedule_all(accounts);
                }
            }
        }
    }

    fn pushgateway_gone(&mut self) {
        if self.registry.pushgateway().is_some() {
            tracing::info!("pushgateway is gone, disabling the metrics relay");
            self.relay = MetricsRelay::Disabled;
            let accounts = self.registry.set_pushgateway(None);
            self.schedule_all(accounts);
        }
    }

    fn account_requested(&mut self, tenant_id: &str, namespace: &str) {
        // Watches replay requests that are already being served.
        if let Some(existing) = self.registry.get(tenant_id) {
            if existing.namespace == namespace
                && matches!(
                    existing.status,
                    TenantStatus::Pending | TenantStatus::Provisioned
                )
            {
                return;
            }
        }
        match self.registry.upsert(tenant_id, namespace) {
            Ok(account) => {
                tracing::info!(tenant = %tenant_id, namespace, "service account requested");
                self.schedule(account);
            }
            Err(error) => tracing::warn!(
                error = &error as &dyn std::error::Error,
                "ignoring service account request"
            ),
        }
    }

    fn prune_unrequested(&mut self) {
        let Some(requested) = &self.requested else {
            return;
        };
        let accounts = self.registry.prune_unrequested(requested);
        for account in &accounts {
            tracing::info!(tenant = %account.tenant_id, "tenant is no longer requested");
        }
        self.schedule_all(accounts);
    }

    /// Reconciles a provisioned tenant again when one of its objects was changed or deleted
    /// by someone else.
    fn object_drifted(&mut self, object: &ManagedObject, deleted: bool) {
        let Some(account) = object
            .label(LABEL_TENANT)
            .and_then(|tenant_id| self.registry.get(tenant_id))
        else {
            return;
        };
        if account.status != TenantStatus::Provisioned {
            return;
        }
        let desired = match resources::build(
            &account.tenant_id,
            &account.namespace,
            &account.desired_properties,
        ) {
            Ok(desired) => desired,
            Err(error) => {
                tracing::warn!(error = &error as &dyn std::error::Error, "cannot check drift");
                return;
            }
        };
        let key = object.key();
        let wanted = desired.objects.iter().find(|d| d.key() == key);
        let drifted = match (wanted, deleted) {
            (Some(_), true) => true,
            (None, true) => false,
            (Some(wanted), false) => {
                wanted.last_applied() != object.last_applied() || wanted.drifted_from(object)
            }
            (None, false) => true,
        };
        if drifted {
            tracing::info!(tenant = %account.tenant_id, "{key} drifted, reconciling");
            let account = account.clone();
            self.schedule(account);
        }
    }

    fn reconciled(&mut self, result: ReconcileResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.relay.record(&self.metrics, &result);

        if !self
            .registry
            .apply_outcome(&result.tenant_id, result.generation, &result.outcome)
        {
            tracing::debug!(
                tenant = %result.tenant_id,
                generation = result.generation,
                "dropping outcome of a superseded reconciliation"
            );
            return;
        }
        match &result.outcome {
            Outcome::Failed {
                target, reason, ..
            } => tracing::warn!(
                tenant = %result.tenant_id,
                object = %target,
                %reason,
                "{} failed",
                result.operation
            ),
            Outcome::Removed => tracing::info!(tenant = %result.tenant_id, "tenant removed"),
            Outcome::Provisioned | Outcome::Superseded => {}
        }
    }

    fn schedule_all(&mut self, accounts: Vec<TenantAccount>) {
        for account in accounts {
            self.schedule(account);
        }
    }

    fn schedule(&mut self, account: TenantAccount) {
        self.in_flight += 1;
        let reconciler = self.reconciler.clone();
        let tx = self.tx.clone();
        let span = info_span!("reconcile", tenant = %account.tenant_id);
        tokio::spawn(
            async move {
                let result = reconciler.reconcile(account).await;
                if tx.send(HubEvent::Reconciled(result)).await.is_err() {
                    tracing::debug!("hub stopped, dropping reconcile result");
                }
            }
            .instrument(span),
        );
    }

    /// Lists buckets with `credentials`. Tenants are provisioned regardless; a failure only
    /// shows in the hub status.
    fn verify_in_background(&mut self, credentials: S3Credentials) {
        self.in_flight += 1;
        let verifier = self.verifier.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                let error = match verifier.verify(&credentials).await {
                    Ok(()) => None,
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "S3 credentials were refused"
                        );
                        Some(error.to_string())
                    }
                };
                let _ = tx.send(HubEvent::S3Verified { credentials, error }).await;
            }
            .instrument(info_span!("verify_s3_credentials")),
        );
    }

    fn discover_in_background(&self) {
        let reconciler = self.reconciler.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                let event = match reconciler.discover().await {
                    Ok(tenants) => HubEvent::Discovered(tenants),
                    Err(error) => {
                        let untrusted = error.is_untrusted();
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            untrusted,
                            "failed to discover existing tenants"
                        );
                        HubEvent::DiscoveryFailed { untrusted }
                    }
                };
                let _ = tx.send(event).await;
            }
            .instrument(info_span!("discover")),
        );
    }

    pub fn status(&self) -> HubStatus {
        if !self.trusted {
            return HubStatus::Blocked(
                "Integration hub is not trusted, check its RBAC permissions".to_string(),
            );
        }
        if self.credential_error.is_some() || self.verification_error.is_some() {
            return HubStatus::Blocked("Invalid S3 credentials".to_string());
        }
        let accounts = self.registry.list();
        let count = |phase: TenantPhase| {
            accounts
                .iter()
                .filter(|a| a.status.phase() == phase)
                .count()
        };
        let failed = count(TenantPhase::Failed);
        if failed > 0 {
            return HubStatus::Blocked(format!("{failed} service account(s) failed"));
        }
        let busy = count(TenantPhase::Pending) + count(TenantPhase::Deprovisioning);
        if busy > 0 {
            return HubStatus::Maintenance(format!("Reconciling {busy} service account(s)"));
        }
        HubStatus::Active
    }

    fn status_data(&self) -> BTreeMap<String, String> {
        let (status, message) = self.status().data();
        let mut data = BTreeMap::from([
            (STATUS_KEY.to_string(), status.to_string()),
            (MESSAGE_KEY.to_string(), message),
        ]);
        for account in self.registry.list() {
            let value = match &account.status {
                TenantStatus::Failed {
                    operation,
                    target,
                    reason,
                } => format!("failed to {operation} {target}: {reason}"),
                status => status.phase().to_string().to_lowercase(),
            };
            data.insert(format!("{TENANT_KEY_PREFIX}{}", account.tenant_id), value);
        }
        data
    }

    async fn publish(&mut self) {
        if let Err(error) = self.publisher.publish(self.registry.list()).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish service accounts"
            );
        }
        let status = self.status_data();
        if let Err(error) = self.publisher.publish_bag(STATUS_DATA_BAG, status).await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish hub status"
            );
        }
    }
}
