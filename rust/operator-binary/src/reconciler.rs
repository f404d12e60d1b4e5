//! Drives the cluster towards the desired object set of one tenant.
//!
//! A reconciliation builds the desired [`ManagedResourceSet`], lists what the cluster
//! currently holds under the tenant's labels and applies the difference. Objects are created
//! or patched in provisioning order and deleted in reverse order.
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use snafu::{ResultExt, Snafu};
use stackable_operator::logging::controller::ReconcilerError;
use strum::{EnumDiscriminants, IntoEnumIterator, IntoStaticStr};
use tokio::sync::OwnedMutexGuard;

use crate::{
    backoff::{RetryError, RetryPolicy, retry},
    cluster::{self, ClusterApi, ManagedObject, ObjectKey, ObjectKind},
    constants::{LABEL_TENANT, MANAGED_BY_SELECTOR},
    registry::{Operation, TenantAccount},
    resources::{self, ManagedResourceSet},
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("{target} still failing after {attempts} attempts"))]
    Transient {
        target: String,
        attempts: u32,
        source: cluster::Error,
    },

    #[snafu(display("{target} failed"))]
    NonTransient {
        target: String,
        source: cluster::Error,
    },

    #[snafu(display("failed to build the desired objects"))]
    BuildResources { source: resources::Error },

    #[snafu(display("failed to discover existing tenants"))]
    Discover { source: cluster::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl Error {
    fn target(&self) -> String {
        match self {
            Error::Transient { target, .. } | Error::NonTransient { target, .. } => {
                target.clone()
            }
            Error::BuildResources { .. } | Error::Discover { .. } => "desired objects".to_string(),
        }
    }

    /// The hub lacks the RBAC permissions to manage service accounts.
    pub fn is_untrusted(&self) -> bool {
        match self {
            Error::Discover { source } | Error::NonTransient { source, .. } => {
                source.is_forbidden()
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Provisioned,
    Removed,
    /// The account changed while provisioning; a newer reconciliation takes over.
    Superseded,
    Failed {
        target: String,
        category: &'static str,
        reason: String,
    },
}

impl Outcome {
    fn from_error(error: &Error) -> Self {
        Outcome::Failed {
            target: error.target(),
            category: error.category(),
            reason: error_chain(error),
        }
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Clone, Debug)]
pub struct ReconcileResult {
    pub tenant_id: String,
    pub generation: u64,
    pub operation: Operation,
    pub outcome: Outcome,
    /// Number of successful object writes.
    pub writes: u32,
    pub duration: Duration,
}

/// A single step towards the desired state.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Create(ManagedObject),
    Patch(ManagedObject),
    Delete(ObjectKey),
}

impl Change {
    fn key(&self) -> ObjectKey {
        match self {
            Change::Create(object) | Change::Patch(object) => object.key(),
            Change::Delete(key) => key.clone(),
        }
    }
}

/// Three-way diff between the desired objects, the observed objects and the fingerprint the
/// hub left on the observed objects when it last applied them.
///
/// Objects whose fingerprint matches and whose managed fields are untouched need no change.
/// Observed objects outside the desired set are deleted, last provisioned kind first.
pub fn plan(
    desired: &ManagedResourceSet,
    observed: &BTreeMap<ObjectKey, ManagedObject>,
) -> Vec<Change> {
    let mut changes: Vec<Change> = desired
        .objects
        .iter()
        .filter_map(|object| match observed.get(&object.key()) {
            None => Some(Change::Create(object.clone())),
            Some(current)
                if current.last_applied() != object.last_applied()
                    || object.drifted_from(current) =>
            {
                Some(Change::Patch(object.clone()))
            }
            Some(_) => None,
        })
        .collect();

    let mut stale: Vec<&ObjectKey> = observed
        .keys()
        .filter(|key| !desired.contains(key))
        .collect();
    stale.sort_by(|a, b| b.kind.cmp(&a.kind));
    changes.extend(stale.into_iter().cloned().map(Change::Delete));
    changes
}

/// Serialises reconciliations of the same tenant.
#[derive(Default)]
pub struct TenantLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct TenantGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<TenantLocks>,
    tenant_id: String,
}

impl TenantLocks {
    pub async fn lock(self: &Arc<Self>, tenant_id: &str) -> TenantGuard {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(tenant_id.to_string()).or_default().clone()
        };
        TenantGuard {
            guard: Some(mutex.lock_owned().await),
            locks: Arc::clone(self),
            tenant_id: tenant_id.to_string(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for TenantGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table itself still refers to the mutex: nobody is waiting for it.
        if table
            .get(&self.tenant_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            table.remove(&self.tenant_id);
        }
    }
}

/// A tenant found in the cluster through its labelled ServiceAccount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredTenant {
    pub tenant_id: String,
    pub namespace: String,
}

pub struct Reconciler<C> {
    cluster: Arc<C>,
    retry: RetryPolicy,
    locks: Arc<TenantLocks>,
}

impl<C> Clone for Reconciler<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            retry: self.retry,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(cluster: Arc<C>, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            retry,
            locks: Arc::default(),
        }
    }

    /// Brings the cluster in line with `account`.
    ///
    /// Never returns an error: failures are reported in the result's [`Outcome`].
    #[tracing::instrument(skip_all, fields(tenant = %account.tenant_id, generation = account.generation))]
    pub async fn reconcile(&self, account: TenantAccount) -> ReconcileResult {
        let _guard = self.locks.lock(&account.tenant_id).await;
        let started = Instant::now();
        let operation = account.operation();
        let mut writes = 0;

        let result = match operation {
            Operation::Provision => self.provision(&account, &mut writes).await,
            Operation::Deprovision => self.deprovision(&account, &mut writes).await,
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "{operation} of tenant failed"
                );
                Outcome::from_error(&error)
            }
        };
        tracing::info!(?outcome, writes, "finished {operation}");

        ReconcileResult {
            tenant_id: account.tenant_id,
            generation: account.generation,
            operation,
            outcome,
            writes,
            duration: started.elapsed(),
        }
    }

    async fn provision(&self, account: &TenantAccount, writes: &mut u32) -> Result<Outcome> {
        if account.cancel.is_cancelled() {
            return Ok(Outcome::Superseded);
        }
        let desired = resources::build(
            &account.tenant_id,
            &account.namespace,
            &account.desired_properties,
        )
        .context(BuildResourcesSnafu)?;
        let observed = self.observe(&account.tenant_id).await?;

        for change in plan(&desired, &observed) {
            if account.cancel.is_cancelled() {
                tracing::info!("account changed while provisioning, stopping");
                return Ok(Outcome::Superseded);
            }
            self.execute(&change).await?;
            *writes += 1;
        }
        Ok(Outcome::Provisioned)
    }

    /// Deletes every object of the tenant.
    ///
    /// Stops as soon as the account changes: a revived tenant may already have been provisioned
    /// by a reconciliation that took the tenant lock first.
    async fn deprovision(&self, account: &TenantAccount, writes: &mut u32) -> Result<Outcome> {
        if account.cancel.is_cancelled() {
            return Ok(Outcome::Superseded);
        }
        let observed = self.observe(&account.tenant_id).await?;
        let nothing = ManagedResourceSet {
            tenant_id: account.tenant_id.clone(),
            objects: Vec::new(),
        };
        for change in plan(&nothing, &observed) {
            if account.cancel.is_cancelled() {
                tracing::info!("account changed while deprovisioning, stopping");
                return Ok(Outcome::Superseded);
            }
            self.execute(&change).await?;
            *writes += 1;
        }
        Ok(Outcome::Removed)
    }

    /// Lists every object labelled with the tenant, across all namespaces.
    async fn observe(&self, tenant_id: &str) -> Result<BTreeMap<ObjectKey, ManagedObject>> {
        let selector = resources::tenant_selector(tenant_id);
        let mut observed = BTreeMap::new();
        for kind in ObjectKind::iter() {
            let objects = self
                .with_retry(format!("listing {kind} objects of tenant {tenant_id}"), || {
                    self.cluster.list(kind, &selector)
                })
                .await?;
            observed.extend(objects.into_iter().map(|object| (object.key(), object)));
        }
        Ok(observed)
    }

    async fn execute(&self, change: &Change) -> Result<()> {
        let key = change.key();
        match change {
            Change::Create(object) => {
                tracing::debug!("creating {key}");
                self.with_retry(key.to_string(), || self.cluster.apply(object))
                    .await
            }
            Change::Patch(object) => {
                tracing::debug!("patching {key}");
                self.with_retry(key.to_string(), || self.cluster.apply(object))
                    .await
            }
            Change::Delete(key) => {
                tracing::debug!("deleting {key}");
                self.with_retry(key.to_string(), || self.cluster.delete(key))
                    .await
            }
        }
    }

    async fn with_retry<T, F>(
        &self,
        target: String,
        op: impl FnMut() -> F,
    ) -> Result<T>
    where
        F: Future<Output = cluster::Result<T>>,
    {
        retry(&self.retry, op, cluster::Error::is_transient, &target)
            .await
            .map_err(|error| match error {
                RetryError::Permanent(source) => Error::NonTransient { target, source },
                RetryError::Exhausted { last, attempts } => Error::Transient {
                    target,
                    attempts,
                    source: last,
                },
            })
    }

    /// Finds the tenants this hub provisioned before a restart.
    pub async fn discover(&self) -> Result<Vec<DiscoveredTenant>> {
        let service_accounts = self
            .with_retry("discovering tenants".to_string(), || {
                self.cluster
                    .list(ObjectKind::ServiceAccount, MANAGED_BY_SELECTOR)
            })
            .await
            .map_err(|error| match error {
                Error::Transient { source, .. } | Error::NonTransient { source, .. } => {
                    Error::Discover { source }
                }
                other => other,
            })?;

        Ok(service_accounts
            .iter()
            .filter_map(|object| {
                Some(DiscoveredTenant {
                    tenant_id: object.label(LABEL_TENANT)?.to_string(),
                    namespace: object.meta().namespace.clone()?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use stackable_operator::k8s_openapi::ByteString;

    use super::*;
    use crate::{
        cluster::memory::{MemoryCluster, Op, Write},
        registry::{Registry, TenantStatus},
        s3::{self, tests::raw},
    };

    fn setup() -> (Arc<MemoryCluster>, Reconciler<MemoryCluster>, Registry) {
        let cluster = Arc::new(MemoryCluster::default());
        let reconciler = Reconciler::new(cluster.clone(), RetryPolicy::default());
        let mut registry = Registry::default();
        registry.set_credentials(Some(s3::tests::minio()));
        (cluster, reconciler, registry)
    }

    fn secret_value(cluster: &MemoryCluster, tenant: &str, key: &str) -> Option<String> {
        let secret = cluster.get(&ObjectKey {
            kind: ObjectKind::Secret,
            namespace: "spark".to_string(),
            name: resources::properties_secret_name(tenant),
        })?;
        let ManagedObject::Secret(secret) = secret else {
            return None;
        };
        let ByteString(bytes) = secret.data?.remove(key)?;
        String::from_utf8(bytes).ok()
    }

    #[tokio::test]
    async fn test_provision_creates_objects_in_order() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();

        let result = reconciler.reconcile(alice).await;

        assert_eq!(result.outcome, Outcome::Provisioned);
        assert_eq!(result.writes, 4);
        let kinds: Vec<_> = cluster.writes().iter().map(|w| w.key.kind).collect();
        assert_eq!(
            kinds,
            [
                ObjectKind::ServiceAccount,
                ObjectKind::Role,
                ObjectKind::RoleBinding,
                ObjectKind::Secret
            ]
        );
        assert_eq!(
            secret_value(&cluster, "alice", "spark.hadoop.fs.s3a.endpoint").as_deref(),
            Some("http://minio:9000")
        );
    }

    #[tokio::test]
    async fn test_second_reconcile_performs_no_writes() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice.clone()).await;
        cluster.clear_writes();

        let result = reconciler.reconcile(alice).await;

        assert_eq!(result.outcome, Outcome::Provisioned);
        assert_eq!(result.writes, 0);
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_patches_only_the_secret() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice).await;
        cluster.clear_writes();

        let rotated = s3::parse(&raw(&[
            (s3::ENDPOINT, "https://s3.example.com"),
            (s3::ACCESS_KEY, "AK2"),
            (s3::SECRET_KEY, "SK2"),
            (s3::BUCKET, "logs"),
        ]))
        .unwrap();
        let alice = registry.set_credentials(Some(rotated)).remove(0);
        let result = reconciler.reconcile(alice).await;

        assert_eq!(result.writes, 1);
        assert_eq!(cluster.writes()[0].key.kind, ObjectKind::Secret);
        assert_eq!(
            secret_value(&cluster, "alice", "spark.hadoop.fs.s3a.access.key").as_deref(),
            Some("AK2")
        );
        assert_eq!(
            secret_value(&cluster, "alice", "spark.eventLog.dir").as_deref(),
            Some("s3a://logs")
        );
    }

    #[tokio::test]
    async fn test_tampered_secret_is_restored() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice.clone()).await;

        let key = ObjectKey {
            kind: ObjectKind::Secret,
            namespace: "spark".to_string(),
            name: "configuration-hub-conf-alice".to_string(),
        };
        let Some(ManagedObject::Secret(mut secret)) = cluster.get(&key) else {
            panic!("secret was not created");
        };
        secret.data = None;
        cluster.insert(ManagedObject::Secret(secret));
        cluster.clear_writes();

        let result = reconciler.reconcile(alice).await;

        assert_eq!(result.writes, 1);
        assert_eq!(
            cluster.writes(),
            [Write {
                op: Op::Apply,
                key
            }]
        );
    }

    #[tokio::test]
    async fn test_tenants_do_not_touch_each_other() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        let bob = registry.upsert("bob", "spark").unwrap();
        reconciler.reconcile(alice).await;
        reconciler.reconcile(bob).await;
        let alice_objects = cluster.labelled(&resources::tenant_selector("alice"));
        cluster.clear_writes();

        let bob = registry.remove("bob").unwrap();
        let result = reconciler.reconcile(bob).await;

        assert_eq!(result.outcome, Outcome::Removed);
        assert!(
            cluster
                .writes()
                .iter()
                .all(|write| !write.key.name.contains("alice"))
        );
        assert_eq!(
            cluster.labelled(&resources::tenant_selector("alice")),
            alice_objects
        );
        assert!(cluster.labelled(&resources::tenant_selector("bob")).is_empty());
    }

    #[tokio::test]
    async fn test_removal_deletes_in_reverse_order() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice).await;
        cluster.clear_writes();

        let alice = registry.remove("alice").unwrap();
        let result = reconciler.reconcile(alice.clone()).await;

        assert_eq!(result.outcome, Outcome::Removed);
        let deleted: Vec<_> = cluster
            .writes()
            .iter()
            .inspect(|write| assert_eq!(write.op, Op::Delete))
            .map(|write| write.key.kind)
            .collect();
        assert_eq!(
            deleted,
            [
                ObjectKind::Secret,
                ObjectKind::RoleBinding,
                ObjectKind::Role,
                ObjectKind::ServiceAccount
            ]
        );
        assert!(cluster.objects().is_empty());

        assert!(registry.apply_outcome("alice", alice.generation, &result.outcome));
        assert!(!registry.contains("alice"));
    }

    #[tokio::test]
    async fn test_objects_left_in_another_namespace_are_deleted() {
        let (cluster, reconciler, mut registry) = setup();
        let stray = resources::build("alice", "old", &Default::default()).unwrap();
        for object in stray.objects {
            cluster.insert(object);
        }

        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice).await;

        let namespaces: BTreeSet<_> = cluster
            .labelled(&resources::tenant_selector("alice"))
            .into_iter()
            .map(|key| key.namespace)
            .collect();
        assert_eq!(namespaces, BTreeSet::from(["spark".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_once() {
        let (cluster, reconciler, mut registry) = setup();
        cluster.fail(ObjectKind::Secret, Op::Apply, 409, 100);
        let alice = registry.upsert("alice", "spark").unwrap();

        let result = reconciler.reconcile(alice.clone()).await;

        let Outcome::Failed {
            target, category, ..
        } = &result.outcome
        else {
            panic!("expected a failure, got {:?}", result.outcome);
        };
        assert_eq!(target, "Secret spark/configuration-hub-conf-alice");
        assert_eq!(*category, "Transient");
        // Objects applied before the failing one stay in place.
        assert_eq!(result.writes, 3);
        assert_eq!(cluster.objects().len(), 3);

        assert!(registry.apply_outcome("alice", alice.generation, &result.outcome));
        assert_eq!(registry.retry_failed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let (cluster, reconciler, mut registry) = setup();
        cluster.fail(ObjectKind::Role, Op::Apply, 503, 2);
        let alice = registry.upsert("alice", "spark").unwrap();

        let result = reconciler.reconcile(alice).await;

        assert_eq!(result.outcome, Outcome::Provisioned);
        assert_eq!(cluster.objects().len(), 4);
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let (cluster, reconciler, mut registry) = setup();
        cluster.fail(ObjectKind::ServiceAccount, Op::Apply, 403, 1);
        let alice = registry.upsert("alice", "spark").unwrap();

        let result = reconciler.reconcile(alice.clone()).await;

        assert!(matches!(
            result.outcome,
            Outcome::Failed {
                category: "NonTransient",
                ..
            }
        ));
        assert!(cluster.objects().is_empty());

        // The injected fault is used up, the next attempt succeeds.
        registry.apply_outcome("alice", alice.generation, &result.outcome);
        let alice = registry.retry_failed().remove(0);
        assert_eq!(reconciler.reconcile(alice).await.outcome, Outcome::Provisioned);
    }

    #[tokio::test]
    async fn test_removal_during_provisioning() {
        let (cluster, reconciler, mut registry) = setup();
        let gate = cluster.gate(ObjectKind::Role);
        let alice = registry.upsert("alice", "spark").unwrap();

        let in_flight = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile(alice).await }
        });
        gate.reached().await;
        let removal = registry.remove("alice").unwrap();
        gate.open();

        let provisioning = in_flight.await.unwrap();
        assert_eq!(provisioning.outcome, Outcome::Superseded);
        assert!(!registry.apply_outcome("alice", provisioning.generation, &provisioning.outcome));
        assert!(
            cluster
                .writes()
                .iter()
                .all(|write| write.key.kind <= ObjectKind::Role)
        );

        let removed = reconciler.reconcile(removal.clone()).await;
        assert_eq!(removed.outcome, Outcome::Removed);
        assert!(registry.apply_outcome("alice", removal.generation, &removed.outcome));
        assert!(cluster.objects().is_empty());
        assert!(!registry.contains("alice"));
    }

    #[tokio::test]
    async fn test_stale_removal_spares_revived_tenant() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        let provisioned = reconciler.reconcile(alice.clone()).await;
        registry.apply_outcome("alice", alice.generation, &provisioned.outcome);

        let removal = registry.remove("alice").unwrap();
        let revival = registry.upsert("alice", "spark").unwrap();

        // The revival wins the tenant lock before the removal.
        let revived = reconciler.reconcile(revival.clone()).await;
        assert_eq!(revived.outcome, Outcome::Provisioned);
        assert!(registry.apply_outcome("alice", revival.generation, &revived.outcome));
        cluster.clear_writes();

        let removed = reconciler.reconcile(removal.clone()).await;
        assert_eq!(removed.outcome, Outcome::Superseded);
        assert!(!registry.apply_outcome("alice", removal.generation, &removed.outcome));

        assert!(cluster.writes().is_empty());
        assert_eq!(cluster.labelled(&resources::tenant_selector("alice")).len(), 4);
        assert_eq!(
            registry.get("alice").map(|account| &account.status),
            Some(&TenantStatus::Provisioned)
        );
    }

    #[tokio::test]
    async fn test_removal_stops_when_tenant_is_revived() {
        let (cluster, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice).await;

        let gate = cluster.gate_delete(ObjectKind::Role);
        let removal = registry.remove("alice").unwrap();
        let in_flight = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile(removal).await }
        });
        gate.reached().await;
        let revival = registry.upsert("alice", "spark").unwrap();
        gate.open();

        assert_eq!(in_flight.await.unwrap().outcome, Outcome::Superseded);
        // Deletion stopped before the ServiceAccount.
        assert!(
            cluster
                .labelled(&resources::tenant_selector("alice"))
                .iter()
                .any(|key| key.kind == ObjectKind::ServiceAccount)
        );
        assert_eq!(
            reconciler.reconcile(revival).await.outcome,
            Outcome::Provisioned
        );
        assert_eq!(cluster.labelled(&resources::tenant_selector("alice")).len(), 4);
    }

    #[tokio::test]
    async fn test_discover_restores_tenants() {
        let (_, reconciler, mut registry) = setup();
        let alice = registry.upsert("alice", "spark").unwrap();
        reconciler.reconcile(alice).await;

        assert_eq!(
            reconciler.discover().await.unwrap(),
            [DiscoveredTenant {
                tenant_id: "alice".to_string(),
                namespace: "spark".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_discover_without_permissions() {
        let (cluster, reconciler, _) = setup();
        cluster.forbid_list();

        let error = reconciler.discover().await.unwrap_err();
        assert!(error.is_untrusted());
    }

    #[tokio::test]
    async fn test_tenant_locks_are_released() {
        let locks = Arc::new(TenantLocks::default());
        let guard = locks.lock("alice").await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_same_tenant_is_serialised() {
        let locks = Arc::new(TenantLocks::default());
        let first = locks.lock("alice").await;
        let _other = locks.lock("bob").await;

        let waiting = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _second = locks.lock("alice").await;
            }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(first);
        waiting.await.unwrap();
    }
}
