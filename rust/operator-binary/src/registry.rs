//! Process-wide record of the tenants the hub manages.
//!
//! The registry is owned by the dispatcher loop and is the only mutable shared state in the
//! hub. Every mutation of an account assigns it a fresh generation and cancels the token
//! handed to the previous reconciliation, so outcomes of superseded work can be recognised
//! and dropped.
use std::collections::BTreeSet;

use snafu::Snafu;
use strum::{Display, EnumDiscriminants, IntoStaticStr};
use tokio_util::sync::CancellationToken;

use crate::{
    properties::{SparkProperties, spark_properties},
    reconciler::Outcome,
    s3::{PushGatewayEndpoint, S3Credentials},
};

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display(
        "tenant {tenant_id:?} is already registered in namespace {existing:?}, refusing to move it to {requested:?}"
    ))]
    DuplicateTenant {
        tenant_id: String,
        existing: String,
        requested: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Provision,
    Deprovision,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(TenantPhase), derive(Display, IntoStaticStr))]
pub enum TenantStatus {
    Pending,
    Provisioned,
    Deprovisioning,
    Failed {
        operation: Operation,
        target: String,
        reason: String,
    },
}

impl TenantStatus {
    pub fn phase(&self) -> TenantPhase {
        self.into()
    }
}

#[derive(Clone, Debug)]
pub struct TenantAccount {
    pub tenant_id: String,
    pub namespace: String,
    pub desired_properties: SparkProperties,
    pub status: TenantStatus,
    /// Registry-wide sequence number of the last mutation of this account.
    pub generation: u64,
    pub cancel: CancellationToken,
}

impl TenantAccount {
    /// The work a reconciliation of this account has to do.
    pub fn operation(&self) -> Operation {
        match &self.status {
            TenantStatus::Deprovisioning => Operation::Deprovision,
            TenantStatus::Failed { operation, .. } => *operation,
            TenantStatus::Pending | TenantStatus::Provisioned => Operation::Provision,
        }
    }
}

#[derive(Default)]
pub struct Registry {
    accounts: Vec<TenantAccount>,
    credentials: Option<S3Credentials>,
    pushgateway: Option<PushGatewayEndpoint>,
    generation: u64,
}

impl Registry {
    pub fn credentials(&self) -> Option<&S3Credentials> {
        self.credentials.as_ref()
    }

    pub fn pushgateway(&self) -> Option<&PushGatewayEndpoint> {
        self.pushgateway.as_ref()
    }

    /// Accounts in registration order.
    pub fn list(&self) -> &[TenantAccount] {
        &self.accounts
    }

    pub fn get(&self, tenant_id: &str) -> Option<&TenantAccount> {
        self.accounts.iter().find(|a| a.tenant_id == tenant_id)
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.get(tenant_id).is_some()
    }

    fn position(&self, tenant_id: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.tenant_id == tenant_id)
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Moves the account at `index` to `status` under a new generation, superseding any
    /// reconciliation still running for the previous one.
    fn bump(&mut self, index: usize, status: TenantStatus) -> TenantAccount {
        let generation = self.next_generation();
        let account = &mut self.accounts[index];
        account.cancel.cancel();
        account.cancel = CancellationToken::new();
        account.generation = generation;
        account.status = status;
        account.clone()
    }

    /// Regenerates the properties of the account at `index` from the current inputs and
    /// marks it Pending.
    fn regenerate(&mut self, index: usize) -> TenantAccount {
        self.accounts[index].desired_properties =
            spark_properties(self.credentials.as_ref(), self.pushgateway.as_ref());
        self.bump(index, TenantStatus::Pending)
    }

    /// Registers a tenant, or regenerates the properties of an existing one.
    ///
    /// Properties are always computed from scratch out of the current S3 credentials and
    /// pushgateway. A tenant that was being deprovisioned is revived.
    pub fn upsert(&mut self, tenant_id: &str, namespace: &str) -> Result<TenantAccount> {
        if let Some(index) = self.position(tenant_id) {
            let existing = &self.accounts[index].namespace;
            if existing != namespace {
                return DuplicateTenantSnafu {
                    tenant_id,
                    existing: existing.clone(),
                    requested: namespace,
                }
                .fail();
            }
            return Ok(self.regenerate(index));
        }

        self.accounts.push(TenantAccount {
            tenant_id: tenant_id.to_string(),
            namespace: namespace.to_string(),
            desired_properties: SparkProperties::new(),
            status: TenantStatus::Pending,
            generation: 0,
            cancel: CancellationToken::new(),
        });
        let index = self.accounts.len() - 1;
        Ok(self.regenerate(index))
    }

    /// Re-registers a tenant found in the cluster at startup. Already known tenants are
    /// left alone.
    pub fn restore(&mut self, tenant_id: &str, namespace: &str) -> Option<TenantAccount> {
        if self.contains(tenant_id) {
            return None;
        }
        self.upsert(tenant_id, namespace).ok()
    }

    /// Starts deprovisioning a tenant and cancels its in-flight provisioning.
    ///
    /// The account stays registered until its removal is confirmed through
    /// [`Registry::apply_outcome`].
    pub fn remove(&mut self, tenant_id: &str) -> Option<TenantAccount> {
        let index = self.position(tenant_id)?;
        Some(self.bump(index, TenantStatus::Deprovisioning))
    }

    /// Removes every tenant not in `requested`, returning the accounts that started
    /// deprovisioning.
    pub fn prune_unrequested(&mut self, requested: &BTreeSet<String>) -> Vec<TenantAccount> {
        let stale: Vec<String> = self
            .accounts
            .iter()
            .filter(|a| a.status != TenantStatus::Deprovisioning)
            .filter(|a| !requested.contains(&a.tenant_id))
            .map(|a| a.tenant_id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|tenant_id| self.remove(tenant_id))
            .collect()
    }

    fn regenerate_live(&mut self) -> Vec<TenantAccount> {
        let live: Vec<usize> = (0..self.accounts.len())
            .filter(|&index| self.accounts[index].operation() == Operation::Provision)
            .collect();
        live.into_iter()
            .map(|index| self.regenerate(index))
            .collect()
    }

    /// Replaces the hub-wide S3 credentials, returning every live tenant regenerated.
    ///
    /// `None` drops the credentials: the regenerated properties carry no S3 keys.
    pub fn set_credentials(&mut self, credentials: Option<S3Credentials>) -> Vec<TenantAccount> {
        self.credentials = credentials;
        self.regenerate_live()
    }

    pub fn set_pushgateway(
        &mut self,
        pushgateway: Option<PushGatewayEndpoint>,
    ) -> Vec<TenantAccount> {
        self.pushgateway = pushgateway;
        self.regenerate_live()
    }

    /// Records the outcome of a reconciliation of `generation`.
    ///
    /// Returns `false` when the account moved on in the meantime, in which case the outcome
    /// is stale and ignored.
    pub fn apply_outcome(&mut self, tenant_id: &str, generation: u64, outcome: &Outcome) -> bool {
        let Some(index) = self.position(tenant_id) else {
            return false;
        };
        let account = &mut self.accounts[index];
        if account.generation != generation {
            return false;
        }

        match outcome {
            Outcome::Provisioned => account.status = TenantStatus::Provisioned,
            Outcome::Removed => {
                self.accounts.remove(index);
            }
            Outcome::Superseded => {}
            Outcome::Failed {
                target, reason, ..
            } => {
                account.status = TenantStatus::Failed {
                    operation: account.operation(),
                    target: target.clone(),
                    reason: reason.clone(),
                }
            }
        }
        true
    }

    /// Schedules another attempt for every failed tenant.
    pub fn retry_failed(&mut self) -> Vec<TenantAccount> {
        let failed: Vec<(usize, Operation)> = self
            .accounts
            .iter()
            .enumerate()
            .filter_map(|(index, account)| match &account.status {
                TenantStatus::Failed { operation, .. } => Some((index, *operation)),
                _ => None,
            })
            .collect();

        failed
            .into_iter()
            .map(|(index, operation)| match operation {
                Operation::Provision => self.regenerate(index),
                Operation::Deprovision => self.bump(index, TenantStatus::Deprovisioning),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::{self, tests::raw};

    fn registry_with_minio() -> Registry {
        let mut registry = Registry::default();
        registry.set_credentials(Some(s3::tests::minio()));
        registry
    }

    fn failed(reason: &str) -> Outcome {
        Outcome::Failed {
            target: "Secret spark/configuration-hub-conf-alice".to_string(),
            category: "NonTransient",
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_upsert_registers_pending_account() {
        let mut registry = registry_with_minio();
        let account = registry.upsert("alice", "spark").unwrap();

        assert_eq!(account.status, TenantStatus::Pending);
        assert_eq!(
            account
                .desired_properties
                .get("spark.hadoop.fs.s3a.endpoint")
                .map(String::as_str),
            Some("http://minio:9000")
        );
    }

    #[test]
    fn test_list_keeps_registration_order() {
        let mut registry = Registry::default();
        for tenant in ["carol", "alice", "bob"] {
            registry.upsert(tenant, "spark").unwrap();
        }
        registry.upsert("alice", "spark").unwrap();

        let tenants: Vec<_> = registry.list().iter().map(|a| a.tenant_id.as_str()).collect();
        assert_eq!(tenants, ["carol", "alice", "bob"]);
    }

    #[test]
    fn test_namespace_conflict_is_rejected() {
        let mut registry = Registry::default();
        registry.upsert("alice", "spark").unwrap();

        assert_eq!(
            registry.upsert("alice", "other").unwrap_err(),
            Error::DuplicateTenant {
                tenant_id: "alice".to_string(),
                existing: "spark".to_string(),
                requested: "other".to_string(),
            }
        );
        assert_eq!(registry.get("alice").unwrap().namespace, "spark");
    }

    #[test]
    fn test_rotation_regenerates_every_live_tenant() {
        let mut registry = registry_with_minio();
        let alice = registry.upsert("alice", "spark").unwrap();
        registry.upsert("bob", "spark").unwrap();
        registry.remove("bob");

        let rotated = s3::parse(&raw(&[
            (s3::ENDPOINT, "https://s3.example.com"),
            (s3::ACCESS_KEY, "AK2"),
            (s3::SECRET_KEY, "SK2"),
            (s3::BUCKET, "logs"),
        ]))
        .unwrap();
        let regenerated = registry.set_credentials(Some(rotated));

        assert_eq!(regenerated.len(), 1);
        let alice_after = &regenerated[0];
        assert!(alice_after.generation > alice.generation);
        assert!(alice.cancel.is_cancelled());
        assert_eq!(
            alice_after
                .desired_properties
                .get("spark.hadoop.fs.s3a.access.key")
                .map(String::as_str),
            Some("AK2")
        );
        assert_eq!(
            registry.get("bob").unwrap().status,
            TenantStatus::Deprovisioning
        );
    }

    #[test]
    fn test_dropping_credentials_removes_s3_keys() {
        let mut registry = registry_with_minio();
        registry.upsert("alice", "spark").unwrap();

        let regenerated = registry.set_credentials(None);
        assert!(regenerated[0].desired_properties.is_empty());
    }

    #[test]
    fn test_stale_outcomes_are_dropped() {
        let mut registry = Registry::default();
        let first = registry.upsert("alice", "spark").unwrap();
        let second = registry.upsert("alice", "spark").unwrap();

        assert!(!registry.apply_outcome("alice", first.generation, &Outcome::Provisioned));
        assert_eq!(registry.get("alice").unwrap().status, TenantStatus::Pending);

        assert!(registry.apply_outcome("alice", second.generation, &Outcome::Provisioned));
        assert_eq!(
            registry.get("alice").unwrap().status,
            TenantStatus::Provisioned
        );
    }

    #[test]
    fn test_removal_completes_on_removed_outcome() {
        let mut registry = Registry::default();
        let pending = registry.upsert("alice", "spark").unwrap();
        let removing = registry.remove("alice").unwrap();

        assert!(pending.cancel.is_cancelled());
        assert_eq!(removing.operation(), Operation::Deprovision);
        assert!(registry.contains("alice"));

        assert!(registry.apply_outcome("alice", removing.generation, &Outcome::Removed));
        assert!(!registry.contains("alice"));
    }

    #[test]
    fn test_failed_tenants_are_retried_with_their_operation() {
        let mut registry = Registry::default();
        let alice = registry.upsert("alice", "spark").unwrap();
        registry.upsert("bob", "spark").unwrap();
        let bob = registry.remove("bob").unwrap();

        registry.apply_outcome("alice", alice.generation, &failed("forbidden"));
        registry.apply_outcome("bob", bob.generation, &failed("forbidden"));
        assert_eq!(
            registry.get("alice").unwrap().status.phase(),
            TenantPhase::Failed
        );

        let retried = registry.retry_failed();
        let statuses: Vec<_> = retried.iter().map(|a| a.status.clone()).collect();
        assert_eq!(
            statuses,
            [TenantStatus::Pending, TenantStatus::Deprovisioning]
        );
        assert!(registry.retry_failed().is_empty());
    }

    #[test]
    fn test_prune_unrequested() {
        let mut registry = Registry::default();
        registry.restore("alice", "spark").unwrap();
        registry.restore("bob", "spark").unwrap();
        assert!(registry.restore("bob", "spark").is_none());

        let pruned = registry.prune_unrequested(&BTreeSet::from(["alice".to_string()]));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].tenant_id, "bob");
        assert_eq!(pruned[0].status, TenantStatus::Deprovisioning);
    }

    #[test]
    fn test_pushgateway_adds_sink_properties() {
        let mut registry = Registry::default();
        registry.upsert("alice", "spark").unwrap();

        let gateway =
            s3::parse_pushgateway(&raw(&[(s3::PUSH_ENDPOINT, "http://pushgateway:9091")]))
                .unwrap();
        let regenerated = registry.set_pushgateway(Some(gateway));
        assert!(
            regenerated[0]
                .desired_properties
                .contains_key("spark.metrics.conf.driver.sink.prometheus.pushgateway-address")
        );
    }
}
