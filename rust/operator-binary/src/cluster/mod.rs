//! The narrow view of the Kubernetes API that the reconciler works against.
use std::{collections::BTreeMap, fmt, future::Future, time::Duration};

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            core::v1::{Secret, ServiceAccount},
            rbac::v1::{Role, RoleBinding},
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube,
};
use strum::{Display, EnumIter};

use crate::constants::ANNOTATION_LAST_APPLIED;

mod kubernetes;
#[cfg(test)]
pub mod memory;

pub use kubernetes::KubeCluster;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("request was rejected with {code} {reason}: {message}"))]
    Rejected {
        code: u16,
        reason: String,
        message: String,
    },

    #[snafu(display("request did not complete within {timeout:?}"))]
    TimedOut { timeout: Duration },

    #[snafu(display("failed to reach the Kubernetes API"))]
    Transport { source: kube::Error },

    #[snafu(display("{kind} object is missing its name or namespace"))]
    IncompleteObject { kind: String },

    #[snafu(display("failed to serialize {key}"))]
    SerializeObject {
        source: serde_json::Error,
        key: ObjectKey,
    },
}

impl Error {
    pub fn from_kube(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => Error::Rejected {
                code: response.code,
                reason: response.reason.clone(),
                message: response.message.clone(),
            },
            source => Error::Transport { source },
        }
    }

    /// Conflicts, throttling, server-side failures and anything that never reached the
    /// API server are worth another attempt. Validation and authorization failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Rejected { code, .. } => matches!(code, 408 | 409 | 429) || *code >= 500,
            Error::TimedOut { .. } | Error::Transport { .. } => true,
            Error::IncompleteObject { .. } | Error::SerializeObject { .. } => false,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Rejected { code: 403, .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Runs a Kubernetes API request, giving up after `timeout`.
pub async fn bounded<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.map_err(Error::from_kube),
        Err(_) => TimedOutSnafu { timeout }.fail(),
    }
}

/// Kinds making up the managed resource set of a tenant, declared in provisioning order.
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    Secret,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Secret(Secret),
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::Role(_) => ObjectKind::Role,
            ManagedObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ManagedObject::Secret(_) => ObjectKind::Secret,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedObject::ServiceAccount(o) => &o.metadata,
            ManagedObject::Role(o) => &o.metadata,
            ManagedObject::RoleBinding(o) => &o.metadata,
            ManagedObject::Secret(o) => &o.metadata,
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::ServiceAccount(o) => &mut o.metadata,
            ManagedObject::Role(o) => &mut o.metadata,
            ManagedObject::RoleBinding(o) => &mut o.metadata,
            ManagedObject::Secret(o) => &mut o.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey {
            kind: self.kind(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_LAST_APPLIED))
            .map(String::as_str)
    }

    /// Records a digest of the object's current content as its last-applied annotation.
    pub fn stamp_last_applied(mut self) -> Result<Self> {
        let mut content = self.clone();
        let meta = content.meta_mut();
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(ANNOTATION_LAST_APPLIED);
            if annotations.is_empty() {
                meta.annotations = None;
            }
        }
        let serialized = content
            .to_json()
            .with_context(|_| SerializeObjectSnafu { key: self.key() })?;
        let digest = format!("{:x}", Sha256::digest(serialized));

        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_LAST_APPLIED.to_string(), digest);
        Ok(self)
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            ManagedObject::ServiceAccount(o) => serde_json::to_vec(o),
            ManagedObject::Role(o) => serde_json::to_vec(o),
            ManagedObject::RoleBinding(o) => serde_json::to_vec(o),
            ManagedObject::Secret(o) => serde_json::to_vec(o),
        }
    }

    /// Whether the fields this hub manages differ between `self` (desired) and `observed`.
    ///
    /// Fields populated by the API server or other controllers are ignored.
    pub fn drifted_from(&self, observed: &ManagedObject) -> bool {
        let labels_missing = self.meta().labels.iter().flatten().any(|(key, value)| {
            observed.label(key) != Some(value.as_str())
        });
        if labels_missing {
            return true;
        }

        match (self, observed) {
            (ManagedObject::ServiceAccount(_), ManagedObject::ServiceAccount(_)) => false,
            (ManagedObject::Role(desired), ManagedObject::Role(observed)) => {
                desired.rules != observed.rules
            }
            (ManagedObject::RoleBinding(desired), ManagedObject::RoleBinding(observed)) => {
                desired.role_ref != observed.role_ref || desired.subjects != observed.subjects
            }
            (ManagedObject::Secret(desired), ManagedObject::Secret(observed)) => {
                desired.data.as_ref().filter(|data| !data.is_empty())
                    != observed.data.as_ref().filter(|data| !data.is_empty())
            }
            _ => true,
        }
    }
}

/// Operations the reconciler needs from the cluster.
///
/// Implementations bound every call in time and report timeouts as [`Error::TimedOut`].
pub trait ClusterApi: Send + Sync + 'static {
    /// Lists objects of `kind` across all namespaces matching the label selector.
    fn list(
        &self,
        kind: ObjectKind,
        label_selector: &str,
    ) -> impl Future<Output = Result<Vec<ManagedObject>>> + Send;

    /// Creates or updates the object using server-side apply.
    fn apply(&self, object: &ManagedObject) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the object. Deleting an object that is already gone succeeds.
    fn delete(&self, key: &ObjectKey) -> impl Future<Output = Result<()>> + Send;
}
