//! Builds the Kubernetes objects that make up a tenant's Spark execution identity.
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        ByteString, Resource,
        api::{
            core::v1::{Secret, ServiceAccount},
            rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
        },
    },
    kvp::Labels,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    cluster::{self, ManagedObject, ObjectKey},
    constants::{APP_NAME, LABEL_MANAGED_BY, LABEL_TENANT, PROPERTIES_SECRET_PREFIX},
    properties::SparkProperties,
};

const POD_VERBS: &[&str] = &[
    "create",
    "get",
    "list",
    "watch",
    "delete",
    "deletecollection",
    "patch",
    "update",
];
const READ_VERBS: &[&str] = &["get", "list", "watch"];

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to build labels for tenant {tenant_id:?}"))]
    LabelBuild {
        source: stackable_operator::kvp::LabelError,
        tenant_id: String,
    },

    #[snafu(display("failed to stamp {key}"))]
    StampObject {
        source: cluster::Error,
        key: ObjectKey,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The full set of objects owned by one tenant, in provisioning order.
#[derive(Clone, Debug)]
pub struct ManagedResourceSet {
    pub tenant_id: String,
    pub objects: Vec<ManagedObject>,
}

impl ManagedResourceSet {
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.keys().any(|candidate| &candidate == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.objects.iter().map(ManagedObject::key)
    }
}

/// Label selector matching every object owned by `tenant_id`.
pub fn tenant_selector(tenant_id: &str) -> String {
    format!("{LABEL_MANAGED_BY}={APP_NAME},{LABEL_TENANT}={tenant_id}")
}

pub fn role_name(tenant_id: &str) -> String {
    format!("{tenant_id}-role")
}

pub fn role_binding_name(tenant_id: &str) -> String {
    format!("{tenant_id}-role-binding")
}

pub fn properties_secret_name(tenant_id: &str) -> String {
    format!("{PROPERTIES_SECRET_PREFIX}-{tenant_id}")
}

/// How consumers locate the properties Secret of a tenant: `<namespace>/<secret name>`.
pub fn config_reference(namespace: &str, tenant_id: &str) -> String {
    format!("{namespace}/{}", properties_secret_name(tenant_id))
}

fn tenant_labels(tenant_id: &str) -> Result<Labels> {
    Labels::try_from([(LABEL_MANAGED_BY, APP_NAME), (LABEL_TENANT, tenant_id)])
        .context(LabelBuildSnafu { tenant_id })
}

/// Builds the desired objects for a tenant, each stamped with its last-applied fingerprint.
pub fn build(
    tenant_id: &str,
    namespace: &str,
    properties: &SparkProperties,
) -> Result<ManagedResourceSet> {
    let labels = tenant_labels(tenant_id)?;
    let metadata = |name: String| {
        ObjectMetaBuilder::new()
            .name(name)
            .namespace(namespace)
            .with_labels(labels.clone())
            .build()
    };

    let service_account = ServiceAccount {
        metadata: metadata(tenant_id.to_string()),
        ..ServiceAccount::default()
    };

    let role = Role {
        metadata: metadata(role_name(tenant_id)),
        rules: Some(vec![
            policy_rule(&["pods"], POD_VERBS),
            policy_rule(&["configmaps", "services", "persistentvolumeclaims"], POD_VERBS),
            policy_rule(&["pods/log"], READ_VERBS),
        ]),
    };

    let role_binding = RoleBinding {
        metadata: metadata(role_binding_name(tenant_id)),
        role_ref: RoleRef {
            api_group: Role::GROUP.to_string(),
            kind: Role::KIND.to_string(),
            name: role_name(tenant_id),
        },
        subjects: Some(vec![Subject {
            api_group: Some(ServiceAccount::GROUP.to_string()),
            kind: ServiceAccount::KIND.to_string(),
            name: tenant_id.to_string(),
            namespace: Some(namespace.to_string()),
        }]),
    };

    let secret = Secret {
        metadata: metadata(properties_secret_name(tenant_id)),
        data: Some(
            properties
                .iter()
                .map(|(key, value)| (key.clone(), ByteString(value.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    };

    let objects = [
        ManagedObject::ServiceAccount(service_account),
        ManagedObject::Role(role),
        ManagedObject::RoleBinding(role_binding),
        ManagedObject::Secret(secret),
    ]
    .into_iter()
    .map(|object| {
        let key = object.key();
        object.stamp_last_applied().context(StampObjectSnafu { key })
    })
    .collect::<Result<Vec<_>>>()?;

    Ok(ManagedResourceSet {
        tenant_id: tenant_id.to_string(),
        objects,
    })
}

fn policy_rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}
