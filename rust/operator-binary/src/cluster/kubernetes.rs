use std::{fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use stackable_operator::{
    k8s_openapi::{
        NamespaceResourceScope,
        api::{
            core::v1::{Secret, ServiceAccount},
            rbac::v1::{Role, RoleBinding},
        },
    },
    kube::{
        self, Api, Resource,
        api::{DeleteParams, ListParams, Patch, PatchParams},
    },
};

use super::{Error, IncompleteObjectSnafu, ManagedObject, ObjectKey, ObjectKind, Result, bounded};
use crate::constants::FIELD_MANAGER;

/// [`super::ClusterApi`] backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn list_all<K>(&self, label_selector: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = bounded(
            self.timeout,
            api.list(&ListParams::default().labels(label_selector)),
        )
        .await?;
        Ok(list.items)
    }

    async fn apply_one<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        K::DynamicType: Default,
    {
        let meta = object.meta();
        let (Some(name), Some(namespace)) = (meta.name.as_deref(), meta.namespace.as_deref())
        else {
            return IncompleteObjectSnafu {
                kind: K::kind(&K::DynamicType::default()).to_string(),
            }
            .fail();
        };
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        bounded(
            self.timeout,
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_one<K>(&self, key: &ObjectKey) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        match bounded(self.timeout, api.delete(&key.name, &DeleteParams::default())).await {
            Ok(_) | Err(Error::Rejected { code: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl super::ClusterApi for KubeCluster {
    async fn list(&self, kind: ObjectKind, label_selector: &str) -> Result<Vec<ManagedObject>> {
        Ok(match kind {
            ObjectKind::ServiceAccount => self
                .list_all::<ServiceAccount>(label_selector)
                .await?
                .into_iter()
                .map(ManagedObject::ServiceAccount)
                .collect(),
            ObjectKind::Role => self
                .list_all::<Role>(label_selector)
                .await?
                .into_iter()
                .map(ManagedObject::Role)
                .collect(),
            ObjectKind::RoleBinding => self
                .list_all::<RoleBinding>(label_selector)
                .await?
                .into_iter()
                .map(ManagedObject::RoleBinding)
                .collect(),
            ObjectKind::Secret => self
                .list_all::<Secret>(label_selector)
                .await?
                .into_iter()
                .map(ManagedObject::Secret)
                .collect(),
        })
    }

    async fn apply(&self, object: &ManagedObject) -> Result<()> {
        match object {
            ManagedObject::ServiceAccount(o) => self.apply_one(o).await,
            ManagedObject::Role(o) => self.apply_one(o).await,
            ManagedObject::RoleBinding(o) => self.apply_one(o).await,
            ManagedObject::Secret(o) => self.apply_one(o).await,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match key.kind {
            ObjectKind::ServiceAccount => self.delete_one::<ServiceAccount>(key).await,
            ObjectKind::Role => self.delete_one::<Role>(key).await,
            ObjectKind::RoleBinding => self.delete_one::<RoleBinding>(key).await,
            ObjectKind::Secret => self.delete_one::<Secret>(key).await,
        }
    }
}
