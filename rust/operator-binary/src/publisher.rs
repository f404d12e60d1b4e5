use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::logging::controller::ReconcilerError;
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    constants::SERVICE_ACCOUNT_RELATION,
    registry::{TenantAccount, TenantStatus},
    relation::{self, RelationStore},
    resources::config_reference,
};

pub const SERVICE_ACCOUNTS_KEY: &str = "service-accounts";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum PublishError {
    #[snafu(display("failed to serialize the service account descriptors"))]
    SerializeDescriptors { source: serde_json::Error },

    #[snafu(display("failed to publish relation data"))]
    WriteRelation { source: relation::Error },
}

impl ReconcilerError for PublishError {
    fn category(&self) -> &'static str {
        PublishErrorDiscriminants::from(self).into()
    }
}

type Result<T, E = PublishError> = std::result::Result<T, E>;

/// What a consumer needs to run Spark as a provisioned service account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountDescriptor {
    pub tenant_id: String,
    pub namespace: String,
    pub config_reference: String,
}

impl ServiceAccountDescriptor {
    fn for_account(account: &TenantAccount) -> Self {
        Self {
            tenant_id: account.tenant_id.clone(),
            namespace: account.namespace.clone(),
            config_reference: config_reference(&account.namespace, &account.tenant_id),
        }
    }
}

/// Descriptors of the provisioned accounts, in registration order.
pub fn descriptors(accounts: &[TenantAccount]) -> Vec<ServiceAccountDescriptor> {
    accounts
        .iter()
        .filter(|account| account.status == TenantStatus::Provisioned)
        .map(ServiceAccountDescriptor::for_account)
        .collect()
}

/// Writes outbound data bags, skipping writes that would not change anything.
pub struct RelationPublisher<S> {
    store: S,
    published: HashMap<String, BTreeMap<String, String>>,
}

impl<S: RelationStore> RelationPublisher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            published: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publishes the provisioned accounts on the service account relation.
    pub async fn publish(&mut self, accounts: &[TenantAccount]) -> Result<bool> {
        let serialized =
            serde_json::to_string(&descriptors(accounts)).context(SerializeDescriptorsSnafu)?;
        self.publish_bag(
            SERVICE_ACCOUNT_RELATION,
            BTreeMap::from([(SERVICE_ACCOUNTS_KEY.to_string(), serialized)]),
        )
        .await
    }

    /// Writes `data` to `bag` unless it is what was last written there.
    ///
    /// Returns whether a write happened. A failed write forgets the cached state so the next
    /// call writes again.
    pub async fn publish_bag(&mut self, bag: &str, data: BTreeMap<String, String>) -> Result<bool> {
        if self.published.get(bag) == Some(&data) {
            return Ok(false);
        }
        match self.store.write(bag, data.clone()).await {
            Ok(()) => {
                tracing::debug!(bag, "published relation data");
                self.published.insert(bag.to_string(), data);
                Ok(true)
            }
            Err(source) => {
                self.published.remove(bag);
                Err(PublishError::WriteRelation { source })
            }
        }
    }
}
