//! Relations between the hub and its peers, carried by labelled objects in the hub namespace.
//!
//! Inbound relation objects are watched and translated into [`HubEvent`]s. Outbound data bags
//! are written as ConfigMaps owned by the hub.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    future::Future,
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        ByteString, NamespaceResourceScope,
        api::core::v1::{ConfigMap, Secret},
    },
    kube::{
        self, Api, Resource, ResourceExt,
        api::{Patch, PatchParams},
        runtime::{WatchStreamExt, watcher},
    },
    kvp::Labels,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::sync::mpsc;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    cluster::{self, ManagedObject},
    constants::{
        APP_NAME, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_RELATION, MANAGED_BY_SELECTOR,
        PUSHGATEWAY_RELATION, S3_RELATION, SERVICE_ACCOUNT_RELATION,
    },
    dispatcher::{HubEvent, RelationData},
    s3::RawRelationData,
};

pub const REQUEST_SERVICE_ACCOUNT: &str = "service-account";
pub const REQUEST_NAMESPACE: &str = "namespace";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to write the {bag:?} data bag"))]
    WriteDataBag { bag: String, source: cluster::Error },

    #[snafu(display("failed to build labels for the {bag:?} data bag"))]
    DataBagLabels {
        bag: String,
        source: stackable_operator::kvp::LabelError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[snafu(display("request is missing the {field:?} field"))]
    MissingRequestField { field: &'static str },

    #[snafu(display("{value:?} is not a valid {field}: {reason}"))]
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// A request for a Spark service account, as read from a request ConfigMap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRequest {
    pub tenant_id: String,
    pub namespace: String,
}

/// Checks `value` is an RFC 1123 label, so it can serve as object name and label value alike.
fn validate_name(field: &'static str, value: &str) -> Result<(), RequestError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.len() > 63 {
        Some("must be at most 63 characters")
    } else if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        Some("must consist of lower case alphanumeric characters or '-'")
    } else if value.starts_with('-') || value.ends_with('-') {
        Some("must start and end with an alphanumeric character")
    } else {
        None
    };
    match reason {
        Some(reason) => InvalidNameSnafu {
            field,
            value,
            reason,
        }
        .fail(),
        None => Ok(()),
    }
}

/// Parses a service account request.
///
/// The namespace is read from its own field, or from a `namespace:name` service account when
/// that field is absent.
pub fn parse_request(data: &RawRelationData) -> Result<AccountRequest, RequestError> {
    let field = |key: &str| {
        data.get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };
    let service_account = field(REQUEST_SERVICE_ACCOUNT).ok_or(
        RequestError::MissingRequestField {
            field: REQUEST_SERVICE_ACCOUNT,
        },
    )?;

    let (namespace, tenant_id) = match (field(REQUEST_NAMESPACE), service_account.split_once(':'))
    {
        (Some(namespace), _) => (namespace, service_account),
        (None, Some((namespace, name))) => (namespace, name),
        (None, None) => {
            return MissingRequestFieldSnafu {
                field: REQUEST_NAMESPACE,
            }
            .fail();
        }
    };
    validate_name("namespace", namespace)?;
    validate_name("service account name", tenant_id)?;

    Ok(AccountRequest {
        tenant_id: tenant_id.to_string(),
        namespace: namespace.to_string(),
    })
}

/// Destination for outbound relation data.
pub trait RelationStore: Send + Sync + 'static {
    /// Replaces the content of the data bag `bag`.
    fn write(
        &self,
        bag: &str,
        data: BTreeMap<String, String>,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub fn data_bag_name(bag: &str) -> String {
    format!("{APP_NAME}-{bag}")
}

/// Writes data bags as ConfigMaps in the hub namespace.
pub struct KubeRelationStore {
    client: kube::Client,
    namespace: String,
    timeout: Duration,
}

impl KubeRelationStore {
    pub fn new(client: kube::Client, namespace: String, timeout: Duration) -> Self {
        Self {
            client,
            namespace,
            timeout,
        }
    }
}

impl RelationStore for KubeRelationStore {
    async fn write(&self, bag: &str, data: BTreeMap<String, String>) -> Result<()> {
        let name = data_bag_name(bag);
        let config_map = ConfigMap {
            metadata: ObjectMetaBuilder::new()
                .name(&name)
                .namespace(&self.namespace)
                .with_labels(
                    Labels::try_from([(LABEL_MANAGED_BY, APP_NAME)])
                        .context(DataBagLabelsSnafu { bag })?,
                )
                .build(),
            data: Some(data),
            ..ConfigMap::default()
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let request = api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        );
        cluster::bounded(self.timeout, request)
            .await
            .context(WriteDataBagSnafu { bag })?;
        Ok(())
    }
}

fn relation_selector(relation: &str) -> String {
    format!("{LABEL_RELATION}={relation}")
}

fn secret_data(secret: &Secret) -> RawRelationData {
    let mut data: RawRelationData = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(key, ByteString(value))| {
            Some((key.clone(), String::from_utf8(value.clone()).ok()?))
        })
        .collect();
    data.extend(secret.string_data.clone().unwrap_or_default());
    data
}

/// Reduced view of a watch stream.
///
/// Every (re-)list is framed by `Relisting` and `Synced`. Objects deleted while the watch was
/// down produce no `Deleted`; they are only noticed by not being listed again.
enum Observed<K> {
    Relisting,
    Applied(K),
    Deleted(K),
    Synced,
}

fn observe<K>(api: Api<K>, selector: &str) -> impl Stream<Item = Observed<K>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, watcher::Config::default().labels(selector))
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object)) => {
                    Some(Observed::Applied(object))
                }
                Ok(watcher::Event::Delete(object)) => Some(Observed::Deleted(object)),
                Ok(watcher::Event::InitDone) => Some(Observed::Synced),
                Ok(watcher::Event::Init) => Some(Observed::Relisting),
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "watch stream failed, retrying"
                    );
                    None
                }
            }
        })
}

/// Follows a relation carried by a single object, reporting it gone when a listing ends
/// without it.
#[derive(Default)]
struct PresenceTracker {
    present: bool,
}

impl PresenceTracker {
    fn next<K>(
        &mut self,
        observed: Observed<K>,
        changed: impl FnOnce(K) -> HubEvent,
        gone: HubEvent,
    ) -> Option<HubEvent> {
        match observed {
            Observed::Relisting => {
                self.present = false;
                None
            }
            Observed::Applied(object) => {
                self.present = true;
                Some(changed(object))
            }
            Observed::Deleted(_) => {
                self.present = false;
                Some(gone)
            }
            Observed::Synced if !self.present => Some(gone),
            Observed::Synced => None,
        }
    }
}

/// Follows the S3 credentials Secret.
pub async fn watch_s3_credentials(
    client: kube::Client,
    namespace: String,
    tx: mpsc::Sender<HubEvent>,
) {
    let api: Api<Secret> = Api::namespaced(client, &namespace);
    let mut presence = PresenceTracker::default();
    let events = observe(api, &relation_selector(S3_RELATION));
    futures::pin_mut!(events);
    while let Some(observed) = events.next().await {
        let Some(event) = presence.next(
            observed,
            |secret| HubEvent::S3CredentialsChanged(RelationData(secret_data(&secret))),
            HubEvent::S3CredentialsGone,
        ) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Follows the pushgateway ConfigMap.
pub async fn watch_pushgateway(
    client: kube::Client,
    namespace: String,
    tx: mpsc::Sender<HubEvent>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let mut presence = PresenceTracker::default();
    let events = observe(api, &relation_selector(PUSHGATEWAY_RELATION));
    futures::pin_mut!(events);
    while let Some(observed) = events.next().await {
        let Some(event) = presence.next(
            observed,
            |config_map| {
                HubEvent::PushGatewayChanged(RelationData(config_map.data.unwrap_or_default()))
            },
            HubEvent::PushGatewayGone,
        ) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Tracks which tenant each request ConfigMap asks for, so edits and deletions release the
/// tenant that was previously requested.
#[derive(Default)]
struct RequestTracker {
    by_object: BTreeMap<String, String>,
    /// Objects seen since the current listing started.
    relisted: Option<BTreeSet<String>>,
}

impl RequestTracker {
    fn relisting(&mut self) {
        self.relisted = Some(BTreeSet::new());
    }

    fn applied(&mut self, object: String, data: &RawRelationData) -> Vec<HubEvent> {
        if let Some(relisted) = &mut self.relisted {
            relisted.insert(object.clone());
        }
        let mut events = Vec::new();
        let request = match parse_request(data) {
            Ok(request) => Some(request),
            Err(error) => {
                tracing::warn!(
                    request = %object,
                    error = &error as &dyn std::error::Error,
                    "ignoring invalid service account request"
                );
                None
            }
        };
        let requested = request.as_ref().map(|r| r.tenant_id.clone());

        if self
            .by_object
            .get(&object)
            .is_some_and(|previous| Some(previous) != requested.as_ref())
        {
            events.extend(self.released(&object));
        }
        if let Some(AccountRequest {
            tenant_id,
            namespace,
        }) = request
        {
            self.by_object.insert(object, tenant_id.clone());
            events.push(HubEvent::AccountRequested {
                tenant_id,
                namespace,
            });
        }
        events
    }

    fn released(&mut self, object: &str) -> Option<HubEvent> {
        let tenant_id = self.by_object.remove(object)?;
        // Another request may still ask for the same tenant.
        if self.by_object.values().any(|t| *t == tenant_id) {
            return None;
        }
        Some(HubEvent::AccountReleased { tenant_id })
    }

    /// Releases requests that vanished while the watch was down, then reports the complete
    /// set of requested tenants.
    fn synced(&mut self) -> Vec<HubEvent> {
        let mut events = Vec::new();
        if let Some(relisted) = self.relisted.take() {
            let vanished: Vec<String> = self
                .by_object
                .keys()
                .filter(|object| !relisted.contains(*object))
                .cloned()
                .collect();
            for object in vanished {
                events.extend(self.released(&object));
            }
        }
        events.push(HubEvent::RequestsSynced {
            tenants: self.by_object.values().cloned().collect(),
        });
        events
    }
}

/// Follows the service account request ConfigMaps.
pub async fn watch_account_requests(
    client: kube::Client,
    namespace: String,
    tx: mpsc::Sender<HubEvent>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let mut tracker = RequestTracker::default();
    let events = observe(api, &relation_selector(SERVICE_ACCOUNT_RELATION));
    futures::pin_mut!(events);
    while let Some(observed) = events.next().await {
        let hub_events = match observed {
            Observed::Relisting => {
                tracker.relisting();
                Vec::new()
            }
            Observed::Applied(config_map) => {
                let name = config_map.name_any();
                tracker.applied(name, &config_map.data.unwrap_or_default())
            }
            Observed::Deleted(config_map) => {
                tracker.released(&config_map.name_any()).into_iter().collect()
            }
            Observed::Synced => tracker.synced(),
        };
        for event in hub_events {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn watch_kind<K>(
    client: kube::Client,
    tx: mpsc::Sender<HubEvent>,
    wrap: fn(K) -> ManagedObject,
) where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    let events = observe(Api::<K>::all(client), MANAGED_BY_SELECTOR);
    futures::pin_mut!(events);
    while let Some(observed) = events.next().await {
        let event = match observed {
            Observed::Applied(object) => HubEvent::ManagedObjectApplied(wrap(object)),
            Observed::Deleted(object) => HubEvent::ManagedObjectDeleted(wrap(object)),
            Observed::Relisting | Observed::Synced => continue,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Follows every object the hub manages, so out-of-band edits and deletions get repaired.
pub async fn watch_managed_objects(client: kube::Client, tx: mpsc::Sender<HubEvent>) {
    futures::join!(
        watch_kind(client.clone(), tx.clone(), ManagedObject::ServiceAccount)
            .instrument(info_span!("watch", kind = "ServiceAccount")),
        watch_kind(client.clone(), tx.clone(), ManagedObject::Role)
            .instrument(info_span!("watch", kind = "Role")),
        watch_kind(client.clone(), tx.clone(), ManagedObject::RoleBinding)
            .instrument(info_span!("watch", kind = "RoleBinding")),
        watch_kind::<Secret>(client, tx, ManagedObject::Secret)
            .instrument(info_span!("watch", kind = "Secret")),
    );
}
