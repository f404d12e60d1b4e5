use std::sync::Arc;

use clap::Parser;
use futures::{FutureExt, pin_mut, select};
use stackable_operator::{cli::RunArguments, telemetry::Tracing};
use tokio::sync::mpsc;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    cluster::KubeCluster,
    config::{Command, HubRunArguments},
    constants::OPERATOR_NAME,
    dispatcher::{EVENT_CHANNEL_CAPACITY, Hub, HubEvent},
    publisher::RelationPublisher,
    reconciler::Reconciler,
    relation::KubeRelationStore,
    storage::S3Verifier,
};

mod backoff;
mod cluster;
mod config;
mod constants;
mod dispatcher;
mod metrics;
mod properties;
mod publisher;
mod reconciler;
mod registry;
mod relation;
mod resources;
mod s3;
mod storage;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(HubRunArguments {
            // The shared Stackable operator flags are accepted so the hub deploys like the
            // other operators. Only the common options are used: the hub owns no product
            // config, watches its own namespace and runs no maintenance tasks.
            operator:
                RunArguments {
                    operator_environment: _,
                    watch_namespace: _,
                    product_config: _,
                    maintenance: _,
                    common,
                },
            hub,
        }) => {
            // Console and file logging are configured through `CONSOLE_LOG`, `FILE_LOG` and
            // `ROLLING_LOGS_DIR`, see `Tracing::pre_configured`.
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, common.telemetry).init()?;

            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                hub_namespace = %hub.hub_namespace,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &common.cluster_info,
            )
            .await?;
            let kube_client = client.as_kube_client();

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let hub_runner = Hub::new(
                Reconciler::new(
                    Arc::new(KubeCluster::new(kube_client.clone(), hub.api_timeout())),
                    hub.retry_policy(),
                ),
                RelationPublisher::new(KubeRelationStore::new(
                    kube_client.clone(),
                    hub.hub_namespace.clone(),
                    hub.api_timeout(),
                )),
                S3Verifier::new(hub.api_timeout()),
                tx.clone(),
            )?
            .run(rx)
            .instrument(info_span!("hub"));

            tokio::spawn(
                relation::watch_s3_credentials(
                    kube_client.clone(),
                    hub.hub_namespace.clone(),
                    tx.clone(),
                )
                .instrument(info_span!("watch_s3_credentials")),
            );
            tokio::spawn(
                relation::watch_pushgateway(
                    kube_client.clone(),
                    hub.hub_namespace.clone(),
                    tx.clone(),
                )
                .instrument(info_span!("watch_pushgateway")),
            );
            tokio::spawn(
                relation::watch_account_requests(
                    kube_client.clone(),
                    hub.hub_namespace.clone(),
                    tx.clone(),
                )
                .instrument(info_span!("watch_account_requests")),
            );
            tokio::spawn(
                relation::watch_managed_objects(kube_client, tx.clone())
                    .instrument(info_span!("watch_managed_objects")),
            );

            let status_interval = hub.status_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(status_interval);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(HubEvent::UpdateStatus).await.is_err() {
                        break;
                    }
                }
            });

            let hub_runner = hub_runner.fuse();
            let shutdown = tokio::signal::ctrl_c().fuse();
            pin_mut!(hub_runner, shutdown);
            select! {
                () = hub_runner => tracing::warn!("hub stopped"),
                signal = shutdown => {
                    signal?;
                    tracing::info!("received shutdown signal");
                }
            };
        }
    }
    Ok(())
}
