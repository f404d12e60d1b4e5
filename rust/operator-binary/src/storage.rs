//! Checks S3 credentials against the object store they point at.
//!
//! Parsing only proves the relation data is complete. A bucket listing proves the endpoint is
//! reachable and accepts the keys.
use std::{future::Future, time::Duration};

use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Config, Credentials, Region},
};
use snafu::{ResultExt, Snafu};

use crate::s3::S3Credentials;

/// Used when the relation names no region. Most S3 compatible stores ignore it.
const DEFAULT_REGION: &str = "us-east-1";
const CREDENTIALS_SOURCE: &str = "s3-relation";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to list buckets at {endpoint}"))]
    ListBuckets {
        source: aws_sdk_s3::Error,
        endpoint: String,
    },

    #[snafu(display("{endpoint} did not answer within {timeout:?}"))]
    TimedOut { endpoint: String, timeout: Duration },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, credentials: &S3Credentials) -> impl Future<Output = Result<()>> + Send;
}

/// Verifies credentials by listing the buckets they can see.
pub struct S3Verifier {
    timeout: Duration,
}

impl S3Verifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn client(credentials: &S3Credentials) -> Client {
    let config = Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(
            credentials.region().unwrap_or(DEFAULT_REGION).to_string(),
        ))
        .endpoint_url(credentials.endpoint())
        .force_path_style(credentials.path_style())
        .credentials_provider(Credentials::new(
            credentials.access_key(),
            credentials.secret_key(),
            None,
            None,
            CREDENTIALS_SOURCE,
        ))
        .build();
    Client::from_conf(config)
}

impl CredentialVerifier for S3Verifier {
    async fn verify(&self, credentials: &S3Credentials) -> Result<()> {
        let endpoint = credentials.endpoint();
        let request = client(credentials).list_buckets().send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(response) => {
                response
                    .map_err(aws_sdk_s3::Error::from)
                    .context(ListBucketsSnafu { endpoint })?;
                Ok(())
            }
            Err(_) => TimedOutSnafu {
                endpoint,
                timeout: self.timeout,
            }
            .fail(),
        }
    }
}
