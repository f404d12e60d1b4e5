//! Parsing of the inbound relation data bags into typed values.
//!
//! This is the only place where untyped relation data is turned into
//! [`S3Credentials`] and [`PushGatewayEndpoint`]; everything downstream works
//! with the parsed values.
use std::{collections::BTreeMap, fmt};

use snafu::{OptionExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use url::Url;

pub type RawRelationData = BTreeMap<String, String>;

pub const ENDPOINT: &str = "endpoint";
pub const ACCESS_KEY: &str = "access-key";
pub const SECRET_KEY: &str = "secret-key";
pub const BUCKET: &str = "bucket";
pub const PATH: &str = "path";
pub const REGION: &str = "region";
pub const URI_STYLE: &str = "s3-uri-style";
pub const PUSH_ENDPOINT: &str = "push-endpoint";

#[derive(Snafu, Debug, Clone, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum CredentialError {
    #[snafu(display("relation data is missing the required field {field:?}"))]
    MissingField { field: &'static str },

    #[snafu(display("endpoint {endpoint:?} is not a valid URL: {reason}"))]
    MalformedUrl { endpoint: String, reason: String },

    #[snafu(display("unsupported value {value:?} for field {field:?}"))]
    InvalidValue { field: &'static str, value: String },
}

impl CredentialError {
    pub fn category(&self) -> &'static str {
        CredentialErrorDiscriminants::from(self).into()
    }
}

type Result<T, E = CredentialError> = std::result::Result<T, E>;

/// Connection details for the object storage that Spark writes event logs to.
///
/// The value is immutable: a credential rotation replaces it as a whole.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    endpoint: Url,
    access_key: String,
    secret_key: String,
    bucket: String,
    path: String,
    region: Option<String>,
    path_style: bool,
}

impl S3Credentials {
    /// The endpoint as handed to Spark, without a trailing slash.
    pub fn endpoint(&self) -> String {
        self.endpoint.as_str().trim_end_matches('/').to_string()
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn path_style(&self) -> bool {
        self.path_style
    }

    pub fn ssl_enabled(&self) -> bool {
        self.endpoint.scheme() == "https" || self.endpoint.port() == Some(443)
    }

    /// Location of the Spark event logs, e.g. `s3a://spark-logs/events`.
    pub fn log_dir(&self) -> String {
        if self.path.is_empty() {
            format!("s3a://{}", self.bucket)
        } else {
            format!("s3a://{}/{}", self.bucket, self.path)
        }
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("region", &self.region)
            .field("path_style", &self.path_style)
            .finish()
    }
}

/// Address of the Prometheus pushgateway that Spark jobs push their metrics to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushGatewayEndpoint {
    url: Url,
}

impl PushGatewayEndpoint {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` form as expected by the Spark Prometheus sink.
    pub fn address(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

fn required<'a>(raw: &'a RawRelationData, field: &'static str) -> Result<&'a str> {
    raw.get(field)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .context(MissingFieldSnafu { field })
}

fn optional<'a>(raw: &'a RawRelationData, field: &'static str) -> Option<&'a str> {
    raw.get(field)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_url(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint).map_err(|err| CredentialError::MalformedUrl {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => MalformedUrlSnafu {
            endpoint,
            reason: format!("expected an http(s) URL with a host, got scheme {scheme:?}"),
        }
        .fail(),
    }
}

/// Parses the `s3-credentials` relation data bag.
pub fn parse(raw: &RawRelationData) -> Result<S3Credentials> {
    let endpoint = parse_url(required(raw, ENDPOINT)?)?;
    let access_key = required(raw, ACCESS_KEY)?.to_string();
    let secret_key = required(raw, SECRET_KEY)?.to_string();
    let bucket = required(raw, BUCKET)?.to_string();

    let path_style = match optional(raw, URI_STYLE) {
        None | Some("path") => true,
        Some("host") => false,
        Some(other) => {
            return InvalidValueSnafu {
                field: URI_STYLE,
                value: other,
            }
            .fail();
        }
    };

    Ok(S3Credentials {
        endpoint,
        access_key,
        secret_key,
        bucket,
        path: optional(raw, PATH)
            .map(|path| path.trim_matches('/').to_string())
            .unwrap_or_default(),
        region: optional(raw, REGION).map(str::to_string),
        path_style,
    })
}

/// Parses the pushgateway relation data bag. A bare `host:port` is read as plain http.
pub fn parse_pushgateway(raw: &RawRelationData) -> Result<PushGatewayEndpoint> {
    let endpoint = required(raw, PUSH_ENDPOINT)?;
    let url = if endpoint.contains("://") {
        parse_url(endpoint)?
    } else {
        parse_url(&format!("http://{endpoint}"))?
    };
    Ok(PushGatewayEndpoint { url })
}
