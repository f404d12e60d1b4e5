use std::collections::BTreeMap;

use crate::s3::{PushGatewayEndpoint, S3Credentials};

pub type SparkProperties = BTreeMap<String, String>;

const SIMPLE_CREDENTIALS_PROVIDER: &str = "org.apache.hadoop.fs.s3a.SimpleAWSCredentialsProvider";
const PROMETHEUS_SINK_CLASS: &str = "org.apache.spark.banzaicloud.metrics.sink.PrometheusSink";
const METRICS_NAME_CAPTURE_REGEX: &str = "([a-z0-9]*_[a-z0-9]*_[a-z0-9]*_)(.+)";
const METRICS_NAME_REPLACEMENT: &str = "$2";
const METRICS_PUSH_PERIOD_SECONDS: &str = "5";

/// Generates the complete set of Spark properties for a service account.
///
/// The result is always built from scratch out of the current inputs, so keys derived from
/// a previous credential set can never survive a rotation. Later inserts win when two inputs
/// produce the same key.
pub fn spark_properties(
    s3: Option<&S3Credentials>,
    pushgateway: Option<&PushGatewayEndpoint>,
) -> SparkProperties {
    let mut properties = SparkProperties::new();

    if let Some(s3) = s3 {
        properties.extend(s3_properties(s3));
    }
    if let Some(pushgateway) = pushgateway {
        properties.extend(metrics_sink_properties(pushgateway));
    }

    properties
}

fn s3_properties(s3: &S3Credentials) -> SparkProperties {
    let log_dir = s3.log_dir();
    let mut result = BTreeMap::from([
        ("spark.hadoop.fs.s3a.endpoint".to_string(), s3.endpoint()),
        (
            "spark.hadoop.fs.s3a.access.key".to_string(),
            s3.access_key().to_string(),
        ),
        (
            "spark.hadoop.fs.s3a.secret.key".to_string(),
            s3.secret_key().to_string(),
        ),
        (
            "spark.hadoop.fs.s3a.path.style.access".to_string(),
            s3.path_style().to_string(),
        ),
        (
            "spark.hadoop.fs.s3a.connection.ssl.enabled".to_string(),
            s3.ssl_enabled().to_string(),
        ),
        (
            "spark.hadoop.fs.s3a.aws.credentials.provider".to_string(),
            SIMPLE_CREDENTIALS_PROVIDER.to_string(),
        ),
        ("spark.eventLog.enabled".to_string(), "true".to_string()),
        ("spark.eventLog.dir".to_string(), log_dir.clone()),
        ("spark.history.fs.logDirectory".to_string(), log_dir),
    ]);
    if let Some(region) = s3.region() {
        result.insert(
            "spark.hadoop.fs.s3a.endpoint.region".to_string(),
            region.to_string(),
        );
    }
    result
}

fn metrics_sink_properties(pushgateway: &PushGatewayEndpoint) -> SparkProperties {
    let address = pushgateway.address();
    let mut result = SparkProperties::new();

    for instance in ["driver", "executor"] {
        let prefix = format!("spark.metrics.conf.{instance}.sink.prometheus");
        result.insert(format!("{prefix}.pushgateway-address"), address.clone());
        result.insert(format!("{prefix}.class"), PROMETHEUS_SINK_CLASS.to_string());
        result.insert(
            format!("{prefix}.enable-dropwizard-collector"),
            "true".to_string(),
        );
        result.insert(
            format!("{prefix}.period"),
            METRICS_PUSH_PERIOD_SECONDS.to_string(),
        );
        result.insert(
            format!("{prefix}.metrics-name-capture-regex"),
            METRICS_NAME_CAPTURE_REGEX.to_string(),
        );
        result.insert(
            format!("{prefix}.metrics-name-replacement"),
            METRICS_NAME_REPLACEMENT.to_string(),
        );
    }

    result
}
