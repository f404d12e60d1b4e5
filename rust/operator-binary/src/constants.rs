use const_format::concatcp;

pub const APP_NAME: &str = "spark-integration-hub";
pub const OPERATOR_NAME: &str = "integration-hub.spark.stackable.tech";
pub const FIELD_MANAGER: &str = APP_NAME;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_TENANT: &str = concatcp!(OPERATOR_NAME, "/tenant");
pub const LABEL_RELATION: &str = concatcp!(OPERATOR_NAME, "/relation");
pub const ANNOTATION_LAST_APPLIED: &str = concatcp!(OPERATOR_NAME, "/last-applied");

pub const MANAGED_BY_SELECTOR: &str = concatcp!(LABEL_MANAGED_BY, "=", APP_NAME);

pub const S3_RELATION: &str = "s3-credentials";
pub const PUSHGATEWAY_RELATION: &str = "pushgateway";
pub const SERVICE_ACCOUNT_RELATION: &str = "spark-service-account";
pub const STATUS_DATA_BAG: &str = "status";

pub const PROPERTIES_SECRET_PREFIX: &str = "configuration-hub-conf";

pub const METRICS_JOB_NAME: &str = APP_NAME;
