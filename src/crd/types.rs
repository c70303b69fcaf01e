//! Shared types used by the OpenldapCluster CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, EnvVar, PersistentVolumeClaimSpec, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, Toleration,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROOT: &str = "dc=example,dc=com";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_CONFIG_USERNAME: &str = "config";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LDAP_PORT: i32 = 1389;
pub const DEFAULT_LDAPS_PORT: i32 = 1636;
pub const DEFAULT_CA_FILE: &str = "ca.crt";
pub const DEFAULT_CERT_FILE: &str = "cert.crt";
pub const DEFAULT_KEY_FILE: &str = "cert.key";
pub const DEFAULT_MONITOR_INTERVAL: &str = "30s";

/// Pod-level overrides applied to every unit of the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Extra environment variables appended after the generated ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub env: Option<Vec<EnvVar>>,

    /// Annotations added to the pod template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Persistent storage for each unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub volume_claim_template: PersistentVolumeClaimSpec,
}

/// Listening ports of the directory server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    #[serde(default = "default_ldap_port")]
    pub ldap: i32,
    #[serde(default = "default_ldaps_port")]
    pub ldaps: i32,
}

fn default_ldap_port() -> i32 {
    DEFAULT_LDAP_PORT
}

fn default_ldaps_port() -> i32 {
    DEFAULT_LDAPS_PORT
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            ldap: DEFAULT_LDAP_PORT,
            ldaps: DEFAULT_LDAPS_PORT,
        }
    }
}

/// TLS settings. The secret is mounted into every unit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

/// LDIF files loaded on first start, from either a Secret or a ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub secret: Option<SecretVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub config_map: Option<ConfigMapVolumeSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenldapConfig {
    /// Base DN of the directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub admin_password: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub config_password: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_data: Option<SeedData>,
}

/// Prometheus scrape registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Labels added to the ServiceMonitor so a Prometheus instance selects it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_timeout: Option<String>,
}

/// Kubernetes-style condition
///
/// # Examples
///
/// ```rust
/// use openldap_k8s::crd::Condition;
///
/// let condition = Condition::new("Ready", true, "ClusterReady", "Master is serving writes");
/// assert!(condition.is_true());
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition: "Initialized", "Ready" or "Elected"
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True" or "False"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
