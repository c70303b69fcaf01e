//! OpenldapCluster Custom Resource Definition
//!
//! An OpenldapCluster is one writable master plus read-only replicas, run as a
//! StatefulSet. The status subresource records which unit is elected master.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, PodAffinityTerm, PodAntiAffinity, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, MonitorConfig, OpenldapConfig, PodTemplateConfig, PortConfig, StorageConfig,
    TlsConfig, DEFAULT_ADMIN_USERNAME, DEFAULT_CA_FILE, DEFAULT_CERT_FILE, DEFAULT_CONFIG_USERNAME,
    DEFAULT_KEY_FILE, DEFAULT_LOG_LEVEL, DEFAULT_MONITOR_INTERVAL, DEFAULT_ROOT,
};

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const ROLE_MASTER: &str = "master";
pub const ROLE_SLAVE: &str = "slave";

/// Structured validation error for `OpenldapClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "openldap.kwonjin.click",
    version = "v1",
    kind = "OpenldapCluster",
    namespaced,
    status = "OpenldapClusterStatus",
    shortname = "olc",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Master","type":"string","jsonPath":".status.currentMaster"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenldapClusterSpec {
    /// Directory server image, e.g. `bitnami/openldap:2.6.6`
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateConfig>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openldap_config: Option<OpenldapConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,
}

fn default_replicas() -> i32 {
    1
}

/// Observed state, written only through the status subresource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenldapClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Pod chosen to become master; empty while unset
    #[serde(default)]
    pub desired_master: String,

    /// Pod confirmed as master after promotion completed
    #[serde(default)]
    pub current_master: String,

    /// Number of failovers started since creation
    #[serde(default)]
    pub failover_count: u32,
}

impl OpenldapClusterSpec {
    /// Fill every missing optional section with its default.
    ///
    /// Returns true when anything was changed. `cluster_name` is needed for
    /// the anti-affinity selector.
    pub fn apply_defaults(&mut self, cluster_name: &str) -> bool {
        let before = self.clone();

        let config = self.openldap_config.get_or_insert_with(Default::default);
        config.root.get_or_insert_with(|| DEFAULT_ROOT.to_string());
        config
            .admin_username
            .get_or_insert_with(|| DEFAULT_ADMIN_USERNAME.to_string());
        config
            .config_username
            .get_or_insert_with(|| DEFAULT_CONFIG_USERNAME.to_string());
        config
            .log_level
            .get_or_insert_with(|| DEFAULT_LOG_LEVEL.to_string());

        let tls = config.tls.get_or_insert_with(TlsConfig::default);
        if tls.enabled {
            tls.ca_file.get_or_insert_with(|| DEFAULT_CA_FILE.to_string());
            tls.cert_file
                .get_or_insert_with(|| DEFAULT_CERT_FILE.to_string());
            tls.key_file.get_or_insert_with(|| DEFAULT_KEY_FILE.to_string());
        }

        self.ports.get_or_insert_with(PortConfig::default);

        let monitor = self.monitor.get_or_insert_with(MonitorConfig::default);
        monitor
            .interval
            .get_or_insert_with(|| DEFAULT_MONITOR_INTERVAL.to_string());

        let template = self.template.get_or_insert_with(Default::default);
        if template.affinity.is_none() {
            template.affinity = Some(default_affinity(cluster_name));
        }

        *self != before
    }

    /// Validate the spec, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.image",
                "image must not be empty",
                "Set spec.image to an OpenLDAP image such as bitnami/openldap:2.6.6.",
            ));
        }

        if self.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                format!("replicas must be at least 1, got {}", self.replicas),
                "Set spec.replicas to 1 or more.",
            ));
        }

        if let Some(tls) = self.tls() {
            if tls.enabled && tls.secret_name.as_deref().unwrap_or("").is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.openldapConfig.tls.secretName",
                    "TLS is enabled but no certificate secret is named",
                    "Set spec.openldapConfig.tls.secretName to a Secret holding the CA, certificate and key.",
                ));
            }
        }

        let ports = self.ports.clone().unwrap_or_default();
        if ports.ldap == ports.ldaps {
            errors.push(SpecValidationError::new(
                "spec.ports",
                "ldap and ldaps ports must differ",
                "Choose distinct values for spec.ports.ldap and spec.ports.ldaps.",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate against a running cluster whose resources were built with
    /// `tls_was_enabled`
    pub fn validate_update(&self, tls_was_enabled: bool) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = match self.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        if self.tls_enabled() != tls_was_enabled {
            errors.push(SpecValidationError::new(
                "spec.openldapConfig.tls.enabled",
                "TLS cannot be enabled or disabled after creation",
                "Recreate the cluster to change its TLS mode.",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.openldap_config.as_ref().and_then(|c| c.tls.as_ref())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls().map(|t| t.enabled).unwrap_or(false)
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn ldap_port(&self) -> i32 {
        self.ports.as_ref().map(|p| p.ldap).unwrap_or(super::types::DEFAULT_LDAP_PORT)
    }

    pub fn ldaps_port(&self) -> i32 {
        self.ports.as_ref().map(|p| p.ldaps).unwrap_or(super::types::DEFAULT_LDAPS_PORT)
    }

    pub fn root(&self) -> &str {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.root.as_deref())
            .unwrap_or(DEFAULT_ROOT)
    }

    pub fn admin_username(&self) -> &str {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.admin_username.as_deref())
            .unwrap_or(DEFAULT_ADMIN_USERNAME)
    }

    pub fn config_username(&self) -> &str {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.config_username.as_deref())
            .unwrap_or(DEFAULT_CONFIG_USERNAME)
    }

    pub fn log_level(&self) -> &str {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.log_level.as_deref())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn admin_password(&self) -> Option<&SecretKeySelector> {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.admin_password.as_ref())
    }

    pub fn config_password(&self) -> Option<&SecretKeySelector> {
        self.openldap_config
            .as_ref()
            .and_then(|c| c.config_password.as_ref())
    }

    /// Image tag used for the version label; `latest` when untagged
    pub fn image_tag(&self) -> &str {
        let last_segment = self.image.rsplit('/').next().unwrap_or(&self.image);
        last_segment
            .split_once(':')
            .map(|(_, tag)| tag)
            .filter(|tag| !tag.is_empty())
            .unwrap_or("latest")
    }
}

/// Required anti-affinity spreading units across nodes
fn default_affinity(cluster_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: LABEL_NAME.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![cluster_name.to_string()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl OpenldapCluster {
    pub fn pod_name(&self, index: i32) -> String {
        format!("{}-{}", self.name_any(), index)
    }

    /// Claim created by the StatefulSet for the unit at `index`
    pub fn claim_name(&self, index: i32) -> String {
        format!("data-{}-{}", self.name_any(), index)
    }

    pub fn write_service_name(&self) -> String {
        format!("{}-write", self.name_any())
    }

    pub fn read_service_name(&self) -> String {
        format!("{}-read", self.name_any())
    }

    pub fn metrics_service_name(&self) -> String {
        format!("{}-metrics", self.name_any())
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    pub fn exporter_name(&self) -> String {
        format!("{}-exporter", self.name_any())
    }

    pub fn init_container_name(&self) -> String {
        format!("{}-init", self.name_any())
    }

    /// Name of the promotion job for the current desired master
    pub fn promotion_job_name(&self) -> String {
        format!("{}-promotion", self.desired_master())
    }

    pub fn admin_dn(&self) -> String {
        format!("cn={},{}", self.spec.admin_username(), self.spec.root())
    }

    /// Stable labels used in selectors; they never change over the cluster's life
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), self.name_any()),
            (LABEL_INSTANCE.to_string(), "openldap".to_string()),
        ])
    }

    /// Selector labels plus the running image version
    pub fn versioned_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_VERSION.to_string(), self.spec.image_tag().to_string());
        labels
    }

    pub fn master_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_COMPONENT.to_string(), ROLE_MASTER.to_string());
        labels
    }

    pub fn slave_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_COMPONENT.to_string(), ROLE_SLAVE.to_string());
        labels
    }

    pub fn job_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), self.name_any()),
            (LABEL_INSTANCE.to_string(), "election".to_string()),
        ])
    }

    pub fn desired_master(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.desired_master.as_str())
            .unwrap_or("")
    }

    pub fn current_master(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.current_master.as_str())
            .unwrap_or("")
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}
