//! Operator-wide configuration
//!
//! Built once at startup from CLI arguments and environment, then shared
//! read-only with every component through `Arc<OperatorConfig>`.

use std::time::Duration;

/// Requeue delays used by the reconcile loop and the election engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeueDelays {
    /// State was just written; look again soon
    pub short: Duration,
    /// Waiting on the promotion job
    pub medium: Duration,
    /// Waiting on pods to converge
    pub wait: Duration,
    /// Steady state periodic resync
    pub long: Duration,
}

impl Default for RequeueDelays {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(2),
            medium: Duration::from_secs(5),
            wait: Duration::from_secs(10),
            long: Duration::from_secs(30),
        }
    }
}

/// Settings for the run-to-completion promotion job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromotionConfig {
    pub image: String,
    /// Script executed inside the elected pod
    pub script: String,
    pub shell: String,
    pub ttl_seconds_after_finished: i32,
    pub backoff_limit: i32,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            image: "alpine/k8s:1.25.6".to_string(),
            script: "sh /opt/repl/master".to_string(),
            shell: "/bin/bash".to_string(),
            ttl_seconds_after_finished: 300,
            backoff_limit: 6,
        }
    }
}

/// Metrics exporter sidecar settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExporterConfig {
    pub image: String,
    pub port: i32,
    pub path: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            image: "qwp1216/openldap-exporter:0.0.4".to_string(),
            port: 9142,
            path: "/metrics".to_string(),
        }
    }
}

/// Paths inside the directory server image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPaths {
    pub data: String,
    pub seed_data: String,
    pub tls: String,
}

impl Default for MountPaths {
    fn default() -> Self {
        Self {
            data: "/bitnami/openldap".to_string(),
            seed_data: "/ldifs".to_string(),
            tls: "/opt/bitnami/openldap/certs".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub field_manager: String,
    pub cluster_domain: String,
    pub requeue: RequeueDelays,
    pub promotion: PromotionConfig,
    pub exporter: ExporterConfig,
    pub paths: MountPaths,
    /// Upper bound for the error backoff
    pub max_backoff: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            field_manager: "openldap-operator".to_string(),
            cluster_domain: "cluster.local".to_string(),
            requeue: RequeueDelays::default(),
            promotion: PromotionConfig::default(),
            exporter: ExporterConfig::default(),
            paths: MountPaths::default(),
            max_backoff: Duration::from_secs(300),
        }
    }
}
