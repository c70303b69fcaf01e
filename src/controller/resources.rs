//! Kubernetes resource builders for OpenldapCluster
//!
//! Every builder is a pure function of the cluster and the operator
//! configuration. Creating and updating the objects is the job of the
//! synchronizers in `sync.rs`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy,
    StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource,
    PersistentVolumeClaim, Pod, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretVolumeSource, SecurityContext, Service, ServiceAccount,
    ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::config::OperatorConfig;
use crate::crd::service_monitor::{Endpoint, NamespaceSelector};
use crate::crd::{
    OpenldapCluster, ServiceMonitor, ServiceMonitorSpec, DEFAULT_CA_FILE, DEFAULT_CERT_FILE,
    DEFAULT_KEY_FILE, LABEL_MANAGED_BY, LABEL_NAME,
};

pub const MANAGED_BY: &str = "openldap-operator";
pub const CONFIG_HASH_ANNOTATION: &str = "openldap.kwonjin.click/config-hash";
pub const TEMPLATE_HASH_ANNOTATION: &str = "openldap.kwonjin.click/template-hash";
pub const TARGET_UID_ANNOTATION: &str = "openldap.kwonjin.click/target-uid";
pub const TARGET_POD_ANNOTATION: &str = "openldap.kwonjin.click/target-pod";
/// ConfigMap key recording whether the directory was built with TLS
pub const ENABLE_TLS_KEY: &str = "LDAP_ENABLE_TLS";

const DATA_VOLUME: &str = "data";
const SEED_VOLUME: &str = "ldifs";
const TLS_VOLUME: &str = "tls";
const METRICS_PORT_NAME: &str = "metrics";

/// Labels put on every object the operator creates
pub fn standard_labels(cluster: &OpenldapCluster) -> BTreeMap<String, String> {
    let mut labels = cluster.versioned_labels();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &OpenldapCluster) -> OwnerReference {
    OwnerReference {
        api_version: OpenldapCluster::api_version(&()).to_string(),
        kind: OpenldapCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn object_meta(cluster: &OpenldapCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(standard_labels(cluster)),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

// ============================================================================
// RBAC
// ============================================================================

pub fn build_service_account(cluster: &OpenldapCluster) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(cluster, cluster.name_any()),
        ..Default::default()
    }
}

/// Role allowing the promotion job to exec into directory pods
pub fn build_role(cluster: &OpenldapCluster) -> Role {
    Role {
        metadata: object_meta(cluster, cluster.name_any()),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods/exec".to_string()]),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]),
    }
}

pub fn build_role_binding(cluster: &OpenldapCluster) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(cluster, cluster.name_any()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: cluster.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: cluster.name_any(),
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}

// ============================================================================
// ConfigMap
// ============================================================================

/// Environment handed to the directory server through `envFrom`
pub fn config_map_data(
    cluster: &OpenldapCluster,
    config: &OperatorConfig,
) -> BTreeMap<String, String> {
    let spec = &cluster.spec;
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();

    let mut data = BTreeMap::from([
        (
            "LDAP_CUSTOM_LDIF_DIR".to_string(),
            config.paths.seed_data.clone(),
        ),
        ("LDAP_ALLOW_ANON_BINDING".to_string(), "no".to_string()),
        (ENABLE_TLS_KEY.to_string(), yes_no(spec.tls_enabled())),
        ("LDAP_PORT_NUMBER".to_string(), spec.ldap_port().to_string()),
        ("LDAP_ROOT".to_string(), spec.root().to_string()),
        ("LDAP_CONFIG_ADMIN_ENABLED".to_string(), "yes".to_string()),
        (
            "LDAP_ADMIN_USERNAME".to_string(),
            spec.admin_username().to_string(),
        ),
        (
            "LDAP_CONFIG_ADMIN_USERNAME".to_string(),
            spec.config_username().to_string(),
        ),
        ("LDAP_LOGLEVEL".to_string(), log_level_number(spec.log_level())),
        (
            "MASTER_HOST".to_string(),
            format!(
                "ldap://{}.{}.svc.{}:{}",
                cluster.write_service_name(),
                namespace,
                config.cluster_domain,
                spec.ldap_port()
            ),
        ),
    ]);

    if let Some(tls) = spec.tls().filter(|t| t.enabled) {
        let path = |file: &Option<String>, default: &str| {
            format!("{}/{}", config.paths.tls, file.as_deref().unwrap_or(default))
        };
        data.insert(
            "LDAP_LDAPS_PORT_NUMBER".to_string(),
            spec.ldaps_port().to_string(),
        );
        data.insert(
            "LDAP_TLS_CERT_FILE".to_string(),
            path(&tls.cert_file, DEFAULT_CERT_FILE),
        );
        data.insert(
            "LDAP_TLS_KEY_FILE".to_string(),
            path(&tls.key_file, DEFAULT_KEY_FILE),
        );
        data.insert(
            "LDAP_TLS_CA_FILE".to_string(),
            path(&tls.ca_file, DEFAULT_CA_FILE),
        );
    }

    data
}

/// slapd takes a numeric log level
fn log_level_number(level: &str) -> String {
    match level {
        "none" => "0",
        "trace" => "1",
        "debug" => "64",
        "warn" | "warning" => "2048",
        "error" => "32768",
        _ => "256",
    }
    .to_string()
}

pub fn build_config_map(cluster: &OpenldapCluster, config: &OperatorConfig) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(cluster, cluster.config_map_name()),
        data: Some(config_map_data(cluster, config)),
        ..Default::default()
    }
}

/// SHA-256 over the rendered configuration, used to roll pods on change
pub fn config_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 over the desired pod spec. Server defaults never reach it, so it
/// only moves when the operator renders a different template.
pub fn template_hash(pod_spec: &PodSpec) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_json::to_vec(pod_spec) {
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// Services
// ============================================================================

fn ldap_service_ports(cluster: &OpenldapCluster) -> Vec<ServicePort> {
    let mut ports = vec![ServicePort {
        name: Some("ldap".to_string()),
        port: cluster.spec.ldap_port(),
        target_port: Some(IntOrString::Int(cluster.spec.ldap_port())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if cluster.spec.tls_enabled() {
        ports.push(ServicePort {
            name: Some("ldaps".to_string()),
            port: cluster.spec.ldaps_port(),
            target_port: Some(IntOrString::Int(cluster.spec.ldaps_port())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

fn build_service(
    cluster: &OpenldapCluster,
    name: String,
    selector: BTreeMap<String, String>,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: object_meta(cluster, name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Routes only to the pod labeled master
pub fn build_write_service(cluster: &OpenldapCluster) -> Service {
    build_service(
        cluster,
        cluster.write_service_name(),
        cluster.master_labels(),
        ldap_service_ports(cluster),
    )
}

/// Routes to every unit
pub fn build_read_service(cluster: &OpenldapCluster) -> Service {
    build_service(
        cluster,
        cluster.read_service_name(),
        cluster.selector_labels(),
        ldap_service_ports(cluster),
    )
}

pub fn build_metrics_service(cluster: &OpenldapCluster, config: &OperatorConfig) -> Service {
    build_service(
        cluster,
        cluster.metrics_service_name(),
        cluster.selector_labels(),
        vec![ServicePort {
            name: Some(METRICS_PORT_NAME.to_string()),
            port: config.exporter.port,
            target_port: Some(IntOrString::Int(config.exporter.port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }],
    )
}

// ============================================================================
// StatefulSet
// ============================================================================

fn tcp_probe(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(1),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn secret_env(name: &str, selector: &k8s_openapi::api::core::v1::SecretKeySelector) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(selector.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Secrets plus user-supplied extra variables; plain settings come from the ConfigMap
fn directory_env(cluster: &OpenldapCluster) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(password) = cluster.spec.admin_password() {
        env.push(secret_env("LDAP_ADMIN_PASSWORD", password));
    }
    if let Some(password) = cluster.spec.config_password() {
        env.push(secret_env("LDAP_CONFIG_ADMIN_PASSWORD", password));
    }
    if let Some(extra) = cluster.spec.template.as_ref().and_then(|t| t.env.as_ref()) {
        env.extend(extra.iter().cloned());
    }
    env
}

fn container_ports(cluster: &OpenldapCluster) -> Vec<ContainerPort> {
    let mut ports = vec![ContainerPort {
        name: Some("ldap".to_string()),
        container_port: cluster.spec.ldap_port(),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if cluster.spec.tls_enabled() {
        ports.push(ContainerPort {
            name: Some("ldaps".to_string()),
            container_port: cluster.spec.ldaps_port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

fn volumes_and_mounts(
    cluster: &OpenldapCluster,
    config: &OperatorConfig,
) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: config.paths.data.clone(),
        ..Default::default()
    }];

    if let Some(seed) = cluster
        .spec
        .openldap_config
        .as_ref()
        .and_then(|c| c.seed_data.as_ref())
    {
        // A ConfigMap source wins when both are given
        let volume = match (&seed.config_map, &seed.secret) {
            (Some(cm), _) => Some(Volume {
                name: SEED_VOLUME.to_string(),
                config_map: Some(cm.clone()),
                ..Default::default()
            }),
            (None, Some(secret)) => Some(Volume {
                name: SEED_VOLUME.to_string(),
                secret: Some(secret.clone()),
                ..Default::default()
            }),
            (None, None) => None,
        };
        if let Some(volume) = volume {
            volumes.push(volume);
            mounts.push(VolumeMount {
                name: SEED_VOLUME.to_string(),
                mount_path: config.paths.seed_data.clone(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    if let Some(secret_name) = cluster
        .spec
        .tls()
        .filter(|t| t.enabled)
        .and_then(|t| t.secret_name.clone())
    {
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: config.paths.tls.clone(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

fn exporter_container(cluster: &OpenldapCluster, config: &OperatorConfig) -> Container {
    let quantity = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    let mut env = vec![
        EnvVar {
            name: "BIND_DN".to_string(),
            value: Some(cluster.admin_dn()),
            ..Default::default()
        },
        EnvVar {
            name: "METRICS_PORT".to_string(),
            value: Some(config.exporter.port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "LDAP_PORT".to_string(),
            value: Some(cluster.spec.ldap_port().to_string()),
            ..Default::default()
        },
    ];
    if let Some(password) = cluster.spec.admin_password() {
        env.push(secret_env("BIND_PW", password));
    }

    Container {
        name: cluster.exporter_name(),
        image: Some(config.exporter.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: config.exporter.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(quantity("50m", "64Mi")),
            requests: Some(quantity("50m", "64Mi")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod template annotations: user annotations plus the config and template hashes
fn pod_annotations(
    cluster: &OpenldapCluster,
    config: &OperatorConfig,
    pod_spec: &PodSpec,
) -> BTreeMap<String, String> {
    let mut annotations = cluster
        .spec
        .template
        .as_ref()
        .and_then(|t| t.annotations.clone())
        .unwrap_or_default();
    annotations.insert(
        CONFIG_HASH_ANNOTATION.to_string(),
        config_hash(&config_map_data(cluster, config)),
    );
    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), template_hash(pod_spec));
    annotations
}

pub fn build_statefulset(cluster: &OpenldapCluster, config: &OperatorConfig) -> StatefulSet {
    let template = cluster.spec.template.clone().unwrap_or_default();
    let resources = template.resources.clone().unwrap_or_default();
    let (volumes, mounts) = volumes_and_mounts(cluster, config);
    let env_from = vec![EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: Some(cluster.config_map_name()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let env = directory_env(cluster);

    let init_container = Container {
        name: cluster.init_container_name(),
        image: Some(cluster.spec.image.clone()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        command: Some(vec!["/opt/bitnami/scripts/openldap/setup.sh".to_string()]),
        env: Some(env.clone()),
        env_from: Some(env_from.clone()),
        resources: Some(resources.clone()),
        volume_mounts: Some(mounts.clone()),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut containers = vec![Container {
        name: cluster.name_any(),
        image: Some(cluster.spec.image.clone()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        env: Some(env),
        env_from: Some(env_from),
        ports: Some(container_ports(cluster)),
        resources: Some(resources),
        readiness_probe: Some(tcp_probe(cluster.spec.ldap_port())),
        liveness_probe: Some(tcp_probe(cluster.spec.ldap_port())),
        volume_mounts: Some(mounts),
        ..Default::default()
    }];
    if cluster.spec.monitor_enabled() {
        containers.push(exporter_container(cluster, config));
    }

    let pod_spec = PodSpec {
        init_containers: Some(vec![init_container]),
        containers,
        volumes: if volumes.is_empty() { None } else { Some(volumes) },
        affinity: template.affinity,
        node_selector: template.node_selector,
        tolerations: template.tolerations,
        priority_class_name: template.priority_class_name,
        image_pull_secrets: cluster.spec.image_pull_secrets.clone(),
        termination_grace_period_seconds: Some(10),
        security_context: Some(PodSecurityContext {
            fs_group: Some(1001),
            ..Default::default()
        }),
        ..Default::default()
    };

    let annotations = pod_annotations(cluster, config, &pod_spec);
    let mut pod_labels = cluster.versioned_labels();
    pod_labels.extend(cluster.slave_labels());

    let mut claim_template_labels = cluster.selector_labels();
    claim_template_labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

    StatefulSet {
        metadata: object_meta(cluster, cluster.name_any()),
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.spec.replicas),
            service_name: cluster.read_service_name(),
            selector: LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Delete".to_string()),
                },
            ),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    labels: Some(claim_template_labels),
                    ..Default::default()
                },
                spec: Some(cluster.spec.storage.volume_claim_template.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// ServiceMonitor
// ============================================================================

pub fn build_service_monitor(cluster: &OpenldapCluster, config: &OperatorConfig) -> ServiceMonitor {
    let monitor = cluster.spec.monitor.clone().unwrap_or_default();
    let mut labels = standard_labels(cluster);
    labels.extend(monitor.labels.unwrap_or_default());

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let mut service_monitor = ServiceMonitor::new(
        &cluster.name_any(),
        ServiceMonitorSpec {
            job_label: Some(LABEL_NAME.to_string()),
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![namespace],
            }),
            selector: LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..Default::default()
            },
            endpoints: vec![Endpoint {
                port: Some(METRICS_PORT_NAME.to_string()),
                path: Some(config.exporter.path.clone()),
                interval: monitor.interval,
                scrape_timeout: monitor.scrape_timeout,
                ..Default::default()
            }],
        },
    );
    service_monitor.metadata = ObjectMeta {
        labels: Some(labels),
        ..object_meta(cluster, cluster.name_any())
    };
    service_monitor
}

// ============================================================================
// Promotion Job
// ============================================================================

/// Job that runs the promotion script inside the elected pod.
///
/// The job is annotated with the UID of the pod it targets so a job left over
/// from an earlier incarnation of the same pod name is recognisable.
pub fn build_promotion_job(cluster: &OpenldapCluster, pod: &Pod, config: &OperatorConfig) -> Job {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let target = pod.name_any();
    let promotion = &config.promotion;

    let mut labels = cluster.job_labels();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

    Job {
        metadata: ObjectMeta {
            name: Some(cluster.promotion_job_name()),
            namespace: Some(namespace.clone()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([
                (
                    TARGET_UID_ANNOTATION.to_string(),
                    pod.metadata.uid.clone().unwrap_or_default(),
                ),
                (TARGET_POD_ANNOTATION.to_string(), target.clone()),
            ])),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(promotion.ttl_seconds_after_finished),
            backoff_limit: Some(promotion.backoff_limit),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(cluster.job_labels()),
                    annotations: Some(BTreeMap::from([(
                        "sidecar.istio.io/inject".to_string(),
                        "false".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(cluster.name_any()),
                    restart_policy: Some("OnFailure".to_string()),
                    containers: vec![Container {
                        name: "promotion".to_string(),
                        image: Some(promotion.image.clone()),
                        command: Some(vec![
                            "kubectl".to_string(),
                            "exec".to_string(),
                            target,
                            "-n".to_string(),
                            namespace,
                            "-c".to_string(),
                            cluster.name_any(),
                            "--".to_string(),
                            promotion.shell.clone(),
                            "-c".to_string(),
                            promotion.script.clone(),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
