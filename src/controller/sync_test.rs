//! Tests for the resource synchronizers against the in-memory store

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{
        ConfigMap, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
        ResourceRequirements, Service, ServiceAccount,
    };
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    use crate::config::OperatorConfig;
    use crate::controller::sync::{ManagedResource, RECONCILE_ORDER};
    use crate::controller::testing::{test_cluster, FakeStore, RecordingRecorder, NAMESPACE};
    use crate::controller::Context;
    use crate::crd::{MonitorConfig, OpenldapCluster, ServiceMonitor, LABEL_NAME};

    struct Fixture {
        store: FakeStore,
        recorder: RecordingRecorder,
        config: OperatorConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: FakeStore::new(),
                recorder: RecordingRecorder::default(),
                config: OperatorConfig::default(),
            }
        }

        fn ctx(&self) -> Context<'_, FakeStore, RecordingRecorder> {
            Context {
                store: &self.store,
                recorder: &self.recorder,
                config: &self.config,
            }
        }

        async fn ensure(&self, resource: ManagedResource, cluster: &OpenldapCluster) -> bool {
            resource.ensure(&self.ctx(), cluster).await.unwrap()
        }

        async fn ensure_all(&self, cluster: &OpenldapCluster) -> Vec<ManagedResource> {
            let mut changed = Vec::new();
            for resource in RECONCILE_ORDER {
                if self.ensure(resource, cluster).await {
                    changed.push(resource);
                }
            }
            changed
        }
    }

    fn monitored(mut cluster: OpenldapCluster, enabled: bool) -> OpenldapCluster {
        cluster.spec.monitor = Some(MonitorConfig {
            enabled,
            interval: Some("30s".to_string()),
            ..Default::default()
        });
        cluster
    }

    /// Limits without requests, a decimal quantity and a downward API env var
    fn with_pod_overrides(mut cluster: OpenldapCluster) -> OpenldapCluster {
        let template = cluster.spec.template.get_or_insert_with(Default::default);
        template.resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("0.5".to_string())),
                ("memory".to_string(), Quantity("1Gi".to_string())),
            ])),
            ..Default::default()
        });
        template.env = Some(vec![EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        cluster
    }

    /// Rewrite a stored StatefulSet the way the API server does on write
    fn apply_server_defaults(sts: &mut StatefulSet) {
        let Some(pod) = sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
            return;
        };
        pod.dns_policy.get_or_insert_with(|| "ClusterFirst".to_string());
        let containers = pod
            .containers
            .iter_mut()
            .chain(pod.init_containers.iter_mut().flatten());
        for container in containers {
            container
                .image_pull_policy
                .get_or_insert_with(|| "IfNotPresent".to_string());
            container
                .termination_message_path
                .get_or_insert_with(|| "/dev/termination-log".to_string());
            if let Some(resources) = container.resources.as_mut() {
                for quantity in resources.limits.iter_mut().flat_map(|l| l.values_mut()) {
                    if quantity.0 == "0.5" {
                        *quantity = Quantity("500m".to_string());
                    }
                }
                if resources.requests.is_none() {
                    resources.requests = resources.limits.clone();
                }
            }
            for var in container.env.iter_mut().flatten() {
                if let Some(field) = var.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
                    field.api_version.get_or_insert_with(|| "v1".to_string());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_first_pass_creates_and_second_pass_is_quiet() {
        let f = Fixture::new();
        let cluster = test_cluster(3);

        let created = f.ensure_all(&cluster).await;
        assert_eq!(
            created,
            vec![
                ManagedResource::ServiceAccount,
                ManagedResource::Role,
                ManagedResource::RoleBinding,
                ManagedResource::ConfigMap,
                ManagedResource::WriteService,
                ManagedResource::ReadService,
                ManagedResource::StatefulSet,
            ]
        );
        assert_eq!(f.store.count::<ServiceAccount>(), 1);
        assert_eq!(f.store.count::<Role>(), 1);
        assert_eq!(f.store.count::<RoleBinding>(), 1);
        assert_eq!(f.store.count::<Service>(), 2);
        assert!(f.recorder.has("StatefulSetCreated"));

        assert!(f.ensure_all(&cluster).await.is_empty());
    }

    #[tokio::test]
    async fn test_created_objects_are_owned() {
        let f = Fixture::new();
        let cluster = test_cluster(1);
        f.ensure(ManagedResource::ConfigMap, &cluster).await;

        let cm: ConfigMap = f.store.fetch(NAMESPACE, "ldap-config").unwrap();
        let owners = cm.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "ldap");
    }

    #[tokio::test]
    async fn test_labels_added_by_others_are_kept() {
        let f = Fixture::new();
        let cluster = test_cluster(1);
        f.ensure(ManagedResource::ConfigMap, &cluster).await;

        let mut cm: ConfigMap = f.store.fetch(NAMESPACE, "ldap-config").unwrap();
        cm.labels_mut().insert("team".to_string(), "identity".to_string());
        f.store.insert(NAMESPACE, cm);

        assert!(!f.ensure(ManagedResource::ConfigMap, &cluster).await);
        let cm: ConfigMap = f.store.fetch(NAMESPACE, "ldap-config").unwrap();
        assert_eq!(cm.labels().get("team").map(String::as_str), Some("identity"));
    }

    #[tokio::test]
    async fn test_config_map_drift_is_restored() {
        let f = Fixture::new();
        let cluster = test_cluster(1);
        f.ensure(ManagedResource::ConfigMap, &cluster).await;

        let mut cm: ConfigMap = f.store.fetch(NAMESPACE, "ldap-config").unwrap();
        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert("LDAP_ROOT".to_string(), "dc=tampered".to_string());
        f.store.insert(NAMESPACE, cm);

        assert!(f.ensure(ManagedResource::ConfigMap, &cluster).await);
        let cm: ConfigMap = f.store.fetch(NAMESPACE, "ldap-config").unwrap();
        assert_eq!(cm.data.unwrap()["LDAP_ROOT"], "dc=example,dc=com");
        assert!(f.recorder.has("ConfigMapUpdated"));
    }

    #[tokio::test]
    async fn test_write_service_selector_is_restored() {
        let f = Fixture::new();
        let cluster = test_cluster(3);
        f.ensure(ManagedResource::WriteService, &cluster).await;

        let mut svc: Service = f.store.fetch(NAMESPACE, "ldap-write").unwrap();
        if let Some(spec) = svc.spec.as_mut() {
            spec.selector = Some(BTreeMap::from([(LABEL_NAME.to_string(), "ldap".to_string())]));
            spec.cluster_ip = Some("10.0.0.12".to_string());
        }
        f.store.insert(NAMESPACE, svc);

        assert!(f.ensure(ManagedResource::WriteService, &cluster).await);
        let svc: Service = f.store.fetch(NAMESPACE, "ldap-write").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.selector, Some(cluster.master_labels()));
        // server-assigned fields survive
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
    }

    #[tokio::test]
    async fn test_statefulset_follows_replicas_and_image() {
        let f = Fixture::new();
        let mut cluster = test_cluster(3);
        f.ensure(ManagedResource::StatefulSet, &cluster).await;

        cluster.spec.replicas = 5;
        assert!(f.ensure(ManagedResource::StatefulSet, &cluster).await);
        let sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(5));

        cluster.spec.image = "bitnami/openldap:2.6.7".to_string();
        assert!(f.ensure(ManagedResource::StatefulSet, &cluster).await);
        let sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("bitnami/openldap:2.6.7")
        );

        assert!(!f.ensure(ManagedResource::StatefulSet, &cluster).await);
    }

    #[tokio::test]
    async fn test_statefulset_is_stable_under_server_defaults() {
        let f = Fixture::new();
        let cluster = with_pod_overrides(test_cluster(3));
        assert!(f.ensure(ManagedResource::StatefulSet, &cluster).await);

        let mut sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        apply_server_defaults(&mut sts);
        f.store.insert(NAMESPACE, sts);

        for _ in 0..3 {
            assert!(!f.ensure(ManagedResource::StatefulSet, &cluster).await);
        }
    }

    #[tokio::test]
    async fn test_statefulset_restores_edited_limits() {
        let f = Fixture::new();
        let cluster = with_pod_overrides(test_cluster(3));
        f.ensure(ManagedResource::StatefulSet, &cluster).await;

        let mut sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        apply_server_defaults(&mut sts);
        if let Some(pod) = sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            let limits = pod.containers[0]
                .resources
                .as_mut()
                .and_then(|r| r.limits.as_mut())
                .unwrap();
            limits.insert("cpu".to_string(), Quantity("2".to_string()));
        }
        f.store.insert(NAMESPACE, sts);

        assert!(f.ensure(ManagedResource::StatefulSet, &cluster).await);
        let sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        let limits = pod_spec.containers[0].resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits["cpu"], Quantity("0.5".to_string()));
    }

    #[tokio::test]
    async fn test_statefulset_follows_scheduling_changes() {
        let f = Fixture::new();
        let mut cluster = test_cluster(3);
        f.ensure(ManagedResource::StatefulSet, &cluster).await;

        let mut sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        apply_server_defaults(&mut sts);
        f.store.insert(NAMESPACE, sts);
        assert!(!f.ensure(ManagedResource::StatefulSet, &cluster).await);

        let selector = BTreeMap::from([("disktype".to_string(), "ssd".to_string())]);
        cluster
            .spec
            .template
            .get_or_insert_with(Default::default)
            .node_selector = Some(selector.clone());
        assert!(f.ensure(ManagedResource::StatefulSet, &cluster).await);

        let sts: StatefulSet = f.store.fetch(NAMESPACE, "ldap").unwrap();
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.node_selector, Some(selector));
    }

    #[tokio::test]
    async fn test_metrics_service_follows_monitor_toggle() {
        let f = Fixture::new();
        let cluster = test_cluster(1);

        assert!(!f.ensure(ManagedResource::MetricsService, &cluster).await);
        assert!(f.store.fetch::<Service>(NAMESPACE, "ldap-metrics").is_none());

        let cluster = monitored(cluster, true);
        assert!(f.ensure(ManagedResource::MetricsService, &cluster).await);
        assert!(f.store.fetch::<Service>(NAMESPACE, "ldap-metrics").is_some());
        assert!(!f.ensure(ManagedResource::MetricsService, &cluster).await);

        let cluster = monitored(cluster, false);
        assert!(f.ensure(ManagedResource::MetricsService, &cluster).await);
        assert!(f.store.fetch::<Service>(NAMESPACE, "ldap-metrics").is_none());
    }

    #[tokio::test]
    async fn test_claims_are_labeled_but_never_created() {
        let f = Fixture::new();
        let cluster = test_cluster(2);

        assert!(!f.ensure(ManagedResource::StorageClaims, &cluster).await);
        assert_eq!(f.store.count::<PersistentVolumeClaim>(), 0);

        f.store.insert(
            NAMESPACE,
            PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(cluster.claim_name(0)),
                    labels: Some(BTreeMap::from([(
                        "volume.kubernetes.io/origin".to_string(),
                        "sts".to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        assert!(f.ensure(ManagedResource::StorageClaims, &cluster).await);
        let claim: PersistentVolumeClaim = f.store.fetch(NAMESPACE, "data-ldap-0").unwrap();
        let labels = claim.labels();
        assert_eq!(labels.get(LABEL_NAME).map(String::as_str), Some("ldap"));
        assert!(labels.contains_key("volume.kubernetes.io/origin"));

        assert!(!f.ensure(ManagedResource::StorageClaims, &cluster).await);
        assert_eq!(f.store.count::<PersistentVolumeClaim>(), 1);
    }

    #[tokio::test]
    async fn test_service_monitor_follows_monitor_toggle() {
        let f = Fixture::new();
        let cluster = monitored(test_cluster(1), true);

        assert!(f.ensure(ManagedResource::ServiceMonitor, &cluster).await);
        assert!(f.store.fetch::<ServiceMonitor>(NAMESPACE, "ldap").is_some());
        assert!(!f.ensure(ManagedResource::ServiceMonitor, &cluster).await);

        let cluster = monitored(cluster, false);
        assert!(f.ensure(ManagedResource::ServiceMonitor, &cluster).await);
        assert!(f.store.fetch::<ServiceMonitor>(NAMESPACE, "ldap").is_none());
        assert!(!f.ensure(ManagedResource::ServiceMonitor, &cluster).await);
    }
}
