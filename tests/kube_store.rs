//! KubeStore against a mocked API server

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use openldap_k8s::controller::{KubeStore, ObjectStore};
use openldap_k8s::crd::{OpenldapCluster, OpenldapClusterStatus};
use openldap_k8s::Error;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLUSTER_PATH: &str = "/apis/openldap.kwonjin.click/v1/namespaces/directory/openldapclusters/ldap";

fn store_for(server: &MockServer) -> KubeStore {
    let config = kube::Config::new(server.uri().parse().unwrap());
    let client = kube::Client::try_from(config).unwrap();
    KubeStore::new(client, "openldap-operator")
}

fn status_body(code: u16, reason: &str) -> serde_json::Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("request failed: {}", reason),
        "reason": reason,
        "code": code
    })
}

fn cluster_body(resource_version: &str) -> serde_json::Value {
    json!({
        "apiVersion": "openldap.kwonjin.click/v1",
        "kind": "OpenldapCluster",
        "metadata": {
            "name": "ldap",
            "namespace": "directory",
            "resourceVersion": resource_version,
            "uid": "cluster-uid"
        },
        "spec": {
            "image": "bitnami/openldap:2.6.6",
            "replicas": 3
        },
        "status": {
            "conditions": [],
            "desiredMaster": "ldap-0",
            "currentMaster": "",
            "failoverCount": 0
        }
    })
}

#[tokio::test]
async fn test_get_missing_object_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/directory/pods/ldap-0"))
        .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let pod = store.get::<Pod>("directory", "ldap-0").await.unwrap();
    assert!(pod.is_none());
}

#[tokio::test]
async fn test_get_existing_cluster() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body("42")))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let cluster = store
        .get::<OpenldapCluster>("directory", "ldap")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.resource_version().as_deref(), Some("42"));
    assert_eq!(cluster.desired_master(), "ldap-0");
}

#[tokio::test]
async fn test_status_write_conflict_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("{}/status", CLUSTER_PATH)))
        .respond_with(ResponseTemplate::new(409).set_body_json(status_body(409, "Conflict")))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let mut cluster: OpenldapCluster = serde_json::from_value(cluster_body("41")).unwrap();
    cluster.status = Some(OpenldapClusterStatus {
        desired_master: "ldap-1".to_string(),
        ..Default::default()
    });

    let err = store
        .replace_status("directory", &cluster)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(err, Error::Conflict { ref kind, .. } if kind == "OpenldapCluster"));
}

#[tokio::test]
async fn test_server_error_is_retriable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLUSTER_PATH))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(status_body(503, "ServiceUnavailable")),
        )
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store
        .get::<OpenldapCluster>("directory", "ldap")
        .await
        .unwrap_err();
    assert!(err.is_retriable());
    assert!(!err.is_conflict());
}

#[tokio::test]
async fn test_delete_missing_object_is_false() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/namespaces/directory/pods/ldap-2"))
        .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "NotFound")))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert!(!store.delete::<Pod>("directory", "ldap-2").await.unwrap());
}
