//! In-memory test doubles for the object store and event recorder

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde_json::Value;

use super::events::{EventRecorder, EventType};
use super::store::{ObjectStore, StoreResource};
use crate::crd::{OpenldapCluster, OpenldapClusterSpec};
use crate::error::{Error, Result};

type Key = (String, String, String);

fn key<K: StoreResource>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn not_found(name: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} not found", name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    let labels = obj.pointer("/metadata/labels");
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).and_then(Value::as_str) == Some(v),
            None => false,
        })
}

/// Object store with API-server-like resource version checks
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<Key, Value>>,
    version: AtomicU64,
    pub writes: AtomicU64,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Seed an object as if another actor created it
    pub fn insert<K: StoreResource>(&self, namespace: &str, obj: K) -> K {
        let mut value = serde_json::to_value(&obj).unwrap();
        let name = obj.name_any();
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["resourceVersion"] = Value::String(self.next_version());
        if value.pointer("/metadata/uid").is_none() {
            value["metadata"]["uid"] = Value::String(format!("uid-{}-{}", name, self.next_version()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key::<K>(namespace, &name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn fetch<K: StoreResource>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn count<K: StoreResource>(&self) -> usize {
        let kind = K::kind(&()).to_string();
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    pub fn remove<K: StoreResource>(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&key::<K>(namespace, name));
    }

    fn check_version(stored: &Value, incoming: &Value, kind: &str, name: &str) -> Result<()> {
        let incoming_rv = incoming.pointer("/metadata/resourceVersion");
        if incoming_rv.is_some() && incoming_rv != stored.pointer("/metadata/resourceVersion") {
            return Err(Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.fetch(namespace, name))
    }

    async fn list<K: StoreResource>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let objects = self.objects.lock().unwrap();
        let mut items: Vec<(&Key, &Value)> = objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, label_selector))
            .collect();
        items.sort_by(|a, b| a.0.cmp(b.0));
        Ok(items
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect())
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        if self.fetch::<K>(namespace, &name).is_some() {
            return Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                name,
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = None;
        obj.meta_mut().uid = None;
        Ok(self.insert(namespace, obj))
    }

    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let kind = K::kind(&()).to_string();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key::<K>(namespace, &name))
            .ok_or_else(|| not_found(&name))?;
        let mut incoming = serde_json::to_value(obj)?;
        Self::check_version(stored, &incoming, &kind, &name)?;

        if let Some(status) = stored.get("status").cloned() {
            incoming["status"] = status;
        }
        incoming["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        incoming["metadata"]["resourceVersion"] = Value::String(self.next_version());
        *stored = incoming.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(incoming)?)
    }

    async fn replace_status<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let kind = K::kind(&()).to_string();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key::<K>(namespace, &name))
            .ok_or_else(|| not_found(&name))?;
        let incoming = serde_json::to_value(obj)?;
        Self::check_version(stored, &incoming, &kind, &name)?;

        stored["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(stored.clone())?)
    }

    async fn merge_patch<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key::<K>(namespace, name))
            .ok_or_else(|| not_found(name))?;
        merge(stored, patch);
        stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(stored.clone())?)
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .remove(&key::<K>(namespace, name))
            .is_some())
    }
}

/// Event recorder that keeps every event for assertions
#[derive(Default)]
pub struct RecordingRecorder {
    pub events: Mutex<Vec<(EventType, String, String)>>,
}

impl RecordingRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn has(&self, reason: &str) -> bool {
        self.reasons().iter().any(|r| r == reason)
    }
}

#[async_trait]
impl EventRecorder for RecordingRecorder {
    async fn publish(
        &self,
        _cluster: &OpenldapCluster,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), message.to_string()));
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub const NAMESPACE: &str = "directory";

pub fn cluster_spec(replicas: i32) -> OpenldapClusterSpec {
    let mut spec: OpenldapClusterSpec = serde_json::from_value(serde_json::json!({
        "image": "bitnami/openldap:2.6.6",
        "replicas": replicas,
        "openldapConfig": {
            "adminPassword": { "name": "ldap-admin", "key": "password" }
        },
        "storage": {
            "volumeClaimTemplate": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": "1Gi" } }
            }
        }
    }))
    .unwrap();
    spec.apply_defaults("ldap");
    spec
}

/// A cluster named `ldap` in the test namespace
pub fn test_cluster(replicas: i32) -> OpenldapCluster {
    let mut cluster = OpenldapCluster::new("ldap", cluster_spec(replicas));
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some("cluster-uid".to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

/// Observed health of a fixture pod
#[derive(Clone, Copy, Debug)]
pub enum PodState {
    Ready,
    Starting,
    CrashLooping,
    Restarted,
}

pub fn pod(cluster: &OpenldapCluster, index: i32, state: PodState) -> Pod {
    let (phase, ready, waiting, restarts) = match state {
        PodState::Ready => ("Running", "True", None, 0),
        PodState::Starting => ("Pending", "False", None, 0),
        PodState::CrashLooping => ("Running", "False", Some("CrashLoopBackOff"), 3),
        PodState::Restarted => ("Running", "True", None, 1),
    };

    let container_status = ContainerStatus {
        name: "ldap".to_string(),
        ready: ready == "True",
        restart_count: restarts,
        image: "bitnami/openldap:2.6.6".to_string(),
        image_id: String::new(),
        state: waiting.map(|reason| k8s_openapi::api::core::v1::ContainerState {
            waiting: Some(k8s_openapi::api::core::v1::ContainerStateWaiting {
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(cluster.pod_name(index)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(cluster.slave_labels()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".to_string(),
                status: ready.to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![container_status]),
            ..Default::default()
        }),
    }
}

pub fn with_labels(mut pod: Pod, labels: BTreeMap<String, String>) -> Pod {
    pod.metadata.labels = Some(labels);
    pod
}
