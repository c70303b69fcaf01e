//! Resource synchronizers
//!
//! Each managed kind is converged by fetch-or-create followed by a diff over
//! the fields this operator owns. Fields set by other actors (extra labels,
//! server defaults, generated selectors) are left untouched.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, PersistentVolumeClaim, ResourceRequirements,
    Service, ServiceAccount, ServicePort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::events::{EventRecorder, EventType};
use super::resources;
use super::store::{ObjectStore, StoreResource};
use super::Context;
use crate::crd::{OpenldapCluster, ServiceMonitor, LABEL_MANAGED_BY};
use crate::error::{Error, Result};

/// Copy `desired` entries into `current`, keeping keys nobody asked us to manage
fn merge_string_map(
    current: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let current = current.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in desired {
        if current.get(key) != Some(value) {
            current.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

fn merge_metadata(current: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let labels = merge_string_map(&mut current.labels, &desired.labels);
    let annotations = merge_string_map(&mut current.annotations, &desired.annotations);
    labels || annotations
}

/// Fields of a kind that the operator owns
pub trait OwnedFields: StoreResource {
    /// Copy owned fields from `desired` into `self`; true when anything changed
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool;
}

impl OwnedFields for ServiceAccount {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        merge_metadata(&mut self.metadata, &desired.metadata)
    }
}

impl OwnedFields for Role {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        if self.rules != desired.rules {
            self.rules = desired.rules.clone();
            changed = true;
        }
        changed
    }
}

impl OwnedFields for RoleBinding {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        if self.subjects != desired.subjects {
            self.subjects = desired.subjects.clone();
            changed = true;
        }
        changed
    }
}

impl OwnedFields for ConfigMap {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        if self.data != desired.data {
            self.data = desired.data.clone();
            changed = true;
        }
        changed
    }
}

/// Port identity as far as the operator is concerned
fn port_key(port: &ServicePort) -> (Option<String>, i32, String, Option<String>) {
    (
        port.name.clone(),
        port.port,
        port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
        port.target_port.as_ref().map(|p| match p {
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i.to_string(),
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => s.clone(),
        }),
    )
}

impl OwnedFields for Service {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        let Some(desired_spec) = desired.spec.as_ref() else {
            return changed;
        };
        let spec = self.spec.get_or_insert_with(Default::default);

        if spec.selector != desired_spec.selector {
            spec.selector = desired_spec.selector.clone();
            changed = true;
        }

        let current_ports: Vec<_> = spec.ports.iter().flatten().map(port_key).collect();
        let desired_ports: Vec<_> = desired_spec.ports.iter().flatten().map(port_key).collect();
        if current_ports != desired_ports {
            spec.ports = desired_spec.ports.clone();
            changed = true;
        }
        changed
    }
}

/// Value of a quantity in billionths of its unit, so `0.5`, `500m` and
/// `5e2m` compare equal. `None` when the string is not a quantity.
fn quantity_nanos(quantity: &Quantity) -> Option<i128> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let mut mantissa: i128 = 0;
    for digit in whole.chars().chain(fraction.chars()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(digit.to_digit(10)?))?;
    }

    let (binary_power, decimal_exponent): (u32, i32) = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (1, 0),
        "Mi" => (2, 0),
        "Gi" => (3, 0),
        "Ti" => (4, 0),
        "Pi" => (5, 0),
        "Ei" => (6, 0),
        exp if exp.starts_with(['e', 'E']) => (0, exp[1..].parse().ok()?),
        _ => return None,
    };

    let mut value = mantissa.checked_mul(1024_i128.checked_pow(binary_power)?)?;
    let scale = 9 + decimal_exponent - fraction.len() as i32;
    if scale >= 0 {
        value = value.checked_mul(10_i128.checked_pow(scale as u32)?)?;
    } else {
        value /= 10_i128.checked_pow(scale.unsigned_abs())?;
    }
    Some(if negative { -value } else { value })
}

fn canonical_quantity(quantity: &Quantity) -> String {
    quantity_nanos(quantity)
        .map(|nanos| nanos.to_string())
        .unwrap_or_else(|| quantity.0.clone())
}

/// Limits and requests as the API server stores them: quantities in
/// canonical form and requests defaulted from limits
fn canonical_resources(
    resources: Option<&ResourceRequirements>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let canonical = |map: Option<&BTreeMap<String, Quantity>>| -> BTreeMap<String, String> {
        map.into_iter()
            .flatten()
            .map(|(k, v)| (k.clone(), canonical_quantity(v)))
            .collect()
    };
    let limits = canonical(resources.and_then(|r| r.limits.as_ref()));
    let mut requests = canonical(resources.and_then(|r| r.requests.as_ref()));
    for (key, value) in &limits {
        requests.entry(key.clone()).or_insert_with(|| value.clone());
    }
    (limits, requests)
}

/// Env vars with the defaults the API server fills in
fn canonical_env(env: Option<&Vec<EnvVar>>) -> Vec<EnvVar> {
    let mut env = env.cloned().unwrap_or_default();
    for var in &mut env {
        if var.value.as_deref() == Some("") {
            var.value = None;
        }
        let Some(source) = var.value_from.as_mut() else {
            continue;
        };
        if let Some(field) = source.field_ref.as_mut() {
            field.api_version.get_or_insert_with(|| "v1".to_string());
        }
        if let Some(resource) = source.resource_field_ref.as_mut() {
            // An unset or zero divisor means 1
            let divisor = resource
                .divisor
                .as_ref()
                .and_then(quantity_nanos)
                .filter(|nanos| *nanos != 0)
                .unwrap_or(1_000_000_000);
            resource.divisor = Some(Quantity(divisor.to_string()));
        }
    }
    env
}

fn canonical_ports(ports: Option<&Vec<ContainerPort>>) -> Vec<(Option<String>, i32, String)> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.container_port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}

/// Container fields compared by name. Values are compared in the form the
/// API server stores them, and fields it defaults are only compared when the
/// operator sets them.
fn container_drifted(current: &[Container], desired: &[Container]) -> bool {
    let mut current_names: Vec<&str> = current.iter().map(|c| c.name.as_str()).collect();
    let mut desired_names: Vec<&str> = desired.iter().map(|c| c.name.as_str()).collect();
    current_names.sort_unstable();
    desired_names.sort_unstable();
    if current_names != desired_names {
        return true;
    }

    desired.iter().any(|want| {
        let Some(have) = current.iter().find(|c| c.name == want.name) else {
            return true;
        };
        let pull_policy_differs =
            want.image_pull_policy.is_some() && want.image_pull_policy != have.image_pull_policy;
        let ports_differ = want.ports.is_some()
            && canonical_ports(want.ports.as_ref()) != canonical_ports(have.ports.as_ref());

        have.image != want.image
            || pull_policy_differs
            || canonical_env(have.env.as_ref()) != canonical_env(want.env.as_ref())
            || canonical_resources(have.resources.as_ref())
                != canonical_resources(want.resources.as_ref())
            || ports_differ
    })
}

fn template_subset_differs(current: &Option<ObjectMeta>, desired: &Option<ObjectMeta>) -> bool {
    let mut merged = current.clone().unwrap_or_default();
    desired
        .as_ref()
        .map(|d| merge_metadata(&mut merged, d))
        .unwrap_or(false)
}

impl OwnedFields for StatefulSet {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        let (Some(spec), Some(want)) = (self.spec.as_mut(), desired.spec.as_ref()) else {
            return changed;
        };

        let have_pod = spec.template.spec.clone().unwrap_or_default();
        let want_pod = want.template.spec.clone().unwrap_or_default();

        let template_drifted = template_subset_differs(
            &spec.template.metadata,
            &want.template.metadata,
        ) || container_drifted(&have_pod.containers, &want_pod.containers)
            || container_drifted(
                have_pod.init_containers.as_deref().unwrap_or(&[]),
                want_pod.init_containers.as_deref().unwrap_or(&[]),
            );

        if spec.replicas != want.replicas {
            spec.replicas = want.replicas;
            changed = true;
        }
        if template_drifted {
            spec.template = want.template.clone();
            changed = true;
        }
        changed
    }
}

impl OwnedFields for PersistentVolumeClaim {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        merge_string_map(&mut self.metadata.labels, &desired.metadata.labels)
    }
}

impl OwnedFields for ServiceMonitor {
    fn adopt_owned_fields(&mut self, desired: &Self) -> bool {
        let mut changed = merge_metadata(&mut self.metadata, &desired.metadata);
        if self.spec != desired.spec {
            self.spec = desired.spec.clone();
            changed = true;
        }
        changed
    }
}

/// Fetch-or-create then diff-and-replace a single object.
///
/// Returns true when the object was created or updated.
pub async fn ensure_object<K, S, R>(
    ctx: &Context<'_, S, R>,
    cluster: &OpenldapCluster,
    desired: K,
) -> Result<bool>
where
    K: OwnedFields,
    S: ObjectStore,
    R: EventRecorder,
{
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = desired.name_any();
    let kind = K::kind(&()).to_string();

    match ctx.store.get::<K>(&namespace, &name).await? {
        None => {
            let mut desired = desired;
            desired.meta_mut().owner_references = Some(vec![resources::owner_reference(cluster)]);
            info!("Creating {} {}/{}", kind, namespace, name);
            ctx.store.create(&namespace, &desired).await?;
            ctx.recorder
                .publish(
                    cluster,
                    EventType::Normal,
                    &format!("{}Created", kind),
                    &format!("Created {} {}", kind, name),
                )
                .await;
            Ok(true)
        }
        Some(mut existing) => {
            if !existing.adopt_owned_fields(&desired) {
                debug!("{} {}/{} is up to date", kind, namespace, name);
                return Ok(false);
            }
            info!("Updating {} {}/{}", kind, namespace, name);
            ctx.store.replace(&namespace, &existing).await?;
            ctx.recorder
                .publish(
                    cluster,
                    EventType::Normal,
                    &format!("{}Updated", kind),
                    &format!("Updated {} {}", kind, name),
                )
                .await;
            Ok(true)
        }
    }
}

/// Every kind the operator keeps in sync, in the order a pass visits them
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagedResource {
    ServiceAccount,
    Role,
    RoleBinding,
    ConfigMap,
    WriteService,
    ReadService,
    MetricsService,
    StatefulSet,
    StorageClaims,
    ServiceMonitor,
}

/// Identity and RBAC first, then configuration, endpoints, workload and
/// finally the scrape registration
pub const RECONCILE_ORDER: [ManagedResource; 10] = [
    ManagedResource::ServiceAccount,
    ManagedResource::Role,
    ManagedResource::RoleBinding,
    ManagedResource::ConfigMap,
    ManagedResource::WriteService,
    ManagedResource::ReadService,
    ManagedResource::MetricsService,
    ManagedResource::StatefulSet,
    ManagedResource::StorageClaims,
    ManagedResource::ServiceMonitor,
];

impl ManagedResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedResource::ServiceAccount => "ServiceAccount",
            ManagedResource::Role => "Role",
            ManagedResource::RoleBinding => "RoleBinding",
            ManagedResource::ConfigMap => "ConfigMap",
            ManagedResource::WriteService => "WriteService",
            ManagedResource::ReadService => "ReadService",
            ManagedResource::MetricsService => "MetricsService",
            ManagedResource::StatefulSet => "StatefulSet",
            ManagedResource::StorageClaims => "StorageClaims",
            ManagedResource::ServiceMonitor => "ServiceMonitor",
        }
    }

    /// Converge this kind for `cluster`; true when anything was written
    #[instrument(skip(self, ctx, cluster), fields(resource = self.as_str(), name = %cluster.name_any()))]
    pub async fn ensure<S, R>(self, ctx: &Context<'_, S, R>, cluster: &OpenldapCluster) -> Result<bool>
    where
        S: ObjectStore,
        R: EventRecorder,
    {
        let config = ctx.config;
        match self {
            ManagedResource::ServiceAccount => {
                ensure_object(ctx, cluster, resources::build_service_account(cluster)).await
            }
            ManagedResource::Role => ensure_object(ctx, cluster, resources::build_role(cluster)).await,
            ManagedResource::RoleBinding => {
                ensure_object(ctx, cluster, resources::build_role_binding(cluster)).await
            }
            ManagedResource::ConfigMap => {
                ensure_object(ctx, cluster, resources::build_config_map(cluster, config)).await
            }
            ManagedResource::WriteService => {
                ensure_object(ctx, cluster, resources::build_write_service(cluster)).await
            }
            ManagedResource::ReadService => {
                ensure_object(ctx, cluster, resources::build_read_service(cluster)).await
            }
            ManagedResource::MetricsService => ensure_metrics_service(ctx, cluster).await,
            ManagedResource::StatefulSet => {
                ensure_object(ctx, cluster, resources::build_statefulset(cluster, config)).await
            }
            ManagedResource::StorageClaims => ensure_claim_labels(ctx, cluster).await,
            ManagedResource::ServiceMonitor => ensure_service_monitor(ctx, cluster).await,
        }
    }
}

/// Keep labels on the claims the StatefulSet created. Missing claims are
/// left for the StatefulSet controller to create.
async fn ensure_claim_labels<S, R>(ctx: &Context<'_, S, R>, cluster: &OpenldapCluster) -> Result<bool>
where
    S: ObjectStore,
    R: EventRecorder,
{
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let mut desired_labels = cluster.selector_labels();
    desired_labels.insert(LABEL_MANAGED_BY.to_string(), resources::MANAGED_BY.to_string());
    let desired = PersistentVolumeClaim {
        metadata: ObjectMeta {
            labels: Some(desired_labels),
            ..Default::default()
        },
        ..Default::default()
    };

    let mut changed = false;
    for index in 0..cluster.spec.replicas {
        let name = cluster.claim_name(index);
        let Some(mut claim) = ctx
            .store
            .get::<PersistentVolumeClaim>(&namespace, &name)
            .await?
        else {
            continue;
        };
        if claim.adopt_owned_fields(&desired) {
            info!("Updating labels on PersistentVolumeClaim {}/{}", namespace, name);
            ctx.store.replace(&namespace, &claim).await?;
            changed = true;
        }
    }
    Ok(changed)
}

/// The metrics Service fronts the exporter sidecar, which only runs while
/// monitoring is on
async fn ensure_metrics_service<S, R>(
    ctx: &Context<'_, S, R>,
    cluster: &OpenldapCluster,
) -> Result<bool>
where
    S: ObjectStore,
    R: EventRecorder,
{
    if cluster.spec.monitor_enabled() {
        let desired = resources::build_metrics_service(cluster, ctx.config);
        return ensure_object(ctx, cluster, desired).await;
    }

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.metrics_service_name();
    let deleted = ctx.store.delete::<Service>(&namespace, &name).await?;
    if deleted {
        info!("Deleted Service {}/{}", namespace, name);
    }
    Ok(deleted)
}

/// Create or update the ServiceMonitor while monitoring is on, delete it when off
async fn ensure_service_monitor<S, R>(
    ctx: &Context<'_, S, R>,
    cluster: &OpenldapCluster,
) -> Result<bool>
where
    S: ObjectStore,
    R: EventRecorder,
{
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    if !cluster.spec.monitor_enabled() {
        let deleted = match ctx
            .store
            .delete::<ServiceMonitor>(&namespace, &cluster.name_any())
            .await
        {
            Ok(deleted) => deleted,
            // The Prometheus Operator CRDs are not installed
            Err(Error::KubeError(kube::Error::Api(e))) if e.code == 404 => false,
            Err(e) => return Err(e),
        };
        if deleted {
            info!("Deleted ServiceMonitor {}/{}", namespace, cluster.name_any());
        }
        return Ok(deleted);
    }

    let desired = resources::build_service_monitor(cluster, ctx.config);
    match ensure_object(ctx, cluster, desired).await {
        Err(Error::KubeError(kube::Error::Api(e))) if e.code == 404 => {
            warn!(
                "ServiceMonitor API is not available in the cluster, skipping scrape registration for {}",
                cluster.name_any()
            );
            Ok(false)
        }
        other => other,
    }
}
