//! Custom Resource Definitions for the OpenLDAP operator
//!
//! `OpenldapCluster` is owned by this operator. `ServiceMonitor` belongs to the
//! Prometheus Operator and is only written, never installed.

mod openldap_cluster;
pub mod service_monitor;
pub mod types;


pub use openldap_cluster::{
    OpenldapCluster, OpenldapClusterSpec, OpenldapClusterStatus, SpecValidationError,
    LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME, LABEL_VERSION, ROLE_MASTER,
    ROLE_SLAVE,
};
pub use service_monitor::{ServiceMonitor, ServiceMonitorSpec};
pub use types::*;
