//! openldap-k8s: Kubernetes operator for replicated OpenLDAP directory clusters
//!
//! This crate provides the `OpenldapCluster` custom resource, the controller
//! that converges its child objects, and the election engine that keeps
//! exactly one directory pod serving writes.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

pub use crate::config::OperatorConfig;
pub use crate::error::{Error, Result};
