//! Kubernetes backend for kubestream
//!
//! This crate exposes the pods of a set of namespaces as log sources:
//! historical reads, live tails and discovery of newly started pods.

mod client;
mod sources;

pub use client::KubeClient;
pub use sources::{DEFAULT_DISCOVERY_INTERVAL, KubeSources, pod_to_descriptor};
