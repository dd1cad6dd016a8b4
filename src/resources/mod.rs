//! Generators for the Kubernetes resources owned by an NdbCluster.

pub mod common;
pub mod configmap;
pub mod pdb;
pub mod secret;
pub mod services;
pub mod statefulset;
