//! Workspace custom resource reconciler (C7): converges a `Workspace` onto a
//! Deployment + Service pair, with verify-and-repair drift correction and a
//! delete/recreate fallback when an apply is rejected outright.

pub mod controller;
pub mod crd;
pub mod desired;
pub mod error;
pub mod lb_config;
pub mod reconcile;

pub use crd::{Exposure, ExposureType, Phase, Workspace, WorkspaceEnvVar, WorkspacePort, WorkspaceSpec, WorkspaceStatus};
pub use error::{Error, Result};
