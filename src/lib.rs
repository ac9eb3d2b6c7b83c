//! Scaleway provider for declarative infrastructure engines
//!
//! Reconciles desired state held by a host engine against the Scaleway REST APIs. The
//! host sees [`provider::Provider`], a registry of resource and data-source descriptors;
//! each descriptor drives one Scaleway object kind through create, read, update and
//! delete.

pub mod config;
pub mod error;
pub mod locality;
pub mod provider;
pub mod reconcile;
pub mod resources;
pub mod scw;

pub use error::{Error, Result};
pub use provider::Provider;

/// Version injected at compile time via SCW_PROVIDER_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("SCW_PROVIDER_VERSION") {
    Some(v) => v,
    None => "dev",
};
