//! Provider surface
//!
//! Everything the host engine sees: the attribute bag, descriptors and their registry,
//! schemas, plan-time diff hooks, state upgraders and diagnostics.

pub mod data;
pub mod descriptor;
pub mod diag;
pub mod diff;
pub mod meta;
pub mod schema;
pub mod upgrade;

use descriptor::{DataSourceDescriptor, DescriptorRegistry, ResourceDescriptor};
use meta::Meta;
use std::collections::BTreeMap;

/// All registered resource kinds and data sources, plus the provider meta
pub struct Provider {
    meta: Meta,
    resources: BTreeMap<&'static str, ResourceDescriptor>,
    data_sources: BTreeMap<&'static str, DataSourceDescriptor>,
}

impl Provider {
    /// Provider with every built-in kind registered
    pub fn new(meta: Meta) -> Self {
        let mut provider = Self::empty(meta);
        crate::resources::register(&mut provider);
        provider
    }

    pub fn empty(meta: Meta) -> Self {
        Self {
            meta,
            resources: BTreeMap::new(),
            data_sources: BTreeMap::new(),
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn add_resource(&mut self, descriptor: ResourceDescriptor) {
        if self.resources.contains_key(descriptor.name) {
            tracing::warn!("resource {} registered twice", descriptor.name);
        }
        self.resources.insert(descriptor.name, descriptor);
    }

    pub fn add_data_source(&mut self, descriptor: DataSourceDescriptor) {
        if self.data_sources.contains_key(descriptor.name) {
            tracing::warn!("data source {} registered twice", descriptor.name);
        }
        self.data_sources.insert(descriptor.name, descriptor);
    }
}

impl DescriptorRegistry for Provider {
    fn resource(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(name)
    }

    fn data_source(&self, name: &str) -> Option<&DataSourceDescriptor> {
        self.data_sources.get(name)
    }

    fn resource_names(&self) -> Vec<&'static str> {
        self.resources.keys().copied().collect()
    }

    fn data_source_names(&self) -> Vec<&'static str> {
        self.data_sources.keys().copied().collect()
    }
}
