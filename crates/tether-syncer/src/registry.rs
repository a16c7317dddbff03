//! Resource type to synchronizer mapping
//!
//! Discovery hands every newly eligible [`ResourceType`] to the registry,
//! which picks a [`SyncFlavor`] and builds the synchronizer.

use std::collections::HashMap;
use std::sync::Arc;

use tether_common::ResourceType;

use crate::config::SyncerConfig;
use crate::resolver::SyncFlavor;
use crate::store::ClusterStore;
use crate::synchronizer::ResourceSynchronizer;
use crate::transform::TransformContext;

/// Core types that carry no status worth reflecting
const SPEC_ONLY_BUILTINS: &[&str] = &["configmaps", "secrets", "serviceaccounts"];

/// Builds synchronizers for eligible types
pub struct SynchronizerRegistry {
    logical: Arc<dyn ClusterStore>,
    physical: Arc<dyn ClusterStore>,
    ctx: Arc<TransformContext>,
    config: Arc<SyncerConfig>,
    overrides: HashMap<String, SyncFlavor>,
}

impl SynchronizerRegistry {
    /// Create a registry sharing the given stores and context
    pub fn new(
        logical: Arc<dyn ClusterStore>,
        physical: Arc<dyn ClusterStore>,
        ctx: Arc<TransformContext>,
        config: Arc<SyncerConfig>,
    ) -> Self {
        let overrides = SPEC_ONLY_BUILTINS
            .iter()
            .map(|gr| (gr.to_string(), SyncFlavor::SpecOnly))
            .collect();
        Self {
            logical,
            physical,
            ctx,
            config,
            overrides,
        }
    }

    /// Force a flavor for a `resource.group`
    pub fn with_override(mut self, group_resource: impl Into<String>, flavor: SyncFlavor) -> Self {
        self.overrides.insert(group_resource.into(), flavor);
        self
    }

    /// Flavor for a type: explicit override, else by status subresource
    pub fn flavor_for(&self, rt: &ResourceType) -> SyncFlavor {
        if let Some(flavor) = self.overrides.get(&rt.group_resource()) {
            return *flavor;
        }
        if rt.status_subresource {
            SyncFlavor::SpecAndStatus
        } else {
            SyncFlavor::SpecOnly
        }
    }

    /// Build a stopped synchronizer for a type
    pub fn build(&self, rt: &ResourceType) -> Arc<ResourceSynchronizer> {
        Arc::new(ResourceSynchronizer::new(
            rt.clone(),
            self.flavor_for(rt),
            self.logical.clone(),
            self.physical.clone(),
            self.ctx.clone(),
            self.config.clone(),
        ))
    }

    /// Store for the logical side
    pub fn logical(&self) -> &Arc<dyn ClusterStore> {
        &self.logical
    }

    /// Store for the physical side
    pub fn physical(&self) -> &Arc<dyn ClusterStore> {
        &self.physical
    }

    /// Shared configuration
    pub fn config(&self) -> &Arc<SyncerConfig> {
        &self.config
    }

    /// Shared transform context
    pub fn context(&self) -> &Arc<TransformContext> {
        &self.ctx
    }
}
