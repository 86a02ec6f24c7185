//! Manager configuration and the policies callers choose per request.

use std::path::PathBuf;
use std::time::Duration;

use keel_core::alloc::HashMap;

use crate::queue::ResourcePriority;
use crate::worker::default_content_update_workers;

/// Whether acquiring a handle should start loading right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Queue a load if the resource is not loaded yet.
    #[default]
    Load,
    /// Only create the entry. Loading starts on first access.
    NoLoad,
}

/// What `begin_access` returns while the real payload is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// The payload if loaded, else the type's loading fallback.
    #[default]
    AllowFallback,
    /// The payload if loaded, else the last fully loaded lower-quality payload, else the
    /// type's loading fallback.
    AllowLoadingFallback,
    /// Wait until the pipeline is done with the resource.
    BlockTillLoaded,
    /// Fail unless the payload is loaded.
    NoFallback,
}

impl FallbackPolicy {
    /// Whether the policy may serve something other than the loaded payload.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            FallbackPolicy::AllowFallback | FallbackPolicy::AllowLoadingFallback
        )
    }
}

/// How caller-contract violations are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractPolicy {
    /// Panic on the spot.
    Panic,
    /// Log an error and return `Err`.
    Log,
}

impl Default for ContractPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ContractPolicy::Panic
        } else {
            ContractPolicy::Log
        }
    }
}

/// Configuration for [`ResourceManager`](crate::ResourceManager).
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Threads running loaders.
    pub data_load_workers: usize,
    /// Threads running `update_content` for types without main-thread affinity.
    pub content_update_workers: usize,
    /// How long a resource must stay unreferenced before the sweep may reclaim it.
    /// Zero disables the sweep in `per_frame_update`.
    pub auto_free_unused_timeout: Duration,
    /// How long since the last acquisition before the sweep may reclaim a resource.
    pub auto_free_unused_threshold: Duration,
    /// Entries inspected per sweep. `None` inspects every entry.
    pub sweep_budget: Option<usize>,
    /// Priority of resources with neither a type nor a per-resource priority.
    pub default_priority: ResourcePriority,
    /// Per-type priorities, keyed by `Resource::type_name()`.
    pub type_priorities: HashMap<&'static str, ResourcePriority>,
    /// Root directory of the default file loader.
    pub base_path: PathBuf,
    /// How caller-contract violations are reported.
    pub contract_policy: ContractPolicy,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            data_load_workers: 2,
            content_update_workers: default_content_update_workers(),
            auto_free_unused_timeout: Duration::from_secs(10),
            auto_free_unused_threshold: Duration::from_secs(30),
            sweep_budget: None,
            default_priority: ResourcePriority::Medium,
            type_priorities: HashMap::new(),
            base_path: PathBuf::from("."),
            contract_policy: ContractPolicy::default(),
        }
    }
}

impl ResourceManagerConfig {
    pub fn with_data_load_workers(mut self, workers: usize) -> Self {
        self.data_load_workers = workers.max(1);
        self
    }

    pub fn with_content_update_workers(mut self, workers: usize) -> Self {
        self.content_update_workers = workers.max(1);
        self
    }

    pub fn with_auto_free_unused_timeout(mut self, timeout: Duration) -> Self {
        self.auto_free_unused_timeout = timeout;
        self
    }

    pub fn with_auto_free_unused_threshold(mut self, threshold: Duration) -> Self {
        self.auto_free_unused_threshold = threshold;
        self
    }

    pub fn with_sweep_budget(mut self, budget: Option<usize>) -> Self {
        self.sweep_budget = budget;
        self
    }

    pub fn with_default_priority(mut self, priority: ResourcePriority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_type_priority(mut self, type_name: &'static str, priority: ResourcePriority) -> Self {
        self.type_priorities.insert(type_name, priority);
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_contract_policy(mut self, policy: ContractPolicy) -> Self {
        self.contract_policy = policy;
        self
    }
}
