//! Configuration for an [`ExternMetadata`](super::ExternMetadata) run
//!
//! The backend choice is a value made once at startup and injected into the
//! run. Its default follows the `batched` Cargo feature, so the same call
//! site gets a device backend in device builds and none otherwise.

use std::str::FromStr;

use serde::Serialize;

use crate::device::Device;
use crate::error::{config_err, ArbiterError, ArbiterResult};
use crate::pool::slab_pool::DEFAULT_MAX_SLABS_PER_CLASS;

/// True when compiled with the `batched` feature
pub const DEVICE_BACKEND_BUILD: bool = cfg!(feature = "batched");

/// BLAS level 1-3 routines the threaded backend declares by default
pub const DEFAULT_BLAS_FUNCS: &[&str] = &[
    "gemm", "gemv", "ger", "axpy", "dot", "scal", "nrm2", "asum",
];

/// Environment variable selecting the backend (`none` or `batched`)
pub const BACKEND_ENV: &str = "ARBITER_BACKEND";

/// Environment variable for the batch threshold
pub const BATCH_SIZE_ENV: &str = "ARBITER_BATCH_SIZE";

/// Environment variable for the pool policy (`disabled`, `all`, `accelerators`)
pub const POOL_POLICY_ENV: &str = "ARBITER_POOL_POLICY";

/// Environment variable for the per-class slab cap
pub const POOL_MAX_ENV: &str = "ARBITER_POOL_MAX_PER_CLASS";

/// Settings of the threaded batch backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Pending calls that trigger a batch submission
    pub max_batch_calls: usize,

    /// Operation names with a device implementation
    pub declared_funcs: Vec<String>,

    /// Name of the worker thread
    pub worker_name: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_calls: 64,
            declared_funcs: DEFAULT_BLAS_FUNCS.iter().map(|s| s.to_string()).collect(),
            worker_name: "arbiter-batch-worker".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_calls(mut self, max_batch_calls: usize) -> Self {
        self.max_batch_calls = max_batch_calls;
        self
    }

    pub fn with_declared_funcs<I, S>(mut self, funcs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_funcs = funcs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    pub fn validate(&self) -> ArbiterResult<()> {
        if self.max_batch_calls == 0 {
            return Err(config_err("max_batch_calls must be > 0"));
        }
        if self.declared_funcs.iter().any(|f| f.trim().is_empty()) {
            return Err(config_err("declared function names must not be empty"));
        }
        if self.worker_name.trim().is_empty() {
            return Err(config_err("worker_name must not be empty"));
        }
        Ok(())
    }
}

/// Which devices are backed by the slab pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolPolicy {
    /// Get always misses, Put drops the slab
    Disabled,
    /// Every device is pooled
    AllDevices,
    /// Only accelerators are pooled, host slabs bypass the pool
    AcceleratorsOnly,
}

impl PoolPolicy {
    pub fn covers(&self, device: Device) -> bool {
        match self {
            PoolPolicy::Disabled => false,
            PoolPolicy::AllDevices => true,
            PoolPolicy::AcceleratorsOnly => device.is_accelerator(),
        }
    }
}

impl FromStr for PoolPolicy {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(PoolPolicy::Disabled),
            "all" | "all_devices" => Ok(PoolPolicy::AllDevices),
            "accelerators" | "accelerators_only" | "gpu" => Ok(PoolPolicy::AcceleratorsOnly),
            other => Err(config_err(format!("unknown pool policy '{}'", other))),
        }
    }
}

/// Slab pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub policy: PoolPolicy,
    pub max_slabs_per_class: usize,
}

impl PoolConfig {
    /// Pooling follows the backend: on with one, off without.
    pub fn for_backend(has_backend: bool) -> Self {
        PoolConfig {
            policy: if has_backend {
                PoolPolicy::AllDevices
            } else {
                PoolPolicy::Disabled
            },
            max_slabs_per_class: DEFAULT_MAX_SLABS_PER_CLASS,
        }
    }

    pub fn with_policy(mut self, policy: PoolPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_slabs_per_class(mut self, max: usize) -> Self {
        self.max_slabs_per_class = max;
        self
    }
}

/// Backend choice for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    None,
    Batched(BatchConfig),
}

impl BackendSelection {
    pub fn is_none(&self) -> bool {
        matches!(self, BackendSelection::None)
    }
}

/// Configuration for one VM run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternConfig {
    pub backend: BackendSelection,
    pub pool: PoolConfig,
}

impl Default for ExternConfig {
    fn default() -> Self {
        if DEVICE_BACKEND_BUILD {
            Self::batched(BatchConfig::default())
        } else {
            Self::no_backend()
        }
    }
}

impl ExternConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host-only run: no backend, pooling disabled
    pub fn no_backend() -> Self {
        ExternConfig {
            backend: BackendSelection::None,
            pool: PoolConfig::for_backend(false),
        }
    }

    /// Device run with the threaded batch backend and pooling on
    pub fn batched(batch: BatchConfig) -> Self {
        ExternConfig {
            backend: BackendSelection::Batched(batch),
            pool: PoolConfig::for_backend(true),
        }
    }

    pub fn with_pool_policy(mut self, policy: PoolPolicy) -> Self {
        self.pool.policy = policy;
        self
    }

    pub fn with_max_slabs_per_class(mut self, max: usize) -> Self {
        self.pool.max_slabs_per_class = max;
        self
    }

    pub fn validate(&self) -> ArbiterResult<()> {
        if let BackendSelection::Batched(batch) = &self.backend {
            batch.validate()?;
        }
        if self.backend.is_none() && self.pool.policy != PoolPolicy::Disabled {
            return Err(config_err(format!(
                "pool policy {:?} requires a backend",
                self.pool.policy
            )));
        }
        if self.pool.policy != PoolPolicy::Disabled && self.pool.max_slabs_per_class == 0 {
            return Err(config_err(
                "max_slabs_per_class must be > 0 when pooling is enabled",
            ));
        }
        Ok(())
    }

    /// Build from `ARBITER_*` environment variables over the build default.
    pub fn from_env() -> ArbiterResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> ArbiterResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(BACKEND_ENV).as_deref().map(str::trim) {
            None | Some("") => Self::default(),
            Some(v) if v.eq_ignore_ascii_case("none") => Self::no_backend(),
            Some(v) if v.eq_ignore_ascii_case("batched") => Self::batched(BatchConfig::default()),
            Some(other) => {
                return Err(config_err(format!(
                    "{}: unknown backend '{}'",
                    BACKEND_ENV, other
                )))
            }
        };

        if let Some(raw) = lookup(BATCH_SIZE_ENV) {
            let size = parse_usize(BATCH_SIZE_ENV, &raw)?;
            match &mut config.backend {
                BackendSelection::Batched(batch) => batch.max_batch_calls = size,
                BackendSelection::None => {
                    tracing::debug!("{} ignored without a backend", BATCH_SIZE_ENV);
                }
            }
        }

        if let Some(raw) = lookup(POOL_POLICY_ENV) {
            config.pool.policy = raw.parse()?;
        }

        if let Some(raw) = lookup(POOL_MAX_ENV) {
            config.pool.max_slabs_per_class = parse_usize(POOL_MAX_ENV, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_usize(key: &str, raw: &str) -> ArbiterResult<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| config_err(format!("{}='{}': {}", key, raw, e)))
}
