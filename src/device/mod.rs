//! Device and memory handles.
//!
//! A [`Device`] is a plain lookup key for an execution target. A [`Memory`]
//! is an opaque handle to a contiguous slab on one device. Handles are moved,
//! never copied, so a slab always has exactly one owner: the pool or the
//! caller that leased it.

pub mod memory;

pub use memory::{DevicePtr, Memory};

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{config_err, ArbiterError};

/// Execution target identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub enum Device {
    /// Host fallback path
    #[default]
    Host,
    /// Accelerator by ordinal
    Accelerator(u32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }

    /// Accelerator ordinal, if any
    pub fn ordinal(&self) -> Option<u32> {
        match self {
            Device::Host => None,
            Device::Accelerator(n) => Some(*n),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accelerator(n) => write!(f, "accel:{}", n),
        }
    }
}

impl FromStr for Device {
    type Err = ArbiterError;

    /// Accepts `host`, `cpu`, `accel:N` and `gpu:N` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "host" | "cpu" => return Ok(Device::Host),
            _ => {}
        }

        let ordinal = lower
            .strip_prefix("accel:")
            .or_else(|| lower.strip_prefix("gpu:"))
            .ok_or_else(|| config_err(format!("unknown device '{}'", s)))?;

        ordinal
            .parse::<u32>()
            .map(Device::Accelerator)
            .map_err(|e| config_err(format!("bad device ordinal in '{}': {}", s, e)))
    }
}
