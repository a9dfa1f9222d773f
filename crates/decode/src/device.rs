//! Compute device selection.
//!
//! The device is picked once at startup and passed explicitly to the model
//! and the generation controller; nothing reads it from global state.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    /// Pick the preferred device among those a backend reports as usable.
    ///
    /// Preference order is CUDA, then MPS, then CPU. `only_cpu` forces CPU.
    pub fn select(only_cpu: bool, available: &[Device]) -> Device {
        let device = if only_cpu {
            Device::Cpu
        } else if available.contains(&Device::Cuda) {
            Device::Cuda
        } else if available.contains(&Device::Mps) {
            Device::Mps
        } else {
            Device::Cpu
        };
        info!(%device, only_cpu, "selected compute device");
        device
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_cuda_then_mps() {
        let all = [Device::Cpu, Device::Mps, Device::Cuda];
        assert_eq!(Device::select(false, &all), Device::Cuda);
        assert_eq!(Device::select(false, &[Device::Cpu, Device::Mps]), Device::Mps);
        assert_eq!(Device::select(false, &[Device::Cpu]), Device::Cpu);
    }

    #[test]
    fn only_cpu_wins() {
        assert_eq!(Device::select(true, &[Device::Cuda]), Device::Cpu);
    }

    #[test]
    fn displays_lowercase() {
        assert_eq!(Device::Mps.to_string(), "mps");
    }
}
