//! Compute device selection

use crate::config::DevicePreference;
use crate::error::LoadError;
use std::fmt;
use tracing::info;

/// Device an ONNX session executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{}", device_id),
        }
    }
}

/// Pick the best device allowed by `preference`.
pub fn select_device(preference: DevicePreference) -> Result<Device, LoadError> {
    select_with(preference, cuda_available())
}

fn select_with(preference: DevicePreference, cuda: bool) -> Result<Device, LoadError> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Auto if cuda => Device::Cuda { device_id: 0 },
        DevicePreference::Auto => Device::Cpu,
        DevicePreference::Cuda if cuda => Device::Cuda { device_id: 0 },
        DevicePreference::Cuda => {
            return Err(LoadError::device(
                "CUDA requested but no CUDA execution provider is available",
            ))
        }
    };
    info!(preference = ?preference, device = %device, "Compute device selected");
    Ok(device)
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}
