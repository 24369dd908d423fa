use anyhow::{anyhow, Result};
use candle::Device;
use std::str::FromStr;
use tracing::warn;

/// Where model weights should live, from `EMBED_DEVICE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.is_empty() || lower == "auto" {
            Ok(DevicePreference::Auto)
        } else if lower == "cpu" {
            Ok(DevicePreference::Cpu)
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            let ordinal = match trimmed.split_once(':') {
                Some((_, part)) => part
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| anyhow!("invalid CUDA ordinal in EMBED_DEVICE '{trimmed}'"))?,
                None => 0,
            };
            Ok(DevicePreference::Cuda(ordinal))
        } else {
            Err(anyhow!(
                "unrecognized EMBED_DEVICE value '{trimmed}' (expected auto, cpu or cuda:N)"
            ))
        }
    }
}

pub fn build_device(pref: DevicePreference) -> Result<Device> {
    match pref {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {ordinal} but initialization failed: {err}. Build with \
                 the `cuda` feature and ensure CUDA libraries are available."
            )
        }),
        DevicePreference::Auto => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(err) => {
                warn!("CUDA unavailable ({err}), falling back to CPU");
                Ok(Device::Cpu)
            }
        },
    }
}
