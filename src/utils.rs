use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

/// Where tensor computation runs. Resolved once at startup and handed to
/// every tensor-producing component instead of being queried ad hoc.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTarget {
    #[default]
    Auto,
    Cpu,
    Accelerator,
}

impl ComputeTarget {
    pub fn resolve(self) -> Device {
        match self {
            ComputeTarget::Cpu => Device::Cpu,
            ComputeTarget::Auto | ComputeTarget::Accelerator => {
                if tch::utils::has_mps() {
                    Device::Mps
                } else {
                    Device::cuda_if_available()
                }
            }
        }
    }
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan()
        .to_kind(Kind::Int64)
        .sum(Kind::Int64)
        .int64_value(&[])
        > 0
}
