//! Per-replica resource quotas.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Extended resource name for NVIDIA GPUs.
pub const GPU_RESOURCE_KEY: &str = "nvidia.com/gpu";

/// Requests and limits with identical quantities. The GPU key is left out
/// entirely when `gpus` is zero.
pub fn build_resource_requirements(cpus: u32, memory_gb: u32, gpus: u32) -> ResourceRequirements {
    let mut quota = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpus.to_string())),
        ("memory".to_string(), Quantity(format!("{memory_gb}Gi"))),
    ]);
    if gpus > 0 {
        quota.insert(GPU_RESOURCE_KEY.to_string(), Quantity(gpus.to_string()));
    }
    ResourceRequirements {
        requests: Some(quota.clone()),
        limits: Some(quota),
        ..Default::default()
    }
}
