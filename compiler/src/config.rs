// config.rs — Target hardware configuration
//
// Module-level context consumed as opaque constants: warp geometry and the
// size/alignment of a hardware tensor descriptor. Values are supplied by the
// driver (CLI flags or the serialized module); defaults describe a
// Hopper-class part.

use serde::{Deserialize, Serialize};

/// Bytes occupied by one hardware tensor descriptor.
pub const DEFAULT_DESCRIPTOR_SIZE: u32 = 128;
/// Required alignment of a descriptor buffer in global scratch memory.
pub const DEFAULT_DESCRIPTOR_ALIGN: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub num_warps: u32,
    pub threads_per_warp: u32,
    /// Compute capability as `major * 10 + minor` (e.g. 90).
    pub compute_capability: u32,
    pub descriptor_size: u32,
    pub descriptor_align: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            num_warps: 4,
            threads_per_warp: 32,
            compute_capability: 90,
            descriptor_size: DEFAULT_DESCRIPTOR_SIZE,
            descriptor_align: DEFAULT_DESCRIPTOR_ALIGN,
        }
    }
}

impl TargetConfig {
    /// Threads in one cooperative thread array.
    pub fn threads_per_cta(&self) -> u32 {
        self.num_warps * self.threads_per_warp
    }

    /// Canonical compact JSON used for provenance fingerprints.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_four_warps() {
        let cfg = TargetConfig::default();
        assert_eq!(cfg.threads_per_cta(), 128);
        assert_eq!(cfg.descriptor_size, 128);
    }

    #[test]
    fn canonical_json_is_stable() {
        let cfg = TargetConfig::default();
        assert_eq!(cfg.canonical_json(), TargetConfig::default().canonical_json());
        let parsed: TargetConfig = serde_json::from_str(&cfg.canonical_json()).unwrap();
        assert_eq!(parsed, cfg);
    }
}
