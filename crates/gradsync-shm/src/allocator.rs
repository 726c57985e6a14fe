//! Staging-buffer allocation keyed by partition key.
//!
//! Region names are derived from the tensor's first partition key, so every
//! process on a node opens the same segment without coordination. In a
//! multi-switch topology each PCIe switch gets its own copy of the buffer;
//! the last one is the canonical region the cross-switch reduction folds
//! into.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::region::SharedRegion;

pub struct ShmAllocator {
    prefix: String,
    num_pcie_switches: u32,
}

impl ShmAllocator {
    pub fn new(prefix: impl Into<String>, num_pcie_switches: u32) -> Self {
        Self {
            prefix: prefix.into(),
            num_pcie_switches: num_pcie_switches.max(1),
        }
    }

    /// Open the single staging region for a tensor whose first partition
    /// key is `key`.
    pub fn open_shared_memory(&self, key: u64, size: usize) -> Result<Arc<SharedRegion>> {
        let name = format!("{}_{key}", self.prefix);
        let region = SharedRegion::create_or_open(&name, size)?;
        trace!(name = %region.name(), size, owner = region.is_owner(), "opened staging region");
        Ok(Arc::new(region))
    }

    /// Open one staging region per PCIe switch. The caller treats the last
    /// entry as the canonical buffer.
    pub fn open_pcie_shared_memory(
        &self,
        key: u64,
        size: usize,
    ) -> Result<Vec<Arc<SharedRegion>>> {
        let mut regions = Vec::with_capacity(self.num_pcie_switches as usize);
        for switch in 0..self.num_pcie_switches {
            let name = format!("{}_pcie{switch}_{key}", self.prefix);
            let region = SharedRegion::create_or_open(&name, size)?;
            trace!(name = %region.name(), size, switch, "opened per-switch staging region");
            regions.push(Arc::new(region));
        }
        Ok(regions)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HostRegion;

    fn test_prefix(tag: &str) -> String {
        format!("gstest_{tag}_{}", std::process::id())
    }

    #[test]
    fn single_region_by_key() {
        let alloc = ShmAllocator::new(test_prefix("single"), 1);
        let region = alloc.open_shared_memory(42, 128).unwrap();
        assert_eq!(region.len(), 128);
    }

    #[test]
    fn pcie_regions_one_per_switch() {
        let alloc = ShmAllocator::new(test_prefix("pcie"), 2);
        let regions = alloc.open_pcie_shared_memory(7, 64).unwrap();
        assert_eq!(regions.len(), 2);
        for region in &regions {
            assert_eq!(region.len(), 64);
        }
    }
}
