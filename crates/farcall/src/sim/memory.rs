//! Sparse address space of a simulated target.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::bail;

use crate::traits::ProcessMemory;
use crate::traits::Protection;

pub const PAGE_SIZE: usize = 0x1000;

struct Region {
    data: Vec<u8>,
    protection: Protection,
    /// Mapped image rather than a heap allocation.
    image: bool,
}

/// Page-granular allocations. Every access must fall inside one allocation.
pub struct SimMemory {
    regions: Mutex<BTreeMap<u64, Region>>,
    next: AtomicU64,
    limit: u64,
}

impl SimMemory {
    /// Allocations are handed out upwards from `start` and never cross `limit`.
    pub fn new(start: u64, limit: u64) -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(start),
            limit,
        }
    }

    fn regions(&self) -> anyhow::Result<MutexGuard<'_, BTreeMap<u64, Region>>> {
        self.regions.lock().map_err(|_| anyhow!("simulated address space is poisoned"))
    }

    /// Maps an image at a fixed base.
    pub fn map_image(&self, base: u64, size: usize) -> anyhow::Result<()> {
        let mut regions = self.regions()?;
        let end = base + size as u64;
        if regions.range(..end).next_back().is_some_and(|(b, r)| b + r.data.len() as u64 > base) {
            bail!("image at {base:#x} overlaps an existing mapping");
        }
        regions.insert(base, Region { data: vec![0; size], protection: Protection::ReadWriteExecute, image: true });
        Ok(())
    }

    /// Unmaps an image mapped with [`SimMemory::map_image`].
    pub fn unmap_image(&self, base: u64) -> anyhow::Result<()> {
        let mut regions = self.regions()?;
        match regions.get(&base) {
            Some(region) if region.image => {
                regions.remove(&base);
                Ok(())
            }
            _ => bail!("no image mapped at {base:#x}"),
        }
    }

    /// Live heap allocations, images excluded.
    pub fn allocation_count(&self) -> usize {
        self.regions().map(|r| r.values().filter(|r| !r.image).count()).unwrap_or(0)
    }

    /// True if `address` lies in executable memory.
    pub fn is_executable(&self, address: u64) -> bool {
        self.regions()
            .map(|regions| {
                Self::find(&regions, address, 1)
                    .is_some_and(|(_, region)| region.protection == Protection::ReadWriteExecute)
            })
            .unwrap_or(false)
    }

    /// Bytes from `address` to the end of its allocation.
    pub fn read_to_end(&self, address: u64) -> anyhow::Result<Vec<u8>> {
        let regions = self.regions()?;
        let (base, region) = Self::find(&regions, address, 1)
            .ok_or_else(|| anyhow!("access violation reading {address:#x}"))?;
        Ok(region.data[(address - base) as usize..].to_vec())
    }

    fn find(regions: &BTreeMap<u64, Region>, address: u64, len: usize) -> Option<(u64, &Region)> {
        let (&base, region) = regions.range(..=address).next_back()?;
        let end = address.checked_add(len as u64)?;
        (end <= base + region.data.len() as u64).then_some((base, region))
    }
}

impl ProcessMemory for SimMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let regions = self.regions()?;
        let (base, region) = Self::find(&regions, address, buf.len())
            .ok_or_else(|| anyhow!("access violation reading {} bytes at {address:#x}", buf.len()))?;
        let offset = (address - base) as usize;
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut regions = self.regions()?;
        let base = Self::find(&regions, address, data.len())
            .map(|(base, _)| base)
            .ok_or_else(|| anyhow!("access violation writing {} bytes at {address:#x}", data.len()))?;
        let region = regions
            .get_mut(&base)
            .ok_or_else(|| anyhow!("region at {base:#x} vanished"))?;
        let offset = (address - base) as usize;
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn allocate(&self, size: usize, protection: Protection) -> anyhow::Result<u64> {
        if size == 0 {
            bail!("zero-sized allocation");
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        // One unmapped guard page after every allocation.
        let address = self.next.fetch_add((size + PAGE_SIZE) as u64, Ordering::Relaxed);
        if address + size as u64 > self.limit {
            bail!("address space exhausted allocating {size:#x} bytes");
        }

        self.regions()?.insert(address, Region { data: vec![0; size], protection, image: false });
        Ok(address)
    }

    fn free(&self, address: u64) -> anyhow::Result<()> {
        let mut regions = self.regions()?;
        match regions.get(&address) {
            Some(region) if !region.image => {
                regions.remove(&address);
                Ok(())
            }
            Some(_) => bail!("{address:#x} is a mapped image, not an allocation"),
            None => bail!("no allocation at {address:#x}"),
        }
    }
}
