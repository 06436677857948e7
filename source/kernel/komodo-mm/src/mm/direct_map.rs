// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Direct-mapped window over low physical memory
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (mm/tests_prop.rs)
//! PUBLIC API: DirectMap::{new,to_virtual,to_physical,page_to_virtual,page_to_physical,page_alias,
//!             as_ptr,page_slice_mut}
//! DEPENDS_ON: mm::layout (directmap region), boot::ConfigurationError
//! INVARIANTS: v = base + p is a bijection over [0, ram_size); the ceiling is the
//!             directmap region size; addresses past detected RAM are rejected
//!
//! The window is populated once by the bootloader (cacheable, PL1 only) and
//! never edited afterwards, so every translation here is pure arithmetic.

use core::fmt;

use super::layout::{AddressRegionTable, Region};
use super::{is_page_aligned, KOM_PAGE_SHIFT, KOM_PAGE_SIZE};
use crate::boot::ConfigurationError;
use crate::types::{PageNr, PhysAddr, VirtAddr};

/// Failure of a direct-map translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectMapError {
    /// Physical address is at or above the direct-map ceiling.
    OutOfPhysicalRange(PhysAddr),
    /// Physical address is below the ceiling but past the RAM reported at boot.
    Unbacked(PhysAddr),
    /// Virtual address does not lie in the directmap region.
    NotInDirectMap(VirtAddr),
    /// A page-granular translation was given an unaligned address.
    Misaligned(u64),
}

impl fmt::Display for DirectMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectMapError::OutOfPhysicalRange(pa) => {
                write!(f, "physical address {:#x} beyond direct-map ceiling", pa)
            }
            DirectMapError::Unbacked(pa) => {
                write!(f, "physical address {:#x} beyond installed RAM", pa)
            }
            DirectMapError::NotInDirectMap(va) => {
                write!(f, "virtual address {:#x} outside the direct map", va)
            }
            DirectMapError::Misaligned(addr) => write!(f, "address {:#x} not page aligned", addr),
        }
    }
}

/// Translation between physical addresses and their alias in the directmap region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMap {
    region: Region,
    ram_size: u64,
}

impl DirectMap {
    /// Binds the window to the directmap region of `table` and to the amount
    /// of RAM the bootloader reported. More RAM than the window can alias is
    /// a fatal configuration error.
    pub fn new(table: &AddressRegionTable, ram_size: u64) -> Result<Self, ConfigurationError> {
        let region = *table.direct_map();
        if ram_size == 0 {
            return Err(ConfigurationError::NoRam);
        }
        if !is_page_aligned(ram_size) {
            return Err(ConfigurationError::RamMisaligned(ram_size));
        }
        if ram_size > region.size() {
            return Err(ConfigurationError::RamExceedsDirectMap {
                ram_size,
                ceiling: region.size(),
            });
        }
        Ok(Self { region, ram_size })
    }

    /// Hard ceiling on addressable physical memory.
    pub const fn ceiling(&self) -> u64 {
        self.region.size()
    }

    /// RAM reported at boot; never above [`Self::ceiling`].
    pub const fn ram_size(&self) -> u64 {
        self.ram_size
    }

    pub const fn virt_base(&self) -> VirtAddr {
        self.region.base()
    }

    /// Number of physical pages reachable through the window.
    pub const fn page_limit(&self) -> u64 {
        self.ram_size >> KOM_PAGE_SHIFT
    }

    pub fn contains_phys(&self, pa: PhysAddr) -> bool {
        pa.raw() < self.ram_size
    }

    fn check_phys(&self, pa: PhysAddr) -> Result<(), DirectMapError> {
        if pa.raw() >= self.ceiling() {
            return Err(DirectMapError::OutOfPhysicalRange(pa));
        }
        if pa.raw() >= self.ram_size {
            return Err(DirectMapError::Unbacked(pa));
        }
        Ok(())
    }

    /// Alias of `pa` in the directmap region. Byte granular.
    pub fn to_virtual(&self, pa: PhysAddr) -> Result<VirtAddr, DirectMapError> {
        self.check_phys(pa)?;
        // Cannot overflow: pa < region size and the region end was validated.
        Ok(VirtAddr::new(self.region.base().raw() + pa.raw()))
    }

    /// Physical address aliased by `va`. Byte granular.
    pub fn to_physical(&self, va: VirtAddr) -> Result<PhysAddr, DirectMapError> {
        if !self.region.contains(va) {
            return Err(DirectMapError::NotInDirectMap(va));
        }
        let pa = PhysAddr::new(va.raw() - self.region.base().raw());
        if pa.raw() >= self.ram_size {
            return Err(DirectMapError::Unbacked(pa));
        }
        Ok(pa)
    }

    /// Like [`Self::to_virtual`] but for callers building page-table entries.
    pub fn page_to_virtual(&self, pa: PhysAddr) -> Result<VirtAddr, DirectMapError> {
        if !pa.is_page_aligned() {
            return Err(DirectMapError::Misaligned(pa.raw()));
        }
        self.to_virtual(pa)
    }

    /// Like [`Self::to_physical`] but requires a page-aligned address.
    pub fn page_to_physical(&self, va: VirtAddr) -> Result<PhysAddr, DirectMapError> {
        if !va.is_page_aligned() {
            return Err(DirectMapError::Misaligned(va.raw()));
        }
        self.to_physical(va)
    }

    /// Virtual alias of the first byte of `page`.
    pub fn page_alias(&self, page: PageNr) -> Result<VirtAddr, DirectMapError> {
        let pa = page.base().ok_or(DirectMapError::OutOfPhysicalRange(PhysAddr::new(u64::MAX)))?;
        self.to_virtual(pa)
    }

    /// Pointer through which the monitor may access a `T` stored at `pa`.
    ///
    /// The whole object must lie in backed RAM and `pa` must be suitably
    /// aligned for `T`. Dereferencing is only sound while the direct-map root
    /// is active, which holds for all monitor-mode code.
    pub fn as_ptr<T>(&self, pa: PhysAddr) -> Result<*mut T, DirectMapError> {
        let size = core::mem::size_of::<T>() as u64;
        let align = core::mem::align_of::<T>() as u64;
        if pa.raw() % align != 0 {
            return Err(DirectMapError::Misaligned(pa.raw()));
        }
        let va = self.to_virtual(pa)?;
        if size > 0 {
            let last = pa.checked_add(size - 1).ok_or(DirectMapError::OutOfPhysicalRange(pa))?;
            self.check_phys(last)?;
        }
        let addr = usize::try_from(va.raw()).map_err(|_| DirectMapError::OutOfPhysicalRange(pa))?;
        Ok(addr as *mut T)
    }

    /// Mutable view of `page` through its direct-map alias.
    ///
    /// # Safety
    ///
    /// The direct-map root must be active, and the caller must have exclusive
    /// access to the page (a secure page it holds, or monitor-private memory)
    /// for the whole of `'p`.
    pub unsafe fn page_slice_mut<'p>(
        &self,
        page: PageNr,
    ) -> Result<&'p mut [u8; KOM_PAGE_SIZE as usize], DirectMapError> {
        let va = self.page_alias(page)?;
        let addr = usize::try_from(va.raw()).map_err(|_| DirectMapError::NotInDirectMap(va))?;
        // SAFETY: the alias covers one whole backed page and the caller
        // guarantees the window is live and the page is not shared.
        Ok(unsafe { &mut *(addr as *mut [u8; KOM_PAGE_SIZE as usize]) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{KOM_DIRECTMAP_SIZE, KOM_DIRECTMAP_VBASE};

    fn full_map() -> DirectMap {
        DirectMap::new(&AddressRegionTable::komodo(), KOM_DIRECTMAP_SIZE).expect("full RAM")
    }

    #[test]
    fn translates_page_one() {
        let map = full_map();
        let va = map.to_virtual(PhysAddr::new(0x1000)).expect("in range");
        assert_eq!(va, VirtAddr::new(0x8000_1000));
        assert_eq!(map.to_physical(VirtAddr::new(0x8000_1000)), Ok(PhysAddr::new(0x1000)));
    }

    #[test]
    fn window_edges() {
        let map = full_map();
        assert_eq!(map.to_virtual(PhysAddr::new(0)), Ok(VirtAddr::new(KOM_DIRECTMAP_VBASE)));
        assert_eq!(
            map.to_virtual(PhysAddr::new(KOM_DIRECTMAP_SIZE - 1)),
            Ok(VirtAddr::new(0xffff_ffff))
        );
        assert_eq!(
            map.to_virtual(PhysAddr::new(KOM_DIRECTMAP_SIZE)),
            Err(DirectMapError::OutOfPhysicalRange(PhysAddr::new(KOM_DIRECTMAP_SIZE)))
        );
    }

    #[test]
    fn rejects_virtual_addresses_outside_window() {
        let map = full_map();
        for raw in [0u64, 0x4000_0000, 0x7fff_ffff, 0x1_0000_0000] {
            assert_eq!(
                map.to_physical(VirtAddr::new(raw)),
                Err(DirectMapError::NotInDirectMap(VirtAddr::new(raw)))
            );
        }
    }

    #[test]
    fn page_granular_requires_alignment() {
        let map = full_map();
        assert_eq!(
            map.page_to_virtual(PhysAddr::new(0x1010)),
            Err(DirectMapError::Misaligned(0x1010))
        );
        assert_eq!(
            map.page_to_physical(VirtAddr::new(0x8000_1010)),
            Err(DirectMapError::Misaligned(0x8000_1010))
        );
        assert_eq!(map.to_virtual(PhysAddr::new(0x1010)), Ok(VirtAddr::new(0x8000_1010)));
        assert_eq!(map.page_to_physical(VirtAddr::new(0x8000_2000)), Ok(PhysAddr::new(0x2000)));
    }

    #[test]
    fn unbacked_tail_is_rejected() {
        let ram = 0x1000_0000;
        let map = DirectMap::new(&AddressRegionTable::komodo(), ram).expect("256 MiB");
        assert_eq!(map.page_limit(), ram / KOM_PAGE_SIZE);
        assert_eq!(
            map.to_virtual(PhysAddr::new(ram)),
            Err(DirectMapError::Unbacked(PhysAddr::new(ram)))
        );
        assert_eq!(
            map.to_physical(VirtAddr::new(KOM_DIRECTMAP_VBASE + ram)),
            Err(DirectMapError::Unbacked(PhysAddr::new(ram)))
        );
        assert_eq!(
            map.to_virtual(PhysAddr::new(KOM_DIRECTMAP_SIZE)),
            Err(DirectMapError::OutOfPhysicalRange(PhysAddr::new(KOM_DIRECTMAP_SIZE)))
        );
    }

    #[test]
    fn boot_rejects_oversized_or_odd_ram() {
        let table = AddressRegionTable::komodo();
        assert_eq!(
            DirectMap::new(&table, KOM_DIRECTMAP_SIZE + KOM_PAGE_SIZE),
            Err(ConfigurationError::RamExceedsDirectMap {
                ram_size: KOM_DIRECTMAP_SIZE + KOM_PAGE_SIZE,
                ceiling: KOM_DIRECTMAP_SIZE,
            })
        );
        assert_eq!(DirectMap::new(&table, 0), Err(ConfigurationError::NoRam));
        assert_eq!(DirectMap::new(&table, 0x1234), Err(ConfigurationError::RamMisaligned(0x1234)));
    }

    #[test]
    fn as_ptr_checks_object_bounds() {
        let ram = 0x10_0000;
        let map = DirectMap::new(&AddressRegionTable::komodo(), ram).expect("1 MiB");
        let ptr = map.as_ptr::<u64>(PhysAddr::new(0x2000)).expect("aligned");
        assert_eq!(ptr as usize as u64, KOM_DIRECTMAP_VBASE + 0x2000);
        assert_eq!(
            map.as_ptr::<u64>(PhysAddr::new(0x2004)),
            Err(DirectMapError::Misaligned(0x2004))
        );
        assert_eq!(
            map.as_ptr::<[u8; 16]>(PhysAddr::new(ram - 8)),
            Err(DirectMapError::Unbacked(PhysAddr::new(ram + 7)))
        );
    }

    #[test]
    fn page_alias_follows_installed_ram() {
        let ram = 0x20_0000;
        let map = DirectMap::new(&AddressRegionTable::komodo(), ram).expect("2 MiB");
        assert_eq!(map.page_alias(PageNr::new(1)), Ok(VirtAddr::new(0x8000_1000)));
        let last = PageNr::new(ram / KOM_PAGE_SIZE - 1);
        assert_eq!(
            map.page_alias(last),
            Ok(VirtAddr::new(KOM_DIRECTMAP_VBASE + ram - KOM_PAGE_SIZE))
        );
        let tail = PageNr::new(ram / KOM_PAGE_SIZE);
        assert_eq!(map.page_alias(tail), Err(DirectMapError::Unbacked(PhysAddr::new(ram))));
        assert!(map.contains_phys(PhysAddr::new(ram - 1)));
        assert!(!map.contains_phys(PhysAddr::new(ram)));
    }

    #[test]
    fn page_slice_rejects_pages_outside_ram() {
        let ram = 0x20_0000;
        let map = DirectMap::new(&AddressRegionTable::komodo(), ram).expect("2 MiB");
        let tail = PageNr::new(ram / KOM_PAGE_SIZE);
        // SAFETY: both calls fail before any memory is touched.
        unsafe {
            assert_eq!(
                map.page_slice_mut(tail).map(|_| ()),
                Err(DirectMapError::Unbacked(PhysAddr::new(ram)))
            );
            assert_eq!(
                map.page_slice_mut(PageNr::new(u64::MAX)).map(|_| ()),
                Err(DirectMapError::OutOfPhysicalRange(PhysAddr::new(u64::MAX)))
            );
        }
    }
}
