// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Static partition of the secure-world virtual address space
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (mm/tests_prop.rs)
//! PUBLIC API: Region, Domain, RootScope, AddressRegionTable::{komodo,new,region_for,bounds_check}
//! DEPENDS_ON: mm constants, types::VirtAddr, boot::ConfigurationError
//! INVARIANTS: Regions page aligned and pairwise disjoint; user region starts at 0 and
//!             ends at the monitor base; table immutable after construction

use core::fmt;

use super::{
    is_page_aligned, KOM_DIRECTMAP_SIZE, KOM_DIRECTMAP_VBASE, KOM_MON_VBASE, KOM_VA_LIMIT,
};
use crate::boot::ConfigurationError;
use crate::types::VirtAddr;

/// Protection domain a region belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Enclave code and data, reachable from PL0.
    User,
    /// Monitor image, PL1 only.
    MonitorPrivileged,
    /// 1:1 alias of low physical memory, PL1 only.
    DirectMapped,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::User, Domain::MonitorPrivileged, Domain::DirectMapped];

    const fn index(self) -> usize {
        match self {
            Domain::User => 0,
            Domain::MonitorPrivileged => 1,
            Domain::DirectMapped => 2,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::User => "user",
            Domain::MonitorPrivileged => "monitor",
            Domain::DirectMapped => "directmap",
        })
    }
}

/// Which page-table root translates a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootScope {
    /// Swapped with every enclave (TTBR0).
    PerEnclave,
    /// Populated once by the bootloader and shared for the life of the monitor (TTBR1).
    StaticShared,
}

/// One contiguous slice of the virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    name: &'static str,
    base: VirtAddr,
    size: u64,
    domain: Domain,
    cacheable: bool,
    root_scope: RootScope,
}

impl Region {
    pub const fn new(
        name: &'static str,
        base: u64,
        size: u64,
        domain: Domain,
        cacheable: bool,
        root_scope: RootScope,
    ) -> Self {
        Self { name, base: VirtAddr::new(base), size, domain, cacheable, root_scope }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address. Saturates for unvalidated regions.
    pub const fn end(&self) -> u64 {
        self.base.raw().saturating_add(self.size)
    }

    pub const fn domain(&self) -> Domain {
        self.domain
    }

    pub const fn cacheable(&self) -> bool {
        self.cacheable
    }

    pub const fn root_scope(&self) -> RootScope {
        self.root_scope
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va.raw() >= self.base.raw() && va.raw() < self.end()
    }

    /// `true` when `[va, va + len)` lies inside the region. An empty range
    /// is inside iff `va` is.
    pub fn contains_range(&self, va: VirtAddr, len: u64) -> bool {
        if !self.contains(va) {
            return false;
        }
        match va.raw().checked_add(len) {
            Some(end) => end <= self.end(),
            None => false,
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base.raw() < other.end() && other.base.raw() < self.end()
    }
}

/// Failure of an address classification or bounds check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// No region contains the address.
    NotMapped(VirtAddr),
    /// The range is not fully contained in a single region.
    OutOfRange { addr: VirtAddr, len: u64 },
    /// The range is in a region of the wrong protection domain.
    WrongDomain { expected: Domain, found: Domain },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::NotMapped(va) => write!(f, "address {:#x} is not in any region", va),
            LayoutError::OutOfRange { addr, len } => {
                write!(f, "range {:#x}+{:#x} leaves its region", addr, len)
            }
            LayoutError::WrongDomain { expected, found } => {
                write!(f, "expected {} region, found {}", expected, found)
            }
        }
    }
}

const REGION_COUNT: usize = 3;

/// Regions of the Komodo secure world, ordered by base address.
const KOMODO_REGIONS: [Region; REGION_COUNT] = [
    Region::new("user", 0, KOM_MON_VBASE, Domain::User, true, RootScope::PerEnclave),
    Region::new(
        "monitor",
        KOM_MON_VBASE,
        KOM_DIRECTMAP_VBASE - KOM_MON_VBASE,
        Domain::MonitorPrivileged,
        true,
        RootScope::StaticShared,
    ),
    Region::new(
        "directmap",
        KOM_DIRECTMAP_VBASE,
        KOM_DIRECTMAP_SIZE,
        Domain::DirectMapped,
        true,
        RootScope::StaticShared,
    ),
];

/// Immutable description of the three-region partition.
///
/// Built once at boot and shared by reference; there is no way to mutate a
/// table after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRegionTable {
    /// Sorted by base address.
    regions: [Region; REGION_COUNT],
    /// `regions` index for each `Domain::index()`.
    by_domain: [usize; REGION_COUNT],
}

impl AddressRegionTable {
    /// The build-time layout. Its invariants are checked by the constant
    /// assertions in `mm` and by `validate` in the unit tests.
    pub const fn komodo() -> Self {
        Self { regions: KOMODO_REGIONS, by_domain: [0, 1, 2] }
    }

    /// Builds a table from arbitrary regions, rejecting any layout that
    /// breaks the partition invariants.
    pub fn new(mut regions: [Region; REGION_COUNT]) -> Result<Self, ConfigurationError> {
        regions.sort_unstable_by_key(|r| r.base.raw());
        let mut by_domain = [usize::MAX; REGION_COUNT];
        for (index, region) in regions.iter().enumerate() {
            let slot = &mut by_domain[region.domain.index()];
            if *slot != usize::MAX {
                return Err(ConfigurationError::DuplicateDomain(region.domain));
            }
            *slot = index;
        }
        let table = Self { regions, by_domain };
        table.validate()?;
        Ok(table)
    }

    /// Checks alignment, disjointness and the user/monitor split.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for region in &self.regions {
            if region.size == 0 {
                return Err(ConfigurationError::EmptyRegion(region.name));
            }
            if !is_page_aligned(region.base.raw()) || !is_page_aligned(region.size) {
                return Err(ConfigurationError::RegionMisaligned(region.name));
            }
            match region.base.raw().checked_add(region.size) {
                Some(end) if end <= KOM_VA_LIMIT => {}
                _ => return Err(ConfigurationError::RegionOutsideAddressSpace(region.name)),
            }
            let expected_scope = match region.domain {
                Domain::User => RootScope::PerEnclave,
                Domain::MonitorPrivileged | Domain::DirectMapped => RootScope::StaticShared,
            };
            if region.root_scope != expected_scope {
                return Err(ConfigurationError::RootScopeMismatch(region.name));
            }
        }
        for (i, a) in self.regions.iter().enumerate() {
            for b in &self.regions[i + 1..] {
                if a.overlaps(b) {
                    return Err(ConfigurationError::RegionOverlap(a.name, b.name));
                }
            }
        }
        let user = self.user();
        if user.base.raw() != 0 {
            return Err(ConfigurationError::UserNotAtZero);
        }
        if user.end() != self.monitor().base.raw() {
            return Err(ConfigurationError::SplitMismatch {
                user_end: user.end(),
                monitor_base: self.monitor().base.raw(),
            });
        }
        Ok(())
    }

    pub fn region(&self, domain: Domain) -> &Region {
        &self.regions[self.by_domain[domain.index()]]
    }

    pub fn user(&self) -> &Region {
        self.region(Domain::User)
    }

    pub fn monitor(&self) -> &Region {
        self.region(Domain::MonitorPrivileged)
    }

    pub fn direct_map(&self) -> &Region {
        self.region(Domain::DirectMapped)
    }

    /// Regions in ascending base-address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Returns the region containing `va`.
    pub fn region_for(&self, va: VirtAddr) -> Result<&Region, LayoutError> {
        self.regions.iter().find(|r| r.contains(va)).ok_or(LayoutError::NotMapped(va))
    }

    /// Validates that `[va, va + len)` lies in one region of domain `expected`.
    ///
    /// Every caller-supplied address must pass through here before it is
    /// trusted with the privileges of `expected`.
    pub fn bounds_check(
        &self,
        va: VirtAddr,
        len: u64,
        expected: Domain,
    ) -> Result<&Region, LayoutError> {
        let out_of_range = LayoutError::OutOfRange { addr: va, len };
        let region = self.region_for(va).map_err(|_| out_of_range)?;
        if !region.contains_range(va, len) {
            return Err(out_of_range);
        }
        if region.domain != expected {
            return Err(LayoutError::WrongDomain { expected, found: region.domain });
        }
        Ok(region)
    }
}

impl Default for AddressRegionTable {
    fn default() -> Self {
        Self::komodo()
    }
}
