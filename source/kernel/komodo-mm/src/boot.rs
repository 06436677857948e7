// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot handoff for the monitor memory core
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/boot_layout.rs
//! PUBLIC API: BootInfo, ConfigurationError, MonitorMemory::{try_init,init,new_enclave_space}
//! DEPENDS_ON: mm::layout, mm::direct_map, mm::secure_pool, mm::enclave_space
//! INVARIANTS: Layout and RAM size validated exactly once; all state built here is
//!             read-only afterwards except the pool's own interior lock

use core::fmt;

use crate::mm::direct_map::DirectMap;
use crate::mm::enclave_space::EnclaveAddressSpace;
use crate::mm::layout::{AddressRegionTable, Domain};
use crate::mm::secure_pool::MonitorPagePool;
use crate::types::EnclaveId;

/// Facts reported by the bootloader before the monitor takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootInfo {
    /// Bytes of physical RAM installed starting at physical address 0.
    pub ram_size: u64,
}

impl BootInfo {
    pub const fn new(ram_size: u64) -> Self {
        Self { ram_size }
    }
}

/// Fatal configuration problems detected during boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Two regions claim the same domain.
    DuplicateDomain(Domain),
    EmptyRegion(&'static str),
    RegionMisaligned(&'static str),
    /// Region end lies past the 32-bit virtual address space.
    RegionOutsideAddressSpace(&'static str),
    /// Region uses the wrong translation root for its domain.
    RootScopeMismatch(&'static str),
    RegionOverlap(&'static str, &'static str),
    /// The user region does not start at virtual address 0.
    UserNotAtZero,
    /// TTBR0 and TTBR1 halves do not meet.
    SplitMismatch { user_end: u64, monitor_base: u64 },
    /// Bootloader reported zero bytes of RAM.
    NoRam,
    RamMisaligned(u64),
    /// Installed RAM cannot be aliased in full by the direct map.
    RamExceedsDirectMap { ram_size: u64, ceiling: u64 },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::DuplicateDomain(domain) => {
                write!(f, "more than one region for domain {}", domain)
            }
            ConfigurationError::EmptyRegion(name) => write!(f, "region {} is empty", name),
            ConfigurationError::RegionMisaligned(name) => {
                write!(f, "region {} not page aligned", name)
            }
            ConfigurationError::RegionOutsideAddressSpace(name) => {
                write!(f, "region {} exceeds the 32-bit address space", name)
            }
            ConfigurationError::RootScopeMismatch(name) => {
                write!(f, "region {} uses the wrong translation root", name)
            }
            ConfigurationError::RegionOverlap(a, b) => {
                write!(f, "regions {} and {} overlap", a, b)
            }
            ConfigurationError::UserNotAtZero => f.write_str("user region must start at 0"),
            ConfigurationError::SplitMismatch { user_end, monitor_base } => write!(
                f,
                "user region ends at {:#x} but monitor region starts at {:#x}",
                user_end, monitor_base
            ),
            ConfigurationError::NoRam => f.write_str("no RAM reported"),
            ConfigurationError::RamMisaligned(size) => {
                write!(f, "RAM size {:#x} not page aligned", size)
            }
            ConfigurationError::RamExceedsDirectMap { ram_size, ceiling } => write!(
                f,
                "RAM size {:#x} exceeds direct-map ceiling {:#x}",
                ram_size, ceiling
            ),
        }
    }
}

/// Memory state established once at boot and shared by every monitor call.
pub struct MonitorMemory {
    regions: AddressRegionTable,
    direct_map: DirectMap,
    pool: MonitorPagePool,
}

impl MonitorMemory {
    /// Validates the Komodo layout against `info` and builds the memory core.
    pub fn try_init(info: &BootInfo) -> Result<Self, ConfigurationError> {
        let regions = AddressRegionTable::komodo();
        regions.validate()?;
        for region in regions.iter() {
            log_info!(
                target: "boot",
                "region {} {:#x}..{:#x} {}",
                region.name(),
                region.base().raw(),
                region.end(),
                region.domain()
            );
        }

        let direct_map = DirectMap::new(&regions, info.ram_size)?;
        log_info!(
            target: "boot",
            "ram {:#x} bytes, direct map {:#x}..{:#x}",
            direct_map.ram_size(),
            direct_map.virt_base().raw(),
            direct_map.virt_base().raw() + direct_map.ram_size()
        );

        let pool = MonitorPagePool::new(&direct_map);
        log_info!(
            target: "boot",
            "secure pool: {} slots over {} pages",
            pool.capacity(),
            pool.page_limit()
        );
        Ok(Self { regions, direct_map, pool })
    }

    /// Like [`MonitorMemory::try_init`], but a configuration error halts boot.
    pub fn init(info: &BootInfo) -> Self {
        match Self::try_init(info) {
            Ok(memory) => memory,
            Err(err) => {
                log_error!(target: "boot", "memory configuration rejected: {}", err);
                panic!("monitor memory configuration: {}", err);
            }
        }
    }

    pub fn regions(&self) -> &AddressRegionTable {
        &self.regions
    }

    pub fn direct_map(&self) -> &DirectMap {
        &self.direct_map
    }

    pub fn pool(&self) -> &MonitorPagePool {
        &self.pool
    }

    /// Creates an empty address space for enclave `id` bounded by this layout.
    pub fn new_enclave_space(&self, id: EnclaveId) -> EnclaveAddressSpace<'_> {
        EnclaveAddressSpace::new(&self.regions, id)
    }
}

impl fmt::Debug for MonitorMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorMemory")
            .field("ram_size", &self.direct_map.ram_size())
            .field("pool_claimed", &self.pool.claimed())
            .finish()
    }
}
