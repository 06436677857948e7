// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-enclave address space confined to the user region
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/enclave_space.rs
//! PUBLIC API: EnclaveAddressSpace::{new,map_secure,map_insecure,unmap,translate,teardown,
//!             root_ppn,ttbr0_value}
//! DEPENDS_ON: mm::layout (bounds_check), mm::secure_pool, mm::direct_map, mm::page_table
//! INVARIANTS: Every mapping passes bounds_check(User) first; secure mappings only reference
//!             pages the enclave owns and pin them in the pool until unmapped; insecure
//!             mappings never alias a claimed secure page

use alloc::collections::BTreeSet;
use core::fmt;

use super::direct_map::{DirectMap, DirectMapError};
use super::layout::{AddressRegionTable, Domain, LayoutError};
use super::page_table::{MapError, PageFlags, PageTable};
use super::secure_pool::{PoolError, SecurePagePool};
use super::KOM_PAGE_SIZE;
use crate::types::{EnclaveId, Owner, PageNr, PhysAddr, VirtAddr};

/// Errors reported while building an enclave address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclaveSpaceError {
    /// Address failed the user-region bounds check.
    Layout(LayoutError),
    /// Underlying page-table operation failed.
    Mapping(MapError),
    /// Physical address is not usable through the direct map.
    DirectMap(DirectMapError),
    /// Secure page is not claimed by this enclave.
    NotOwned(PageNr),
    /// Insecure mapping would alias a claimed secure page.
    SecureAlias(PageNr),
    /// Secure-page accounting rejected the request.
    Pool(PoolError),
}

impl From<LayoutError> for EnclaveSpaceError {
    fn from(value: LayoutError) -> Self {
        Self::Layout(value)
    }
}

impl From<MapError> for EnclaveSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<DirectMapError> for EnclaveSpaceError {
    fn from(value: DirectMapError) -> Self {
        Self::DirectMap(value)
    }
}

impl From<PoolError> for EnclaveSpaceError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl fmt::Display for EnclaveSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnclaveSpaceError::Layout(err) => write!(f, "layout: {}", err),
            EnclaveSpaceError::Mapping(err) => write!(f, "mapping: {}", err),
            EnclaveSpaceError::DirectMap(err) => write!(f, "direct map: {}", err),
            EnclaveSpaceError::NotOwned(page) => write!(f, "{} not owned by enclave", page),
            EnclaveSpaceError::SecureAlias(page) => write!(f, "{} is a secure page", page),
            EnclaveSpaceError::Pool(err) => write!(f, "pool: {}", err),
        }
    }
}

/// Root page table of one enclave, swapped into TTBR0 when the enclave runs.
///
/// Every secure mapping pins its page in the pool, so the page cannot be
/// released and handed to another enclave while this table still maps it.
/// Callers serialize operations on a single enclave. An address space must be
/// retired with [`EnclaveAddressSpace::teardown`]; dropping it leaves its
/// secure pages pinned.
pub struct EnclaveAddressSpace<'a> {
    regions: &'a AddressRegionTable,
    id: EnclaveId,
    table: PageTable,
    secure: BTreeSet<VirtAddr>,
}

impl<'a> EnclaveAddressSpace<'a> {
    /// Creates an empty address space for enclave `id`.
    pub fn new(regions: &'a AddressRegionTable, id: EnclaveId) -> Self {
        Self { regions, id, table: PageTable::new(), secure: BTreeSet::new() }
    }

    pub fn id(&self) -> EnclaveId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        Owner::Enclave(self.id)
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.mapped_pages()
    }

    /// Page number of the first-level table.
    pub fn root_ppn(&self) -> PageNr {
        self.table.root_ppn()
    }

    /// Value loaded into TTBR0 when this enclave is entered.
    pub fn ttbr0_value(&self) -> u64 {
        self.table.ttbr0_value()
    }

    fn check_user_page(&self, va: VirtAddr) -> Result<(), EnclaveSpaceError> {
        self.regions.bounds_check(va, KOM_PAGE_SIZE, Domain::User)?;
        if !va.is_page_aligned() {
            return Err(MapError::Unaligned.into());
        }
        Ok(())
    }

    /// Maps secure `page`, which this enclave must already own, at `va`.
    pub fn map_secure<const N: usize>(
        &mut self,
        va: VirtAddr,
        page: PageNr,
        flags: PageFlags,
        pool: &SecurePagePool<N>,
    ) -> Result<(), EnclaveSpaceError> {
        self.check_user_page(va)?;
        let pa = page.base().ok_or(EnclaveSpaceError::Mapping(MapError::OutOfRange))?;
        let owner = self.owner();
        if pool.pin_mapping(page, owner).is_err() {
            log_warn!(target: "enclave", "map_secure {} by {}: not owned", page, owner);
            return Err(EnclaveSpaceError::NotOwned(page));
        }
        if let Err(err) = self.table.map(va, pa, flags) {
            pool.unpin_mapping(page, owner)?;
            return Err(err.into());
        }
        self.secure.insert(va);
        Ok(())
    }

    /// Maps a normal-world page at `va` for shared I/O.
    ///
    /// The page must be backed RAM, must not be a claimed secure page, and may
    /// never be executable.
    pub fn map_insecure<const N: usize>(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageFlags,
        pool: &SecurePagePool<N>,
        direct_map: &DirectMap,
    ) -> Result<(), EnclaveSpaceError> {
        self.check_user_page(va)?;
        direct_map.page_to_virtual(pa)?;
        if pool.is_claimed(pa.page()) {
            log_warn!(target: "enclave", "map_insecure {:#x} by {}: secure alias", pa, self.owner());
            return Err(EnclaveSpaceError::SecureAlias(pa.page()));
        }
        if flags.executable() {
            return Err(MapError::PermissionDenied.into());
        }
        self.table.map(va, pa, flags)?;
        Ok(())
    }

    /// Removes the mapping at `va` and returns the page it referenced. A secure
    /// page becomes releasable once its last mapping is gone.
    pub fn unmap<const N: usize>(
        &mut self,
        va: VirtAddr,
        pool: &SecurePagePool<N>,
    ) -> Result<PhysAddr, EnclaveSpaceError> {
        self.check_user_page(va)?;
        let pa = self.table.unmap(va)?;
        if self.secure.remove(&va) {
            pool.unpin_mapping(pa.page(), self.owner())?;
        }
        Ok(pa)
    }

    /// Physical address and attributes backing `va`, if mapped.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.table.translate(va)
    }

    /// Drops the address space and returns every secure page of this enclave
    /// to the pool. Yields the number of pages released.
    pub fn teardown<const N: usize>(mut self, pool: &SecurePagePool<N>) -> usize {
        let owner = self.owner();
        let mapped = self.table.mapped_pages();
        for va in core::mem::take(&mut self.secure) {
            if let Some((pa, _)) = self.table.translate(va) {
                if let Err(err) = pool.unpin_mapping(pa.page(), owner) {
                    log_error!(target: "enclave", "teardown {}: unpin {:#x}: {}", owner, pa, err);
                }
            }
        }
        drop(self);
        let freed = pool.release_all(owner);
        log_info!(target: "enclave", "teardown {}: {} mappings, {} secure pages", owner, mapped, freed);
        freed
    }
}
