// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Short-descriptor page table for the user region (TTBR0, N = 2), with lazy
//! allocation of second-level tables.
//!
//! Table memory comes from the monitor heap and is addressed by the MMU at
//! the same address the monitor uses to write it.

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use super::{KOM_MON_VBASE, KOM_PAGE_SHIFT, KOM_PAGE_SIZE};
use crate::types::{PageNr, PhysAddr, VirtAddr};

/// Entries in the first-level table. With TTBCR.N = 2 the root is 4 KiB and
/// covers exactly the user region.
pub const L1_ENTRIES: usize = 1024;
/// Entries in a coarse second-level table.
pub const L2_ENTRIES: usize = 256;
/// Bytes covered by one first-level entry.
pub const SECTION_SIZE: u64 = 1 << 20;

const_assert_eq!(L1_ENTRIES as u64 * SECTION_SIZE, KOM_MON_VBASE);
const_assert_eq!(L2_ENTRIES as u64 * KOM_PAGE_SIZE, SECTION_SIZE);
const_assert_eq!(core::mem::size_of::<RootTable>(), 4096);
const_assert_eq!(core::mem::align_of::<RootTable>(), 4096);
const_assert_eq!(core::mem::size_of::<CoarseTable>(), 1024);

/// First-level descriptor type bits for a coarse (second-level) table.
pub const COARSE_DESC: u32 = 0b01;
/// Mask of the coarse-table base address in a first-level descriptor.
const COARSE_ADDR_MASK: u32 = !0x3ff;

/// Table-walk attributes ORed into TTBR0: inner and outer write-back
/// write-allocate, shareable.
pub const TTBR0_WALK_ATTRS: u64 = (1 << 6) | (1 << 3) | (1 << 1);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Attribute bits of a small-page descriptor.
    pub struct PageFlags: u32 {
        const XN = 1 << 0;
        const SMALL_PAGE = 1 << 1;
        const BUFFERABLE = 1 << 2;
        const CACHEABLE = 1 << 3;
        const AP0 = 1 << 4;
        const AP1 = 1 << 5;
        const AP2 = 1 << 9;
        const SHAREABLE = 1 << 10;
        const NOT_GLOBAL = 1 << 11;
    }
}

impl PageFlags {
    const NORMAL: PageFlags = PageFlags::SMALL_PAGE
        .union(PageFlags::BUFFERABLE)
        .union(PageFlags::CACHEABLE)
        .union(PageFlags::NOT_GLOBAL);

    /// Read-only user data.
    pub const fn user_ro() -> Self {
        Self::NORMAL
            .union(PageFlags::AP0)
            .union(PageFlags::AP1)
            .union(PageFlags::AP2)
            .union(PageFlags::XN)
    }

    /// Read-write user data.
    pub const fn user_rw() -> Self {
        Self::NORMAL.union(PageFlags::AP0).union(PageFlags::AP1).union(PageFlags::XN)
    }

    /// Read-only executable user code.
    pub const fn user_rx() -> Self {
        Self::NORMAL.union(PageFlags::AP0).union(PageFlags::AP1).union(PageFlags::AP2)
    }

    /// PL0 can reach the page.
    pub const fn user_accessible(self) -> bool {
        self.contains(PageFlags::AP1)
    }

    pub const fn writable(self) -> bool {
        self.contains(PageFlags::AP0) && !self.contains(PageFlags::AP2)
    }

    pub const fn executable(self) -> bool {
        !self.contains(PageFlags::XN)
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping lies outside the range translated by this table.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid user small page.
    InvalidFlags,
    /// No mapping exists at the address.
    NotMapped,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            MapError::Unaligned => "address not page aligned",
            MapError::OutOfRange => "address outside table range",
            MapError::PermissionDenied => "writable and executable mapping",
            MapError::Overlap => "address already mapped",
            MapError::InvalidFlags => "invalid page attributes",
            MapError::NotMapped => "address not mapped",
        })
    }
}

const DESC_ADDR_MASK: u32 = !((KOM_PAGE_SIZE as u32) - 1);

/// First-level table: 1024 hardware descriptors, 4 KiB aligned for TTBR0.
#[repr(C, align(4096))]
struct RootTable {
    entries: [u32; L1_ENTRIES],
}

#[repr(C, align(1024))]
struct CoarseTable {
    entries: [u32; L2_ENTRIES],
}

impl CoarseTable {
    fn new() -> Box<Self> {
        Box::new(Self { entries: [0; L2_ENTRIES] })
    }
}

/// Address the MMU uses for table memory.
fn table_addr<T>(table: &T) -> u64 {
    table as *const T as usize as u64
}

/// Two-level table translating `[0, KOM_MON_VBASE)`.
///
/// The root holds hardware coarse-table descriptors. Second-level tables are
/// allocated on first use, owned alongside the root, and freed once empty.
pub struct PageTable {
    root: Box<RootTable>,
    coarse: Vec<Option<Box<CoarseTable>>>,
    mapped: usize,
}

impl PageTable {
    /// Creates a table with no second-level tables and no mappings.
    pub fn new() -> Self {
        let mut coarse = Vec::with_capacity(L1_ENTRIES);
        coarse.resize_with(L1_ENTRIES, || None);
        Self { root: Box::new(RootTable { entries: [0; L1_ENTRIES] }), coarse, mapped: 0 }
    }

    /// Physical address of the first-level table.
    pub fn root_addr(&self) -> PhysAddr {
        PhysAddr::new(table_addr(&*self.root))
    }

    /// Page number of the first-level table.
    pub fn root_ppn(&self) -> PageNr {
        self.root_addr().page()
    }

    /// TTBR0 value selecting this table.
    pub fn ttbr0_value(&self) -> u64 {
        self.root_addr().raw() | TTBR0_WALK_ATTRS
    }

    /// Raw first-level descriptor at `index`, if the slot is populated.
    pub fn root_entry(&self, index: usize) -> Option<u32> {
        self.root.entries.get(index).copied().filter(|entry| *entry != 0)
    }

    /// Number of leaf mappings installed.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Number of second-level tables allocated.
    pub fn coarse_tables(&self) -> usize {
        self.coarse.iter().filter(|slot| slot.is_some()).count()
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        let (l1_index, l2_index) = indices(va)?;
        let pa = u32::try_from(pa.raw()).map_err(|_| MapError::OutOfRange)?;
        if !flags.contains(PageFlags::SMALL_PAGE) || !flags.user_accessible() {
            return Err(MapError::InvalidFlags);
        }
        if flags.writable() && flags.executable() {
            return Err(MapError::PermissionDenied);
        }

        let table = self.coarse[l1_index].get_or_insert_with(CoarseTable::new);
        if table.entries[l2_index] != 0 {
            return Err(MapError::Overlap);
        }
        table.entries[l2_index] = (pa & DESC_ADDR_MASK) | flags.bits();
        // Monitor pointers are 32 bits wide; only 64-bit hosts lose the high half here.
        let desc = (table_addr(&**table) as u32 & COARSE_ADDR_MASK) | COARSE_DESC;
        self.root.entries[l1_index] = desc;
        self.mapped += 1;
        Ok(())
    }

    /// Removes the mapping at `va` and returns the physical page it pointed to.
    ///
    /// Second-level tables that become empty are freed.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<PhysAddr, MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        let (l1_index, l2_index) = indices(va)?;
        let slot = &mut self.coarse[l1_index];
        let table = slot.as_mut().ok_or(MapError::NotMapped)?;
        let entry = core::mem::replace(&mut table.entries[l2_index], 0);
        if entry == 0 {
            return Err(MapError::NotMapped);
        }
        if table.entries.iter().all(|e| *e == 0) {
            *slot = None;
            self.root.entries[l1_index] = 0;
        }
        self.mapped -= 1;
        Ok(PhysAddr::new(u64::from(entry & DESC_ADDR_MASK)))
    }

    /// Looks up the descriptor mapped at page-aligned `va` if it exists.
    pub fn lookup(&self, va: VirtAddr) -> Option<u32> {
        if !va.is_page_aligned() {
            return None;
        }
        let (l1_index, l2_index) = indices(va).ok()?;
        let table = self.coarse[l1_index].as_ref()?;
        Some(table.entries[l2_index]).filter(|entry| *entry != 0)
    }

    /// Translates any byte address through the table.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let entry = self.lookup(va.align_down())?;
        let base = u64::from(entry & DESC_ADDR_MASK);
        let flags = PageFlags::from_bits_truncate(entry & !DESC_ADDR_MASK);
        Some((PhysAddr::new(base + va.page_offset()), flags))
    }

    /// Iterates over every leaf mapping in ascending virtual order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, PhysAddr, PageFlags)> + '_ {
        self.coarse.iter().enumerate().flat_map(|(l1_index, slot)| {
            slot.iter().flat_map(move |table| {
                table.entries.iter().enumerate().filter(|(_, e)| **e != 0).map(
                    move |(l2_index, entry)| {
                        let va = (l1_index as u64) * SECTION_SIZE
                            + ((l2_index as u64) << KOM_PAGE_SHIFT);
                        (
                            VirtAddr::new(va),
                            PhysAddr::new(u64::from(entry & DESC_ADDR_MASK)),
                            PageFlags::from_bits_truncate(entry & !DESC_ADDR_MASK),
                        )
                    },
                )
            })
        })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn indices(va: VirtAddr) -> Result<(usize, usize), MapError> {
    if va.raw() >= KOM_MON_VBASE {
        return Err(MapError::OutOfRange);
    }
    let l1 = (va.raw() / SECTION_SIZE) as usize;
    let l2 = ((va.raw() % SECTION_SIZE) >> KOM_PAGE_SHIFT) as usize;
    Ok((l1, l2))
}
