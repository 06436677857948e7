// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address and ownership newtypes shared by the memory core
//! OWNERS: @monitor-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, PageNr, EnclaveId, Owner
//! DEPENDS_ON: mm::KOM_PAGE_SIZE
//! INVARIANTS: Addresses are carried as u64 so region ends never wrap at 4 GiB;
//!             virtual and physical addresses are distinct types
//!
//! The secure world is 32-bit, but `0x8000_0000 + 0x8000_0000` is exactly the
//! top of the address space. Computing region ends in `u32` would wrap to zero,
//! so every address is widened and all arithmetic is checked.

use core::fmt;
use core::num::NonZeroU32;

use crate::mm::{KOM_PAGE_SHIFT, KOM_PAGE_SIZE};

const PAGE_MASK: u64 = KOM_PAGE_SIZE - 1;

/// Virtual address in the monitor's (or an enclave's) address space.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address as seen by the secure world.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Page containing this address.
    #[inline]
    pub const fn page(self) -> PageNr {
        PageNr(self.0 >> KOM_PAGE_SHIFT)
    }

    #[inline]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical page number (physical address >> 12).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNr(u64);

impl PageNr {
    #[inline]
    pub const fn new(nr: u64) -> Self {
        Self(nr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Base address of the page, or `None` if it does not fit in 64 bits.
    #[inline]
    pub fn base(self) -> Option<PhysAddr> {
        self.0.checked_mul(KOM_PAGE_SIZE).map(PhysAddr)
    }
}

impl fmt::Display for PageNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ppn {:#x}", self.0)
    }
}

/// Enclave identifier handed out by the enclave-lifecycle layer.
///
/// **Invariant**: zero is never a valid enclave id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnclaveId(NonZeroU32);

impl EnclaveId {
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0.get()
    }
}

/// Holder of a claimed secure page. A free slot has no owner at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Monitor-internal use (page tables, dispatcher state).
    Monitor,
    Enclave(EnclaveId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Monitor => f.write_str("monitor"),
            Owner::Enclave(id) => write!(f, "enclave#{}", id.as_raw()),
        }
    }
}
