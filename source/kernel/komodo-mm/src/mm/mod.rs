// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Secure-world virtual memory: region layout, direct map, secure-page
//! accounting and per-enclave page tables.

use static_assertions::{const_assert, const_assert_eq};

pub mod direct_map;
pub mod enclave_space;
pub mod layout;
pub mod page_table;
pub mod secure_pool;

/// Size of a page in bytes.
pub const KOM_PAGE_SIZE: u64 = 0x1000;
/// log2 of [`KOM_PAGE_SIZE`].
pub const KOM_PAGE_SHIFT: u32 = 12;

/// User/monitor split for the secure world (TTBR0/TTBR1 boundary).
pub const KOM_MON_VBASE: u64 = 0x4000_0000;

/// Virtual base of the monitor's direct view of physical memory.
pub const KOM_DIRECTMAP_VBASE: u64 = 0x8000_0000;
/// Bytes of physical memory reachable through the direct map.
pub const KOM_DIRECTMAP_SIZE: u64 = 0x8000_0000;

/// Bytes of physical memory the monitor may hold as secure at once.
pub const KOM_SECURE_RESERVE: u64 = 1024 * 1024;
/// Number of secure pages the pool can track.
pub const KOM_SECURE_NPAGES: usize = (KOM_SECURE_RESERVE / KOM_PAGE_SIZE) as usize;

/// One past the highest secure-world virtual address.
pub const KOM_VA_LIMIT: u64 = 1 << 32;

const_assert_eq!(1u64 << KOM_PAGE_SHIFT, KOM_PAGE_SIZE);
const_assert_eq!(KOM_MON_VBASE % KOM_PAGE_SIZE, 0);
const_assert_eq!(KOM_DIRECTMAP_VBASE % KOM_PAGE_SIZE, 0);
const_assert_eq!(KOM_DIRECTMAP_SIZE % KOM_PAGE_SIZE, 0);
const_assert!(KOM_MON_VBASE < KOM_DIRECTMAP_VBASE);
const_assert_eq!(KOM_DIRECTMAP_VBASE + KOM_DIRECTMAP_SIZE, KOM_VA_LIMIT);
const_assert_eq!(KOM_SECURE_RESERVE % KOM_PAGE_SIZE, 0);
const_assert!(KOM_SECURE_NPAGES > 0);
const_assert!(KOM_SECURE_RESERVE <= KOM_DIRECTMAP_SIZE);

/// Rounds `value` up to the next page boundary, `None` on overflow.
#[inline]
pub const fn page_align_up(value: u64) -> Option<u64> {
    match value.checked_add(KOM_PAGE_SIZE - 1) {
        Some(v) => Some(v & !(KOM_PAGE_SIZE - 1)),
        None => None,
    }
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (KOM_PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests_prop;
