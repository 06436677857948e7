// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity accounting of secure physical pages
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (mm/tests_prop.rs) + tests/secure_pool.rs (threads)
//! PUBLIC API: SecurePagePool::{claim,release,release_all,is_claimed,owner_of}, MonitorPagePool
//! DEPENDS_ON: spin::Mutex, types::{PageNr, Owner}, mm::direct_map::DirectMap
//! INVARIANTS: claimed <= capacity; a page is held by at most one slot; every claimed page
//!             lies below the direct-map page limit; a free slot carries no owner; a page
//!             with live page-table mappings cannot be released
//!
//! The pool is an arena of `N` slots. Capacity is a const generic so the
//! secure-memory footprint is fixed when the monitor is built; it never grows.

use core::fmt;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::direct_map::DirectMap;
use super::{KOM_DIRECTMAP_SIZE, KOM_PAGE_SHIFT, KOM_SECURE_NPAGES};
use crate::types::{Owner, PageNr};

/// Pool sized by the build-time secure reserve.
pub type MonitorPagePool = SecurePagePool<KOM_SECURE_NPAGES>;

/// Number of physical pages the direct map can ever alias.
pub const MAX_PAGE_LIMIT: u64 = KOM_DIRECTMAP_SIZE >> KOM_PAGE_SHIFT;

/// Index of a pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Accounting conflicts reported by the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is already claimed.
    PoolExhausted,
    /// The page is already held, by this or another owner.
    AlreadyClaimed(PageNr),
    /// The page is not reachable through the direct map.
    OutOfRange(PageNr),
    /// The page is not currently claimed.
    NotClaimed(PageNr),
    /// The page is claimed by someone other than the caller.
    OwnerMismatch(PageNr),
    /// A page table still maps the page.
    StillMapped(PageNr),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::PoolExhausted => f.write_str("secure page pool exhausted"),
            PoolError::AlreadyClaimed(page) => write!(f, "{} already claimed", page),
            PoolError::OutOfRange(page) => write!(f, "{} outside the direct map", page),
            PoolError::NotClaimed(page) => write!(f, "{} not claimed", page),
            PoolError::OwnerMismatch(page) => write!(f, "{} held by another owner", page),
            PoolError::StillMapped(page) => write!(f, "{} still mapped", page),
        }
    }
}

/// A claimed slot. Free slots are `None`, so a released page keeps no owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SecurePage {
    page: PageNr,
    owner: Owner,
    /// Live page-table entries referencing the page.
    mappings: u32,
}

struct PoolState<const N: usize> {
    slots: [Option<SecurePage>; N],
    claimed: usize,
}

impl<const N: usize> PoolState<N> {
    const fn new() -> Self {
        Self { slots: [None; N], claimed: 0 }
    }

    fn find(&self, page: PageNr) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, Some(s) if s.page == page))
    }

    fn held_mut(&mut self, page: PageNr, owner: Owner) -> Result<&mut SecurePage, PoolError> {
        let index = self.find(page).ok_or(PoolError::NotClaimed(page))?;
        match &mut self.slots[index] {
            Some(held) if held.owner == owner => Ok(held),
            _ => Err(PoolError::OwnerMismatch(page)),
        }
    }
}

/// Monitor-wide secure-page budget.
///
/// `claim` and `release` run their whole check-then-act sequence under one
/// lock, so concurrent callers on different cores can never both win the same
/// page or overshoot the capacity.
pub struct SecurePagePool<const N: usize> {
    page_limit: u64,
    state: Mutex<PoolState<N>>,
    #[cfg(feature = "failpoints")]
    deny_next_claim: AtomicBool,
}

impl<const N: usize> SecurePagePool<N> {
    /// Creates an all-free pool accepting pages below `page_limit`, clamped
    /// to [`MAX_PAGE_LIMIT`].
    pub const fn with_page_limit(page_limit: u64) -> Self {
        let page_limit = if page_limit > MAX_PAGE_LIMIT { MAX_PAGE_LIMIT } else { page_limit };
        Self {
            page_limit,
            state: Mutex::new(PoolState::new()),
            #[cfg(feature = "failpoints")]
            deny_next_claim: AtomicBool::new(false),
        }
    }

    /// Creates an all-free pool bounded by the RAM visible through `direct_map`.
    pub fn new(direct_map: &DirectMap) -> Self {
        Self::with_page_limit(direct_map.page_limit())
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// First page number the pool rejects as out of range.
    pub const fn page_limit(&self) -> u64 {
        self.page_limit
    }

    /// Marks `page` as secure and held by `owner`.
    pub fn claim(&self, page: PageNr, owner: Owner) -> Result<SlotIndex, PoolError> {
        if page.raw() >= self.page_limit {
            log_debug!(target: "pool", "claim {} by {}: out of range", page, owner);
            return Err(PoolError::OutOfRange(page));
        }
        let result = {
            let mut state = self.state.lock();
            self.claim_locked(&mut state, page, owner)
        };
        match result {
            Ok(_slot) => {
                #[cfg(feature = "debug_pool")]
                log_trace!(target: "pool", "claim {} by {} -> slot {}", page, owner, _slot.0);
            }
            Err(PoolError::PoolExhausted) => {
                log_warn!(target: "pool", "claim {} by {}: pool exhausted ({} pages)", page, owner, N);
            }
            Err(err) => log_debug!(target: "pool", "claim by {}: {}", owner, err),
        }
        result
    }

    fn claim_locked(
        &self,
        state: &mut PoolState<N>,
        page: PageNr,
        owner: Owner,
    ) -> Result<SlotIndex, PoolError> {
        if state.find(page).is_some() {
            return Err(PoolError::AlreadyClaimed(page));
        }
        #[cfg(feature = "failpoints")]
        if self.deny_next_claim.swap(false, Ordering::SeqCst) {
            return Err(PoolError::PoolExhausted);
        }
        if state.claimed == N {
            return Err(PoolError::PoolExhausted);
        }
        let index = state
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(PoolError::PoolExhausted)?;
        state.slots[index] = Some(SecurePage { page, owner, mappings: 0 });
        state.claimed += 1;
        Ok(SlotIndex(index))
    }

    /// Returns `page` to the normal world. Only its current owner may do so,
    /// and only once no page table maps it any more.
    pub fn release(&self, page: PageNr, owner: Owner) -> Result<(), PoolError> {
        let result = {
            let mut state = self.state.lock();
            Self::release_locked(&mut state, page, owner)
        };
        match result {
            Ok(()) => {
                #[cfg(feature = "debug_pool")]
                log_trace!(target: "pool", "release {} by {}", page, owner);
            }
            Err(PoolError::OwnerMismatch(_)) => {
                log_warn!(target: "pool", "release {} by {}: owner mismatch", page, owner);
            }
            Err(PoolError::StillMapped(_)) => {
                log_warn!(target: "pool", "release {} by {}: still mapped", page, owner);
            }
            Err(err) => log_debug!(target: "pool", "release by {}: {}", owner, err),
        }
        result
    }

    fn release_locked(
        state: &mut PoolState<N>,
        page: PageNr,
        owner: Owner,
    ) -> Result<(), PoolError> {
        if state.held_mut(page, owner)?.mappings != 0 {
            return Err(PoolError::StillMapped(page));
        }
        if let Some(index) = state.find(page) {
            state.slots[index] = None;
            state.claimed -= 1;
        }
        Ok(())
    }

    /// Records a new page-table entry for `page`, which `owner` must hold.
    ///
    /// Runs under the pool lock, so the ownership check and the pin cannot be
    /// split by a concurrent release.
    pub fn pin_mapping(&self, page: PageNr, owner: Owner) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let held = state.held_mut(page, owner)?;
        held.mappings = held.mappings.saturating_add(1);
        Ok(())
    }

    /// Drops one page-table entry previously recorded with [`Self::pin_mapping`].
    pub fn unpin_mapping(&self, page: PageNr, owner: Owner) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let held = state.held_mut(page, owner)?;
        held.mappings = held.mappings.saturating_sub(1);
        Ok(())
    }

    /// Number of live page-table entries referencing `page`.
    pub fn mapping_count(&self, page: PageNr) -> usize {
        let state = self.state.lock();
        state
            .find(page)
            .and_then(|index| state.slots[index])
            .map_or(0, |held| held.mappings as usize)
    }

    /// Releases every unmapped page held by `owner` and returns how many were
    /// freed. Pages still pinned by a page table stay claimed.
    pub fn release_all(&self, owner: Owner) -> usize {
        let mut state = self.state.lock();
        let mut freed = 0;
        for slot in state.slots.iter_mut() {
            if matches!(slot, Some(held) if held.owner == owner && held.mappings == 0) {
                *slot = None;
                freed += 1;
            }
        }
        state.claimed -= freed;
        drop(state);
        if freed != 0 {
            log_debug!(target: "pool", "released {} pages of {}", freed, owner);
        }
        freed
    }

    pub fn is_claimed(&self, page: PageNr) -> bool {
        self.state.lock().find(page).is_some()
    }

    /// Current holder of `page`, if any.
    pub fn owner_of(&self, page: PageNr) -> Option<Owner> {
        let state = self.state.lock();
        state.find(page).and_then(|index| state.slots[index]).map(|held| held.owner)
    }

    /// `true` when `page` is claimed by exactly `owner`.
    pub fn is_held_by(&self, page: PageNr, owner: Owner) -> bool {
        self.owner_of(page) == Some(owner)
    }

    /// Number of claimed slots.
    pub fn claimed(&self) -> usize {
        self.state.lock().claimed
    }

    /// Number of free slots.
    pub fn free(&self) -> usize {
        N - self.claimed()
    }

    /// Forces the next `claim` that passes the duplicate check to fail with
    /// [`PoolError::PoolExhausted`].
    #[cfg(feature = "failpoints")]
    pub fn deny_next_claim(&self) {
        self.deny_next_claim.store(true, Ordering::SeqCst);
    }
}

impl<const N: usize> fmt::Debug for SecurePagePool<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePagePool")
            .field("capacity", &N)
            .field("claimed", &self.claimed())
            .field("page_limit", &self.page_limit)
            .finish()
    }
}
