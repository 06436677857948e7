// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the region table, direct map and secure-page pool
//! OWNERS: @monitor-mm-team
//! NOTE: Tests only; no monitor logic.
//!
//! TEST_SCOPE:
//!   - Direct-map translation is a bijection over installed RAM
//!   - Addresses at or past the ceiling never translate
//!   - Every address below 4 GiB classifies into exactly one region
//!   - Pool accounting never exceeds capacity and never double-claims
//!
//! TEST_SCENARIOS:
//!   - direct_map_roundtrip(): to_physical(to_virtual(p)) == p
//!   - direct_map_injective(): distinct p give distinct v
//!   - beyond_ceiling_fails(): p >= size is OutOfPhysicalRange
//!   - exactly_one_region(): region_for agrees with a linear containment count
//!   - pool_matches_model(): random claim/release sequence agrees with a set model

use std::collections::BTreeMap;

use proptest::prelude::*;

use super::direct_map::{DirectMap, DirectMapError};
use super::layout::AddressRegionTable;
use super::secure_pool::{PoolError, SecurePagePool};
use super::{KOM_DIRECTMAP_SIZE, KOM_VA_LIMIT};
use crate::types::{EnclaveId, Owner, PageNr, PhysAddr, VirtAddr};

fn full_map() -> DirectMap {
    DirectMap::new(&AddressRegionTable::komodo(), KOM_DIRECTMAP_SIZE).expect("full RAM")
}

#[derive(Clone, Debug)]
enum PoolOp {
    Claim(u64, u32),
    Release(u64, u32),
}

fn arb_owner_raw() -> impl Strategy<Value = u32> {
    0u32..3
}

fn owner(raw: u32) -> Owner {
    EnclaveId::from_raw(raw).map_or(Owner::Monitor, Owner::Enclave)
}

fn arb_pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        (0u64..12, arb_owner_raw()).prop_map(|(p, o)| PoolOp::Claim(p, o)),
        (0u64..12, arb_owner_raw()).prop_map(|(p, o)| PoolOp::Release(p, o)),
    ]
}

proptest! {
    #[test]
    fn direct_map_roundtrip(p in 0u64..KOM_DIRECTMAP_SIZE) {
        let map = full_map();
        let va = map.to_virtual(PhysAddr::new(p)).unwrap();
        prop_assert_eq!(map.to_physical(va), Ok(PhysAddr::new(p)));
    }

    #[test]
    fn direct_map_injective(a in 0u64..KOM_DIRECTMAP_SIZE, b in 0u64..KOM_DIRECTMAP_SIZE) {
        prop_assume!(a != b);
        let map = full_map();
        prop_assert_ne!(
            map.to_virtual(PhysAddr::new(a)).unwrap(),
            map.to_virtual(PhysAddr::new(b)).unwrap()
        );
    }

    #[test]
    fn beyond_ceiling_fails(p in KOM_DIRECTMAP_SIZE..=u64::MAX) {
        let map = full_map();
        prop_assert_eq!(
            map.to_virtual(PhysAddr::new(p)),
            Err(DirectMapError::OutOfPhysicalRange(PhysAddr::new(p)))
        );
    }

    #[test]
    fn exactly_one_region(v in 0u64..KOM_VA_LIMIT) {
        let table = AddressRegionTable::komodo();
        let va = VirtAddr::new(v);
        let containing: Vec<_> = table.iter().filter(|r| r.contains(va)).collect();
        prop_assert_eq!(containing.len(), 1);
        prop_assert_eq!(table.region_for(va), Ok(containing[0]));
    }

    #[test]
    fn pool_matches_model(ops in proptest::collection::vec(arb_pool_op(), 1..64)) {
        const CAP: usize = 4;
        let pool = SecurePagePool::<CAP>::with_page_limit(10);
        let mut model: BTreeMap<u64, u32> = BTreeMap::new();
        for op in ops {
            match op {
                PoolOp::Claim(p, o) => {
                    let expected = if p >= 10 {
                        Err(PoolError::OutOfRange(PageNr::new(p)))
                    } else if model.contains_key(&p) {
                        Err(PoolError::AlreadyClaimed(PageNr::new(p)))
                    } else if model.len() == CAP {
                        Err(PoolError::PoolExhausted)
                    } else {
                        model.insert(p, o);
                        Ok(())
                    };
                    prop_assert_eq!(pool.claim(PageNr::new(p), owner(o)).map(|_| ()), expected);
                }
                PoolOp::Release(p, o) => {
                    let expected = match model.get(&p).copied() {
                        None => Err(PoolError::NotClaimed(PageNr::new(p))),
                        Some(held) if held != o => Err(PoolError::OwnerMismatch(PageNr::new(p))),
                        Some(_) => {
                            model.remove(&p);
                            Ok(())
                        }
                    };
                    prop_assert_eq!(pool.release(PageNr::new(p), owner(o)), expected);
                }
            }
            prop_assert!(pool.claimed() <= CAP);
            prop_assert_eq!(pool.claimed(), model.len());
        }
        for (p, o) in &model {
            prop_assert_eq!(pool.owner_of(PageNr::new(*p)), Some(owner(*o)));
        }
    }
}
