// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tests for the boot handoff and the Komodo address layout
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 5 integration tests
//!
//! TEST_SCOPE:
//!   - Layout validation at boot
//!   - Direct-map translation through the booted state
//!   - Region bounds checking
//!
//! TEST_SCENARIOS:
//!   - regions_are_disjoint_and_split(): user end meets monitor base, no overlap
//!   - direct_map_scenario(): 0x1000 <-> 0x8000_1000
//!   - small_ram_leaves_unbacked_tail(): addresses past RAM are rejected
//!   - monitor_address_is_not_user(): 0x4000_0500 as User is WrongDomain
//!   - oversized_ram_is_fatal(): RAM above 2 GiB refuses to boot
//!
//! DEPENDENCIES:
//!   - komodo_mm::boot::MonitorMemory: boot-time memory state

use komodo_mm::boot::{BootInfo, ConfigurationError, MonitorMemory};
use komodo_mm::mm::direct_map::DirectMapError;
use komodo_mm::mm::layout::{Domain, LayoutError};
use komodo_mm::mm::{KOM_DIRECTMAP_SIZE, KOM_MON_VBASE};
use komodo_mm::types::{PhysAddr, VirtAddr};

#[test]
fn regions_are_disjoint_and_split() {
    let memory = MonitorMemory::try_init(&BootInfo::new(KOM_DIRECTMAP_SIZE)).unwrap();
    let regions = memory.regions();
    assert_eq!(regions.user().end(), regions.monitor().base().raw());
    assert_eq!(regions.monitor().base().raw(), KOM_MON_VBASE);
    let all: Vec<_> = regions.iter().collect();
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(!a.overlaps(b), "{} overlaps {}", a.name(), b.name());
        }
    }
}

#[test]
fn direct_map_scenario() {
    let memory = MonitorMemory::try_init(&BootInfo::new(KOM_DIRECTMAP_SIZE)).unwrap();
    let map = memory.direct_map();
    assert_eq!(map.to_virtual(PhysAddr::new(0x1000)), Ok(VirtAddr::new(0x8000_1000)));
    assert_eq!(map.to_physical(VirtAddr::new(0x8000_1000)), Ok(PhysAddr::new(0x1000)));
    assert_eq!(
        map.to_virtual(PhysAddr::new(KOM_DIRECTMAP_SIZE)),
        Err(DirectMapError::OutOfPhysicalRange(PhysAddr::new(KOM_DIRECTMAP_SIZE)))
    );
}

#[test]
fn small_ram_leaves_unbacked_tail() {
    let memory = MonitorMemory::try_init(&BootInfo::new(256 << 20)).unwrap();
    let map = memory.direct_map();
    let last = PhysAddr::new((256 << 20) - 0x1000);
    assert!(map.page_to_virtual(last).is_ok());
    assert_eq!(
        map.to_virtual(PhysAddr::new(256 << 20)),
        Err(DirectMapError::Unbacked(PhysAddr::new(256 << 20)))
    );
    assert_eq!(memory.pool().page_limit(), (256 << 20) >> 12);
}

#[test]
fn monitor_address_is_not_user() {
    let memory = MonitorMemory::try_init(&BootInfo::new(KOM_DIRECTMAP_SIZE)).unwrap();
    assert_eq!(
        memory.regions().bounds_check(VirtAddr::new(0x4000_0500), 4, Domain::User),
        Err(LayoutError::WrongDomain { expected: Domain::User, found: Domain::MonitorPrivileged })
    );
}

#[test]
fn oversized_ram_is_fatal() {
    let ram = KOM_DIRECTMAP_SIZE * 2;
    assert_eq!(
        MonitorMemory::try_init(&BootInfo::new(ram)).map(|_| ()),
        Err(ConfigurationError::RamExceedsDirectMap { ram_size: ram, ceiling: KOM_DIRECTMAP_SIZE })
    );
}
