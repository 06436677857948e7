// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Secure-world memory core for the Komodo monitor
//! OWNERS: @monitor-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + proptest per module; integration tests under tests/
//! PUBLIC API: mm::{layout, direct_map, secure_pool, enclave_space}, boot::MonitorMemory, types
//! DEPENDS_ON: bitflags, spin, static_assertions
//! INVARIANTS: Fixed three-region layout; checked direct-map ceiling; bounded secure-page budget
//!
//! The monitor's virtual address space is split into three regions:
//!
//! ```text
//! 0x0000_0000 ..0x4000_0000  user       enclaves only, per-enclave root table (TTBR0)
//! 0x4000_0000 ..0x8000_0000  monitor    monitor image, PL1 only, static (TTBR1)
//! 0x8000_0000 ..0x1_0000_0000 directmap 1:1 view of the first 2 GiB of physical memory
//! ```
//!
//! Every component receives the same immutable [`mm::layout::AddressRegionTable`]
//! by reference; nothing here keeps a mutable global besides the log sink.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod boot;
pub mod mm;
pub mod types;

pub use diag::log;
