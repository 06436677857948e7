// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics for the monitor memory core
//! OWNERS: @monitor-mm-team
//! PUBLIC API: log (log_* macros, LogSink, install_sink)
//! DEPENDS_ON: spin::Once
//! INVARIANTS: Single-line emission; sink installed at most once

#[macro_use]
pub mod log;
