// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-lifetime signal configuration.

use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::debug;

/// Ignore SIGPIPE for the life of the process so a write to a closed
/// socket or device surfaces as an `EPIPE` error result instead of
/// killing the process. Called once during startup, before any threads
/// are spawned.
pub fn disable_sigpipe() -> nix::Result<()> {
    // Safety: SIG_IGN carries no handler that could race with other
    // threads, and this runs before any are created.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
    debug!("SIGPIPE disabled");
    Ok(())
}
