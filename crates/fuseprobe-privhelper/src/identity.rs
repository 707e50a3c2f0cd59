// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Invoking-user identity and privilege drop.
//!
//! The harness must start elevated (the mount syscall requires it) but
//! serves requests as the invoking user. Under sudo the invoking user is
//! recovered from `SUDO_UID`/`SUDO_GID`; a direct root invocation keeps
//! root as the serving identity.

use std::env;

use nix::unistd::{getgid, getuid, geteuid, setresgid, setresuid, Gid, Uid};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("this program must be started with root privileges")]
    NotElevated,
    #[error("privileges were already dropped")]
    AlreadyDropped,
    #[error("failed to set {which} to {id}: {source}")]
    Drop {
        which: &'static str,
        id: u32,
        #[source]
        source: nix::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeState {
    Elevated,
    Dropped,
}

/// The identity the harness serves requests as, plus where the process
/// currently sits on the one-way `Elevated -> Dropped` transition.
#[derive(Debug)]
pub struct Identity {
    uid: u32,
    gid: u32,
    state: PrivilegeState,
}

impl Identity {
    /// Resolve the serving identity. Fails unless the effective uid is
    /// root; prefers `SUDO_UID`/`SUDO_GID` so `sudo fuseprobe` serves as
    /// the user who typed the command.
    pub fn resolve() -> Result<Self, IdentityError> {
        if !geteuid().is_root() {
            return Err(IdentityError::NotElevated);
        }
        let uid = sudo_id("SUDO_UID").unwrap_or_else(|| getuid().as_raw());
        let gid = sudo_id("SUDO_GID").unwrap_or_else(|| getgid().as_raw());
        debug!(uid, gid, "resolved serving identity");
        Ok(Self {
            uid,
            gid,
            state: PrivilegeState::Elevated,
        })
    }

    /// Test constructor; production code goes through [`Identity::resolve`].
    pub fn from_parts(uid: u32, gid: u32, state: PrivilegeState) -> Self {
        Self { uid, gid, state }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn state(&self) -> PrivilegeState {
        self.state
    }

    /// Permanently drop to the serving identity, gid first so the gid
    /// change still happens with root. One-way; a second call fails.
    pub fn drop_privileges(&mut self) -> Result<(), IdentityError> {
        if self.state == PrivilegeState::Dropped {
            return Err(IdentityError::AlreadyDropped);
        }
        let gid = Gid::from_raw(self.gid);
        setresgid(gid, gid, gid).map_err(|source| IdentityError::Drop {
            which: "gid",
            id: self.gid,
            source,
        })?;
        let uid = Uid::from_raw(self.uid);
        setresuid(uid, uid, uid).map_err(|source| IdentityError::Drop {
            which: "uid",
            id: self.uid,
            source,
        })?;
        self.state = PrivilegeState::Dropped;
        info!(uid = self.uid, gid = self.gid, "dropped privileges");
        Ok(())
    }
}

fn sudo_id(var: &str) -> Option<u32> {
    env::var(var).ok()?.parse().ok()
}
