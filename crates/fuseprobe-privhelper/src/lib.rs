// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Privilege handling for the FUSE harness.
//!
//! Mounting a FUSE filesystem needs root, but the request-serving side of
//! the harness should not keep it. This crate separates the two concerns:
//! a small helper process is forked while still single-threaded and keeps
//! root for the mount syscall; the parent drops privileges and talks to it
//! over a socketpair, receiving the `/dev/fuse` descriptor via `SCM_RIGHTS`.

pub mod helper;
pub mod identity;
pub mod mount_target;
pub mod signals;

pub use helper::{HelperError, MountRequest, PrivHelper, DEFAULT_MOUNT_TIMEOUT};
pub use identity::{Identity, IdentityError};
pub use mount_target::{ensure_empty_directory, MountTargetError};
pub use signals::disable_sigpipe;
