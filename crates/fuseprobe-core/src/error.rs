// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the harness core.

use std::io;

/// Result alias for dispatcher operations.
pub type FsResult<T> = Result<T, FsError>;

/// Error reported by a dispatcher for an individual request. These are
/// recovered locally: the channel translates them into protocol-level
/// error replies and keeps running.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name is not valid UTF-8")]
    InvalidName,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported operation")]
    Unsupported,
}

impl FsError {
    /// Protocol-level error code returned to the kernel for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::InvalidName => libc::EILSEQ,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Unsupported => libc::ENOSYS,
        }
    }
}

/// Fatal failure of the transport below the dispatch boundary.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to bootstrap a channel.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("channel already initialized")]
    AlreadyInitialized,
    #[error("session negotiation failed: {0}")]
    Negotiation(#[source] TransportError),
    #[error("failed to spawn channel worker: {0}")]
    Spawn(#[from] io::Error),
}
