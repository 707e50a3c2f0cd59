// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The opaque transport boundary below the dispatch layer.
//!
//! A [`Transport`] hides the kernel-level wire encoding from the channel:
//! workers pull decoded [`TransportEvent`]s and submit [`ReplyPayload`]s
//! without ever touching bytes. The production implementation is
//! [`crate::device::DevFuseTransport`]; tests use
//! [`crate::testing::SimTransport`].

use std::ffi::OsString;

use crate::dispatcher::{DirEntry, EntryReply};
use crate::error::TransportError;
use crate::types::{Attr, InodeNumber};

/// A single decoded filesystem request.
#[derive(Clone, Debug)]
pub struct FsRequest {
    /// Kernel-assigned identifier matching the request to its reply.
    pub unique: u64,
    pub op: FsOperation,
}

/// Decoded operation payloads for the capability set.
#[derive(Clone, Debug)]
pub enum FsOperation {
    GetAttr { ino: InodeNumber },
    Lookup { parent: InodeNumber, name: OsString },
    Open { ino: InodeNumber, flags: u32 },
    Read { ino: InodeNumber, fh: u64, offset: u64, size: u32 },
    Write { ino: InodeNumber, fh: u64, offset: u64, data: Vec<u8> },
    ReadDir { ino: InodeNumber, offset: u64 },
    Release { ino: InodeNumber, fh: u64 },
    Access { ino: InodeNumber, mask: u32 },
    /// One-way message; the kernel expects no reply.
    Forget { ino: InodeNumber },
    /// Anything outside the capability set. Answered with ENOSYS.
    Other { opcode: u32 },
}

impl FsOperation {
    pub fn name(&self) -> &'static str {
        match self {
            FsOperation::GetAttr { .. } => "getattr",
            FsOperation::Lookup { .. } => "lookup",
            FsOperation::Open { .. } => "open",
            FsOperation::Read { .. } => "read",
            FsOperation::Write { .. } => "write",
            FsOperation::ReadDir { .. } => "readdir",
            FsOperation::Release { .. } => "release",
            FsOperation::Access { .. } => "access",
            FsOperation::Forget { .. } => "forget",
            FsOperation::Other { .. } => "other",
        }
    }

    /// Whether the operation counts against the background-request bound
    /// in addition to the total in-flight bound.
    pub fn is_background(&self) -> bool {
        matches!(
            self,
            FsOperation::Read { .. } | FsOperation::Write { .. } | FsOperation::ReadDir { .. }
        )
    }

    /// Whether the kernel expects a reply for this operation.
    pub fn wants_reply(&self) -> bool {
        !matches!(self, FsOperation::Forget { .. })
    }
}

/// Inbound event observed by a channel worker.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Request(FsRequest),
    /// The mount target was unmounted (user- or system-initiated).
    Unmounted,
    /// An external controller requested a takeover/handoff of the mount.
    TakeoverRequested,
}

/// Reply produced by routing a request through the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyPayload {
    Attr(Attr),
    Entry(EntryReply),
    Opened(u64),
    Data(Vec<u8>),
    Written(u32),
    Directory(Vec<DirEntry>),
    Empty,
    Error(i32),
}

/// The kernel-facing handle, viewed from above the wire encoding.
///
/// Terminal outcomes are sticky: once `next_event` has reported
/// `Unmounted`, `TakeoverRequested`, or a fatal error, every subsequent
/// call from any thread observes the same outcome. This is what lets a
/// whole worker pool wind down from a single terminal observation.
pub trait Transport: Send + Sync {
    /// Perform protocol negotiation with the peer. Called exactly once,
    /// before any worker starts pulling events.
    fn start_session(&self) -> Result<(), TransportError>;

    /// Block until the next inbound event.
    fn next_event(&self) -> Result<TransportEvent, TransportError>;

    /// Submit the reply for request `unique`.
    fn send_reply(&self, unique: u64, reply: ReplyPayload) -> Result<(), TransportError>;
}
