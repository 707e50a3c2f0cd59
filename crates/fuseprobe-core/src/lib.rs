// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core machinery for the fuseprobe mount conformance harness.
//!
//! This crate turns an exclusively owned mount handle and a dispatcher
//! implementation into a running, multi-threaded request-processing
//! channel. The kernel wire encoding lives behind the [`Transport`]
//! boundary; everything above it (dispatch, backpressure, lifecycle)
//! is kernel-agnostic and fully testable in-process.

pub mod channel;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod types;

pub use channel::{Channel, ChannelState, CompletionHandle, RequestTrace, StopData, StopReason};
pub use config::{CaseSensitivity, ChannelConfig};
pub use device::{DevFuseTransport, MountHandle, SessionParams};
pub use dispatcher::{DirEntry, Dispatcher, EntryReply, HarnessDispatcher, RootAttrOverrides};
pub use error::{ChannelError, FsError, FsResult, TransportError};
pub use telemetry::{NullStatsSink, StatsSink};
pub use transport::{FsOperation, FsRequest, ReplyPayload, Transport, TransportEvent};
pub use types::{Attr, InodeNumber};
