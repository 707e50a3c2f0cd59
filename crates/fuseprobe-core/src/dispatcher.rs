// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem capability set and the harness's minimal dispatcher.
//!
//! The channel depends only on the [`Dispatcher`] trait, never on a
//! concrete type hierarchy. Every operation defaults to an explicit
//! "unsupported" failure; implementations override exactly the entries
//! they support.

use std::ffi::OsStr;
use std::time::Duration;

use crate::error::{FsError, FsResult};
use crate::types::{Attr, InodeNumber};

/// Reply to a successful entry lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryReply {
    pub ino: InodeNumber,
    pub generation: u64,
    pub attr: Attr,
}

/// A single directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub name: String,
    pub is_dir: bool,
}

/// The filesystem capability set: one entry per protocol operation.
///
/// Implementations must be safe to invoke concurrently from any worker
/// thread and must not assume single-threaded access to shared state.
pub trait Dispatcher: Send + Sync {
    fn getattr(&self, _ino: InodeNumber) -> FsResult<Attr> {
        Err(FsError::Unsupported)
    }

    fn lookup(&self, _parent: InodeNumber, _name: &OsStr) -> FsResult<EntryReply> {
        Err(FsError::Unsupported)
    }

    fn open(&self, _ino: InodeNumber, _flags: u32) -> FsResult<u64> {
        Err(FsError::Unsupported)
    }

    fn read(&self, _ino: InodeNumber, _fh: u64, _offset: u64, _size: u32) -> FsResult<Vec<u8>> {
        Err(FsError::Unsupported)
    }

    fn write(&self, _ino: InodeNumber, _fh: u64, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::Unsupported)
    }

    fn readdir(&self, _ino: InodeNumber, _offset: u64) -> FsResult<Vec<DirEntry>> {
        Err(FsError::Unsupported)
    }

    fn release(&self, _ino: InodeNumber, _fh: u64) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn access(&self, _ino: InodeNumber, _mask: u32) -> FsResult<()> {
        Err(FsError::Unsupported)
    }
}

/// Root attribute values that are test conventions rather than protocol
/// requirements. Kept configurable so conformance runs can vary them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootAttrOverrides {
    pub nlink: u32,
    pub blksize: u32,
    pub blocks: u64,
}

impl Default for RootAttrOverrides {
    fn default() -> Self {
        Self {
            nlink: 2,
            blksize: 512,
            blocks: 1,
        }
    }
}

/// The minimal dispatcher: answers attribute lookups on the single
/// synthesized root directory and nothing else. Exists to validate that
/// the channel routes requests correctly and propagates both success and
/// failure results back through the protocol boundary.
pub struct HarnessDispatcher {
    uid: u32,
    gid: u32,
    root_attrs: RootAttrOverrides,
}

impl HarnessDispatcher {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            root_attrs: RootAttrOverrides::default(),
        }
    }

    pub fn with_root_attrs(mut self, root_attrs: RootAttrOverrides) -> Self {
        self.root_attrs = root_attrs;
        self
    }
}

impl Dispatcher for HarnessDispatcher {
    fn getattr(&self, ino: InodeNumber) -> FsResult<Attr> {
        if !ino.is_root() {
            return Err(FsError::NotFound);
        }
        Ok(Attr {
            ino: ino.get(),
            size: 0,
            blocks: self.root_attrs.blocks,
            mode: libc::S_IFDIR | 0o755,
            nlink: self.root_attrs.nlink,
            uid: self.uid,
            gid: self.gid,
            blksize: self.root_attrs.blksize,
            // Zero timeout: the kernel must never cache this answer.
            timeout: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct NoopDispatcher;
    impl Dispatcher for NoopDispatcher {}

    #[test]
    fn root_getattr_synthesizes_directory() {
        let dispatcher = HarnessDispatcher::new(1000, 1000);
        let attr = dispatcher.getattr(InodeNumber::ROOT).unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.mode & 0o7777, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 1000);
        assert_eq!(attr.blksize, 512);
        assert_eq!(attr.timeout, Duration::ZERO);
    }

    #[test]
    fn non_root_getattr_is_not_found() {
        let dispatcher = HarnessDispatcher::new(0, 0);
        for ino in [0u64, 2, 3, u64::MAX] {
            match dispatcher.getattr(InodeNumber::new(ino)) {
                Err(FsError::NotFound) => {}
                other => panic!("expected NotFound for ino {ino}, got {other:?}"),
            }
        }
        // Deterministic on repeated calls.
        assert!(matches!(
            dispatcher.getattr(InodeNumber::new(2)),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn getattr_is_consistent_across_threads() {
        let dispatcher = Arc::new(HarnessDispatcher::new(42, 43));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let attr = dispatcher.getattr(InodeNumber::ROOT).unwrap();
                        assert_eq!((attr.uid, attr.gid, attr.nlink), (42, 43, 2));
                        assert!(attr.is_dir());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn unimplemented_capabilities_fail_explicitly() {
        let dispatcher = HarnessDispatcher::new(0, 0);
        assert!(matches!(
            dispatcher.lookup(InodeNumber::ROOT, OsStr::new("x")),
            Err(FsError::Unsupported)
        ));
        assert!(matches!(
            dispatcher.read(InodeNumber::ROOT, 0, 0, 16),
            Err(FsError::Unsupported)
        ));
        assert!(matches!(
            dispatcher.write(InodeNumber::ROOT, 0, 0, b"x"),
            Err(FsError::Unsupported)
        ));
        assert!(matches!(
            dispatcher.readdir(InodeNumber::ROOT, 0),
            Err(FsError::Unsupported)
        ));

        // A dispatcher that overrides nothing rejects everything.
        assert!(matches!(
            NoopDispatcher.getattr(InodeNumber::ROOT),
            Err(FsError::Unsupported)
        ));
    }

    #[test]
    fn root_attr_overrides_are_applied() {
        let dispatcher = HarnessDispatcher::new(0, 0).with_root_attrs(RootAttrOverrides {
            nlink: 3,
            blksize: 4096,
            blocks: 8,
        });
        let attr = dispatcher.getattr(InodeNumber::ROOT).unwrap();
        assert_eq!(attr.nlink, 3);
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.blocks, 8);
    }
}
