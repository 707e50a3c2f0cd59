// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared across the harness.

use std::time::Duration;

/// Inode identifier within a mounted filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// The well-known root inode of a FUSE mount.
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub fn new(ino: u64) -> Self {
        Self(ino)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A synthesized attribute record plus the cache-timeout hint returned to
/// the kernel alongside it. A zero timeout instructs the kernel to never
/// cache the answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub timeout: Duration,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_is_one() {
        assert_eq!(InodeNumber::ROOT.get(), 1);
        assert!(InodeNumber::ROOT.is_root());
        assert!(!InodeNumber::new(2).is_root());
    }

    #[test]
    fn attr_dir_detection() {
        let attr = Attr {
            ino: 1,
            size: 0,
            blocks: 1,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            blksize: 512,
            timeout: Duration::ZERO,
        };
        assert!(attr.is_dir());
    }
}
