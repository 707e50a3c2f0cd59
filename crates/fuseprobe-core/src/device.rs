// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `/dev/fuse` transport: adapts an exclusively owned [`MountHandle`]
//! to the [`Transport`] boundary.
//!
//! Only the framing needed by the harness's capability set is decoded
//! here; everything else surfaces as `FsOperation::Other` and is
//! rejected above. Concurrent reads from multiple workers are safe:
//! the kernel hands out one whole request per read.

use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::transport::{FsOperation, FsRequest, ReplyPayload, Transport, TransportEvent};
use crate::types::{Attr, InodeNumber};

const FUSE_LOOKUP: u32 = 1;
const FUSE_FORGET: u32 = 2;
const FUSE_GETATTR: u32 = 3;
const FUSE_OPEN: u32 = 14;
const FUSE_READ: u32 = 15;
const FUSE_WRITE: u32 = 16;
const FUSE_RELEASE: u32 = 18;
const FUSE_INIT: u32 = 26;
const FUSE_OPENDIR: u32 = 27;
const FUSE_READDIR: u32 = 28;
const FUSE_RELEASEDIR: u32 = 29;
const FUSE_ACCESS: u32 = 34;
const FUSE_DESTROY: u32 = 38;

const FUSE_KERNEL_VERSION: u32 = 7;
const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

const IN_HEADER_LEN: usize = 40;
const MAX_WRITE: u32 = 128 * 1024;
// One full write plus headers must fit in a single read.
const RECV_BUF_LEN: usize = MAX_WRITE as usize + 4096;

/// The live, exclusively owned kernel connection for an active mount.
///
/// Exactly one handle exists per mount target; ownership moves into the
/// transport, never a shared reference.
#[derive(Debug)]
pub struct MountHandle {
    fd: OwnedFd,
    mount_path: PathBuf,
}

impl MountHandle {
    pub fn new(fd: OwnedFd, mount_path: PathBuf) -> Self {
        Self { fd, mount_path }
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }
}

/// Negotiation parameters advertised to the kernel during INIT.
#[derive(Clone, Copy, Debug)]
pub struct SessionParams {
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

impl SessionParams {
    /// Derive kernel-visible limits from the channel's backpressure bounds.
    pub fn from_config(config: &ChannelConfig) -> Self {
        let max_background = config.max_background_requests.min(u16::MAX as usize) as u16;
        Self {
            max_background,
            congestion_threshold: (max_background / 4 * 3).max(1),
            max_write: MAX_WRITE,
        }
    }
}

enum Terminal {
    Unmounted,
    Error(String),
}

pub struct DevFuseTransport {
    device: File,
    mount_path: PathBuf,
    params: SessionParams,
    terminal: Mutex<Option<Terminal>>,
}

impl DevFuseTransport {
    /// Consumes the mount handle; the transport is its sole owner from
    /// here on.
    pub fn new(handle: MountHandle, params: SessionParams) -> Self {
        Self {
            device: File::from(handle.fd),
            mount_path: handle.mount_path,
            params,
            terminal: Mutex::new(None),
        }
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn sticky(&self) -> Option<Result<TransportEvent, TransportError>> {
        let terminal = self.terminal.lock().ok()?;
        match terminal.as_ref()? {
            Terminal::Unmounted => Some(Ok(TransportEvent::Unmounted)),
            Terminal::Error(msg) => Some(Err(TransportError::Protocol(msg.clone()))),
        }
    }

    fn set_terminal(&self, terminal: Terminal) {
        if let Ok(mut guard) = self.terminal.lock() {
            guard.get_or_insert(terminal);
        }
    }

    /// Read one kernel frame. `Ok(None)` means the mount is gone.
    fn read_frame(&self, buf: &mut Vec<u8>) -> Result<Option<usize>, TransportError> {
        loop {
            buf.resize(RECV_BUF_LEN, 0);
            match (&self.device).read(buf) {
                Ok(n) if n >= IN_HEADER_LEN => return Ok(Some(n)),
                Ok(n) => {
                    return Err(TransportError::Protocol(format!(
                        "short read from fuse device: {n} bytes"
                    )));
                }
                Err(err) => match err.raw_os_error() {
                    // Request was aborted before we picked it up; retry.
                    Some(code) if code == libc::ENOENT || code == libc::EINTR => continue,
                    Some(code) if code == libc::EAGAIN => continue,
                    Some(code) if code == libc::ENODEV => return Ok(None),
                    _ => return Err(TransportError::Io(err)),
                },
            }
        }
    }

    fn write_reply(&self, bytes: &[u8]) -> Result<(), TransportError> {
        (&self.device).write_all(bytes).map_err(TransportError::Io)
    }

    fn negotiate(&self) -> Result<(), TransportError> {
        let mut buf = Vec::new();
        let n = self
            .read_frame(&mut buf)?
            .ok_or_else(|| TransportError::Protocol("mount vanished before INIT".into()))?;
        let frame = Frame::parse(&buf[..n])?;
        if frame.opcode != FUSE_INIT {
            return Err(TransportError::Protocol(format!(
                "expected INIT, got opcode {}",
                frame.opcode
            )));
        }
        let mut body = Decoder::new(frame.payload);
        let major = body.u32()?;
        let minor = body.u32()?;
        let max_readahead = body.u32()?;
        if major != FUSE_KERNEL_VERSION {
            // Refuse the session; the kernel aborts the mount on error.
            self.write_reply(&encode_error(frame.unique, libc::EPROTO))?;
            return Err(TransportError::Protocol(format!(
                "unsupported fuse major version {major}"
            )));
        }

        let mut out = Encoder::new();
        out.u32(FUSE_KERNEL_VERSION);
        out.u32(minor.min(FUSE_KERNEL_MINOR_VERSION));
        out.u32(max_readahead);
        out.u32(0); // flags: no optional behaviors requested
        out.u16(self.params.max_background);
        out.u16(self.params.congestion_threshold);
        out.u32(self.params.max_write);
        if minor >= 23 {
            out.u32(0); // time_gran
            out.u16(0); // max_pages
            out.u16(0); // map_alignment
            out.u32(0); // flags2
            for _ in 0..7 {
                out.u32(0);
            }
        }
        self.write_reply(&out.finish(frame.unique, 0))?;
        debug!(
            kernel_version = format_args!("{major}.{minor}"),
            max_background = self.params.max_background,
            "fuse session negotiated"
        );
        Ok(())
    }

    fn decode(&self, frame: Frame<'_>) -> Result<TransportEvent, TransportError> {
        let ino = InodeNumber::new(frame.nodeid);
        let mut body = Decoder::new(frame.payload);
        let op = match frame.opcode {
            FUSE_GETATTR => FsOperation::GetAttr { ino },
            FUSE_LOOKUP => {
                let name = body.c_string()?;
                FsOperation::Lookup { parent: ino, name }
            }
            FUSE_OPEN | FUSE_OPENDIR => FsOperation::Open {
                ino,
                flags: body.u32()?,
            },
            FUSE_READ => {
                let fh = body.u64()?;
                let offset = body.u64()?;
                let size = body.u32()?;
                FsOperation::Read {
                    ino,
                    fh,
                    offset,
                    size,
                }
            }
            FUSE_WRITE => {
                let fh = body.u64()?;
                let offset = body.u64()?;
                let size = body.u32()? as usize;
                body.skip(20)?; // write_flags, lock_owner, flags, padding
                let data = body.bytes(size)?;
                FsOperation::Write {
                    ino,
                    fh,
                    offset,
                    data,
                }
            }
            FUSE_READDIR => {
                body.skip(8)?; // fh
                let offset = body.u64()?;
                FsOperation::ReadDir { ino, offset }
            }
            FUSE_RELEASE | FUSE_RELEASEDIR => FsOperation::Release {
                ino,
                fh: body.u64()?,
            },
            FUSE_ACCESS => FsOperation::Access {
                ino,
                mask: body.u32()?,
            },
            FUSE_FORGET => FsOperation::Forget { ino },
            opcode => FsOperation::Other { opcode },
        };
        trace!(unique = frame.unique, op = op.name(), ino = frame.nodeid, "request");
        Ok(TransportEvent::Request(FsRequest {
            unique: frame.unique,
            op,
        }))
    }
}

impl Transport for DevFuseTransport {
    fn start_session(&self) -> Result<(), TransportError> {
        self.negotiate().inspect_err(|err| {
            self.set_terminal(Terminal::Error(err.to_string()));
        })
    }

    fn next_event(&self) -> Result<TransportEvent, TransportError> {
        if let Some(outcome) = self.sticky() {
            return outcome;
        }
        let mut buf = Vec::new();
        match self.read_frame(&mut buf) {
            Ok(Some(n)) => {
                let frame = Frame::parse(&buf[..n])?;
                if frame.opcode == FUSE_DESTROY {
                    self.set_terminal(Terminal::Unmounted);
                    return Ok(TransportEvent::Unmounted);
                }
                self.decode(frame)
            }
            Ok(None) => {
                self.set_terminal(Terminal::Unmounted);
                Ok(TransportEvent::Unmounted)
            }
            Err(err) => {
                self.set_terminal(Terminal::Error(err.to_string()));
                Err(err)
            }
        }
    }

    fn send_reply(&self, unique: u64, reply: ReplyPayload) -> Result<(), TransportError> {
        let bytes = encode_reply(unique, &reply);
        match self.write_reply(&bytes) {
            Ok(()) => Ok(()),
            // The request vanished (e.g. unmount raced the reply); the
            // channel treats this as an ordinary, recoverable result.
            Err(TransportError::Io(err))
                if err.raw_os_error() == Some(libc::ENOENT) =>
            {
                warn!(unique, "reply dropped: request no longer exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

struct Frame<'a> {
    opcode: u32,
    unique: u64,
    nodeid: u64,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, TransportError> {
        let mut header = Decoder::new(bytes);
        let len = header.u32()? as usize;
        let opcode = header.u32()?;
        let unique = header.u64()?;
        let nodeid = header.u64()?;
        header.skip(16)?; // uid, gid, pid, padding
        if len > bytes.len() || len < IN_HEADER_LEN {
            return Err(TransportError::Protocol(format!(
                "frame length {len} inconsistent with read of {}",
                bytes.len()
            )));
        }
        Ok(Self {
            opcode,
            unique,
            nodeid,
            payload: &bytes[IN_HEADER_LEN..len],
        })
    }
}

struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        if self.rest.len() < n {
            return Err(TransportError::Protocol(format!(
                "truncated frame: wanted {n} bytes, have {}",
                self.rest.len()
            )));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), TransportError> {
        self.take(n).map(|_| ())
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, TransportError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        self.take(n).map(<[u8]>::to_vec)
    }

    /// NUL-terminated name at the tail of a frame.
    fn c_string(&mut self) -> Result<OsString, TransportError> {
        let end = self
            .rest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.rest.len());
        let name = OsString::from_vec(self.rest[..end].to_vec());
        self.rest = &[];
        Ok(name)
    }
}

struct Encoder {
    body: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { body: Vec::new() }
    }

    fn u16(&mut self, value: u16) {
        self.body.extend_from_slice(&value.to_ne_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_ne_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.body.extend_from_slice(&value.to_ne_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    fn attr(&mut self, attr: &Attr) {
        self.u64(attr.ino);
        self.u64(attr.size);
        self.u64(attr.blocks);
        self.u64(0); // atime
        self.u64(0); // mtime
        self.u64(0); // ctime
        self.u32(0); // atimensec
        self.u32(0); // mtimensec
        self.u32(0); // ctimensec
        self.u32(attr.mode);
        self.u32(attr.nlink);
        self.u32(attr.uid);
        self.u32(attr.gid);
        self.u32(0); // rdev
        self.u32(attr.blksize);
        self.u32(0); // padding
    }

    /// Prepend the out header and return the full frame.
    fn finish(self, unique: u64, error: i32) -> Vec<u8> {
        let len = 16 + self.body.len();
        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&(len as u32).to_ne_bytes());
        frame.extend_from_slice(&error.to_ne_bytes());
        frame.extend_from_slice(&unique.to_ne_bytes());
        frame.extend_from_slice(&self.body);
        frame
    }
}

fn encode_error(unique: u64, errno: i32) -> Vec<u8> {
    Encoder::new().finish(unique, -errno)
}

fn encode_reply(unique: u64, reply: &ReplyPayload) -> Vec<u8> {
    let mut out = Encoder::new();
    match reply {
        ReplyPayload::Error(errno) => return encode_error(unique, *errno),
        ReplyPayload::Empty => {}
        ReplyPayload::Attr(attr) => {
            out.u64(attr.timeout.as_secs());
            out.u32(attr.timeout.subsec_nanos());
            out.u32(0); // dummy
            out.attr(attr);
        }
        ReplyPayload::Entry(entry) => {
            out.u64(entry.ino.get());
            out.u64(entry.generation);
            out.u64(entry.attr.timeout.as_secs()); // entry_valid
            out.u64(entry.attr.timeout.as_secs()); // attr_valid
            out.u32(entry.attr.timeout.subsec_nanos());
            out.u32(entry.attr.timeout.subsec_nanos());
            out.attr(&entry.attr);
        }
        ReplyPayload::Opened(fh) => {
            out.u64(*fh);
            out.u32(0); // open_flags
            out.u32(0); // padding
        }
        ReplyPayload::Data(data) => out.raw(data),
        ReplyPayload::Written(size) => {
            out.u32(*size);
            out.u32(0); // padding
        }
        ReplyPayload::Directory(entries) => {
            for (idx, entry) in entries.iter().enumerate() {
                let name = entry.name.as_bytes();
                let kind = if entry.is_dir { libc::DT_DIR } else { libc::DT_REG };
                out.u64(entry.ino.get());
                out.u64(idx as u64 + 1); // offset of the next entry
                out.u32(name.len() as u32);
                out.u32(u32::from(kind));
                out.raw(name);
                // Dirents are 8-byte aligned.
                let padding = (8 - (24 + name.len()) % 8) % 8;
                out.raw(&[0u8; 8][..padding]);
            }
        }
    }
    out.finish(unique, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attr;
    use std::time::Duration;

    fn sample_attr() -> Attr {
        Attr {
            ino: 1,
            size: 0,
            blocks: 1,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            blksize: 512,
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn attr_reply_frame_layout() {
        let frame = encode_reply(7, &ReplyPayload::Attr(sample_attr()));
        // out header (16) + attr_valid (12) + dummy (4) + fuse_attr (88)
        assert_eq!(frame.len(), 120);
        assert_eq!(u32::from_ne_bytes(frame[0..4].try_into().unwrap()), 120);
        assert_eq!(i32::from_ne_bytes(frame[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_ne_bytes(frame[8..16].try_into().unwrap()), 7);
        // mode sits after header + 12 + 4 + ino/size/blocks/times/nsecs
        let mode_at = 16 + 12 + 4 + 24 + 24 + 12;
        let mode = u32::from_ne_bytes(frame[mode_at..mode_at + 4].try_into().unwrap());
        assert_eq!(mode, libc::S_IFDIR | 0o755);
    }

    #[test]
    fn error_reply_negates_errno() {
        let frame = encode_reply(9, &ReplyPayload::Error(libc::ENOENT));
        assert_eq!(frame.len(), 16);
        let error = i32::from_ne_bytes(frame[4..8].try_into().unwrap());
        assert_eq!(error, -libc::ENOENT);
    }

    #[test]
    fn frame_parse_extracts_header_fields() {
        let mut raw = Vec::new();
        let payload = 16u64.to_ne_bytes();
        raw.extend_from_slice(&((IN_HEADER_LEN + payload.len()) as u32).to_ne_bytes());
        raw.extend_from_slice(&FUSE_GETATTR.to_ne_bytes());
        raw.extend_from_slice(&42u64.to_ne_bytes()); // unique
        raw.extend_from_slice(&1u64.to_ne_bytes()); // nodeid
        raw.extend_from_slice(&[0u8; 16]); // uid, gid, pid, padding
        raw.extend_from_slice(&payload);

        let frame = Frame::parse(&raw).unwrap();
        assert_eq!(frame.opcode, FUSE_GETATTR);
        assert_eq!(frame.unique, 42);
        assert_eq!(frame.nodeid, 1);
        assert_eq!(frame.payload.len(), 8);
    }

    #[test]
    fn frame_parse_rejects_truncation() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1024u32.to_ne_bytes()); // claims more than present
        raw.extend_from_slice(&FUSE_GETATTR.to_ne_bytes());
        raw.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            Frame::parse(&raw),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn lookup_name_decodes_to_nul() {
        let mut decoder = Decoder::new(b"hello\0");
        assert_eq!(decoder.c_string().unwrap(), OsString::from("hello"));
    }

    #[test]
    fn session_params_track_config_bounds() {
        let config = ChannelConfig {
            max_background_requests: 12,
            ..Default::default()
        };
        let params = SessionParams::from_config(&config);
        assert_eq!(params.max_background, 12);
        assert_eq!(params.congestion_threshold, 9);
    }
}
