// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The privileged mount helper.
//!
//! [`PrivHelper::spawn`] forks while the process is still single-threaded.
//! The child keeps root and serves mount requests; the parent drops
//! privileges afterwards and talks to the child over a `SOCK_SEQPACKET`
//! socketpair. Requests and responses are JSON datagrams; a successful
//! mount response carries the `/dev/fuse` descriptor as `SCM_RIGHTS`
//! ancillary data, so the parent ends up with exclusive ownership of the
//! device without ever having been able to open it itself.

use std::fs::OpenOptions;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use nix::mount::{mount, MsFlags};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    recv, recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use fuseprobe_core::MountHandle;

use crate::identity::{Identity, PrivilegeState};

/// How long the harness waits for the helper to answer a mount request
/// before giving up. A tunable default, not a protocol requirement.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_millis(100);

/// How long `spawn` waits for the child's ready message.
const SPAWN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const WIRE_BUF_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("failed to spawn privileged helper: {0}")]
    Spawn(#[source] nix::Error),
    #[error("helper cannot be spawned after privileges were dropped")]
    SpawnAfterDrop,
    #[error("helper handshake failed: {0}")]
    Handshake(String),
    #[error("mount of {path} failed: {message} (errno {errno})")]
    Mount {
        path: PathBuf,
        errno: i32,
        message: String,
    },
    #[error("no response from helper within {0:?}")]
    Timeout(Duration),
    #[error("helper connection closed")]
    Closed,
    #[error("helper I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// One mount order for the helper. Built once, consumed by
/// [`PrivHelper::fuse_mount`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountRequest {
    pub mount_path: PathBuf,
    pub read_only: bool,
    pub vfs_type: String,
}

impl MountRequest {
    /// A read-only FUSE mount at `mount_path`, which is what the
    /// harness always asks for.
    pub fn new(mount_path: PathBuf) -> Self {
        Self {
            mount_path,
            read_only: true,
            vfs_type: "fuse".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum HelperRequest {
    Mount(MountRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum HelperResponse {
    Ready,
    Mounted,
    MountFailed { errno: i32, message: String },
}

/// Client handle to the forked helper. Dropping it closes the control
/// socket, which is the helper's signal to exit; the child is reaped on
/// drop so it never outlives the harness as a zombie.
pub struct PrivHelper {
    socket: Option<OwnedFd>,
    child: Pid,
}

impl PrivHelper {
    /// Fork the helper. Must run before any threads exist and before
    /// `identity.drop_privileges()`, since the child inherits the current
    /// credentials and keeps them.
    pub fn spawn(identity: &Identity) -> Result<Self, HelperError> {
        if identity.state() == PrivilegeState::Dropped {
            return Err(HelperError::SpawnAfterDrop);
        }
        let (parent_sock, child_sock) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(HelperError::Spawn)?;

        // Safety: the harness is still single-threaded at this point, so
        // the child inherits a consistent address space.
        match unsafe { fork() }.map_err(HelperError::Spawn)? {
            ForkResult::Child => {
                drop(parent_sock);
                let code = serve(&child_sock, identity.uid(), identity.gid());
                // _exit, not exit: the child shares the parent's atexit state.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_sock);
                debug!(pid = child.as_raw(), "forked privileged helper");
                let helper = Self {
                    socket: Some(parent_sock),
                    child,
                };
                match helper.recv_response(SPAWN_HANDSHAKE_TIMEOUT)? {
                    (HelperResponse::Ready, _) => Ok(helper),
                    (other, _) => Err(HelperError::Handshake(format!(
                        "unexpected ready message: {other:?}"
                    ))),
                }
            }
        }
    }

    /// Ask the helper to mount and wait up to `timeout` for the
    /// descriptor to come back.
    pub fn fuse_mount(
        &self,
        request: MountRequest,
        timeout: Duration,
    ) -> Result<MountHandle, HelperError> {
        let mount_path = request.mount_path.clone();
        let payload = serde_json::to_vec(&HelperRequest::Mount(request))
            .map_err(|err| HelperError::Handshake(format!("failed to encode request: {err}")))?;
        let socket = self.socket.as_ref().ok_or(HelperError::Closed)?;
        let iov = [IoSlice::new(&payload)];
        sendmsg::<UnixAddr>(socket.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(|err| HelperError::Io(err.into()))?;

        match self.recv_response(timeout)? {
            (HelperResponse::Mounted, Some(fd)) => {
                info!(path = %mount_path.display(), "mounted");
                Ok(MountHandle::new(fd, mount_path))
            }
            (HelperResponse::Mounted, None) => Err(HelperError::Handshake(
                "mount response carried no descriptor".to_string(),
            )),
            (HelperResponse::MountFailed { errno, message }, _) => Err(HelperError::Mount {
                path: mount_path,
                errno,
                message,
            }),
            (other, _) => Err(HelperError::Handshake(format!(
                "unexpected mount response: {other:?}"
            ))),
        }
    }

    /// Wait for one response datagram, extracting any descriptor that
    /// rode along as ancillary data.
    fn recv_response(
        &self,
        timeout: Duration,
    ) -> Result<(HelperResponse, Option<OwnedFd>), HelperError> {
        let socket = self.socket.as_ref().ok_or(HelperError::Closed)?;

        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, poll_timeout).map_err(|err| HelperError::Io(err.into()))?;
        if ready == 0 {
            return Err(HelperError::Timeout(timeout));
        }

        let mut buf = [0u8; WIRE_BUF_SIZE];
        let (len, passed_fd) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(
                socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(|err| HelperError::Io(err.into()))?;
            let mut passed_fd = None;
            let cmsgs = msg
                .cmsgs()
                .map_err(|err| HelperError::Io(err.into()))?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                    // Safety: the kernel installed these descriptors into
                    // our table for this message; we take ownership of the
                    // first and there are no other claimants.
                    passed_fd = raw_fds
                        .first()
                        .map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
            (msg.bytes, passed_fd)
        };
        if len == 0 {
            return Err(HelperError::Closed);
        }
        let response: HelperResponse = serde_json::from_slice(&buf[..len])
            .map_err(|err| HelperError::Handshake(format!("malformed response: {err}")))?;
        Ok((response, passed_fd))
    }
}

impl Drop for PrivHelper {
    fn drop(&mut self) {
        // Closing our end of the socket is the shutdown signal; reap the
        // child so it does not linger as a zombie.
        if let Some(socket) = self.socket.take() {
            drop(socket);
        }
        if let Err(err) = waitpid(self.child, None) {
            warn!(pid = self.child.as_raw(), %err, "failed to reap helper");
        }
    }
}

/// Child-side request loop. Runs with the inherited (root) credentials;
/// exits when the parent's end of the socket closes.
fn serve(sock: &OwnedFd, uid: u32, gid: u32) -> i32 {
    if send_response(sock, &HelperResponse::Ready, None).is_err() {
        return 1;
    }
    let mut buf = [0u8; WIRE_BUF_SIZE];
    loop {
        let len = match recv(sock.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => return 0,
            Ok(len) => len,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 1,
        };
        let request: HelperRequest = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(_) => return 1,
        };
        let HelperRequest::Mount(mount_request) = request;
        match mount_fuse(&mount_request, uid, gid) {
            Ok(device) => {
                if send_response(sock, &HelperResponse::Mounted, Some(&device)).is_err() {
                    return 1;
                }
            }
            Err(errno) => {
                let response = HelperResponse::MountFailed {
                    errno: errno as i32,
                    message: errno.desc().to_string(),
                };
                if send_response(sock, &response, None).is_err() {
                    return 1;
                }
            }
        }
    }
}

fn send_response(
    sock: &OwnedFd,
    response: &HelperResponse,
    device: Option<&OwnedFd>,
) -> Result<(), ()> {
    let payload = serde_json::to_vec(response).map_err(|_| ())?;
    let iov = [IoSlice::new(&payload)];
    let raw_fds;
    let scm;
    let cmsgs: &[ControlMessage] = match device {
        Some(device) => {
            raw_fds = [device.as_raw_fd()];
            scm = [ControlMessage::ScmRights(&raw_fds)];
            &scm
        }
        None => &[],
    };
    sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None).map_err(|_| ())?;
    Ok(())
}

/// Open `/dev/fuse` and mount it at the requested path. Returns the
/// device descriptor; the mount itself stays behind in the filesystem.
fn mount_fuse(request: &MountRequest, uid: u32, gid: u32) -> Result<OwnedFd, nix::errno::Errno> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/fuse")
        .map_err(|err| {
            error!(%err, "failed to open /dev/fuse");
            nix::errno::Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
        })?;
    let device = OwnedFd::from(device);

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if request.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    // rootmode mirrors the S_IFDIR attribute the dispatcher reports.
    let data = format!(
        "fd={},rootmode=40000,user_id={},group_id={},allow_other,default_permissions",
        device.as_raw_fd(),
        uid,
        gid
    );
    mount(
        Some("fuseprobe"),
        &request.mount_path,
        Some(request.vfs_type.as_str()),
        flags,
        Some(data.as_str()),
    )
    .map_err(|errno| {
        error!(path = %request.mount_path.display(), %errno, "mount failed");
        errno
    })?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_request_defaults_to_read_only_fuse() {
        let request = MountRequest::new(PathBuf::from("/tmp/mnt"));
        assert!(request.read_only);
        assert_eq!(request.vfs_type, "fuse");
    }

    #[test]
    fn wire_messages_round_trip_with_payload_detail() {
        let encoded = serde_json::to_vec(&HelperResponse::MountFailed {
            errno: libc::EPERM,
            message: "Operation not permitted".to_string(),
        })
        .unwrap();
        match serde_json::from_slice(&encoded).unwrap() {
            HelperResponse::MountFailed { errno, message } => {
                assert_eq!(errno, libc::EPERM);
                assert!(message.contains("permitted"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    // Forks a real helper over the real socketpair protocol, but as an
    // unprivileged user the mount request must come back as an EPERM
    // MountFailed datagram rather than a descriptor.
    #[test]
    fn helper_reports_mount_failure_without_root() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let identity = Identity::from_parts(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            PrivilegeState::Elevated,
        );
        let helper = PrivHelper::spawn(&identity).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = helper.fuse_mount(
            MountRequest::new(dir.path().to_path_buf()),
            Duration::from_secs(5),
        );
        match result {
            Err(HelperError::Mount { errno, .. }) => {
                assert!(errno == libc::EPERM || errno == libc::EACCES || errno == libc::ENOENT);
            }
            other => panic!("expected mount failure, got {other:?}"),
        }
    }

    // The host only drops privileges once the mount handle is back from
    // the helper; the helper keeps root independently, so requests sent
    // after the parent's drop must still be served.
    #[test]
    fn helper_keeps_serving_after_parent_drops_privileges() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let mut identity = Identity::from_parts(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            PrivilegeState::Elevated,
        );
        let helper = PrivHelper::spawn(&identity).unwrap();
        identity.drop_privileges().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = helper.fuse_mount(
            MountRequest::new(dir.path().to_path_buf()),
            Duration::from_secs(5),
        );
        // Unprivileged, the mount itself is refused, but the helper must
        // answer with a structured failure rather than going silent.
        assert!(matches!(result, Err(HelperError::Mount { .. })));
    }

    #[test]
    fn spawn_is_refused_after_privilege_drop() {
        let identity = Identity::from_parts(0, 0, PrivilegeState::Dropped);
        assert!(matches!(
            PrivHelper::spawn(&identity),
            Err(HelperError::SpawnAfterDrop)
        ));
    }
}
