// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fuseprobe — FUSE mount conformance harness.
//!
//! Mounts a minimal synthetic filesystem (one empty root directory) at
//! the given path and serves it until unmounted. Exercises the full
//! privileged mount path: privilege-separated helper, descriptor
//! handover, channel bootstrap, and clean stop-reason reporting.
//!
//! Run as root (or under sudo); unmount with `umount <path>` to finish.

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};

use fuseprobe_core::{
    Channel, ChannelConfig, DevFuseTransport, HarnessDispatcher, NullStatsSink, SessionParams,
    StopReason,
};
use fuseprobe_logging::CliLoggingArgs;
use fuseprobe_privhelper::{
    disable_sigpipe, ensure_empty_directory, Identity, MountRequest, PrivHelper,
    DEFAULT_MOUNT_TIMEOUT,
};

// Exit codes from sysexits.h, matching what callers of mount tooling
// conventionally check for.
const EX_OK: i32 = 0;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_NOPERM: i32 = 77;

const MOUNT_HANDSHAKE_TIMEOUT: Duration = DEFAULT_MOUNT_TIMEOUT;

#[derive(Debug, Parser)]
#[command(name = "fuseprobe", about = "FUSE mount conformance harness")]
struct Args {
    /// Mount target directory; created if absent, must be empty
    mount_point: PathBuf,

    /// Number of channel worker threads
    #[arg(long, default_value_t = 4)]
    fuse_threads: usize,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EX_OK,
                _ => EX_NOPERM,
            };
            let _ = err.print();
            return code;
        }
    };

    let logging = args.logging.clone();
    if let Err(err) = logging.init("fuseprobe") {
        eprintln!("failed to initialize logging: {err:#}");
        return EX_SOFTWARE;
    }
    if let Err(err) = disable_sigpipe() {
        error!(%err, "failed to ignore SIGPIPE");
        return EX_SOFTWARE;
    }

    let mut identity = match Identity::resolve() {
        Ok(identity) => identity,
        Err(err) => {
            error!(%err, "cannot run unprivileged");
            return EX_NOPERM;
        }
    };

    // Resolve the target against the invocation directory before moving
    // to /, so the harness never pins the caller's working directory.
    let mount_point = match absolutize(&args.mount_point) {
        Ok(path) => path,
        Err(err) => {
            error!(%err, "cannot resolve mount target");
            return EX_SOFTWARE;
        }
    };
    if let Err(err) = env::set_current_dir("/") {
        error!(%err, "failed to chdir to /");
        return EX_SOFTWARE;
    }

    // Target validation runs before anything privileged, so a bad target
    // never costs a helper fork or a mount syscall.
    if let Err(err) = ensure_empty_directory(&mount_point) {
        error!(%err, "mount target check failed");
        return EX_DATAERR;
    }

    match serve(&mut identity, mount_point, args.fuse_threads) {
        Ok(StopReason::Unmounted) => {
            info!("unmounted cleanly");
            EX_OK
        }
        Ok(reason) => {
            error!(%reason, "channel stopped abnormally");
            EX_SOFTWARE
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "harness failed");
            EX_SOFTWARE
        }
    }
}

/// Mount, serve until the channel stops, and report why it stopped.
fn serve(
    identity: &mut Identity,
    mount_point: PathBuf,
    fuse_threads: usize,
) -> anyhow::Result<StopReason> {
    let helper = PrivHelper::spawn(identity).context("failed to spawn privileged helper")?;
    let handle = helper
        .fuse_mount(MountRequest::new(mount_point), MOUNT_HANDSHAKE_TIMEOUT)
        .context("mount handshake failed")?;

    // Root is only needed up to the mount handshake; everything past this
    // point serves requests as the invoking user.
    identity
        .drop_privileges()
        .context("failed to drop privileges")?;

    let config = ChannelConfig {
        worker_threads: fuse_threads,
        ..Default::default()
    };
    let dispatcher = HarnessDispatcher::new(identity.uid(), identity.gid());
    let transport = DevFuseTransport::new(handle, SessionParams::from_config(&config));
    let channel = Channel::new(
        Box::new(transport),
        Box::new(dispatcher),
        config,
        Box::new(NullStatsSink),
    );

    let completion = channel.initialize().context("channel bootstrap failed")?;
    info!(workers = fuse_threads, "serving; unmount to stop");
    let stop = completion.wait();
    if let Some(detail) = &stop.error {
        error!(%detail, "transport reported a fatal error");
    }
    Ok(stop.reason)
}

fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_defaults_to_four() {
        let args = Args::try_parse_from(["fuseprobe", "/tmp/mnt"]).unwrap();
        assert_eq!(args.fuse_threads, 4);
        assert_eq!(args.mount_point, PathBuf::from("/tmp/mnt"));
    }

    #[test]
    fn worker_count_is_tunable() {
        let args = Args::try_parse_from(["fuseprobe", "/tmp/mnt", "--fuse-threads", "8"]).unwrap();
        assert_eq!(args.fuse_threads, 8);
    }

    #[test]
    fn mount_point_is_required() {
        assert!(Args::try_parse_from(["fuseprobe"]).is_err());
    }

    #[test]
    fn absolutize_keeps_absolute_paths() {
        let path = PathBuf::from("/already/abs");
        assert_eq!(absolutize(&path).unwrap(), path);
    }

    #[test]
    fn absolutize_resolves_relative_paths_against_cwd() {
        let resolved = absolutize(Path::new("mnt")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("mnt"));
    }
}
