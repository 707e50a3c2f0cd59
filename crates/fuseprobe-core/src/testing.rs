// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only utilities and mock implementations.
//!
//! Provides an in-memory transport and controllable dispatchers so the
//! channel machinery can be exercised without a kernel mount.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::dispatcher::Dispatcher;
use crate::error::{FsError, FsResult, TransportError};
use crate::transport::{FsOperation, FsRequest, ReplyPayload, Transport, TransportEvent};
use crate::types::{Attr, InodeNumber};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimTerminal {
    Unmounted,
    Takeover,
    Error,
}

struct SimInner {
    events: VecDeque<FsRequest>,
    terminal: Option<SimTerminal>,
    error_message: Option<String>,
    fail_negotiation: bool,
}

/// Scripted transport: tests enqueue requests and a terminal event and
/// observe every reply the channel sends. Terminal events are sticky,
/// matching the production transport contract.
pub struct SimTransport {
    inner: Mutex<SimInner>,
    arrived: Condvar,
    replies: Mutex<Vec<(u64, ReplyPayload)>>,
}

impl SimTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SimInner {
                events: VecDeque::new(),
                terminal: None,
                error_message: None,
                fail_negotiation: false,
            }),
            arrived: Condvar::new(),
            replies: Mutex::new(Vec::new()),
        })
    }

    pub fn push_request(&self, unique: u64, op: FsOperation) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push_back(FsRequest { unique, op });
        drop(inner);
        self.arrived.notify_all();
    }

    /// Queued requests are still drained before the terminal is observed.
    pub fn push_unmount(&self) {
        self.set_terminal(SimTerminal::Unmounted, None);
    }

    pub fn push_takeover(&self) {
        self.set_terminal(SimTerminal::Takeover, None);
    }

    pub fn push_transport_error(&self, message: &str) {
        self.set_terminal(SimTerminal::Error, Some(message.to_string()));
    }

    /// Make the next `start_session` fail, simulating a bad handshake.
    pub fn fail_negotiation(&self) {
        self.inner.lock().unwrap().fail_negotiation = true;
    }

    fn set_terminal(&self, terminal: SimTerminal, message: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminal.get_or_insert(terminal);
        if inner.error_message.is_none() {
            inner.error_message = message;
        }
        drop(inner);
        self.arrived.notify_all();
    }

    pub fn replies(&self) -> Vec<(u64, ReplyPayload)> {
        self.replies.lock().unwrap().clone()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    /// Block until the channel has sent `n` replies, panicking after
    /// `timeout`.
    pub fn wait_for_replies(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.reply_count() < n {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {n} replies (have {})",
                self.reply_count()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Transport for SimTransport {
    fn start_session(&self) -> Result<(), TransportError> {
        if self.inner.lock().unwrap().fail_negotiation {
            return Err(TransportError::Protocol("scripted negotiation failure".to_string()));
        }
        Ok(())
    }

    fn next_event(&self) -> Result<TransportEvent, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(request) = inner.events.pop_front() {
                return Ok(TransportEvent::Request(request));
            }
            match inner.terminal {
                Some(SimTerminal::Unmounted) => return Ok(TransportEvent::Unmounted),
                Some(SimTerminal::Takeover) => return Ok(TransportEvent::TakeoverRequested),
                Some(SimTerminal::Error) => {
                    let message = inner
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "scripted error".to_string());
                    return Err(TransportError::Protocol(message));
                }
                None => {
                    inner = self.arrived.wait(inner).unwrap();
                }
            }
        }
    }

    fn send_reply(&self, unique: u64, reply: ReplyPayload) -> Result<(), TransportError> {
        self.replies.lock().unwrap().push((unique, reply));
        Ok(())
    }
}

struct GateState {
    open: bool,
    current: usize,
    peak: usize,
    entered_total: usize,
}

/// Dispatcher whose `getattr` blocks on a gate until released. Used to
/// hold requests in flight for backpressure and watchdog tests; also
/// tracks peak concurrency.
pub struct GatedDispatcher {
    state: Mutex<GateState>,
    changed: Condvar,
    uid: u32,
    gid: u32,
}

impl GatedDispatcher {
    pub fn new(uid: u32, gid: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                open: false,
                current: 0,
                peak: 0,
                entered_total: 0,
            }),
            changed: Condvar::new(),
            uid,
            gid,
        })
    }

    pub fn open_gate(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    /// Highest number of getattr calls that were ever blocked inside the
    /// dispatcher at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    /// Block until `n` calls have entered the dispatcher in total.
    pub fn wait_for_entered(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.entered_total < n {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };
            let (guard, result) = self.changed.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() && state.entered_total < n {
                return false;
            }
        }
        true
    }
}

impl Dispatcher for GatedDispatcher {
    fn getattr(&self, ino: InodeNumber) -> FsResult<Attr> {
        {
            let mut state = self.state.lock().unwrap();
            state.current += 1;
            state.entered_total += 1;
            state.peak = state.peak.max(state.current);
            self.changed.notify_all();
            while !state.open {
                state = self.changed.wait(state).unwrap();
            }
            state.current -= 1;
        }
        if !ino.is_root() {
            return Err(FsError::NotFound);
        }
        Ok(Attr {
            ino: ino.get(),
            size: 0,
            blocks: 1,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            blksize: 512,
            timeout: Duration::ZERO,
        })
    }
}
