// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Channel bootstrap and lifecycle.
//!
//! A [`Channel`] binds a consumed transport and a dispatcher into a
//! running multi-threaded request loop. The lifecycle is two-stage:
//! [`Channel::initialize`] returns once the worker pool is accepting
//! requests, and the [`CompletionHandle`] it yields resolves when the
//! loop ends, carrying the [`StopData`] produced exactly once per
//! channel lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error, info, warn};

use crate::config::{CaseSensitivity, ChannelConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, TransportError};
use crate::telemetry::StatsSink;
use crate::transport::{FsOperation, FsRequest, ReplyPayload, Transport, TransportEvent};

/// Enumerated cause for the end of a channel's request loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The mount target was unmounted; the clean shutdown path.
    Unmounted,
    /// An external controller requested a takeover of the mount.
    TakeoverRequested,
    /// A fatal I/O or protocol error on the kernel-facing handle.
    TransportError,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Unmounted => f.write_str("unmounted"),
            StopReason::TakeoverRequested => f.write_str("takeover-requested"),
            StopReason::TransportError => f.write_str("transport-error"),
        }
    }
}

/// Terminal record of a channel. Produced exactly once, when the request
/// loop ends; never before initialization completes.
#[derive(Debug)]
pub struct StopData {
    pub reason: StopReason,
    pub error: Option<TransportError>,
}

/// Lifecycle states. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Second stage of the lifecycle: resolves when the request loop ends.
pub struct CompletionHandle {
    rx: Receiver<StopData>,
}

impl CompletionHandle {
    /// Block until the channel reaches `Stopped`.
    pub fn wait(self) -> StopData {
        self.rx.recv().unwrap_or_else(|_| StopData {
            reason: StopReason::TransportError,
            error: Some(TransportError::Closed),
        })
    }

    /// Bounded wait, mainly for callers that interleave shutdown with
    /// other work.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StopData> {
        match self.rx.recv_timeout(timeout) {
            Ok(stop) => Some(stop),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(StopData {
                reason: StopReason::TransportError,
                error: Some(TransportError::Closed),
            }),
        }
    }
}

/// Summary of one completed request, kept in a bounded in-memory ring.
#[derive(Clone, Debug)]
pub struct RequestTrace {
    pub unique: u64,
    pub op: &'static str,
    pub errno: i32,
    pub duration: Duration,
}

/// Two-bound backpressure gauge. Workers acquire before dispatch; at a
/// bound they block, so excess requests queue instead of failing.
struct RequestGauge {
    inner: Mutex<GaugeInner>,
    released: Condvar,
    max_inflight: usize,
    max_background: usize,
    log_interval: Duration,
}

struct GaugeInner {
    inflight: usize,
    background: usize,
    last_saturation_log: Option<Instant>,
}

impl RequestGauge {
    fn new(config: &ChannelConfig) -> Self {
        Self {
            inner: Mutex::new(GaugeInner {
                inflight: 0,
                background: 0,
                last_saturation_log: None,
            }),
            released: Condvar::new(),
            // A zero bound would deadlock the pool; clamp to one.
            max_inflight: config.max_inflight_requests.max(1),
            max_background: config.max_background_requests.max(1),
            log_interval: config.high_load_log_interval,
        }
    }

    /// Returns how long the caller queued for a permit.
    fn acquire(&self, background: bool) -> Duration {
        let started = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while inner.inflight >= self.max_inflight
            || (background && inner.background >= self.max_background)
        {
            self.maybe_log_saturation(&mut inner);
            inner = match self.released.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        inner.inflight += 1;
        if background {
            inner.background += 1;
        }
        started.elapsed()
    }

    fn release(&self, background: bool) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.inflight -= 1;
        if background {
            inner.background -= 1;
        }
        drop(inner);
        self.released.notify_all();
    }

    fn maybe_log_saturation(&self, inner: &mut GaugeInner) {
        let due = inner
            .last_saturation_log
            .map(|at| at.elapsed() >= self.log_interval)
            .unwrap_or(true);
        if due {
            inner.last_saturation_log = Some(Instant::now());
            info!(
                inflight = inner.inflight,
                background = inner.background,
                max_inflight = self.max_inflight,
                max_background = self.max_background,
                "request bounds saturated; queueing new requests"
            );
        }
    }
}

struct InflightEntry {
    op: &'static str,
    started: Instant,
    warned: bool,
}

struct StopState {
    data: Option<StopData>,
    tx: Option<Sender<StopData>>,
}

struct ChannelCore {
    transport: Box<dyn Transport>,
    dispatcher: Box<dyn Dispatcher>,
    stats: Box<dyn StatsSink>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    gauge: RequestGauge,
    inflight: Mutex<HashMap<u64, InflightEntry>>,
    stop: Mutex<StopState>,
    live_workers: AtomicUsize,
    shutdown: AtomicBool,
    watchdog_park: Mutex<()>,
    watchdog_wake: Condvar,
    traces: ArrayQueue<RequestTrace>,
}

/// A running (or not-yet-started) request-processing channel.
pub struct Channel {
    core: Arc<ChannelCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Bind transport, dispatcher, configuration, and telemetry. The
    /// transport is consumed: the channel is its sole owner.
    pub fn new(
        transport: Box<dyn Transport>,
        dispatcher: Box<dyn Dispatcher>,
        config: ChannelConfig,
        stats: Box<dyn StatsSink>,
    ) -> Self {
        let gauge = RequestGauge::new(&config);
        let traces = ArrayQueue::new(config.trace_bus_capacity.max(1));
        Self {
            core: Arc::new(ChannelCore {
                transport,
                dispatcher,
                stats,
                config,
                state: Mutex::new(ChannelState::Uninitialized),
                gauge,
                inflight: Mutex::new(HashMap::new()),
                stop: Mutex::new(StopState {
                    data: None,
                    tx: None,
                }),
                live_workers: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                watchdog_park: Mutex::new(()),
                watchdog_wake: Condvar::new(),
                traces,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ChannelState {
        *lock_or_recover(&self.core.state)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    /// Name-comparison mode carried unchanged for higher-level layers.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.core.config.case_sensitivity
    }

    /// Drain the ring of recent request traces, oldest first.
    pub fn drain_traces(&self) -> Vec<RequestTrace> {
        let mut traces = Vec::new();
        while let Some(trace) = self.core.traces.pop() {
            traces.push(trace);
        }
        traces
    }

    /// First lifecycle stage: negotiate the session and start the worker
    /// pool. Returns once the channel accepts requests; the handle's
    /// `wait` is the second stage.
    pub fn initialize(&self) -> Result<CompletionHandle, ChannelError> {
        {
            let mut state = lock_or_recover(&self.core.state);
            if *state != ChannelState::Uninitialized {
                return Err(ChannelError::AlreadyInitialized);
            }
            *state = ChannelState::Initializing;
        }

        if let Err(err) = self.core.transport.start_session() {
            *lock_or_recover(&self.core.state) = ChannelState::Stopped;
            return Err(ChannelError::Negotiation(err));
        }

        let (tx, rx) = mpsc::channel();
        lock_or_recover(&self.core.stop).tx = Some(tx);

        // Running must be visible before the first worker can observe a
        // terminal event, or a fast unmount could be overwritten.
        *lock_or_recover(&self.core.state) = ChannelState::Running;

        let count = self.core.config.worker_threads.max(1);
        self.core.live_workers.store(count, Ordering::Release);
        let mut workers = lock_or_recover(&self.workers);
        for i in 0..count {
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("fuseprobe-worker-{i}"))
                .spawn(move || worker_loop(&core));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Abandon startup: account for the unspawned workers
                    // so the pool can still wind down.
                    let unspawned = count - i;
                    let _ = self.core.live_workers.fetch_sub(unspawned, Ordering::AcqRel);
                    self.core.shutdown.store(true, Ordering::Release);
                    *lock_or_recover(&self.core.state) = ChannelState::Stopped;
                    return Err(ChannelError::Spawn(err));
                }
            }
        }

        let core = Arc::clone(&self.core);
        let watchdog = thread::Builder::new()
            .name("fuseprobe-watchdog".to_string())
            .spawn(move || watchdog_loop(&core))
            .map_err(ChannelError::Spawn)?;
        workers.push(watchdog);

        info!(
            workers = count,
            max_inflight = self.core.config.max_inflight_requests,
            max_background = self.core.config.max_background_requests,
            "channel accepting requests"
        );
        Ok(CompletionHandle { rx })
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop(core: &Arc<ChannelCore>) {
    loop {
        match core.transport.next_event() {
            Ok(TransportEvent::Request(request)) => core.handle_request(request),
            Ok(TransportEvent::Unmounted) => {
                core.record_stop(StopReason::Unmounted, None);
                break;
            }
            Ok(TransportEvent::TakeoverRequested) => {
                core.record_stop(StopReason::TakeoverRequested, None);
                break;
            }
            Err(err) => {
                core.record_stop(StopReason::TransportError, Some(err));
                break;
            }
        }
    }
    if core.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        core.finish();
    }
}

fn watchdog_loop(core: &Arc<ChannelCore>) {
    let threshold = core.config.long_request_threshold;
    let tick = (threshold / 4).max(Duration::from_millis(10));
    let mut park = lock_or_recover(&core.watchdog_park);
    while !core.shutdown.load(Ordering::Acquire) {
        let (guard, _) = core
            .watchdog_wake
            .wait_timeout(park, tick)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        park = guard;
        if core.shutdown.load(Ordering::Acquire) {
            break;
        }
        core.scan_long_requests(threshold);
    }
}

impl ChannelCore {
    fn handle_request(&self, request: FsRequest) {
        let FsRequest { unique, op } = request;
        if !op.wants_reply() {
            debug!(unique, op = op.name(), "one-way message");
            return;
        }

        let background = op.is_background();
        let waited = self.gauge.acquire(background);
        if waited > Duration::ZERO {
            self.stats.record_queue_wait(op.name(), waited);
        }
        {
            let mut inflight = lock_or_recover(&self.inflight);
            let _ = inflight.insert(
                unique,
                InflightEntry {
                    op: op.name(),
                    started: Instant::now(),
                    warned: false,
                },
            );
        }

        let started = Instant::now();
        let op_name = op.name();
        let reply = self.route(&op);
        let errno = match &reply {
            ReplyPayload::Error(errno) => *errno,
            _ => 0,
        };
        if let Err(err) = self.transport.send_reply(unique, reply) {
            warn!(unique, op = op_name, %err, "failed to send reply");
        }

        let duration = started.elapsed();
        let _ = lock_or_recover(&self.inflight).remove(&unique);
        self.gauge.release(background);
        self.stats.record_request(op_name, duration);
        let _ = self.traces.force_push(RequestTrace {
            unique,
            op: op_name,
            errno,
            duration,
        });
    }

    /// Route one request through the capability set. Dispatcher failures
    /// are recovered locally into protocol error replies.
    fn route(&self, op: &FsOperation) -> ReplyPayload {
        match op {
            FsOperation::GetAttr { ino } => match self.dispatcher.getattr(*ino) {
                Ok(attr) => ReplyPayload::Attr(attr),
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::Lookup { parent, name } => {
                if self.config.require_utf8_paths && name.to_str().is_none() {
                    debug!(parent = %parent, "rejecting non-UTF-8 lookup name");
                    return ReplyPayload::Error(libc::EILSEQ);
                }
                match self.dispatcher.lookup(*parent, name) {
                    Ok(entry) => ReplyPayload::Entry(entry),
                    Err(err) => ReplyPayload::Error(err.errno()),
                }
            }
            FsOperation::Open { ino, flags } => match self.dispatcher.open(*ino, *flags) {
                Ok(fh) => ReplyPayload::Opened(fh),
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::Read {
                ino,
                fh,
                offset,
                size,
            } => match self.dispatcher.read(*ino, *fh, *offset, *size) {
                Ok(data) => ReplyPayload::Data(data),
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::Write {
                ino,
                fh,
                offset,
                data,
            } => match self.dispatcher.write(*ino, *fh, *offset, data) {
                Ok(written) => ReplyPayload::Written(written),
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::ReadDir { ino, offset } => {
                match self.dispatcher.readdir(*ino, *offset) {
                    Ok(entries) => ReplyPayload::Directory(entries),
                    Err(err) => ReplyPayload::Error(err.errno()),
                }
            }
            FsOperation::Release { ino, fh } => match self.dispatcher.release(*ino, *fh) {
                Ok(()) => ReplyPayload::Empty,
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::Access { ino, mask } => match self.dispatcher.access(*ino, *mask) {
                Ok(()) => ReplyPayload::Empty,
                Err(err) => ReplyPayload::Error(err.errno()),
            },
            FsOperation::Forget { .. } => ReplyPayload::Empty,
            FsOperation::Other { opcode } => {
                debug!(opcode, "operation outside capability set");
                ReplyPayload::Error(libc::ENOSYS)
            }
        }
    }

    /// First terminal event wins; later ones are ignored.
    fn record_stop(&self, reason: StopReason, error: Option<TransportError>) {
        let mut stop = lock_or_recover(&self.stop);
        if stop.data.is_none() {
            match reason {
                StopReason::Unmounted => info!(%reason, "request loop ending"),
                _ => error!(%reason, error = ?error, "request loop ending"),
            }
            stop.data = Some(StopData { reason, error });
            let mut state = lock_or_recover(&self.state);
            if *state == ChannelState::Running {
                *state = ChannelState::Stopping;
            }
        }
        drop(stop);
        self.shutdown.store(true, Ordering::Release);
        self.watchdog_wake.notify_all();
    }

    /// Called by the last exiting worker: publish StopData and reach
    /// `Stopped`.
    fn finish(&self) {
        *lock_or_recover(&self.state) = ChannelState::Stopped;
        let mut stop = lock_or_recover(&self.stop);
        let data = stop.data.take().unwrap_or(StopData {
            reason: StopReason::TransportError,
            error: Some(TransportError::Closed),
        });
        info!(stop_reason = %data.reason, "channel stopped");
        if let Some(tx) = stop.tx.take() {
            let _ = tx.send(data);
        }
    }

    fn scan_long_requests(&self, threshold: Duration) {
        let mut inflight = lock_or_recover(&self.inflight);
        for (unique, entry) in inflight.iter_mut() {
            let elapsed = entry.started.elapsed();
            if elapsed >= threshold && !entry.warned {
                entry.warned = true;
                warn!(
                    unique,
                    op = entry.op,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request running longer than configured threshold"
                );
                self.stats.record_long_request(entry.op, elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::HarnessDispatcher;
    use crate::telemetry::{MockStatsSink, NullStatsSink};
    use crate::testing::{GatedDispatcher, SimTransport};
    use crate::types::InodeNumber;
    use std::collections::HashSet;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    use std::sync::Arc;

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            worker_threads: 2,
            ..Default::default()
        }
    }

    struct ArcDispatcher<D>(Arc<D>);
    impl<D: Dispatcher> Dispatcher for ArcDispatcher<D> {
        fn getattr(&self, ino: InodeNumber) -> crate::error::FsResult<crate::types::Attr> {
            self.0.getattr(ino)
        }
    }

    struct ArcTransport(Arc<SimTransport>);
    impl Transport for ArcTransport {
        fn start_session(&self) -> Result<(), TransportError> {
            self.0.start_session()
        }
        fn next_event(&self) -> Result<TransportEvent, TransportError> {
            self.0.next_event()
        }
        fn send_reply(&self, unique: u64, reply: ReplyPayload) -> Result<(), TransportError> {
            self.0.send_reply(unique, reply)
        }
    }

    fn channel_over(
        transport: &Arc<SimTransport>,
        dispatcher: Box<dyn Dispatcher>,
        config: ChannelConfig,
    ) -> Channel {
        Channel::new(
            Box::new(ArcTransport(Arc::clone(transport))),
            dispatcher,
            config,
            Box::new(NullStatsSink),
        )
    }

    #[test]
    fn initialize_reaches_running_then_unmount_stops_cleanly() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        assert_eq!(channel.state(), ChannelState::Uninitialized);

        let completion = channel.initialize().unwrap();
        assert_eq!(channel.state(), ChannelState::Running);
        assert!(completion.wait_timeout(Duration::from_millis(20)).is_none());

        transport.push_unmount();
        let stop = completion.wait();
        assert_eq!(stop.reason, StopReason::Unmounted);
        assert!(stop.error.is_none());
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn channel_cannot_be_initialized_twice() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();
        assert!(matches!(
            channel.initialize(),
            Err(ChannelError::AlreadyInitialized)
        ));
        transport.push_unmount();
        let _ = completion.wait();
    }

    #[test]
    fn negotiation_failure_aborts_initialization() {
        let transport = SimTransport::new();
        transport.fail_negotiation();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        assert!(matches!(
            channel.initialize(),
            Err(ChannelError::Negotiation(_))
        ));
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn dispatcher_results_propagate_through_the_protocol_boundary() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(7, 8)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();

        transport.push_request(1, FsOperation::GetAttr { ino: InodeNumber::ROOT });
        transport.push_request(2, FsOperation::GetAttr { ino: InodeNumber::new(9) });
        transport.push_request(3, FsOperation::Other { opcode: 999 });
        transport.wait_for_replies(3, Duration::from_secs(5));
        transport.push_unmount();
        let _ = completion.wait();

        let replies = transport.replies();
        let by_unique: HashMap<u64, ReplyPayload> = replies.into_iter().collect();
        match by_unique.get(&1) {
            Some(ReplyPayload::Attr(attr)) => {
                assert!(attr.is_dir());
                assert_eq!((attr.uid, attr.gid, attr.nlink), (7, 8, 2));
            }
            other => panic!("expected attr reply, got {other:?}"),
        }
        assert_eq!(by_unique.get(&2), Some(&ReplyPayload::Error(libc::ENOENT)));
        assert_eq!(by_unique.get(&3), Some(&ReplyPayload::Error(libc::ENOSYS)));
    }

    #[test]
    fn transport_error_surfaces_in_stop_data() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();
        transport.push_transport_error("device went away");
        let stop = completion.wait();
        assert_eq!(stop.reason, StopReason::TransportError);
        match stop.error {
            Some(TransportError::Protocol(msg)) => assert!(msg.contains("device went away")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn takeover_reason_is_observable() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();
        transport.push_takeover();
        let stop = completion.wait();
        assert_eq!(stop.reason, StopReason::TakeoverRequested);
    }

    #[test]
    fn inflight_bound_queues_excess_requests() {
        let transport = SimTransport::new();
        let gated = GatedDispatcher::new(1, 1);
        let config = ChannelConfig {
            worker_threads: 4,
            max_inflight_requests: 2,
            ..Default::default()
        };
        let channel = channel_over(
            &transport,
            Box::new(ArcDispatcher(Arc::clone(&gated))),
            config,
        );
        let completion = channel.initialize().unwrap();

        for unique in 1..=6u64 {
            transport.push_request(unique, FsOperation::GetAttr { ino: InodeNumber::ROOT });
        }
        // Exactly the bound reaches the dispatcher; the rest queue.
        assert!(gated.wait_for_entered(2, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(gated.peak_concurrency(), 2);

        gated.open_gate();
        transport.wait_for_replies(6, Duration::from_secs(5));
        transport.push_unmount();
        let _ = completion.wait();

        assert!(gated.peak_concurrency() <= 2);
        let replies = transport.replies();
        assert_eq!(replies.len(), 6, "no request may be lost or answered twice");
        let uniques: HashSet<u64> = replies.iter().map(|(unique, _)| *unique).collect();
        assert_eq!(uniques.len(), 6);
    }

    #[test]
    fn non_utf8_lookup_rejected_only_when_enforced() {
        let raw_name = OsString::from_vec(vec![0x66, 0xff, 0xfe]);

        for (require_utf8, expected_errno) in [(true, libc::EILSEQ), (false, libc::ENOSYS)] {
            let transport = SimTransport::new();
            let config = ChannelConfig {
                worker_threads: 1,
                require_utf8_paths: require_utf8,
                ..Default::default()
            };
            let channel = channel_over(
                &transport,
                Box::new(HarnessDispatcher::new(1, 1)),
                config,
            );
            let completion = channel.initialize().unwrap();
            transport.push_request(
                1,
                FsOperation::Lookup {
                    parent: InodeNumber::ROOT,
                    name: raw_name.clone(),
                },
            );
            transport.wait_for_replies(1, Duration::from_secs(5));
            transport.push_unmount();
            let _ = completion.wait();

            assert_eq!(
                transport.replies()[0].1,
                ReplyPayload::Error(expected_errno),
                "require_utf8_paths={require_utf8}"
            );
        }
    }

    #[test]
    fn watchdog_reports_long_running_requests() {
        let transport = SimTransport::new();
        let gated = GatedDispatcher::new(1, 1);
        let mut stats = MockStatsSink::new();
        stats.expect_record_long_request().times(1..).return_const(());
        stats.expect_record_request().returning(|_, _| ());
        stats.expect_record_queue_wait().returning(|_, _| ());

        let config = ChannelConfig {
            worker_threads: 1,
            long_request_threshold: Duration::from_millis(50),
            ..Default::default()
        };
        let channel = Channel::new(
            Box::new(ArcTransport(Arc::clone(&transport))),
            Box::new(ArcDispatcher(Arc::clone(&gated))),
            config,
            Box::new(stats),
        );
        let completion = channel.initialize().unwrap();

        transport.push_request(1, FsOperation::GetAttr { ino: InodeNumber::ROOT });
        assert!(gated.wait_for_entered(1, Duration::from_secs(5)));
        // Hold the request in flight well past the threshold.
        std::thread::sleep(Duration::from_millis(150));
        gated.open_gate();
        transport.wait_for_replies(1, Duration::from_secs(5));
        transport.push_unmount();
        let _ = completion.wait();
    }

    #[test]
    fn forget_messages_are_one_way() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();
        transport.push_request(1, FsOperation::Forget { ino: InodeNumber::new(5) });
        transport.push_request(2, FsOperation::GetAttr { ino: InodeNumber::ROOT });
        transport.wait_for_replies(1, Duration::from_secs(5));
        transport.push_unmount();
        let _ = completion.wait();

        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, 2);
    }

    #[test]
    fn traces_record_completed_requests() {
        let transport = SimTransport::new();
        let channel = channel_over(
            &transport,
            Box::new(HarnessDispatcher::new(1, 1)),
            small_config(),
        );
        let completion = channel.initialize().unwrap();
        transport.push_request(1, FsOperation::GetAttr { ino: InodeNumber::ROOT });
        transport.push_request(2, FsOperation::GetAttr { ino: InodeNumber::new(3) });
        transport.wait_for_replies(2, Duration::from_secs(5));
        transport.push_unmount();
        let _ = completion.wait();

        let traces = channel.drain_traces();
        assert_eq!(traces.len(), 2);
        assert!(traces.iter().all(|trace| trace.op == "getattr"));
        assert!(traces.iter().any(|trace| trace.errno == libc::ENOENT));
    }
}
