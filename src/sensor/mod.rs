//! Sensor state, event stamping, and the per-sample dispatch path.
//!
//! A [`Sensor`] owns the decoder registry and the subscription map, stamps
//! every outgoing event with its identity (content-hashed id, monotonic
//! time, sequence number), enriches events with process and container
//! context, and fans decoded samples out to subscriber channels. The
//! external monitor loop calls [`Sensor::dispatch`] synchronously for every
//! sample it reads; that path takes no locks.

pub mod stats;
pub mod subscription;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decode::registry::DecoderRegistry;
use crate::decode::{DecodeError, FieldMap};
use crate::events::{self, EventPayload, EventSelector, TelemetryEvent};
use crate::filter::Predicate;
use crate::monitor::{EventMonitor, MonitorSample, SampleRecord};
use crate::mounts;
use crate::process::{ContainerLookup, ProcessCache};

pub use self::stats::{Metrics, MetricsSnapshot};
pub use self::subscription::EventStream;

use self::subscription::SubscriptionMap;

/// Number of random bytes behind a sensor id.
const SENSOR_ID_LENGTH: usize = 32;

/// A subscription descriptor: which event classes to watch and an optional
/// predicate applied to every matching sample.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRequest {
    pub events: EventSelector,
    pub filter: Option<Predicate>,
}

/// The (cgroups, pids) scope the external monitor should observe, derived
/// from `cgroup_names` in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorScope {
    pub cgroups: Vec<String>,
    /// A single `-1` entry means system-wide.
    pub pids: Vec<i32>,
}

/// State of one sensor instance. Sensor ids are ephemeral; everything else
/// hangs off this struct and is passed explicitly to collaborators.
pub struct Sensor {
    id: String,
    boot_monotime: i64,
    sequence: AtomicU64,
    cfg: Config,
    metrics: Metrics,
    decoders: DecoderRegistry,
    subscriptions: SubscriptionMap,
    monitor: Arc<dyn EventMonitor>,
    processes: Arc<dyn ProcessCache>,
    containers: Arc<dyn ContainerLookup>,
    perf_event_dir: Option<PathBuf>,
    tracefs_mount: parking_lot::Mutex<Option<PathBuf>>,
    perf_event_mount: parking_lot::Mutex<Option<PathBuf>>,
    cancel: CancellationToken,
}

impl Sensor {
    /// Create and start a sensor.
    ///
    /// Ensures the run directory exists, locates (or privately mounts) a
    /// tracefs instance, best-effort locates the perf_event cgroupfs, and
    /// enables all events on the monitor. Fails when no tracefs can be made
    /// available; a missing perf_event cgroupfs is never fatal.
    pub fn start(
        cfg: Config,
        monitor: Arc<dyn EventMonitor>,
        processes: Arc<dyn ProcessCache>,
        containers: Arc<dyn ContainerLookup>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;

        mounts::ensure_run_dir(&cfg.run_dir)
            .with_context(|| format!("creating run dir {}", cfg.run_dir.display()))?;

        let mut tracefs_mount = None;
        let tracing_dir = match &cfg.tracing_dir {
            Some(dir) => dir.clone(),
            None => match mounts::tracing_dir() {
                Some(dir) => dir,
                None if cfg.dont_mount_tracing => {
                    bail!("no mounted tracefs found and private mounts are disabled")
                }
                None => {
                    debug!("no mounted tracefs found, mounting a private one");
                    let dir = mounts::mount_private_tracefs(&cfg.run_dir)
                        .context("mounting private tracefs")?;
                    tracefs_mount = Some(dir.clone());
                    dir
                }
            },
        };

        let mut perf_event_mount = None;
        let perf_event_dir = match mounts::perf_event_dir() {
            Some(dir) => Some(dir),
            None if cfg.dont_mount_perf_event => None,
            None => match mounts::mount_private_perf_event(&cfg.run_dir) {
                Ok(dir) => {
                    perf_event_mount = Some(dir.clone());
                    Some(dir)
                }
                Err(e) => {
                    warn!(error = %e, "could not mount perf_event cgroupfs, continuing without");
                    None
                }
            },
        };

        let sensor = Arc::new(Self {
            id: random_sensor_id(),
            boot_monotime: monotonic_raw_ns(),
            sequence: AtomicU64::new(0),
            decoders: DecoderRegistry::new(&tracing_dir),
            subscriptions: SubscriptionMap::new(),
            metrics: Metrics::new(),
            cfg,
            monitor,
            processes,
            containers,
            perf_event_dir,
            tracefs_mount: parking_lot::Mutex::new(tracefs_mount),
            perf_event_mount: parking_lot::Mutex::new(perf_event_mount),
            cancel: CancellationToken::new(),
        });

        sensor.monitor.enable_all();

        info!(
            sensor_id = %sensor.id,
            tracing_dir = %tracing_dir.display(),
            "sensor started",
        );

        Ok(sensor)
    }

    /// Stop the sensor: cancel background tasks and release private mounts.
    pub fn stop(&self) {
        self.cancel.cancel();

        if let Some(dir) = self.tracefs_mount.lock().take() {
            if let Err(e) = mounts::unmount(&dir) {
                debug!(dir = %dir.display(), error = %e, "could not unmount private tracefs");
            }
        }

        if let Some(dir) = self.perf_event_mount.lock().take() {
            if let Err(e) = mounts::unmount(&dir) {
                debug!(dir = %dir.display(), error = %e, "could not unmount perf_event cgroupfs");
            }
        }

        info!(sensor_id = %self.id, "sensor stopped");
    }

    /// The sensor's hex-encoded id, stable for the process lifetime.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The monotonic-raw reference point all event monotimes are relative to.
    pub fn boot_monotime(&self) -> i64 {
        self.boot_monotime
    }

    /// Sensor counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The sensor-global decoder registry.
    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Register a decoder for the named trace event and return its id.
    /// This is the boundary operation the subscription assembler builds on.
    pub fn register_event(
        &self,
        name: &str,
        post: Arc<dyn crate::decode::PostDecoder>,
    ) -> Result<u16, crate::schema::SchemaError> {
        self.decoders.add(name, post)
    }

    /// Start delivering samples for an attached event.
    pub fn enable_event(&self, event_id: u16) {
        self.monitor.enable(event_id);
    }

    /// Stop delivering samples for an attached event.
    pub fn disable_event(&self, event_id: u16) {
        self.monitor.disable(event_id);
    }

    /// Events dropped on a full channel for a live subscription.
    pub fn dropped_events(&self, subscription_id: u64) -> Option<u64> {
        self.subscriptions
            .subscriber(subscription_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Derive the monitor scope from the configured cgroup names. Empty or
    /// `/` entries request system-wide monitoring, as does a missing
    /// perf_event cgroupfs.
    pub fn monitor_scope(&self) -> MonitorScope {
        let mut seen = HashSet::new();
        let mut cgroups = Vec::new();
        let mut system = false;

        for cgroup in &self.cfg.cgroup_names {
            if cgroup.is_empty() || cgroup == "/" {
                system = true;
                continue;
            }
            if seen.insert(cgroup.clone()) {
                cgroups.push(cgroup.clone());
            }
        }

        let mut pids = Vec::new();
        if system || cgroups.is_empty() || self.perf_event_dir.is_none() {
            pids.push(-1);
        }

        MonitorScope { cgroups, pids }
    }

    // --- Event stamping ---

    fn next_sequence(&self) -> u64 {
        // First emitted value is 1; 0 means "unset" on the wire.
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn current_monotime(&self) -> i64 {
        monotonic_raw_ns() - self.boot_monotime
    }

    fn stamp(&self, monotime_ns: i64, payload: EventPayload) -> TelemetryEvent {
        let sequence = self.next_sequence();
        self.metrics.record_event();

        TelemetryEvent {
            id: event_id(&self.id, sequence, monotime_ns),
            sensor_id: self.id.clone(),
            monotime_ns,
            sequence,
            pid: 0,
            cpu: 0,
            process_id: String::new(),
            container_id: String::new(),
            container_name: String::new(),
            image_id: String::new(),
            image_name: String::new(),
            payload,
        }
    }

    /// Produce a stamped event at the current monotonic time.
    pub fn new_event(&self, payload: EventPayload) -> TelemetryEvent {
        self.stamp(self.current_monotime(), payload)
    }

    /// Produce a stamped event from a perf sample: the monotime comes from
    /// the sample clock, the pid from the decoded `common_pid` field (the
    /// perf-level pid is zero across pid namespaces), and process and
    /// container context from the caches.
    pub fn new_event_from_sample(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
        payload: EventPayload,
    ) -> Result<TelemetryEvent, DecodeError> {
        let pid = fields
            .get("common_pid")
            .ok_or(DecodeError::MissingField {
                field: "common_pid",
            })?;
        let pid = pid.as_i32().ok_or(DecodeError::WrongType {
            field: "common_pid",
            expected: "i32",
            got: pid.type_name(),
        })?;

        let monotime_ns = sample.time as i64 - self.boot_monotime;
        let mut event = self.stamp(monotime_ns, payload);
        event.pid = pid;
        event.cpu = sample.cpu as i32;

        if let Some(process_id) = self.processes.process_id(pid) {
            event.process_id = process_id;
        }

        if let Some(container_id) = self.processes.container_id(pid) {
            if let Some(info) = self.containers.info(&container_id) {
                event.container_name = info.name;
                event.image_id = info.image_id;
                event.image_name = info.image_name;
            }
            event.container_id = container_id;
        }

        Ok(event)
    }

    // --- Subscriptions ---

    /// Create a subscription from a descriptor.
    ///
    /// Registers one decoder per requested trace event, attaches and
    /// enables the events on the monitor, and returns a stream of matching
    /// events. Closing (or dropping) the stream tears the subscription
    /// down. A descriptor selecting no events yields `Ok(None)`. Any setup
    /// failure rolls back every registration this call made.
    pub fn subscribe(self: &Arc<Self>, request: SubscriptionRequest) -> Result<Option<EventStream>> {
        let pre = self.decoders.snapshot();

        let mut registered: Vec<(u16, String)> = Vec::new();
        if let Err(err) = events::register_selector(self, &request.events, &mut registered) {
            self.rollback(&pre, &registered, &[]);
            return Err(err).context("registering trace event decoders");
        }

        if registered.is_empty() {
            return Ok(None);
        }

        let mut ids: Vec<u16> = registered.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut attached = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Err(err) = self.monitor.register_event(*id) {
                self.rollback(&pre, &registered, &attached);
                return Err(err).context("attaching trace events to the monitor");
            }
            attached.push(*id);
        }

        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<()>(1);
        let (data_tx, data_rx) = mpsc::channel(self.cfg.channel_buffer_length);

        let subscription_id = self
            .subscriptions
            .subscribe(registered, request.filter, data_tx);
        self.metrics.add_subscription();

        // Teardown waits for the caller to close the control side. It must
        // run even when the stream is dropped immediately after subscribe.
        let sensor = Arc::clone(self);
        tokio::spawn(async move {
            while ctrl_rx.recv().await.is_some() {}
            debug!(subscription = subscription_id, "control channel closed");
            sensor.teardown(subscription_id);
        });

        for id in &ids {
            self.monitor.enable(*id);
        }

        debug!(
            subscription = subscription_id,
            events = ids.len(),
            "subscription registered",
        );

        Ok(Some(EventStream {
            id: subscription_id,
            ctrl: Some(ctrl_tx),
            data: data_rx,
        }))
    }

    /// Undo a partially-completed subscribe. Decoders that existed before
    /// the call are left in place.
    fn rollback(
        &self,
        pre: &crate::decode::registry::RegistrySnapshot,
        registered: &[(u16, String)],
        attached: &[u16],
    ) {
        for id in attached {
            self.monitor.unregister_event(*id);
        }
        for (_, name) in registered {
            if pre.id_for(name).is_none() {
                self.decoders.remove(name);
            }
        }
    }

    fn teardown(&self, subscription_id: u64) {
        let removed = self.subscriptions.unsubscribe(subscription_id, |event_id, name| {
            self.monitor.unregister_event(event_id);
            self.decoders.remove(name);
        });

        if removed {
            self.metrics.remove_subscription();
            debug!(subscription = subscription_id, "subscription torn down");
        }
    }

    // --- Dispatch ---

    /// Dispatch one sample from the monitor loop.
    ///
    /// Never blocks and never takes a mutex: one atomic registry snapshot
    /// load, one subscription snapshot load, and `try_send` to bounded
    /// subscriber channels. Per-sample errors are absorbed and counted.
    pub fn dispatch(&self, sample: MonitorSample) {
        if let Some(err) = &sample.error {
            self.metrics.record_sample_error();
            warn!(error = %err, "monitor reported a sample error");
        }

        let decoded = match self.decoders.decode_sample(&sample.record) {
            Ok(Some(decoded)) => decoded,
            // No decoder registered: the sample is not for us.
            Ok(None) => return,
            Err(err) => {
                self.metrics.record_decode_error();
                debug!(error = %err, "dropping undecodable sample");
                return;
            }
        };

        let Some(event) = decoded.event else {
            return;
        };
        let event = Arc::new(event);

        let snapshot = self.subscriptions.snapshot();
        for subscriber in snapshot.subscribers(decoded.event_id) {
            if let Some(filter) = &subscriber.filter {
                match filter.evaluate(&decoded.fields) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        self.metrics.record_filter_error();
                        debug!(
                            subscription = subscriber.id,
                            error = %err,
                            "filter evaluation failed, skipping event",
                        );
                        continue;
                    }
                }
            }

            match subscriber.sink.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_backpressure_drop();
                }
                // The subscriber tore down between snapshot load and send.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Spawn a background task that periodically logs the sensor counters.
    /// The task stops when the sensor is stopped.
    pub fn spawn_stats_reporter(self: &Arc<Self>) {
        let sensor = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let interval = self.cfg.stats_report_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = MetricsSnapshot::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snap = sensor.metrics.snapshot();
                        if snap == last {
                            continue;
                        }

                        info!(
                            events = snap.events,
                            subscriptions = snap.subscriptions,
                            decode_errors = snap.decode_errors,
                            filter_errors = snap.filter_errors,
                            backpressure_drops = snap.backpressure_drops,
                            "sensor stats",
                        );
                        last = snap;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("id", &self.id)
            .field("boot_monotime", &self.boot_monotime)
            .finish()
    }
}

/// Content-hashed event id: SHA-256 over the sensor id's UTF-8 bytes, the
/// little-endian sequence number, and the little-endian monotime, encoded
/// as lowercase hex. The layout is fixed so ids are reproducible.
pub fn event_id(sensor_id: &str, sequence: u64, monotime_ns: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sensor_id.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(monotime_ns.to_le_bytes());
    hex_lower(&hasher.finalize())
}

fn random_sensor_id() -> String {
    let mut bytes = [0u8; SENSOR_ID_LENGTH];
    rand::rng().fill_bytes(&mut bytes);
    hex_lower(&bytes)
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(target_os = "linux")]
const STAMP_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC_RAW;
#[cfg(not(target_os = "linux"))]
const STAMP_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Current monotonic-raw clock value in nanoseconds.
fn monotonic_raw_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes through the valid pointer passed.
    if unsafe { libc::clock_gettime(STAMP_CLOCK, &mut ts) } == 0 {
        (ts.tv_sec as i64) * 1_000_000_000 + ts.tv_nsec
    } else {
        0
    }
}
