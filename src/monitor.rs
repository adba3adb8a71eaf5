//! Interface to the external perf event monitor.
//!
//! The ring-buffer reader that produces samples lives outside this crate;
//! the sensor only drives the control surface below and receives
//! [`MonitorSample`]s through [`crate::sensor::Sensor::dispatch`].

/// A raw perf sample as delivered by the kernel's ring buffer.
#[derive(Debug, Clone, Default)]
pub struct SampleRecord {
    /// Kernel timestamp of the sample, monotonic-raw nanoseconds.
    pub time: u64,
    /// Process id as seen by perf. Zero when the sensor and the sampled
    /// process are in different pid namespaces; use `common_pid` from the
    /// decoded fields instead.
    pub pid: u32,
    /// Thread id as seen by perf.
    pub tid: u32,
    /// CPU the sample was taken on.
    pub cpu: u32,
    /// Raw trace event payload. The low 16 bits of the little-endian u64
    /// at offset 0 are the event id.
    pub raw_data: Vec<u8>,
}

/// One unit of work handed to the dispatcher by the monitor loop.
#[derive(Debug)]
pub struct MonitorSample {
    pub record: SampleRecord,
    /// A read-side error attached to this sample. Dispatch records it and
    /// still attempts to decode the record.
    pub error: Option<anyhow::Error>,
}

impl MonitorSample {
    /// A sample with no attached error.
    pub fn new(record: SampleRecord) -> Self {
        Self {
            record,
            error: None,
        }
    }
}

/// Control surface of the perf event monitor.
///
/// Implementations attach and detach kernel trace events by their tracefs
/// ids. All operations are keyed by event id; registration of the matching
/// decoder happens separately in the decoder registry.
pub trait EventMonitor: Send + Sync {
    /// Attach the trace event with the given id.
    fn register_event(&self, event_id: u16) -> anyhow::Result<()>;

    /// Detach the trace event with the given id.
    fn unregister_event(&self, event_id: u16);

    /// Start delivering samples for an attached event.
    fn enable(&self, event_id: u16);

    /// Stop delivering samples for an attached event without detaching it.
    fn disable(&self, event_id: u16);

    /// Enable every attached event.
    fn enable_all(&self);
}
