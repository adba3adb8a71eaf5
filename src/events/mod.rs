//! Telemetry event envelope and the per-family trace event decoders.
//!
//! Every event the sensor emits is a [`TelemetryEvent`]: a stamped envelope
//! (content-hashed id, sensor id, monotonic time, sequence number, process
//! and container context) around one [`EventPayload`] variant. The family
//! submodules map subscription selector entries onto tracefs event names
//! and provide the post-decoders that turn decoded field maps into
//! payloads.

pub mod file;
pub mod kernel;
pub mod network;
pub mod process;
pub mod syscall;

use std::sync::Arc;

use crate::decode::{DecodeError, FieldMap};
use crate::schema::SchemaError;
use crate::sensor::Sensor;

/// Typed payload of a telemetry event, one variant per event family.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A file was opened (`fs/do_sys_open`).
    FileOpen {
        filename: String,
        flags: i32,
        mode: i32,
    },

    /// A process forked (`sched/sched_process_fork`).
    ProcessFork { parent_pid: i32, child_pid: i32 },

    /// A process called exec (`sched/sched_process_exec`).
    ProcessExec { filename: String },

    /// A process exited (`sched/sched_process_exit`).
    ProcessExit { exit_pid: i32 },

    /// A connect attempt entered the kernel (`syscalls/sys_enter_connect`).
    NetworkConnect { fd: i64, address_length: i64 },

    /// A bind attempt entered the kernel (`syscalls/sys_enter_bind`).
    NetworkBind { fd: i64, address_length: i64 },

    /// A listen attempt entered the kernel (`syscalls/sys_enter_listen`).
    NetworkListen { fd: i64, backlog: i64 },

    /// Syscall entry (`raw_syscalls/sys_enter`).
    SyscallEnter { id: i64, args: Vec<u64> },

    /// Syscall exit (`raw_syscalls/sys_exit`).
    SyscallExit { id: i64, ret: i64 },

    /// An arbitrary kernel tracepoint fired; all non-common decoded fields
    /// are surfaced as-is.
    KernelCall { event: String, arguments: FieldMap },
}

/// A stamped, enriched telemetry event ready for delivery to subscribers.
///
/// String context fields are empty when unknown (process not in the cache,
/// process not in a container).
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    /// Content-hashed event id, unique within the sensor's lifetime.
    pub id: String,
    /// Id of the sensor that emitted the event.
    pub sensor_id: String,
    /// Nanoseconds since the sensor's boot reference point.
    pub monotime_ns: i64,
    /// Sensor-unique sequence number; the first emitted event is 1.
    pub sequence: u64,
    /// Process id the event pertains to.
    pub pid: i32,
    /// CPU the originating sample was taken on.
    pub cpu: i32,
    /// Stable process identity from the process cache.
    pub process_id: String,
    /// Container the process runs in, if any.
    pub container_id: String,
    pub container_name: String,
    pub image_id: String,
    pub image_name: String,
    /// The decoded, typed payload.
    pub payload: EventPayload,
}

/// Which event classes a subscription watches. Each entry translates into
/// one decoder registration against the sensor's registry.
#[derive(Debug, Clone, Default)]
pub struct EventSelector {
    pub file: Vec<file::FileEventKind>,
    pub process: Vec<process::ProcessEventKind>,
    pub network: Vec<network::NetworkEventKind>,
    pub syscall: Vec<syscall::SyscallEventKind>,
    pub kernel: Vec<kernel::KernelCallFilter>,
}

impl EventSelector {
    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
            && self.process.is_empty()
            && self.network.is_empty()
            && self.syscall.is_empty()
            && self.kernel.is_empty()
    }
}

/// Register decoders for every entry in the selector, appending the
/// resulting (event id, event name) pairs to `out`. On error the caller
/// rolls back whatever was appended so far.
pub(crate) fn register_selector(
    sensor: &Arc<Sensor>,
    selector: &EventSelector,
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    file::register(sensor, &selector.file, out)?;
    kernel::register(sensor, &selector.kernel, out)?;
    network::register(sensor, &selector.network, out)?;
    process::register(sensor, &selector.process, out)?;
    syscall::register(sensor, &selector.syscall, out)?;
    Ok(())
}

// --- Field extraction helpers shared by the family decoders ---

pub(crate) fn field_i64(fields: &FieldMap, name: &'static str) -> Result<i64, DecodeError> {
    let value = fields
        .get(name)
        .ok_or(DecodeError::MissingField { field: name })?;
    value.as_i64().ok_or(DecodeError::WrongType {
        field: name,
        expected: "integer",
        got: value.type_name(),
    })
}

pub(crate) fn field_string(fields: &FieldMap, name: &'static str) -> Result<String, DecodeError> {
    let value = fields
        .get(name)
        .ok_or(DecodeError::MissingField { field: name })?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or(DecodeError::WrongType {
            field: name,
            expected: "string",
            got: value.type_name(),
        })
}

pub(crate) fn field_u64_array(
    fields: &FieldMap,
    name: &'static str,
) -> Result<Vec<u64>, DecodeError> {
    let value = fields
        .get(name)
        .ok_or(DecodeError::MissingField { field: name })?;

    let crate::decode::Value::Array(values) = value else {
        return Err(DecodeError::WrongType {
            field: name,
            expected: "array",
            got: value.type_name(),
        });
    };

    values
        .iter()
        .map(|v| match v {
            crate::decode::Value::U64(x) => Ok(*x),
            other => Err(DecodeError::WrongType {
                field: name,
                expected: "u64",
                got: other.type_name(),
            }),
        })
        .collect()
}
