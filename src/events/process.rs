//! Process lifecycle event family: fork, exec, and exit tracepoints.

use std::sync::{Arc, Weak};

use crate::decode::{DecodeError, FieldMap, PostDecoder};
use crate::monitor::SampleRecord;
use crate::schema::SchemaError;
use crate::sensor::Sensor;

use super::{field_i64, field_string, EventPayload, TelemetryEvent};

pub const PROCESS_FORK_EVENT: &str = "sched/sched_process_fork";
pub const PROCESS_EXEC_EVENT: &str = "sched/sched_process_exec";
pub const PROCESS_EXIT_EVENT: &str = "sched/sched_process_exit";

/// Process event classes a subscription can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Fork,
    Exec,
    Exit,
}

pub(crate) fn register(
    sensor: &Arc<Sensor>,
    kinds: &[ProcessEventKind],
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    for kind in kinds {
        let (name, post): (&str, Arc<dyn PostDecoder>) = match kind {
            ProcessEventKind::Fork => (
                PROCESS_FORK_EVENT,
                Arc::new(ForkDecoder {
                    sensor: Arc::downgrade(sensor),
                }),
            ),
            ProcessEventKind::Exec => (
                PROCESS_EXEC_EVENT,
                Arc::new(ExecDecoder {
                    sensor: Arc::downgrade(sensor),
                }),
            ),
            ProcessEventKind::Exit => (
                PROCESS_EXIT_EVENT,
                Arc::new(ExitDecoder {
                    sensor: Arc::downgrade(sensor),
                }),
            ),
        };

        let id = sensor.decoders().add(name, post)?;
        out.push((id, name.to_string()));
    }
    Ok(())
}

struct ForkDecoder {
    sensor: Weak<Sensor>,
}

impl PostDecoder for ForkDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let payload = EventPayload::ProcessFork {
            parent_pid: field_i64(fields, "parent_pid")? as i32,
            child_pid: field_i64(fields, "child_pid")? as i32,
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}

struct ExecDecoder {
    sensor: Weak<Sensor>,
}

impl PostDecoder for ExecDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let payload = EventPayload::ProcessExec {
            filename: field_string(fields, "filename")?,
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}

struct ExitDecoder {
    sensor: Weak<Sensor>,
}

impl PostDecoder for ExitDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let payload = EventPayload::ProcessExit {
            exit_pid: field_i64(fields, "pid")? as i32,
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}
