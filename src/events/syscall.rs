//! Raw syscall event family: `raw_syscalls/sys_enter` and `sys_exit`.

use std::sync::{Arc, Weak};

use crate::decode::{DecodeError, FieldMap, PostDecoder};
use crate::monitor::SampleRecord;
use crate::schema::SchemaError;
use crate::sensor::Sensor;

use super::{field_i64, field_u64_array, EventPayload, TelemetryEvent};

pub const SYSCALL_ENTER_EVENT: &str = "raw_syscalls/sys_enter";
pub const SYSCALL_EXIT_EVENT: &str = "raw_syscalls/sys_exit";

/// Syscall event classes a subscription can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallEventKind {
    Enter,
    Exit,
}

pub(crate) fn register(
    sensor: &Arc<Sensor>,
    kinds: &[SyscallEventKind],
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    for kind in kinds {
        let name = match kind {
            SyscallEventKind::Enter => SYSCALL_ENTER_EVENT,
            SyscallEventKind::Exit => SYSCALL_EXIT_EVENT,
        };
        let post = Arc::new(SyscallDecoder {
            sensor: Arc::downgrade(sensor),
            kind: *kind,
        });
        let id = sensor.decoders().add(name, post)?;
        out.push((id, name.to_string()));
    }
    Ok(())
}

struct SyscallDecoder {
    sensor: Weak<Sensor>,
    kind: SyscallEventKind,
}

impl PostDecoder for SyscallDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let id = field_i64(fields, "id")?;
        let payload = match self.kind {
            SyscallEventKind::Enter => EventPayload::SyscallEnter {
                id,
                args: field_u64_array(fields, "args")?,
            },
            SyscallEventKind::Exit => EventPayload::SyscallExit {
                id,
                ret: field_i64(fields, "ret")?,
            },
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}
