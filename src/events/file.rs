//! File event family: open events from `fs/do_sys_open`.

use std::sync::{Arc, Weak};

use crate::decode::{DecodeError, FieldMap, PostDecoder};
use crate::monitor::SampleRecord;
use crate::schema::SchemaError;
use crate::sensor::Sensor;

use super::{field_i64, field_string, EventPayload, TelemetryEvent};

/// Tracepoint behind file-open events.
pub const FILE_OPEN_EVENT: &str = "fs/do_sys_open";

/// File event classes a subscription can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Open,
}

pub(crate) fn register(
    sensor: &Arc<Sensor>,
    kinds: &[FileEventKind],
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    for kind in kinds {
        match kind {
            FileEventKind::Open => {
                let post = Arc::new(FileOpenDecoder {
                    sensor: Arc::downgrade(sensor),
                });
                let id = sensor.decoders().add(FILE_OPEN_EVENT, post)?;
                out.push((id, FILE_OPEN_EVENT.to_string()));
            }
        }
    }
    Ok(())
}

struct FileOpenDecoder {
    sensor: Weak<Sensor>,
}

impl PostDecoder for FileOpenDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let payload = EventPayload::FileOpen {
            filename: field_string(fields, "filename")?,
            flags: field_i64(fields, "flags")? as i32,
            mode: field_i64(fields, "mode")? as i32,
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}
