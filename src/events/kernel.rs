//! Kernel event family: arbitrary tracepoints requested by name, with all
//! non-common-header fields surfaced as arguments.

use std::sync::{Arc, Weak};

use crate::decode::{DecodeError, FieldMap, PostDecoder};
use crate::monitor::SampleRecord;
use crate::schema::SchemaError;
use crate::sensor::Sensor;

use super::{EventPayload, TelemetryEvent};

/// A kernel-call subscription entry naming a tracepoint, e.g.
/// `block/block_rq_issue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCallFilter {
    pub event: String,
}

pub(crate) fn register(
    sensor: &Arc<Sensor>,
    filters: &[KernelCallFilter],
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    for filter in filters {
        let post = Arc::new(KernelCallDecoder {
            sensor: Arc::downgrade(sensor),
            event: filter.event.clone(),
        });
        let id = sensor.decoders().add(&filter.event, post)?;
        out.push((id, filter.event.clone()));
    }
    Ok(())
}

struct KernelCallDecoder {
    sensor: Weak<Sensor>,
    event: String,
}

impl PostDecoder for KernelCallDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        // The common_* header fields carry no event-specific information.
        let arguments: FieldMap = fields
            .iter()
            .filter(|(name, _)| !name.starts_with("common_"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let payload = EventPayload::KernelCall {
            event: self.event.clone(),
            arguments,
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}
