//! Network event family: connect, bind, and listen attempts observed at
//! syscall entry.

use std::sync::{Arc, Weak};

use crate::decode::{DecodeError, FieldMap, PostDecoder};
use crate::monitor::SampleRecord;
use crate::schema::SchemaError;
use crate::sensor::Sensor;

use super::{field_i64, EventPayload, TelemetryEvent};

pub const CONNECT_EVENT: &str = "syscalls/sys_enter_connect";
pub const BIND_EVENT: &str = "syscalls/sys_enter_bind";
pub const LISTEN_EVENT: &str = "syscalls/sys_enter_listen";

/// Network event classes a subscription can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    Connect,
    Bind,
    Listen,
}

pub(crate) fn register(
    sensor: &Arc<Sensor>,
    kinds: &[NetworkEventKind],
    out: &mut Vec<(u16, String)>,
) -> Result<(), SchemaError> {
    for kind in kinds {
        let name = match kind {
            NetworkEventKind::Connect => CONNECT_EVENT,
            NetworkEventKind::Bind => BIND_EVENT,
            NetworkEventKind::Listen => LISTEN_EVENT,
        };
        let post = Arc::new(NetworkDecoder {
            sensor: Arc::downgrade(sensor),
            kind: *kind,
        });
        let id = sensor.decoders().add(name, post)?;
        out.push((id, name.to_string()));
    }
    Ok(())
}

struct NetworkDecoder {
    sensor: Weak<Sensor>,
    kind: NetworkEventKind,
}

impl PostDecoder for NetworkDecoder {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        let Some(sensor) = self.sensor.upgrade() else {
            return Ok(None);
        };

        let fd = field_i64(fields, "fd")?;
        let payload = match self.kind {
            NetworkEventKind::Connect => EventPayload::NetworkConnect {
                fd,
                address_length: field_i64(fields, "addrlen")?,
            },
            NetworkEventKind::Bind => EventPayload::NetworkBind {
                fd,
                address_length: field_i64(fields, "addrlen")?,
            },
            NetworkEventKind::Listen => EventPayload::NetworkListen {
                fd,
                backlog: field_i64(fields, "backlog")?,
            },
        };

        sensor
            .new_event_from_sample(sample, fields, payload)
            .map(Some)
    }
}
