//! Schema-driven decoding of raw trace event payloads.
//!
//! A [`Decoder`] pairs an event schema with a family-specific
//! [`PostDecoder`]. Decoding walks the schema's fields over the raw sample
//! bytes, producing a heterogeneous [`FieldMap`], then hands the map to the
//! post-decoder to build the typed telemetry event. Length checks happen
//! per field against the declared offsets; a schema that disagrees with the
//! payload is a [`DecodeError`], never a panic.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::events::TelemetryEvent;
use crate::monitor::SampleRecord;
use crate::schema::{EventFormat, FieldDescriptor, FieldType};

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    /// Human-readable variant name for logs and errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::String(_) => "string",
            Self::Array(_) => "array",
        }
    }

    /// The value as an i64, when it is any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            Self::U8(v) => Some(i64::from(*v)),
            Self::U16(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            Self::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// The value as an i32, when it is exactly an i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a string slice, when it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Decoded sample data: field name to value.
pub type FieldMap = HashMap<String, Value>;

/// Errors from decoding a raw sample against a schema.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("sample too short for event id: {have} bytes")]
    ShortSample { have: usize },

    #[error("field {field}: range {offset}..{end} outside {have}-byte sample")]
    OutOfBounds {
        field: String,
        offset: usize,
        end: usize,
        have: usize,
    },

    #[error("field {field}: __data_loc size is neither 4 nor 8 (got {size})")]
    DataLocWidth { field: String, size: usize },

    #[error("field {field}: string in a non-dynamic slot")]
    StringNotDynamic { field: String },

    #[error("missing field {field}")]
    MissingField { field: &'static str },

    #[error("field {field}: expected {expected}, got {got}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

/// Turns a decoded field map into a typed telemetry event.
///
/// One implementation exists per event family; returning `Ok(None)` means
/// the sample is valid but produces no telemetry (for example when the
/// owning sensor is shutting down).
pub trait PostDecoder: Send + Sync {
    fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError>;
}

/// A schema-driven decoder for one trace event.
pub struct Decoder {
    format: Arc<EventFormat>,
    post: Arc<dyn PostDecoder>,
}

impl Decoder {
    pub fn new(format: Arc<EventFormat>, post: Arc<dyn PostDecoder>) -> Self {
        Self { format, post }
    }

    /// The schema this decoder was built from.
    pub fn format(&self) -> &EventFormat {
        &self.format
    }

    /// Decode the raw payload into a field map per the schema.
    pub fn decode_raw(&self, raw: &[u8]) -> Result<FieldMap, DecodeError> {
        let mut map = FieldMap::with_capacity(self.format.fields.len());
        for field in &self.format.fields {
            map.insert(field.name.clone(), decode_field(field, raw)?);
        }
        Ok(map)
    }

    /// Run the family post-decoder over an already-decoded field map.
    pub fn post_decode(
        &self,
        sample: &SampleRecord,
        fields: &FieldMap,
    ) -> Result<Option<TelemetryEvent>, DecodeError> {
        self.post.post_decode(sample, fields)
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("id", &self.format.id)
            .field("fields", &self.format.fields.len())
            .finish()
    }
}

fn decode_field(field: &FieldDescriptor, raw: &[u8]) -> Result<Value, DecodeError> {
    if field.data_loc_size > 0 {
        return decode_dynamic(field, raw);
    }

    if field.array_size == 0 {
        return decode_scalar(field, field.offset, raw);
    }

    decode_array(field, field.offset, field.array_size, raw)
}

/// Dynamic (`__data_loc`) field: the slot at `offset` holds a half-width
/// little-endian (offset, length) pair into the sample buffer.
fn decode_dynamic(field: &FieldDescriptor, raw: &[u8]) -> Result<Value, DecodeError> {
    let (data_offset, data_len) = match field.data_loc_size {
        4 => (
            usize::from(read_u16(field, raw, field.offset)?),
            usize::from(read_u16(field, raw, field.offset + 2)?),
        ),
        8 => (
            read_u32(field, raw, field.offset)? as usize,
            read_u32(field, raw, field.offset + 4)? as usize,
        ),
        size => {
            return Err(DecodeError::DataLocWidth {
                field: field.name.clone(),
                size,
            })
        }
    };

    let end = data_offset
        .checked_add(data_len)
        .filter(|&end| end <= raw.len())
        .ok_or_else(|| DecodeError::OutOfBounds {
            field: field.name.clone(),
            offset: data_offset,
            end: data_offset.saturating_add(data_len),
            have: raw.len(),
        })?;

    if field.field_type == FieldType::String {
        let mut bytes = &raw[data_offset..end];
        // One trailing NUL is part of the wire format, not the string.
        if let [head @ .., 0] = bytes {
            bytes = head;
        }
        return Ok(Value::String(
            String::from_utf8_lossy(bytes).into_owned(),
        ));
    }

    let count = if field.type_size > 0 {
        data_len / field.type_size
    } else {
        0
    };
    decode_array(field, data_offset, count, raw)
}

fn decode_array(
    field: &FieldDescriptor,
    start: usize,
    count: usize,
    raw: &[u8],
) -> Result<Value, DecodeError> {
    let mut values = Vec::with_capacity(count);
    let mut offset = start;
    for _ in 0..count {
        values.push(decode_scalar(field, offset, raw)?);
        offset += field.type_size;
    }
    Ok(Value::Array(values))
}

fn decode_scalar(
    field: &FieldDescriptor,
    offset: usize,
    raw: &[u8],
) -> Result<Value, DecodeError> {
    Ok(match field.field_type {
        FieldType::I8 => Value::I8(read_fixed::<1>(field, raw, offset)?[0] as i8),
        FieldType::U8 => Value::U8(read_fixed::<1>(field, raw, offset)?[0]),
        FieldType::I16 => Value::I16(i16::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::U16 => Value::U16(u16::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::I32 => Value::I32(i32::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::U32 => Value::U32(u32::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::I64 => Value::I64(i64::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::U64 => Value::U64(u64::from_le_bytes(read_fixed(field, raw, offset)?)),
        FieldType::String => {
            return Err(DecodeError::StringNotDynamic {
                field: field.name.clone(),
            })
        }
    })
}

fn read_fixed<const N: usize>(
    field: &FieldDescriptor,
    raw: &[u8],
    offset: usize,
) -> Result<[u8; N], DecodeError> {
    raw.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| DecodeError::OutOfBounds {
            field: field.name.clone(),
            offset,
            end: offset + N,
            have: raw.len(),
        })
}

fn read_u16(field: &FieldDescriptor, raw: &[u8], offset: usize) -> Result<u16, DecodeError> {
    Ok(u16::from_le_bytes(read_fixed(field, raw, offset)?))
}

fn read_u32(field: &FieldDescriptor, raw: &[u8], offset: usize) -> Result<u32, DecodeError> {
    Ok(u32::from_le_bytes(read_fixed(field, raw, offset)?))
}
