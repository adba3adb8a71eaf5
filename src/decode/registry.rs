//! Concurrent registry of trace event decoders.
//!
//! The registry maps kernel-assigned event ids to decoders. The dispatch
//! hot path does a single atomic snapshot load and lock-free lookups;
//! writers serialize on a mutex, rebuild the snapshot, and publish it with
//! one atomic store. Published snapshots are immutable, so in-flight
//! readers keep a consistent view for the whole sample they are decoding.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::monitor::SampleRecord;
use crate::schema::{FormatCache, SchemaError};

use super::{DecodeError, Decoder, FieldMap, PostDecoder};

/// One immutable, atomically-published registry state.
///
/// Invariant: `by_name[n] = id` implies `by_id[id]` exists and was
/// registered under `n`.
#[derive(Default)]
pub struct RegistrySnapshot {
    by_id: HashMap<u16, Arc<Decoder>>,
    by_name: HashMap<String, u16>,
}

impl RegistrySnapshot {
    /// Event id registered under `name`, if any.
    pub fn id_for(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Decoder registered for `event_id`, if any.
    pub fn decoder(&self, event_id: u16) -> Option<&Arc<Decoder>> {
        self.by_id.get(&event_id)
    }

    /// Number of registered decoders.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Result of decoding one sample end to end.
#[derive(Debug)]
pub struct DecodedSample {
    /// Event id read from the sample's leading bytes.
    pub event_id: u16,
    /// Schema-decoded field values.
    pub fields: FieldMap,
    /// Typed event produced by the family post-decoder, when the sample
    /// yields one.
    pub event: Option<crate::events::TelemetryEvent>,
}

/// Concurrent map of event id to decoder with lock-free reads.
pub struct DecoderRegistry {
    schemas: FormatCache,
    active: ArcSwap<RegistrySnapshot>,
    write_lock: parking_lot::Mutex<()>,
}

impl DecoderRegistry {
    /// Create an empty registry reading schemas from the given tracefs root.
    pub fn new(tracefs_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            schemas: FormatCache::new(tracefs_dir),
            active: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: parking_lot::Mutex::new(()),
        }
    }

    /// The tracefs root schemas are loaded from.
    pub fn tracefs_dir(&self) -> &Path {
        self.schemas.dir()
    }

    /// The current snapshot. Callers reuse one snapshot for all lookups
    /// belonging to a single sample.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.active.load_full()
    }

    /// Register a decoder for the named trace event and return its id.
    ///
    /// The schema is loaded (or served from cache) before the writers'
    /// lock is taken. Re-adding a name replaces the decoder published for
    /// that name's id.
    pub fn add(&self, name: &str, post: Arc<dyn PostDecoder>) -> Result<u16, SchemaError> {
        let format = self.schemas.load(name)?;
        let decoder = Arc::new(Decoder::new(Arc::clone(&format), post));

        let _guard = self.write_lock.lock();
        let old = self.active.load();

        let mut by_id = old.by_id.clone();
        let mut by_name = old.by_name.clone();
        by_id.insert(format.id, decoder);
        by_name.insert(name.to_string(), format.id);

        self.active
            .store(Arc::new(RegistrySnapshot { by_id, by_name }));

        Ok(format.id)
    }

    /// Remove the decoder registered under `name`, dropping both the name
    /// and id mappings. A name that was never added is a no-op.
    pub fn remove(&self, name: &str) {
        let _guard = self.write_lock.lock();
        let old = self.active.load();

        let Some(&id) = old.by_name.get(name) else {
            return;
        };

        let mut by_id = old.by_id.clone();
        let mut by_name = old.by_name.clone();
        by_id.remove(&id);
        by_name.remove(name);

        self.active
            .store(Arc::new(RegistrySnapshot { by_id, by_name }));
    }

    /// Lock-free decoder lookup by event id.
    pub fn get(&self, event_id: u16) -> Option<Arc<Decoder>> {
        self.active.load().by_id.get(&event_id).cloned()
    }

    /// Decode a sample end to end: read the event id from the leading
    /// little-endian u64 (low 16 bits), look up the decoder, decode the
    /// fields, and run the family post-decoder.
    ///
    /// A sample with no registered decoder is not an error; it simply is
    /// not for us and yields `Ok(None)`.
    pub fn decode_sample(
        &self,
        sample: &SampleRecord,
    ) -> Result<Option<DecodedSample>, DecodeError> {
        let raw = sample.raw_data.as_slice();
        let head: [u8; 8] = raw
            .get(0..8)
            .and_then(|s| s.try_into().ok())
            .ok_or(DecodeError::ShortSample { have: raw.len() })?;
        let event_id = u64::from_le_bytes(head) as u16;

        let snapshot = self.active.load();
        let Some(decoder) = snapshot.by_id.get(&event_id) else {
            return Ok(None);
        };

        let fields = decoder.decode_raw(raw)?;
        let event = decoder.post_decode(sample, &fields)?;

        Ok(Some(DecodedSample {
            event_id,
            fields,
            event,
        }))
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("tracefs_dir", &self.schemas.dir())
            .field("decoders", &self.active.load().len())
            .finish()
    }
}
