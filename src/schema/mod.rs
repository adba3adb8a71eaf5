//! Trace event schemas loaded from tracefs `format` files.
//!
//! Every trace event the kernel exposes carries a textual `format`
//! description under `<tracefs>/events/<subsystem>/<event>/format`. This
//! module parses that text into an [`EventFormat`] (the kernel-assigned
//! event id plus one [`FieldDescriptor`] per field) and caches the result
//! per event name so repeat loads are pure reads.

pub mod field;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

pub use self::field::{FieldDescriptor, FieldType};

/// Errors from loading or parsing a tracefs format file.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("reading format for {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("format for {name} has no ID line")]
    MissingId { name: String },

    #[error("format for {name}: bad field line `{line}`: {source}")]
    Field {
        name: String,
        line: String,
        #[source]
        source: field::FieldError,
    },

    #[error("format for {name} declares no fields")]
    NoFields { name: String },
}

/// Parsed schema of one trace event: its kernel-assigned id and field set.
#[derive(Debug, Clone)]
pub struct EventFormat {
    pub id: u16,
    pub fields: Vec<FieldDescriptor>,
}

impl EventFormat {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Parse the text of a format file. `name` is only used in error messages.
pub fn parse_format(name: &str, text: &str) -> Result<EventFormat, SchemaError> {
    let mut id = None;
    let mut fields = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();

        if let Some(v) = trimmed.strip_prefix("ID:") {
            id = v.trim().parse::<u16>().ok();
            continue;
        }

        if trimmed.starts_with("field:") {
            let f = field::parse_field(trimmed).map_err(|source| SchemaError::Field {
                name: name.to_string(),
                line: trimmed.to_string(),
                source,
            })?;
            fields.push(f);
        }
    }

    let id = id.ok_or_else(|| SchemaError::MissingId {
        name: name.to_string(),
    })?;

    if fields.is_empty() {
        return Err(SchemaError::NoFields {
            name: name.to_string(),
        });
    }

    Ok(EventFormat { id, fields })
}

/// Load and parse the format file for `name` (e.g. `sched/sched_switch`)
/// relative to a tracefs root.
pub fn load_format(tracefs: &Path, name: &str) -> Result<EventFormat, SchemaError> {
    let path = tracefs.join("events").join(name).join("format");
    let text = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
        name: name.to_string(),
        source,
    })?;
    parse_format(name, &text)
}

/// Per-tracefs-root schema cache.
///
/// The first load of an event name reads and parses the format file; later
/// loads return the cached, immutable schema.
pub struct FormatCache {
    dir: PathBuf,
    cache: DashMap<String, Arc<EventFormat>>,
}

impl FormatCache {
    /// Create a cache bound to one tracefs root.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// The tracefs root this cache reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the schema for `name`, reading the format file at most once.
    pub fn load(&self, name: &str) -> Result<Arc<EventFormat>, SchemaError> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(Arc::clone(&cached));
        }

        let format = Arc::new(load_format(&self.dir, name)?);
        self.cache.insert(name.to_string(), Arc::clone(&format));
        Ok(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCHED_SWITCH: &str = "\
name: sched_switch
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:int prev_prio;\toffset:28;\tsize:4;\tsigned:1;

print fmt: \"prev_comm=%s\", REC->prev_comm
";

    #[test]
    fn test_parse_format() {
        let fmt = parse_format("sched/sched_switch", SCHED_SWITCH).unwrap();
        assert_eq!(fmt.id, 316);
        assert_eq!(fmt.fields.len(), 7);

        let pid = fmt.field("common_pid").unwrap();
        assert_eq!(pid.offset, 4);
        assert_eq!(pid.field_type, FieldType::I32);

        let comm = fmt.field("prev_comm").unwrap();
        assert_eq!(comm.array_size, 16);
    }

    #[test]
    fn test_parse_format_missing_id() {
        let text = "name: x\nformat:\n\tfield:int a;\toffset:0;\tsize:4;\tsigned:1;\n";
        let err = parse_format("x/y", text).unwrap_err();
        assert!(matches!(err, SchemaError::MissingId { .. }));
    }

    #[test]
    fn test_parse_format_no_fields() {
        let err = parse_format("x/y", "ID: 7\n").unwrap_err();
        assert!(matches!(err, SchemaError::NoFields { .. }));
    }

    #[test]
    fn test_parse_format_bad_field() {
        let text = "ID: 7\n\tfield:struct foo f;\toffset:0;\tsize:16;\tsigned:0;\n";
        let err = parse_format("x/y", text).unwrap_err();
        assert!(matches!(err, SchemaError::Field { .. }));
    }

    fn write_format(root: &Path, name: &str, text: &str) {
        let dir = root.join("events").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("format")).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_load_format_from_tree() {
        let tmp = tempfile::tempdir().unwrap();
        write_format(tmp.path(), "sched/sched_switch", SCHED_SWITCH);

        let fmt = load_format(tmp.path(), "sched/sched_switch").unwrap();
        assert_eq!(fmt.id, 316);
    }

    #[test]
    fn test_load_format_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_format(tmp.path(), "sched/nonexistent").unwrap_err();
        assert!(matches!(err, SchemaError::Io { .. }));
    }

    #[test]
    fn test_cache_serves_same_schema() {
        let tmp = tempfile::tempdir().unwrap();
        write_format(tmp.path(), "sched/sched_switch", SCHED_SWITCH);

        let cache = FormatCache::new(tmp.path());
        let a = cache.load("sched/sched_switch").unwrap();

        // Remove the backing file; the cached schema must still be served.
        std::fs::remove_file(
            tmp.path()
                .join("events/sched/sched_switch/format"),
        )
        .unwrap();

        let b = cache.load("sched/sched_switch").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
