//! Parsing of single `field:` lines from a tracefs `format` file.

use thiserror::Error;

/// Primitive type of a trace event field element.
///
/// Strings are only produced for dynamic (`__data_loc`) fields; a fixed
/// `char` array decodes as an array of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    String,
}

impl FieldType {
    /// Pick an integer type from element size and signedness.
    pub fn from_size(size: usize, signed: bool) -> Option<Self> {
        match (size, signed) {
            (1, true) => Some(Self::I8),
            (1, false) => Some(Self::U8),
            (2, true) => Some(Self::I16),
            (2, false) => Some(Self::U16),
            (4, true) => Some(Self::I32),
            (4, false) => Some(Self::U32),
            (8, true) => Some(Self::I64),
            (8, false) => Some(Self::U64),
            _ => None,
        }
    }

    /// Size in bytes of one element of this type. Strings have no fixed
    /// element size and report 1 (they are measured by their data-loc length).
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::String => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 => 4,
            Self::I64 | Self::U64 => 8,
        }
    }
}

/// Schema of a single trace event field, parsed from one `field:` line.
///
/// Immutable once loaded. For dynamic fields (`data_loc_size > 0`) the bytes
/// at `offset` hold an (offset, length) pair into the sample buffer rather
/// than the field data itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name as declared in the format file.
    pub name: String,
    /// Byte offset into the raw sample payload.
    pub offset: usize,
    /// Total declared size of the field in bytes.
    pub size: usize,
    /// Element type.
    pub field_type: FieldType,
    /// Size in bytes of a single element.
    pub type_size: usize,
    /// 0 for scalars, N for fixed `[N]` arrays. Dynamic fields keep 0 here
    /// and are recognized by `data_loc_size` instead.
    pub array_size: usize,
    /// 0 for inline fields; 4 or 8 for `__data_loc` fields, in which case it
    /// is the width of the inline (offset, length) word.
    pub data_loc_size: usize,
}

impl FieldDescriptor {
    /// Whether the field's data lives outside its declared slot.
    pub fn is_dynamic(&self) -> bool {
        self.data_loc_size > 0
    }
}

/// Errors from parsing a single `field:` line.
#[derive(Error, Debug)]
pub enum FieldError {
    #[error("malformed field line")]
    Malformed,

    #[error("missing {0} attribute")]
    MissingAttr(&'static str),

    #[error("unsupported type `{type_text}` for field {field} ({size} bytes)")]
    UnknownType {
        field: String,
        type_text: String,
        size: usize,
    },
}

/// Element sizes for C type names that can appear as `__data_loc` element
/// types, where the declared size covers only the data-loc word and the
/// element size cannot be derived from it.
fn named_type_size(name: &str) -> Option<usize> {
    match name {
        "char" | "signed char" | "unsigned char" | "bool" | "s8" | "u8" | "__s8" | "__u8" => {
            Some(1)
        }
        "short" | "signed short" | "unsigned short" | "short int" | "unsigned short int"
        | "s16" | "u16" | "__s16" | "__u16" | "umode_t" => Some(2),
        "int" | "signed int" | "unsigned int" | "s32" | "u32" | "__s32" | "__u32" | "pid_t"
        | "uid_t" | "gid_t" => Some(4),
        "long" | "unsigned long" | "long int" | "unsigned long int" | "long long"
        | "unsigned long long" | "s64" | "u64" | "__s64" | "__u64" | "size_t" | "ssize_t"
        | "loff_t" | "sector_t" => Some(8),
        _ => None,
    }
}

/// Parse one `field:` line of a tracefs format file, e.g.
///
/// ```text
/// field:__data_loc char[] filename;  offset:8;  size:4;  signed:1;
/// ```
pub fn parse_field(line: &str) -> Result<FieldDescriptor, FieldError> {
    let rest = line
        .trim()
        .strip_prefix("field:")
        .ok_or(FieldError::Malformed)?;

    let mut decl = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = None;

    for part in rest.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(v) = part.strip_prefix("offset:") {
            offset = v.trim().parse::<usize>().ok();
        } else if let Some(v) = part.strip_prefix("size:") {
            size = v.trim().parse::<usize>().ok();
        } else if let Some(v) = part.strip_prefix("signed:") {
            signed = match v.trim() {
                "0" => Some(false),
                "1" => Some(true),
                _ => None,
            };
        } else if decl.is_none() {
            decl = Some(part);
        }
    }

    let decl = decl.ok_or(FieldError::Malformed)?;
    let offset = offset.ok_or(FieldError::MissingAttr("offset"))?;
    let size = size.ok_or(FieldError::MissingAttr("size"))?;
    let signed = signed.ok_or(FieldError::MissingAttr("signed"))?;

    // Split `<type-text> <name>` on the last space; the name may carry a
    // fixed-array suffix, e.g. `prev_comm[16]`.
    let (type_text, name_text) = decl.rsplit_once(' ').ok_or(FieldError::Malformed)?;
    let type_text = type_text.trim();
    let name_text = name_text.trim();

    let (name, declared_array) = match name_text.split_once('[') {
        Some((base, rest)) => {
            let n = rest
                .strip_suffix(']')
                .and_then(|v| v.trim().parse::<usize>().ok());
            (base.to_string(), Some(n))
        }
        None => (name_text.to_string(), None),
    };
    if name.is_empty() {
        return Err(FieldError::Malformed);
    }

    let unknown = |type_text: &str| FieldError::UnknownType {
        field: name.clone(),
        type_text: type_text.to_string(),
        size,
    };

    if let Some(element) = type_text.strip_prefix("__data_loc ") {
        // Dynamic field: the declared size is the width of the inline
        // (offset, length) word. Element type comes from the declared text.
        let element = element.trim().trim_end_matches("[]").trim();
        if element == "char" {
            return Ok(FieldDescriptor {
                name,
                offset,
                size,
                field_type: FieldType::String,
                type_size: 1,
                array_size: 0,
                data_loc_size: size,
            });
        }

        let type_size = named_type_size(element).ok_or_else(|| unknown(element))?;
        let field_type =
            FieldType::from_size(type_size, signed).ok_or_else(|| unknown(element))?;
        return Ok(FieldDescriptor {
            name,
            offset,
            size,
            field_type,
            type_size,
            array_size: 0,
            data_loc_size: size,
        });
    }

    if let Some(n) = declared_array {
        // Fixed inline array. An empty or unparsable bracket count falls
        // back to the declared element size when the total divides evenly.
        let type_size = match n {
            Some(n) if n > 0 && size % n == 0 => size / n,
            _ => named_type_size(type_text).ok_or_else(|| unknown(type_text))?,
        };
        let array_size = if type_size > 0 { size / type_size } else { 0 };
        if array_size == 0 {
            return Err(unknown(type_text));
        }
        let field_type =
            FieldType::from_size(type_size, signed).ok_or_else(|| unknown(type_text))?;
        return Ok(FieldDescriptor {
            name,
            offset,
            size,
            field_type,
            type_size,
            array_size,
            data_loc_size: 0,
        });
    }

    // Scalar: the element is the whole field. Pointers and typedef'd
    // integers all reduce to their declared size and signedness.
    let field_type = FieldType::from_size(size, signed).ok_or_else(|| unknown(type_text))?;
    Ok(FieldDescriptor {
        name,
        offset,
        size,
        field_type,
        type_size: size,
        array_size: 0,
        data_loc_size: 0,
    })
}
