//! Schema mapping - column descriptors, native type lookup, and deterministic
//! type inference over flat-file samples.

use crate::client::ColumnMeta;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Abstract value kind, independent of store-native or file-native naming.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SemanticType {
    String,
    Int64,
    Float64,
    Bool,
    DateTime,
    Unknown,
}

/// Ordered column metadata governing row tuple layout.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
        }
    }
}

/// Options controlling file inference.
#[derive(Clone, Debug)]
pub struct InferenceOptions {
    /// Upper bound on rows sampled for type detection. Inference never reads
    /// past this prefix.
    pub sample_rows: usize,

    /// When set, empty cells do not disqualify a candidate type; when unset,
    /// any empty cell forces String.
    pub nullable: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            sample_rows: 100,
            nullable: true,
        }
    }
}

/// Maps a store-native type name to the semantic enum. `Nullable(..)` and
/// `LowCardinality(..)` wrappers are unwrapped first.
pub fn semantic_from_native(native: &str) -> SemanticType {
    let inner = unwrap_native(native);

    match inner {
        "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
            SemanticType::Int64
        }
        "Float32" | "Float64" => SemanticType::Float64,
        "Bool" => SemanticType::Bool,
        "Date" | "Date32" | "DateTime" => SemanticType::DateTime,
        s if s.starts_with("DateTime64") => SemanticType::DateTime,
        "String" | "UUID" | "IPv4" | "IPv6" => SemanticType::String,
        s if s.starts_with("FixedString") || s.starts_with("Enum8") || s.starts_with("Enum16") => {
            SemanticType::String
        }
        _ => SemanticType::Unknown,
    }
}

fn unwrap_native(native: &str) -> &str {
    let mut inner = native.trim();
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(rest) = inner.strip_prefix(wrapper) {
            inner = rest.strip_suffix(')').unwrap_or(rest);
        }
    }
    // Wrappers can nest either way around.
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(rest) = inner.strip_prefix(wrapper) {
            inner = rest.strip_suffix(')').unwrap_or(rest);
        }
    }
    inner
}

/// Builds descriptors from query-result column metadata. Unknown native types
/// map to `Unknown` (treated as String for transfer) and produce a warning.
pub fn descriptors_from_meta(columns: &[ColumnMeta]) -> (Vec<ColumnDescriptor>, Vec<String>) {
    let mut warnings = Vec::new();
    let descriptors = columns
        .iter()
        .map(|meta| {
            let semantic = semantic_from_native(&meta.native_type);
            if semantic == SemanticType::Unknown {
                warnings.push(format!(
                    "column '{}' has unrecognized type '{}', treating as String",
                    meta.name, meta.native_type
                ));
            }
            ColumnDescriptor::new(meta.name.clone(), semantic)
        })
        .collect();
    (descriptors, warnings)
}

/// Per-column sample accumulator for file inference.
struct ColumnSample {
    name: String,
    all_int: bool,
    all_float: bool,
    all_bool: bool,
    saw_value: bool,
    saw_empty: bool,
}

impl ColumnSample {
    fn new(name: String) -> Self {
        Self {
            name,
            all_int: true,
            all_float: true,
            all_bool: true,
            saw_value: false,
            saw_empty: false,
        }
    }

    fn observe(&mut self, cell: &str) {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            self.saw_empty = true;
            return;
        }
        self.saw_value = true;
        if trimmed.parse::<i64>().is_err() {
            self.all_int = false;
        }
        if trimmed.parse::<f64>().is_err() {
            self.all_float = false;
        }
        if !trimmed.eq_ignore_ascii_case("true") && !trimmed.eq_ignore_ascii_case("false") {
            self.all_bool = false;
        }
    }

    /// Deterministic precedence: Int64, then Float64, then Bool, then String.
    fn resolve(&self, nullable: bool) -> SemanticType {
        if self.saw_empty && !nullable {
            return SemanticType::String;
        }
        if !self.saw_value {
            return SemanticType::String;
        }
        if self.all_int {
            SemanticType::Int64
        } else if self.all_float {
            SemanticType::Float64
        } else if self.all_bool {
            SemanticType::Bool
        } else {
            SemanticType::String
        }
    }
}

fn check_unique_names(descriptors: &[ColumnDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for d in descriptors {
        if !seen.insert(d.name.as_str()) {
            return Err(BridgeError::Validation(format!(
                "duplicate column name '{}'",
                d.name
            )));
        }
    }
    Ok(())
}

/// Infers descriptors from a delimited file: header row supplies names, a
/// bounded prefix of rows supplies types. Pure function of the sampled bytes.
pub fn infer_from_csv(content: &[u8], options: &InferenceOptions) -> Result<Vec<ColumnDescriptor>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(BridgeError::Validation("CSV file has no header row".to_string()));
    }

    let mut samples: Vec<ColumnSample> = headers.into_iter().map(ColumnSample::new).collect();

    let mut record = csv::StringRecord::new();
    let mut sampled = 0usize;
    while sampled < options.sample_rows && reader.read_record(&mut record)? {
        for (idx, sample) in samples.iter_mut().enumerate() {
            sample.observe(record.get(idx).unwrap_or(""));
        }
        sampled += 1;
    }

    let descriptors = samples
        .iter()
        .map(|s| ColumnDescriptor::new(s.name.clone(), s.resolve(options.nullable)))
        .collect::<Vec<_>>();
    check_unique_names(&descriptors)?;
    Ok(descriptors)
}

/// Infers descriptors from a JSON records array. Column order follows first
/// appearance across the sampled prefix.
pub fn infer_from_json(records: &[Value], options: &InferenceOptions) -> Result<Vec<ColumnDescriptor>> {
    let mut order: Vec<String> = Vec::new();
    let mut samples: Vec<ColumnSample> = Vec::new();

    let prefix = &records[..records.len().min(options.sample_rows)];
    for record in prefix {
        let obj = record.as_object().ok_or_else(|| {
            BridgeError::Validation("JSON file must be an array of objects".to_string())
        })?;
        for key in obj.keys() {
            if !order.iter().any(|k| k == key) {
                order.push(key.clone());
                samples.push(ColumnSample::new(key.clone()));
            }
        }
        for (idx, name) in order.iter().enumerate() {
            match obj.get(name) {
                None | Some(Value::Null) => samples[idx].observe(""),
                Some(Value::String(s)) => samples[idx].observe(s),
                Some(other) => samples[idx].observe(&other.to_string()),
            }
        }
    }

    if samples.is_empty() {
        return Err(BridgeError::Validation(
            "JSON file contains no records to infer a schema from".to_string(),
        ));
    }

    let descriptors = samples
        .iter()
        .map(|s| ColumnDescriptor::new(s.name.clone(), s.resolve(options.nullable)))
        .collect::<Vec<_>>();
    check_unique_names(&descriptors)?;
    Ok(descriptors)
}

/// Coerces a raw textual cell into the descriptor's semantic type. Values
/// that fail to parse fall back to their string form rather than erroring;
/// the inference pass only saw a prefix of the file.
pub fn coerce_cell(raw: &str, semantic_type: SemanticType, nullable: bool) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return if nullable {
            Value::Null
        } else {
            Value::String(String::new())
        };
    }

    match semantic_type {
        SemanticType::Int64 => trimmed
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
        SemanticType::Float64 => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(trimmed.to_string())),
        SemanticType::Bool => {
            if trimmed.eq_ignore_ascii_case("true") {
                Value::Bool(true)
            } else if trimmed.eq_ignore_ascii_case("false") {
                Value::Bool(false)
            } else {
                Value::String(trimmed.to_string())
            }
        }
        SemanticType::String | SemanticType::DateTime | SemanticType::Unknown => {
            Value::String(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_type_lookup() {
        assert_eq!(semantic_from_native("UInt64"), SemanticType::Int64);
        assert_eq!(semantic_from_native("Int8"), SemanticType::Int64);
        assert_eq!(semantic_from_native("Float32"), SemanticType::Float64);
        assert_eq!(semantic_from_native("Bool"), SemanticType::Bool);
        assert_eq!(semantic_from_native("DateTime"), SemanticType::DateTime);
        assert_eq!(semantic_from_native("DateTime64(3)"), SemanticType::DateTime);
        assert_eq!(semantic_from_native("String"), SemanticType::String);
        assert_eq!(semantic_from_native("FixedString(16)"), SemanticType::String);
        assert_eq!(semantic_from_native("AggregateFunction(sum, UInt64)"), SemanticType::Unknown);
    }

    #[test]
    fn test_wrapped_native_types() {
        assert_eq!(semantic_from_native("Nullable(Int64)"), SemanticType::Int64);
        assert_eq!(semantic_from_native("LowCardinality(String)"), SemanticType::String);
        assert_eq!(
            semantic_from_native("LowCardinality(Nullable(String))"),
            SemanticType::String
        );
    }

    #[test]
    fn test_unknown_native_type_warns() {
        let meta = vec![
            ColumnMeta {
                name: "id".to_string(),
                native_type: "UInt64".to_string(),
            },
            ColumnMeta {
                name: "agg".to_string(),
                native_type: "AggregateFunction(sum, UInt64)".to_string(),
            },
        ];
        let (descriptors, warnings) = descriptors_from_meta(&meta);
        assert_eq!(descriptors[1].semantic_type, SemanticType::Unknown);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("agg"));
    }

    #[test]
    fn test_csv_inference_precedence() {
        let csv = b"a,b,c,d\n1,1.5,true,x\n2,2,false,y\n";
        let descriptors = infer_from_csv(csv, &InferenceOptions::default()).unwrap();
        assert_eq!(descriptors[0].semantic_type, SemanticType::Int64);
        assert_eq!(descriptors[1].semantic_type, SemanticType::Float64);
        assert_eq!(descriptors[2].semantic_type, SemanticType::Bool);
        assert_eq!(descriptors[3].semantic_type, SemanticType::String);
    }

    #[test]
    fn test_csv_inference_is_deterministic() {
        let csv = b"id,amount,flag\n1,9.75,true\n,2.5,\n3,,false\n";
        let first = infer_from_csv(csv, &InferenceOptions::default()).unwrap();
        let second = infer_from_csv(csv, &InferenceOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_cells_respect_nullable_flag() {
        let csv = b"id\n1\n\n3\n";
        let nullable = infer_from_csv(
            csv,
            &InferenceOptions {
                nullable: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(nullable[0].semantic_type, SemanticType::Int64);

        let strict = infer_from_csv(
            csv,
            &InferenceOptions {
                nullable: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(strict[0].semantic_type, SemanticType::String);
    }

    #[test]
    fn test_inference_samples_bounded_prefix() {
        // Non-integer value past the sample window must not flip the type.
        let mut csv = String::from("id\n");
        for i in 0..5 {
            csv.push_str(&format!("{}\n", i));
        }
        csv.push_str("not_a_number\n");
        let descriptors = infer_from_csv(
            csv.as_bytes(),
            &InferenceOptions {
                sample_rows: 5,
                nullable: true,
            },
        )
        .unwrap();
        assert_eq!(descriptors[0].semantic_type, SemanticType::Int64);
    }

    #[test]
    fn test_json_inference_first_appearance_order() {
        let records: Vec<Value> = serde_json::from_str(
            r#"[{"b": 1, "a": "x"}, {"b": 2, "a": "y", "c": 1.5}]"#,
        )
        .unwrap();
        let descriptors = infer_from_json(&records, &InferenceOptions::default()).unwrap();
        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(descriptors[0].semantic_type, SemanticType::Int64);
        assert_eq!(descriptors[2].semantic_type, SemanticType::Float64);
    }

    #[test]
    fn test_duplicate_header_rejected() {
        let csv = b"id,id\n1,2\n";
        let err = infer_from_csv(csv, &InferenceOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_coerce_cell() {
        assert_eq!(coerce_cell("42", SemanticType::Int64, true), Value::from(42));
        assert_eq!(coerce_cell(" true ", SemanticType::Bool, true), Value::Bool(true));
        assert_eq!(coerce_cell("", SemanticType::Int64, true), Value::Null);
        assert_eq!(
            coerce_cell("", SemanticType::Int64, false),
            Value::String(String::new())
        );
        // A value the sampled prefix never saw falls back to text.
        assert_eq!(
            coerce_cell("n/a", SemanticType::Int64, true),
            Value::String("n/a".to_string())
        );
    }
}
