//! Records, observation values and the frozen observation schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One unit of work read from a source.
///
/// The payload is opaque to the pipeline. Identity (`id`, `sub_id`) comes from
/// the source and is unrelated to the sequence number assigned at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<u64>,
    #[serde(default, with = "payload_repr", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "ObservationRow::is_empty")]
    pub observations: ObservationRow,
}

impl Record {
    pub fn new(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            sub_id: None,
            payload: payload.into(),
            observations: ObservationRow::default(),
        }
    }

    pub fn with_sub_id(mut self, sub_id: u64) -> Self {
        self.sub_id = Some(sub_id);
        self
    }

    /// Payload as UTF-8 text, lossy.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_id {
            Some(sub) => write!(f, "Record {}.{}", self.id, sub)?,
            None => write!(f, "Record {}", self.id)?,
        }
        write!(f, " ({} bytes)", self.payload.len())?;
        for (name, value) in self.observations.iter() {
            write!(f, "\n  {} = {}", name, value)?;
        }
        Ok(())
    }
}

/// Payloads serialize as a string when they are valid UTF-8, as a byte array otherwise.
mod payload_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(payload) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(payload),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

/// Type tag of an observation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// A typed value a stage attaches to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ObservationValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ObservationValue::Int(_) => ValueKind::Int,
            ObservationValue::Float(_) => ValueKind::Float,
            ObservationValue::Bool(_) => ValueKind::Bool,
            ObservationValue::Text(_) => ValueKind::Text,
        }
    }

    /// Numeric view used by cut stages. Text and bool have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ObservationValue::Int(v) => Some(*v as f64),
            ObservationValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ObservationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationValue::Int(v) => write!(f, "{}", v),
            ObservationValue::Float(v) => write!(f, "{}", v),
            ObservationValue::Bool(v) => write!(f, "{}", v),
            ObservationValue::Text(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<i64> for ObservationValue {
    fn from(v: i64) -> Self {
        ObservationValue::Int(v)
    }
}

impl From<f64> for ObservationValue {
    fn from(v: f64) -> Self {
        ObservationValue::Float(v)
    }
}

impl From<bool> for ObservationValue {
    fn from(v: bool) -> Self {
        ObservationValue::Bool(v)
    }
}

impl From<String> for ObservationValue {
    fn from(v: String) -> Self {
        ObservationValue::Text(v)
    }
}

impl From<&str> for ObservationValue {
    fn from(v: &str) -> Self {
        ObservationValue::Text(v.to_string())
    }
}

/// Named observation fields accumulated while a record moves through the chain.
///
/// Ordered by field name so the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationRow(BTreeMap<String, ObservationValue>);

impl ObservationRow {
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<ObservationValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&ObservationValue> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ObservationValue)> {
        self.0.iter()
    }
}

/// Declaration of one observable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: ValueKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Mismatch between a row and the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    UnknownField(String),
    WrongKind {
        field: String,
        expected: ValueKind,
        found: ValueKind,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::UnknownField(name) => {
                write!(f, "observable '{}' is not declared by any stage", name)
            }
            SchemaViolation::WrongKind {
                field,
                expected,
                found,
            } => write!(
                f,
                "observable '{}' declared {} but stage produced {}",
                field, expected, found
            ),
        }
    }
}

/// Field name to kind mapping agreed at setup and frozen before processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationSchema {
    fields: BTreeMap<String, ValueKind>,
}

impl ObservationSchema {
    /// Build from declarations; a field declared twice must keep its kind.
    pub fn from_fields<'a>(
        fields: impl IntoIterator<Item = &'a FieldDef>,
    ) -> crate::Result<Self> {
        let mut map = BTreeMap::<String, ValueKind>::new();
        for def in fields {
            match map.get(&def.name) {
                Some(existing) if *existing != def.kind => {
                    return Err(crate::PipelineError::SchemaConflict {
                        field: def.name.clone(),
                        first: existing.to_string(),
                        second: def.kind.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    map.insert(def.name.clone(), def.kind);
                }
            }
        }
        Ok(Self { fields: map })
    }

    pub fn kind_of(&self, field: &str) -> Option<ValueKind> {
        self.fields.get(field).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check a row against the schema. Int values are accepted for float fields.
    pub fn check(&self, row: &ObservationRow) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        for (name, value) in row.iter() {
            match self.fields.get(name) {
                None => violations.push(SchemaViolation::UnknownField(name.clone())),
                Some(expected) => {
                    let found = value.kind();
                    let widened = *expected == ValueKind::Float && found == ValueKind::Int;
                    if found != *expected && !widened {
                        violations.push(SchemaViolation::WrongKind {
                            field: name.clone(),
                            expected: *expected,
                            found,
                        });
                    }
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rejects_conflicting_kinds() {
        let defs = vec![
            FieldDef::new("energy", ValueKind::Float),
            FieldDef::new("energy", ValueKind::Text),
        ];
        let err = ObservationSchema::from_fields(&defs).unwrap_err();
        assert!(matches!(err, crate::PipelineError::SchemaConflict { .. }));
    }

    #[test]
    fn test_schema_accepts_repeated_declaration() {
        let defs = vec![
            FieldDef::new("len", ValueKind::Int),
            FieldDef::new("len", ValueKind::Int),
            FieldDef::new("tag", ValueKind::Text),
        ];
        let schema = ObservationSchema::from_fields(&defs).unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.kind_of("len"), Some(ValueKind::Int));
    }

    #[test]
    fn test_schema_check() {
        let defs = vec![
            FieldDef::new("len", ValueKind::Int),
            FieldDef::new("ratio", ValueKind::Float),
        ];
        let schema = ObservationSchema::from_fields(&defs).unwrap();

        let mut row = ObservationRow::default();
        row.set("len", 4i64);
        row.set("ratio", 2i64);
        assert!(schema.check(&row).is_empty());

        row.set("len", "four");
        row.set("extra", true);
        let violations = schema.check(&row);
        assert_eq!(violations.len(), 2);
        assert!(violations.contains(&SchemaViolation::UnknownField("extra".into())));
    }

    #[test]
    fn test_record_display() {
        let mut record = Record::new(7, b"abc".to_vec()).with_sub_id(2);
        record.observations.set("len", 3i64);
        let text = record.to_string();
        assert!(text.starts_with("Record 7.2 (3 bytes)"));
        assert!(text.contains("len = 3"));
    }

    #[test]
    fn test_payload_text_and_binary() {
        let text = Record::new(1, b"hello".to_vec());
        let json = serde_json::to_string(&text).unwrap();
        assert_eq!(json, r#"{"id":1,"payload":"hello"}"#);

        let binary = Record::new(2, vec![0xff, 0x00]);
        let json = serde_json::to_string(&binary).unwrap();
        assert!(json.contains("[255,0]"));
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, vec![0xff, 0x00]);
    }

    #[test]
    fn test_row_serializes_sorted() {
        let mut row = ObservationRow::default();
        row.set("b", 1i64);
        row.set("a", 2.5);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"a":2.5,"b":1}"#);
    }
}
