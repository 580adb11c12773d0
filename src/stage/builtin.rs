//! Built-in stages available from configuration.
//!
//! These are deliberately small and content-pure: the outcome for a record
//! depends only on the record, never on which worker runs it.

use super::{Shape, Stage, StageOutcome};
use crate::config::Verbosity;
use crate::record::{FieldDef, ObservationValue, Record, ValueKind};

/// Name and verbosity shared by every built-in stage.
#[derive(Debug, Clone)]
struct Base {
    name: String,
    verbosity: Verbosity,
}

impl Base {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            verbosity: Verbosity::default(),
        }
    }
}

macro_rules! stage_common {
    () => {
        fn name(&self) -> &str {
            &self.base.name
        }

        fn verbosity(&self) -> Verbosity {
            self.base.verbosity
        }

        fn set_verbosity(&mut self, level: Verbosity) {
            self.base.verbosity = level;
        }

        fn clone_box(&self) -> Box<dyn Stage> {
            Box::new(self.clone())
        }
    };
}

/// Forwards every record untouched.
#[derive(Debug, Clone)]
pub struct Passthrough {
    base: Base,
}

impl Passthrough {
    pub fn new(name: &str) -> Self {
        Self { base: Base::new(name) }
    }
}

impl Stage for Passthrough {
    stage_common!();

    fn kind(&self) -> &'static str {
        "passthrough"
    }

    fn transform(&mut self, record: Record) -> StageOutcome {
        StageOutcome::Keep(record)
    }
}

/// Writes the payload length (bytes) to an observable named after the stage.
#[derive(Debug, Clone)]
pub struct PayloadLength {
    base: Base,
}

impl PayloadLength {
    pub fn new(name: &str) -> Self {
        Self { base: Base::new(name) }
    }
}

impl Stage for PayloadLength {
    stage_common!();

    fn kind(&self) -> &'static str {
        "payload_length"
    }

    fn observables(&self) -> Vec<FieldDef> {
        vec![FieldDef::new(self.base.name.clone(), ValueKind::Int)]
    }

    fn transform(&mut self, mut record: Record) -> StageOutcome {
        let len = record.payload.len() as i64;
        record.observations.set(self.base.name.clone(), len);
        StageOutcome::Keep(record)
    }
}

/// FNV-1a checksum of the payload, as a hex string observable.
#[derive(Debug, Clone)]
pub struct PayloadChecksum {
    base: Base,
}

impl PayloadChecksum {
    pub fn new(name: &str) -> Self {
        Self { base: Base::new(name) }
    }

    fn fnv1a(bytes: &[u8]) -> u64 {
        bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ *b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

impl Stage for PayloadChecksum {
    stage_common!();

    fn kind(&self) -> &'static str {
        "payload_checksum"
    }

    fn observables(&self) -> Vec<FieldDef> {
        vec![FieldDef::new(self.base.name.clone(), ValueKind::Text)]
    }

    fn transform(&mut self, mut record: Record) -> StageOutcome {
        let sum = format!("{:016x}", Self::fnv1a(&record.payload));
        record.observations.set(self.base.name.clone(), sum);
        StageOutcome::Keep(record)
    }
}

/// Attaches a constant observable.
#[derive(Debug, Clone)]
pub struct Tag {
    base: Base,
    field: String,
    value: ObservationValue,
}

impl Tag {
    pub fn new(name: &str, field: &str, value: impl Into<ObservationValue>) -> Self {
        Self {
            base: Base::new(name),
            field: field.to_string(),
            value: value.into(),
        }
    }
}

impl Stage for Tag {
    stage_common!();

    fn kind(&self) -> &'static str {
        "tag"
    }

    fn observables(&self) -> Vec<FieldDef> {
        vec![FieldDef::new(self.field.clone(), self.value.kind())]
    }

    fn transform(&mut self, mut record: Record) -> StageOutcome {
        record.observations.set(self.field.clone(), self.value.clone());
        StageOutcome::Keep(record)
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "field": self.field, "value": self.value })
    }
}

/// Drops records whose numeric observable falls outside `[min, max]`.
///
/// Records without the observable are kept and counted; the count is
/// reported as a warning when the stage finishes.
#[derive(Debug, Clone)]
pub struct RangeCut {
    base: Base,
    field: String,
    min: Option<f64>,
    max: Option<f64>,
    missing: u64,
}

impl RangeCut {
    pub fn new(name: &str, field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            base: Base::new(name),
            field: field.to_string(),
            min,
            max,
            missing: 0,
        }
    }
}

impl Stage for RangeCut {
    stage_common!();

    fn kind(&self) -> &'static str {
        "range_cut"
    }

    fn transform(&mut self, record: Record) -> StageOutcome {
        let Some(value) = record.observations.get(&self.field).and_then(|v| v.as_f64()) else {
            self.missing += 1;
            return StageOutcome::Keep(record);
        };
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            StageOutcome::Drop
        } else {
            StageOutcome::Keep(record)
        }
    }

    fn finish(&mut self) -> Vec<String> {
        if self.missing > 0 {
            vec![format!(
                "{} records had no numeric '{}' and were not cut",
                self.missing, self.field
            )]
        } else {
            Vec::new()
        }
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "field": self.field, "min": self.min, "max": self.max })
    }
}

/// Drops every n-th record by source id (ids `n-1`, `2n-1`, ...).
#[derive(Debug, Clone)]
pub struct EveryNthCut {
    base: Base,
    every: u64,
}

impl EveryNthCut {
    pub fn new(name: &str, every: u64) -> Self {
        Self {
            base: Base::new(name),
            every: every.max(1),
        }
    }
}

impl Stage for EveryNthCut {
    stage_common!();

    fn kind(&self) -> &'static str {
        "every_nth_cut"
    }

    fn transform(&mut self, record: Record) -> StageOutcome {
        if (record.id + 1) % self.every == 0 {
            StageOutcome::Drop
        } else {
            StageOutcome::Keep(record)
        }
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "every": self.every })
    }
}

/// Extracts a value from a JSON payload by JSON pointer.
///
/// The declared kind is what the schema expects; the stage writes whatever
/// type it actually finds, which shows up as an anomaly when observation
/// validation is on. Payloads that are not JSON, or lack the pointer, are
/// dropped when `required` is set and kept untouched otherwise.
#[derive(Debug, Clone)]
pub struct JsonField {
    base: Base,
    pointer: String,
    kind: ValueKind,
    required: bool,
}

impl JsonField {
    pub fn new(name: &str, pointer: &str, kind: ValueKind, required: bool) -> Self {
        Self {
            base: Base::new(name),
            pointer: pointer.to_string(),
            kind,
            required,
        }
    }

    fn extract(&self, payload: &[u8]) -> Option<ObservationValue> {
        let doc: serde_json::Value = serde_json::from_slice(payload).ok()?;
        match doc.pointer(&self.pointer)? {
            serde_json::Value::Bool(b) => Some(ObservationValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(ObservationValue::Int(i)),
                None => n.as_f64().map(ObservationValue::Float),
            },
            serde_json::Value::String(s) => Some(ObservationValue::Text(s.clone())),
            other => Some(ObservationValue::Text(other.to_string())),
        }
    }
}

impl Stage for JsonField {
    stage_common!();

    fn kind(&self) -> &'static str {
        "json_field"
    }

    fn input_shape(&self) -> Shape {
        Shape::named("json")
    }

    fn output_shape(&self) -> Shape {
        Shape::named("json")
    }

    fn observables(&self) -> Vec<FieldDef> {
        vec![FieldDef::new(self.base.name.clone(), self.kind)]
    }

    fn transform(&mut self, mut record: Record) -> StageOutcome {
        match self.extract(&record.payload) {
            Some(value) => {
                record.observations.set(self.base.name.clone(), value);
                StageOutcome::Keep(record)
            }
            None if self.required => StageOutcome::Drop,
            None => StageOutcome::Keep(record),
        }
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "pointer": self.pointer,
            "kind": self.kind,
            "required": self.required,
        })
    }
}

/// Logs every record it sees. Forces a single worker.
#[derive(Debug, Clone)]
pub struct Inspect {
    base: Base,
    seen: u64,
}

impl Inspect {
    pub fn new(name: &str) -> Self {
        Self {
            base: Base::new(name),
            seen: 0,
        }
    }
}

impl Stage for Inspect {
    stage_common!();

    fn kind(&self) -> &'static str {
        "inspect"
    }

    fn single_worker_only(&self) -> bool {
        true
    }

    fn transform(&mut self, record: Record) -> StageOutcome {
        self.seen += 1;
        if self.base.verbosity >= Verbosity::Info {
            tracing::info!("[{}] {}", self.base.name, record);
        } else {
            tracing::debug!("[{}] {}", self.base.name, record);
        }
        StageOutcome::Keep(record)
    }

    fn finish(&mut self) -> Vec<String> {
        tracing::info!("[{}] inspected {} records", self.base.name, self.seen);
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_length_and_checksum() {
        let mut len = PayloadLength::new("len");
        let mut sum = PayloadChecksum::new("sum");

        let StageOutcome::Keep(record) = len.transform(Record::new(0, b"abcd".to_vec())) else {
            panic!("length stage must keep");
        };
        let StageOutcome::Keep(record) = sum.transform(record) else {
            panic!("checksum stage must keep");
        };
        assert_eq!(record.observations.get("len"), Some(&ObservationValue::Int(4)));
        let expected = format!("{:016x}", PayloadChecksum::fnv1a(b"abcd"));
        assert_eq!(
            record.observations.get("sum"),
            Some(&ObservationValue::Text(expected))
        );
    }

    #[test]
    fn test_fnv1a_known_value() {
        assert_eq!(PayloadChecksum::fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(PayloadChecksum::fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_range_cut_bounds() {
        let mut cut = RangeCut::new("cut", "len", Some(2.0), Some(4.0));
        let mut record = Record::new(0, Vec::new());

        record.observations.set("len", 3i64);
        assert!(matches!(cut.transform(record.clone()), StageOutcome::Keep(_)));

        record.observations.set("len", 5i64);
        assert!(matches!(cut.transform(record.clone()), StageOutcome::Drop));

        record.observations.set("len", 1.5);
        assert!(matches!(cut.transform(record), StageOutcome::Drop));
    }

    #[test]
    fn test_range_cut_reports_missing() {
        let mut cut = RangeCut::new("cut", "len", Some(0.0), None);
        assert!(matches!(cut.transform(Record::new(0, Vec::new())), StageOutcome::Keep(_)));
        let warnings = cut.finish();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("1 records"));
    }

    #[test]
    fn test_every_nth_cut_is_by_id() {
        let mut cut = EveryNthCut::new("nth", 3);
        let dropped: Vec<u64> = (0..9)
            .filter(|id| matches!(cut.transform(Record::new(*id, Vec::new())), StageOutcome::Drop))
            .collect();
        assert_eq!(dropped, vec![2, 5, 8]);
    }

    #[test]
    fn test_json_field() {
        let mut field = JsonField::new("energy", "/hit/energy", ValueKind::Float, true);

        let StageOutcome::Keep(record) =
            field.transform(Record::new(0, br#"{"hit": {"energy": 1.5}}"#.to_vec()))
        else {
            panic!("present field must keep");
        };
        assert_eq!(record.observations.get("energy"), Some(&ObservationValue::Float(1.5)));

        assert!(matches!(
            field.transform(Record::new(1, br#"{"hit": {}}"#.to_vec())),
            StageOutcome::Drop
        ));
        assert!(matches!(
            field.transform(Record::new(2, b"not json".to_vec())),
            StageOutcome::Drop
        ));
    }

    #[test]
    fn test_inspect_is_single_worker() {
        let inspect = Inspect::new("peek");
        assert!(inspect.single_worker_only());
        assert!(!Passthrough::new("p").single_worker_only());
    }
}
