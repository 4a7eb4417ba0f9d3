use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::warn;

/// A point in level space, as authored in the lot documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Exact comparison: sentinel placements are authored as literal zeros.
    pub fn is_origin(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Why a single batch entry was rejected before grouping.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EntryError {
    #[error("entry is not a placement object: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("item identifier {0} does not fit 0-65535")]
    IdentifierOutOfRange(String),

    #[error("class name is empty")]
    EmptyClassName,

    #[error("owning document {0:?} is not a bare .arc file name")]
    InvalidDocumentKey(String),
}

/// Owning document of a request: the `.arc` container file name.
///
/// Equality and hashing use the ASCII case-folded name, so `S101.arc` and
/// `s101.arc` name the same container. The spelling is kept as given.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentKey {
    name: String,
    #[serde(skip)]
    normalised: String,
}

impl DocumentKey {
    pub fn parse(raw: &str) -> Result<Self, EntryError> {
        let name = raw.trim();
        let invalid = || EntryError::InvalidDocumentKey(raw.to_string());

        if name.contains(['/', '\\']) || name.contains("..") {
            return Err(invalid());
        }

        let lower = name.to_ascii_lowercase();
        match lower.strip_suffix(".arc") {
            Some(stem) if !stem.is_empty() => Ok(Self {
                name: name.to_string(),
                normalised: lower,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.name
    }

    /// Container name without the `.arc` extension, as spelled in the batch.
    pub fn stem(&self) -> &str {
        &self.name[..self.name.len() - ".arc".len()]
    }

    pub fn normalised(&self) -> &str {
        &self.normalised
    }
}

impl PartialEq for DocumentKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalised == other.normalised
    }
}

impl Eq for DocumentKey {}

impl Hash for DocumentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalised.hash(state);
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One symbolic placement rewrite: put `new_identifier` into the placement
/// of `class_name` nearest `target` inside `document`.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    ordinal: usize,
    document: DocumentKey,
    class_name: String,
    target: Position,
    new_identifier: u16,
}

impl PlacementRequest {
    pub fn new(
        ordinal: usize,
        document: DocumentKey,
        class_name: impl Into<String>,
        target: Position,
        new_identifier: u16,
    ) -> Result<Self, EntryError> {
        let class_name = class_name.into();
        if class_name.trim().is_empty() {
            return Err(EntryError::EmptyClassName);
        }
        if !target.is_finite() {
            return Err(EntryError::InvalidNumber {
                field: "xcord/ycord/zcord",
                value: target.to_string(),
            });
        }

        Ok(Self {
            ordinal,
            document,
            class_name,
            target,
            new_identifier,
        })
    }

    /// Position of the entry in the batch file.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn document(&self) -> &DocumentKey {
        &self.document
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn target(&self) -> Position {
        self.target
    }

    pub fn new_identifier(&self) -> u16 {
        self.new_identifier
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    fn as_f64(&self, field: &'static str) -> Result<f64, EntryError> {
        let parsed = match self {
            Scalar::Number(n) => n.as_f64(),
            Scalar::Text(s) => s.trim().parse::<f64>().ok(),
        };

        match parsed {
            Some(v) if v.is_finite() => Ok(v),
            _ => Err(EntryError::InvalidNumber {
                field,
                value: self.to_string(),
            }),
        }
    }

    fn as_identifier(&self) -> Result<u16, EntryError> {
        let wide = match self {
            Scalar::Number(n) => n.as_i64(),
            Scalar::Text(s) => s.trim().parse::<i64>().ok(),
        };

        match wide {
            Some(v) => u16::try_from(v).map_err(|_| EntryError::IdentifierOutOfRange(v.to_string())),
            None => Err(EntryError::InvalidNumber {
                field: "item_xml_id",
                value: self.to_string(),
            }),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Batch file entry as written by the multiworld generator.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    item_xml_id: Option<Scalar>,
    vanilla_item: Option<String>,
    arc_file: Option<String>,
    xcord: Option<Scalar>,
    ycord: Option<Scalar>,
    zcord: Option<Scalar>,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, EntryError> {
    value.ok_or(EntryError::MissingField(field))
}

impl BatchEntry {
    fn into_request(self, ordinal: usize) -> Result<PlacementRequest, EntryError> {
        let item_xml_id = required(self.item_xml_id, "item_xml_id")?;
        let vanilla_item = required(self.vanilla_item, "vanilla_item")?;
        let arc_file = required(self.arc_file, "arc_file")?;
        let xcord = required(self.xcord, "xcord")?;
        let ycord = required(self.ycord, "ycord")?;
        let zcord = required(self.zcord, "zcord")?;

        let target = Position::new(
            xcord.as_f64("xcord")?,
            ycord.as_f64("ycord")?,
            zcord.as_f64("zcord")?,
        );

        PlacementRequest::new(
            ordinal,
            DocumentKey::parse(&arc_file)?,
            vanilla_item,
            target,
            item_xml_id.as_identifier()?,
        )
    }
}

/// A batch entry that never became a request.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidEntry {
    pub ordinal: usize,
    pub reason: EntryError,
}

/// All requests targeting one container, in batch order.
#[derive(Debug, Clone)]
pub struct DocumentGroup {
    pub key: DocumentKey,
    pub requests: Vec<PlacementRequest>,
}

/// The validated batch, grouped by owning document in first-seen order.
#[derive(Debug, Default)]
pub struct RequestSet {
    groups: IndexMap<String, DocumentGroup>,
    invalid: Vec<InvalidEntry>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a JSON array of batch entries. Only a top-level shape error
    /// fails; each bad entry is recorded and skipped.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(text)?;
        let mut set = Self::new();

        for (ordinal, value) in entries.into_iter().enumerate() {
            let decoded = serde_json::from_value::<BatchEntry>(value)
                .map_err(|e| EntryError::Malformed(e.to_string()))
                .and_then(|entry| entry.into_request(ordinal));

            match decoded {
                Ok(request) => set.push(request),
                Err(reason) => set.reject(ordinal, reason),
            }
        }

        Ok(set)
    }

    pub fn push(&mut self, request: PlacementRequest) {
        let normalised = request.document().normalised().to_string();
        self.groups
            .entry(normalised)
            .or_insert_with(|| DocumentGroup {
                key: request.document().clone(),
                requests: Vec::new(),
            })
            .requests
            .push(request);
    }

    pub fn reject(&mut self, ordinal: usize, reason: EntryError) {
        warn!(entry = ordinal, %reason, "Skipping batch entry");
        self.invalid.push(InvalidEntry { ordinal, reason });
    }

    pub fn groups(&self) -> impl Iterator<Item = &DocumentGroup> {
        self.groups.values()
    }

    pub fn invalid(&self) -> &[InvalidEntry] {
        &self.invalid
    }

    pub fn request_count(&self) -> usize {
        self.groups.values().map(|g| g.requests.len()).sum()
    }

    pub fn document_count(&self) -> usize {
        self.groups.len()
    }

    pub fn into_parts(self) -> (Vec<DocumentGroup>, Vec<InvalidEntry>) {
        (self.groups.into_values().collect(), self.invalid)
    }
}

impl FromIterator<PlacementRequest> for RequestSet {
    fn from_iter<I: IntoIterator<Item = PlacementRequest>>(iter: I) -> Self {
        let mut set = Self::new();
        for request in iter {
            set.push(request);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(1.0, 2.0, 2.0);
        assert_eq!(Position::ORIGIN.distance(&a), 3.0);
        assert!(Position::new(-0.0, 0.0, 0.0).is_origin());
        assert!(!Position::new(0.0, 0.001, 0.0).is_origin());
    }

    #[test]
    fn document_key_folds_case_and_keeps_spelling() {
        let a = DocumentKey::parse("S101.arc").unwrap();
        let b = DocumentKey::parse(" s101.ARC ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.file_name(), "S101.arc");
        assert_eq!(a.stem(), "S101");
        assert_eq!(b.normalised(), "s101.arc");
    }

    #[test]
    fn document_key_rejects_paths_and_other_files() {
        for raw in ["../s101.arc", "stage/s101.arc", "s101.xml", ".arc", ""] {
            assert!(DocumentKey::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn decodes_strings_and_numbers() {
        let text = r#"[
            {"item_xml_id": 769, "vanilla_item": "uWp13", "arc_file": "s101.arc",
             "xcord": "12.5", "ycord": "0", "zcord": "-3.25"},
            {"item_xml_id": "1025", "vanilla_item": "uIt02", "arc_file": "s203.arc",
             "xcord": 1, "ycord": 2.5, "zcord": 3}
        ]"#;

        let set = RequestSet::from_json(text).unwrap();
        assert!(set.invalid().is_empty());
        assert_eq!(set.request_count(), 2);

        let (groups, _) = set.into_parts();
        let first = &groups[0].requests[0];
        assert_eq!(first.new_identifier(), 769);
        assert_eq!(first.target(), Position::new(12.5, 0.0, -3.25));
        assert_eq!(groups[1].requests[0].new_identifier(), 1025);
    }

    #[test]
    fn bad_entries_are_skipped_individually() {
        let text = r#"[
            {"item_xml_id": 1, "vanilla_item": "uWp13", "arc_file": "s101.arc",
             "xcord": "0", "ycord": "0"},
            {"item_xml_id": 70000, "vanilla_item": "uWp13", "arc_file": "s101.arc",
             "xcord": "0", "ycord": "0", "zcord": "0"},
            {"item_xml_id": 2, "vanilla_item": "uWp13", "arc_file": "s101.arc",
             "xcord": "east", "ycord": "0", "zcord": "0"},
            {"item_xml_id": 3, "vanilla_item": "", "arc_file": "s101.arc",
             "xcord": "0", "ycord": "0", "zcord": "0"},
            "not an entry",
            {"item_xml_id": 4, "vanilla_item": "uWp13", "arc_file": "s101.arc",
             "xcord": "0", "ycord": "0", "zcord": "0"}
        ]"#;

        let set = RequestSet::from_json(text).unwrap();
        assert_eq!(set.request_count(), 1);

        let reasons: Vec<_> = set.invalid().iter().map(|e| (e.ordinal, e.reason.clone())).collect();
        assert_eq!(reasons[0], (0, EntryError::MissingField("zcord")));
        assert_eq!(reasons[1], (1, EntryError::IdentifierOutOfRange("70000".to_string())));
        assert!(matches!(reasons[2], (2, EntryError::InvalidNumber { field: "xcord", .. })));
        assert_eq!(reasons[3], (3, EntryError::EmptyClassName));
        assert!(matches!(reasons[4], (4, EntryError::Malformed(_))));
    }

    #[test]
    fn null_field_counts_as_missing() {
        let text = r#"[{"item_xml_id": 1, "vanilla_item": null, "arc_file": "s101.arc",
                         "xcord": "0", "ycord": "0", "zcord": "0"}]"#;
        let set = RequestSet::from_json(text).unwrap();
        assert_eq!(set.invalid()[0].reason, EntryError::MissingField("vanilla_item"));
    }

    #[test]
    fn groups_by_document_in_first_seen_order() {
        let s101 = DocumentKey::parse("s101.arc").unwrap();
        let s203 = DocumentKey::parse("s203.arc").unwrap();
        let upper = DocumentKey::parse("S101.ARC").unwrap();

        let set: RequestSet = [
            PlacementRequest::new(0, s203, "a", Position::ORIGIN, 1).unwrap(),
            PlacementRequest::new(1, s101, "b", Position::ORIGIN, 2).unwrap(),
            PlacementRequest::new(2, upper, "c", Position::ORIGIN, 3).unwrap(),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.document_count(), 2);
        let keys: Vec<_> = set.groups().map(|g| g.key.file_name().to_string()).collect();
        assert_eq!(keys, vec!["s203.arc", "s101.arc"]);

        let s101_group = set.groups().nth(1).unwrap();
        let ordinals: Vec<_> = s101_group.requests.iter().map(|r| r.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2]);
    }
}
