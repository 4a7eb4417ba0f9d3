use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::document::{NodeId, ParseError, XmlDocument};
use crate::request::Position;

/// An element addressed as `<tag name="field" .../>`.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef {
    pub tag: &'static str,
    pub name: &'static str,
}

/// Element and attribute names of the placement records in a lot document.
#[derive(Debug, Clone, Copy)]
pub struct IndexSchema {
    pub record_tag: &'static str,
    pub record_type: &'static str,
    pub class_name: FieldRef,
    pub info: FieldRef,
    pub position: FieldRef,
    pub item_set: FieldRef,
    pub category_flag: FieldRef,
    pub identifier: FieldRef,
}

impl IndexSchema {
    /// `*_item.lot.xml` layout.
    pub const ITEM_LOT: IndexSchema = IndexSchema {
        record_tag: "classref",
        record_type: "1637199632",
        class_name: FieldRef {
            tag: "string",
            name: "mUnitClass",
        },
        info: FieldRef {
            tag: "classref",
            name: "mpInfo",
        },
        position: FieldRef {
            tag: "vector3",
            name: "mPosition",
        },
        item_set: FieldRef {
            tag: "class",
            name: "mItemSet",
        },
        category_flag: FieldRef {
            tag: "u8",
            name: "ItemType",
        },
        identifier: FieldRef {
            tag: "u16",
            name: "ItemId",
        },
    };
}

impl Default for IndexSchema {
    fn default() -> Self {
        Self::ITEM_LOT
    }
}

/// Index of a record inside its [`DocumentIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(usize);

#[derive(Debug, Clone)]
pub struct PlacementRecord {
    pub id: RecordId,
    pub class_name: String,
    pub position: Position,
    pub category_flag: Option<u8>,
    pub current_identifier: Option<u16>,
    pub(crate) node: NodeId,
    pub(crate) identifier_node: Option<NodeId>,
}

impl PlacementRecord {
    /// Handle of the record element in the owning document.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingClassName,
    MissingInfo,
    MissingPosition,
    InvalidCoordinate,
}

/// A record element that could not be indexed.
#[derive(Debug, Clone)]
pub struct SkippedRecord {
    pub offset: usize,
    pub class_name: Option<String>,
    pub reason: SkipReason,
}

/// Every placement record of one lot document, grouped by class name.
///
/// Owns the parsed document; record handles stay valid until the index is
/// dropped.
#[derive(Debug)]
pub struct DocumentIndex {
    path: Option<PathBuf>,
    pub(crate) document: XmlDocument,
    records: Vec<PlacementRecord>,
    by_class: HashMap<String, Vec<RecordId>>,
    skipped: Vec<SkippedRecord>,
}

impl DocumentIndex {
    pub fn build(content: &[u8]) -> Result<Self, ParseError> {
        Self::build_with_schema(None, content, &IndexSchema::ITEM_LOT)
    }

    /// Like [`DocumentIndex::build`], remembering where `content` was read from.
    pub fn build_at(path: &Path, content: &[u8]) -> Result<Self, ParseError> {
        Self::build_with_schema(Some(path), content, &IndexSchema::ITEM_LOT)
    }

    pub fn build_with_schema(
        path: Option<&Path>,
        content: &[u8],
        schema: &IndexSchema,
    ) -> Result<Self, ParseError> {
        let document = XmlDocument::parse(content)?;
        let mut index = DocumentIndex {
            path: path.map(Path::to_path_buf),
            document,
            records: Vec::new(),
            by_class: HashMap::new(),
            skipped: Vec::new(),
        };

        let record_nodes: Vec<NodeId> = index
            .document
            .nodes()
            .filter(|&id| {
                index.document.element(id).name == schema.record_tag
                    && index.document.attribute(id, "type") == Some(schema.record_type)
            })
            .collect();

        let source = index.display_path();
        for node in record_nodes {
            match read_record(&index.document, node, schema, &source) {
                Ok(mut record) => {
                    record.id = RecordId(index.records.len());
                    index
                        .by_class
                        .entry(record.class_name.clone())
                        .or_default()
                        .push(record.id);
                    index.records.push(record);
                }
                Err(skipped) => {
                    warn!(
                        document = %source,
                        offset = skipped.offset,
                        class = skipped.class_name.as_deref().unwrap_or("?"),
                        reason = ?skipped.reason,
                        "Placement record not indexed"
                    );
                    index.skipped.push(skipped);
                }
            }
        }

        debug!(
            document = %source,
            records = index.records.len(),
            classes = index.by_class.len(),
            skipped = index.skipped.len(),
            "Built document index"
        );
        Ok(index)
    }

    /// Records of `class_name` in document order.
    pub fn candidates<'a>(&'a self, class_name: &str) -> impl Iterator<Item = &'a PlacementRecord> + 'a {
        self.by_class
            .get(class_name)
            .into_iter()
            .flatten()
            .map(move |id| &self.records[id.0])
    }

    pub fn record(&self, id: RecordId) -> &PlacementRecord {
        &self.records[id.0]
    }

    pub(crate) fn record_mut(&mut self, id: RecordId) -> &mut PlacementRecord {
        &mut self.records[id.0]
    }

    pub fn records(&self) -> &[PlacementRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn class_count(&self) -> usize {
        self.by_class.len()
    }

    pub fn skipped(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    pub fn document(&self) -> &XmlDocument {
        &self.document
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn display_path(&self) -> String {
        self.path
            .as_deref()
            .map_or_else(|| "<memory>".to_string(), |p| p.display().to_string())
    }
}

fn read_record(
    doc: &XmlDocument,
    node: NodeId,
    schema: &IndexSchema,
    source: &str,
) -> Result<PlacementRecord, SkippedRecord> {
    let offset = doc.element(node).offset;
    let class_name = doc
        .child(node, schema.class_name.tag, schema.class_name.name)
        .and_then(|c| doc.attribute(c, "value"))
        .map(str::to_string);

    let skip = |reason| SkippedRecord {
        offset,
        class_name: class_name.clone(),
        reason,
    };

    let Some(name) = class_name.clone() else {
        return Err(skip(SkipReason::MissingClassName));
    };
    let info = doc
        .child(node, schema.info.tag, schema.info.name)
        .ok_or_else(|| skip(SkipReason::MissingInfo))?;
    let position_node = doc
        .child(info, schema.position.tag, schema.position.name)
        .ok_or_else(|| skip(SkipReason::MissingPosition))?;

    let coord = |axis: &str| -> Option<f64> {
        let raw = doc.attribute(position_node, axis).unwrap_or("0");
        raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    };
    let position = match (coord("x"), coord("y"), coord("z")) {
        (Some(x), Some(y), Some(z)) => Position::new(x, y, z),
        _ => return Err(skip(SkipReason::InvalidCoordinate)),
    };

    let item_set = doc.descendant(info, schema.item_set.tag, schema.item_set.name);

    let category_flag = item_set
        .and_then(|set| doc.child(set, schema.category_flag.tag, schema.category_flag.name))
        .and_then(|flag| {
            let raw = doc.attribute(flag, "value").unwrap_or("0");
            let parsed = raw.trim().parse::<u8>().ok();
            if parsed.is_none() {
                warn!(document = %source, offset, class = %name, value = raw, "Unreadable category flag");
            }
            parsed
        });

    let identifier_node =
        item_set.and_then(|set| doc.child(set, schema.identifier.tag, schema.identifier.name));
    let current_identifier = identifier_node
        .and_then(|id| doc.attribute(id, "value"))
        .and_then(|raw| raw.trim().parse::<u16>().ok());

    Ok(PlacementRecord {
        id: RecordId(0),
        class_name: name,
        position,
        category_flag,
        current_identifier,
        node,
        identifier_node,
    })
}
