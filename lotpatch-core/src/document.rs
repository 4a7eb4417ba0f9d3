//! Arena-backed XML element tree over the original document text.
//!
//! Elements are stored in document (pre-)order and addressed by [`NodeId`].
//! Nothing is re-rendered from the tree: attribute writes are recorded as
//! edits against byte spans of the source and spliced back in on
//! serialisation, so whitespace, comments, quoting and attribute order of
//! untouched content survive exactly.

use quick_xml::escape::{escape, unescape, EscapeError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed XML near byte {position}: {source}")]
    Xml {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("malformed attribute in <{element}> at byte {position}")]
    Attribute { element: String, position: usize },

    #[error("bad escape in attribute '{attribute}' at byte {position}: {source}")]
    Escape {
        attribute: String,
        position: usize,
        #[source]
        source: EscapeError,
    },

    #[error("closing tag </{found}> at byte {position} does not match <{expected}>")]
    MismatchedEnd {
        expected: String,
        found: String,
        position: usize,
    },

    #[error("element <{name}> opened at byte {position} is never closed")]
    Unclosed { name: String, position: usize },

    #[error("second root element <{name}> at byte {position}")]
    MultipleRoots { name: String, position: usize },

    #[error("document has no root element")]
    MissingRoot,
}

/// Stable handle to an element of one [`XmlDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    value_span: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Byte offset of the element's `<`.
    pub offset: usize,
    subtree_end: usize,
}

#[derive(Debug, Clone)]
struct Edit {
    end: usize,
    text: String,
}

#[derive(Debug, Clone)]
pub struct XmlDocument {
    source: String,
    elements: Vec<Element>,
    root: NodeId,
    edits: BTreeMap<usize, Edit>,
}

impl XmlDocument {
    pub fn parse(content: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(content)?;
        Self::parse_str(text.to_string())
    }

    pub fn parse_str(source: String) -> Result<Self, ParseError> {
        let (elements, root) = build_tree(&source)?;
        Ok(Self {
            source,
            elements,
            root,
            edits: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn element(&self, id: NodeId) -> &Element {
        &self.elements[id.0]
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Every element, in document order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.elements.len()).map(NodeId)
    }

    /// Strict descendants of `id`, in document order.
    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        (id.0 + 1..self.elements[id.0].subtree_end).map(NodeId)
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.elements[id.0]
            .attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// First direct child `<tag name="field" ...>`.
    pub fn child(&self, parent: NodeId, tag: &str, field: &str) -> Option<NodeId> {
        self.elements[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.is_field(c, tag, field))
    }

    /// First descendant `<tag name="field" ...>` at any depth.
    pub fn descendant(&self, ancestor: NodeId, tag: &str, field: &str) -> Option<NodeId> {
        self.descendants(ancestor).find(|&c| self.is_field(c, tag, field))
    }

    fn is_field(&self, id: NodeId, tag: &str, field: &str) -> bool {
        self.elements[id.0].name == tag && self.attribute(id, "name") == Some(field)
    }

    /// Overwrite an existing attribute value. Returns the previous value, or
    /// `None` (and changes nothing) when the element has no such attribute.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> Option<String> {
        let attr = self.elements[id.0]
            .attributes
            .iter_mut()
            .find(|a| a.name == name)?;

        let previous = std::mem::replace(&mut attr.value, value.to_string());
        self.edits.insert(
            attr.value_span.start,
            Edit {
                end: attr.value_span.end,
                text: escape(value).into_owned(),
            },
        );
        Some(previous)
    }

    /// Number of distinct attribute values rewritten since parsing.
    pub fn edit_count(&self) -> usize {
        self.edits.len()
    }

    /// Full document text with every edit applied.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(self.source.len());
        let mut cursor = 0;
        for (&start, edit) in &self.edits {
            out.push_str(&self.source[cursor..start]);
            out.push_str(&edit.text);
            cursor = edit.end;
        }
        out.push_str(&self.source[cursor..]);
        out
    }
}

fn build_tree(source: &str) -> Result<(Vec<Element>, NodeId), ParseError> {
    let base = if source.starts_with('\u{feff}') { '\u{feff}'.len_utf8() } else { 0 };
    let body = &source[base..];

    let mut reader = Reader::from_str(body);
    let mut elements: Vec<Element> = Vec::new();
    let mut open: Vec<NodeId> = Vec::new();
    let mut root: Option<NodeId> = None;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(source) => {
                return Err(ParseError::Xml {
                    position: base + reader.buffer_position() as usize,
                    source,
                })
            }
        };
        let end = base + reader.buffer_position() as usize;

        match event {
            Event::Start(ref tag) | Event::Empty(ref tag) => {
                let is_empty = matches!(event, Event::Empty(_));
                let id = NodeId(elements.len());
                let parent = open.last().copied();

                let element = open_element(source, end, tag, parent)?;
                match parent {
                    Some(p) => elements[p.0].children.push(id),
                    None if root.is_none() => root = Some(id),
                    None => {
                        return Err(ParseError::MultipleRoots {
                            name: element.name,
                            position: element.offset,
                        })
                    }
                }
                elements.push(element);

                if is_empty {
                    elements[id.0].subtree_end = elements.len();
                } else {
                    open.push(id);
                }
            }
            Event::End(ref tag) => {
                let found = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                let Some(id) = open.pop() else {
                    return Err(ParseError::MismatchedEnd {
                        expected: String::new(),
                        found,
                        position: end,
                    });
                };
                if elements[id.0].name != found {
                    return Err(ParseError::MismatchedEnd {
                        expected: elements[id.0].name.clone(),
                        found,
                        position: end,
                    });
                }
                elements[id.0].subtree_end = elements.len();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(id) = open.pop() {
        let element = &elements[id.0];
        return Err(ParseError::Unclosed {
            name: element.name.clone(),
            position: element.offset,
        });
    }

    let root = root.ok_or(ParseError::MissingRoot)?;
    Ok((elements, root))
}

fn open_element(
    source: &str,
    end: usize,
    tag: &BytesStart<'_>,
    parent: Option<NodeId>,
) -> Result<Element, ParseError> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();

    // Neither names nor attribute values may contain a raw '<'.
    let offset = source[..end].rfind('<').ok_or_else(|| ParseError::Attribute {
        element: name.clone(),
        position: end,
    })?;

    for attr in tag.attributes() {
        if let Err(err) = attr {
            return Err(ParseError::Xml {
                position: offset,
                source: err.into(),
            });
        }
    }

    let attributes = scan_attributes(source, offset + 1 + name.len(), end, &name)?;

    Ok(Element {
        name,
        attributes,
        parent,
        children: Vec::new(),
        offset,
        subtree_end: 0,
    })
}

fn scan_attributes(
    source: &str,
    mut pos: usize,
    end: usize,
    element: &str,
) -> Result<Vec<Attribute>, ParseError> {
    let bytes = source.as_bytes();
    let malformed = |position| ParseError::Attribute {
        element: element.to_string(),
        position,
    };
    let skip_ws = |mut p: usize| {
        while p < end && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        p
    };

    let mut attributes = Vec::new();
    loop {
        pos = skip_ws(pos);
        if pos >= end || matches!(bytes[pos], b'/' | b'>') {
            break;
        }

        let name_start = pos;
        while pos < end
            && !matches!(bytes[pos], b'=' | b'/' | b'>')
            && !bytes[pos].is_ascii_whitespace()
        {
            pos += 1;
        }
        let name = &source[name_start..pos];

        pos = skip_ws(pos);
        if pos >= end || bytes[pos] != b'=' {
            return Err(malformed(name_start));
        }
        pos = skip_ws(pos + 1);

        let quote = match bytes.get(pos) {
            Some(&q) if pos < end && (q == b'"' || q == b'\'') => q as char,
            _ => return Err(malformed(pos)),
        };
        let value_start = pos + 1;
        let value_end = source[value_start..end]
            .find(quote)
            .map(|i| value_start + i)
            .ok_or_else(|| malformed(value_start))?;

        let value = unescape(&source[value_start..value_end])
            .map_err(|source| ParseError::Escape {
                attribute: name.to_string(),
                position: value_start,
                source,
            })?
            .into_owned();

        attributes.push(Attribute {
            name: name.to_string(),
            value,
            value_span: value_start..value_end,
        });
        pos = value_end + 1;
    }

    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!-- lot table -->
<class type='cRoot'>
    <array name="mpList" count="2">
        <u16 name="ItemId"   value="769" />
        <string name="mLabel" value="a &amp; b"/>
    </array>
    <class name="mNested"><u8 name="ItemType" value="2"/></class>
</class>
"#;

    #[test]
    fn untouched_document_serialises_verbatim() {
        let doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(doc.to_xml(), SAMPLE);
        assert_eq!(doc.edit_count(), 0);
    }

    #[test]
    fn elements_are_in_document_order() {
        let doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let names: Vec<_> = doc.nodes().map(|id| doc.element(id).name.as_str()).collect();
        assert_eq!(names, vec!["class", "array", "u16", "string", "class", "u8"]);

        let root = doc.root();
        assert_eq!(doc.attribute(root, "type"), Some("cRoot"));
        assert_eq!(doc.descendants(root).count(), 5);
        assert_eq!(doc.element(root).children.len(), 2);
    }

    #[test]
    fn finds_fields_by_tag_and_name() {
        let doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let root = doc.root();

        let list = doc.child(root, "array", "mpList").unwrap();
        let id = doc.child(list, "u16", "ItemId").unwrap();
        assert_eq!(doc.attribute(id, "value"), Some("769"));

        assert!(doc.child(root, "u8", "ItemType").is_none());
        let flag = doc.descendant(root, "u8", "ItemType").unwrap();
        assert_eq!(doc.attribute(flag, "value"), Some("2"));

        let label = doc.child(list, "string", "mLabel").unwrap();
        assert_eq!(doc.attribute(label, "value"), Some("a & b"));
    }

    #[test]
    fn set_attribute_rewrites_only_that_value() {
        let mut doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let id = doc.descendant(doc.root(), "u16", "ItemId").unwrap();

        assert_eq!(doc.set_attribute(id, "value", "1025"), Some("769".to_string()));
        assert_eq!(doc.attribute(id, "value"), Some("1025"));
        assert_eq!(
            doc.to_xml(),
            SAMPLE.replace(r#"value="769""#, r#"value="1025""#)
        );
    }

    #[test]
    fn repeated_writes_keep_the_last_value() {
        let mut doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let id = doc.descendant(doc.root(), "u16", "ItemId").unwrap();

        doc.set_attribute(id, "value", "1");
        assert_eq!(doc.set_attribute(id, "value", "2"), Some("1".to_string()));
        assert_eq!(doc.edit_count(), 1);
        assert!(doc.to_xml().contains(r#"<u16 name="ItemId"   value="2" />"#));
    }

    #[test]
    fn written_values_are_escaped() {
        let mut doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let label = doc.descendant(doc.root(), "string", "mLabel").unwrap();

        doc.set_attribute(label, "value", "x < \"y\"");
        let reparsed = XmlDocument::parse(doc.to_xml().as_bytes()).unwrap();
        let label = reparsed.descendant(reparsed.root(), "string", "mLabel").unwrap();
        assert_eq!(reparsed.attribute(label, "value"), Some("x < \"y\""));
    }

    #[test]
    fn missing_attribute_is_not_added() {
        let mut doc = XmlDocument::parse(SAMPLE.as_bytes()).unwrap();
        let root = doc.root();
        assert_eq!(doc.set_attribute(root, "value", "1"), None);
        assert_eq!(doc.to_xml(), SAMPLE);
    }

    #[test]
    fn byte_order_mark_is_preserved() {
        let text = "\u{feff}<root><u16 name=\"ItemId\" value=\"5\"/></root>";
        let mut doc = XmlDocument::parse(text.as_bytes()).unwrap();
        let id = doc.descendant(doc.root(), "u16", "ItemId").unwrap();
        doc.set_attribute(id, "value", "6");
        assert_eq!(doc.to_xml(), text.replace("\"5\"", "\"6\""));
    }

    #[test]
    fn rejects_documents_without_a_root() {
        assert!(matches!(XmlDocument::parse(b""), Err(ParseError::MissingRoot)));
        assert!(matches!(
            XmlDocument::parse(b"<?xml version=\"1.0\"?>\n<!-- nothing -->\n"),
            Err(ParseError::MissingRoot)
        ));
    }

    #[test]
    fn rejects_malformed_nesting() {
        let mismatched = XmlDocument::parse(b"<a><b></a></b>").unwrap_err();
        assert!(matches!(
            mismatched,
            ParseError::Xml { .. } | ParseError::MismatchedEnd { .. }
        ));

        let unclosed = XmlDocument::parse(b"<a><b/>").unwrap_err();
        assert!(matches!(unclosed, ParseError::Xml { .. } | ParseError::Unclosed { .. }));

        let two_roots = XmlDocument::parse(b"<a/><b/>").unwrap_err();
        assert!(matches!(two_roots, ParseError::MultipleRoots { .. }));
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(matches!(
            XmlDocument::parse(&[b'<', b'a', 0xFF, b'/', b'>']),
            Err(ParseError::Utf8(_))
        ));
    }
}
