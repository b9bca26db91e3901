//! Hierarchical parameter tree shared by the renderer and the sheet importer.
//!
//! Templates arrive as nested JSON objects with no explicit node type. A map is
//! a parameter when it carries a reserved value/unit key and none of its own
//! values are maps; everything else is a section (top level) or a subsection.
//! That decision is made exactly once, in [`SchemaTree::from_json`], and every
//! consumer works with the resulting [`NodeKind`] tags.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

pub const VALUE_KEY: &str = "значение";
pub const UNIT_KEY: &str = "единица";
pub const SOURCE_KEY: &str = "источник";
pub const CONFIDENCE_KEY: &str = "уверенность";
pub const COMMENT_KEY: &str = "комментарий";

const VALUE_KEY_EN: &str = "value";
const UNIT_KEY_EN: &str = "unit";
const SOURCE_KEY_EN: &str = "source";
const CONFIDENCE_KEY_EN: &str = "confidence";
const COMMENT_KEY_EN: &str = "comment";

/// Glossary leaf keys.
pub const MATCH_KEY: &str = "match";
pub const GLOSSARY_UNIT_KEY: &str = "unit";

/// Nesting level of a tree node: 1 section, 2 subsection, 3 parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Section,
    Subsection,
    Parameter,
}

impl NodeKind {
    pub fn level(self) -> u8 {
        match self {
            Self::Section => 1,
            Self::Subsection => 2,
            Self::Parameter => 3,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Self::Section),
            2 => Some(Self::Subsection),
            3 => Some(Self::Parameter),
            _ => None,
        }
    }

    fn group_at_depth(depth: usize) -> Self {
        if depth == 0 {
            Self::Section
        } else {
            Self::Subsection
        }
    }
}

/// True when `value` is a parameter map.
///
/// An empty object has no reserved keys and is therefore a section.
pub fn is_parameter(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    let has_reserved = [VALUE_KEY, UNIT_KEY, VALUE_KEY_EN, UNIT_KEY_EN]
        .iter()
        .any(|key| map.contains_key(*key));
    has_reserved && map.values().all(|v| !v.is_object())
}

/// A node of a template-shaped tree. `L` is the leaf payload: filled
/// parameter fields for templates, synonym lists for glossaries.
#[derive(Debug, Clone, PartialEq)]
pub enum Node<L> {
    Group {
        name: String,
        kind: NodeKind,
        children: Vec<Node<L>>,
    },
    Leaf {
        name: String,
        leaf: L,
    },
}

impl<L> Node<L> {
    pub fn name(&self) -> &str {
        match self {
            Self::Group { name, .. } | Self::Leaf { name, .. } => name,
        }
    }

}

/// A flattened node in depth-first pre-order.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeRow<'a, L> {
    pub name: &'a str,
    pub kind: NodeKind,
    pub path: Vec<&'a str>,
    pub leaf: Option<&'a L>,
}

/// Ordered forest of top-level nodes. Child order is row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<L> {
    pub roots: Vec<Node<L>>,
}

impl<L> Default for Tree<L> {
    fn default() -> Self {
        Self { roots: Vec::new() }
    }
}

impl<L> Tree<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Insert `leaf` at `path`, creating groups along the way. The first path
    /// element becomes a section, deeper ones subsections. A leaf already at
    /// `path` is replaced in place so its position is kept.
    pub fn insert_leaf(&mut self, path: &[String], leaf: L) {
        insert_into(&mut self.roots, path, 0, leaf);
    }

    /// All nodes in depth-first pre-order.
    pub fn rows(&self) -> Vec<TreeRow<'_, L>> {
        let mut rows = Vec::new();
        let mut path = Vec::new();
        collect_rows(&self.roots, &mut path, &mut rows);
        rows
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.rows().iter().filter(|row| row.kind == kind).count()
    }
}

fn insert_into<L>(nodes: &mut Vec<Node<L>>, path: &[String], depth: usize, leaf: L) {
    let Some((name, rest)) = path.split_first() else {
        return;
    };

    let existing = nodes.iter().position(|n| n.name() == name);

    if rest.is_empty() {
        let node = Node::Leaf {
            name: name.clone(),
            leaf,
        };
        match existing {
            Some(pos) => nodes[pos] = node,
            None => nodes.push(node),
        }
        return;
    }

    let pos = match existing {
        Some(pos) => pos,
        None => {
            nodes.push(Node::Group {
                name: name.clone(),
                kind: NodeKind::group_at_depth(depth),
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };

    // A parameter sitting on an intermediate path turns into a group.
    if matches!(nodes[pos], Node::Leaf { .. }) {
        nodes[pos] = Node::Group {
            name: name.clone(),
            kind: NodeKind::group_at_depth(depth),
            children: Vec::new(),
        };
    }

    if let Node::Group { children, .. } = &mut nodes[pos] {
        insert_into(children, rest, depth + 1, leaf);
    }
}

fn collect_rows<'a, L>(
    nodes: &'a [Node<L>],
    path: &mut Vec<&'a str>,
    rows: &mut Vec<TreeRow<'a, L>>,
) {
    for node in nodes {
        path.push(node.name());
        match node {
            Node::Group { name, kind, children } => {
                rows.push(TreeRow {
                    name,
                    kind: *kind,
                    path: path.clone(),
                    leaf: None,
                });
                collect_rows(children, path, rows);
            }
            Node::Leaf { name, leaf } => rows.push(TreeRow {
                name,
                kind: NodeKind::Parameter,
                path: path.clone(),
                leaf: Some(leaf),
            }),
        }
        path.pop();
    }
}

/// Leaf payloads that serialize back into template JSON.
pub trait LeafJson {
    fn to_json(&self) -> Value;
}

impl<L: LeafJson> Tree<L> {
    pub fn to_json(&self) -> Value {
        Value::Object(nodes_to_map(&self.roots))
    }
}

fn nodes_to_map<L: LeafJson>(nodes: &[Node<L>]) -> Map<String, Value> {
    nodes
        .iter()
        .map(|node| match node {
            Node::Group { name, children, .. } => {
                (name.clone(), Value::Object(nodes_to_map(children)))
            }
            Node::Leaf { name, leaf } => (name.clone(), leaf.to_json()),
        })
        .collect()
}

#[cfg(test)]
impl<L> Tree<L> {
    pub fn leaf_paths(&self) -> Vec<Vec<String>> {
        self.rows()
            .into_iter()
            .filter(|row| row.leaf.is_some())
            .map(|row| row.path.iter().map(|s| s.to_string()).collect())
            .collect()
    }
}

// ============================================================================
// Template leaves
// ============================================================================

/// Value-carrying fields of a parameter leaf.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameter {
    pub value: Value,
    pub unit: Option<String>,
    pub source: Option<String>,
    pub confidence: Option<String>,
    pub comment: Option<String>,
}

impl Parameter {
    /// Read a parameter map; Russian keys win over their English aliases.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let field = |ru: &str, en: &str| map.get(ru).or_else(|| map.get(en));
        Self {
            value: field(VALUE_KEY, VALUE_KEY_EN).cloned().unwrap_or(Value::Null),
            unit: field(UNIT_KEY, UNIT_KEY_EN).and_then(truthy_text),
            source: field(SOURCE_KEY, SOURCE_KEY_EN).and_then(truthy_text),
            confidence: field(CONFIDENCE_KEY, CONFIDENCE_KEY_EN).and_then(truthy_text),
            comment: field(COMMENT_KEY, COMMENT_KEY_EN).and_then(truthy_text),
        }
    }

    /// Empty parameter with only a unit, as produced by a sheet import.
    pub fn with_unit(unit: Option<String>) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    /// Whether the value cell should be highlighted.
    pub fn has_value(&self) -> bool {
        match &self.value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl LeafJson for Parameter {
    fn to_json(&self) -> Value {
        let text = |field: &Option<String>| field.clone().map(Value::String).unwrap_or(Value::Null);
        let mut map = Map::new();
        map.insert(VALUE_KEY.to_string(), self.value.clone());
        map.insert(UNIT_KEY.to_string(), text(&self.unit));
        map.insert(SOURCE_KEY.to_string(), text(&self.source));
        map.insert(CONFIDENCE_KEY.to_string(), text(&self.confidence));
        map.insert(COMMENT_KEY.to_string(), text(&self.comment));
        Value::Object(map)
    }
}

/// Text of a scalar, or `None` for null, empty, false, zero and empty containers.
pub fn truthy_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

pub type SchemaTree = Tree<Parameter>;

impl SchemaTree {
    /// Classify a filled template. Anything that is not an object yields an
    /// empty tree.
    pub fn from_json(value: &Value) -> Self {
        let roots = value
            .as_object()
            .map(|map| classify_map(map, 1))
            .unwrap_or_default();
        Self { roots }
    }
}

fn classify_map(map: &Map<String, Value>, level: u8) -> Vec<Node<Parameter>> {
    map.iter()
        .map(|(name, value)| match value.as_object() {
            Some(fields) if is_parameter(value) => Node::Leaf {
                name: name.clone(),
                leaf: Parameter::from_map(fields),
            },
            inner => {
                let kind = if level == 1 {
                    NodeKind::Section
                } else {
                    NodeKind::Subsection
                };
                let children = match inner {
                    Some(inner) => {
                        let next = if level == 1 { 2 } else { child_level(inner) };
                        classify_map(inner, next)
                    }
                    None => Vec::new(),
                };
                Node::Group {
                    name: name.clone(),
                    kind,
                    children,
                }
            }
        })
        .collect()
}

/// Level assumed for the children of a subsection: 3 when any child is a
/// parameter, otherwise another subsection layer.
fn child_level(map: &Map<String, Value>) -> u8 {
    if map.values().any(is_parameter) {
        3
    } else {
        2
    }
}

// ============================================================================
// Glossary leaves
// ============================================================================

/// Synonyms and unit hint for one parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GlossaryEntry {
    pub matches: Option<Vec<String>>,
    pub unit: Option<String>,
}

impl LeafJson for GlossaryEntry {
    fn to_json(&self) -> Value {
        let matches = self
            .matches
            .as_ref()
            .map(|items| Value::Array(items.iter().cloned().map(Value::String).collect()))
            .unwrap_or(Value::Null);
        let unit = self.unit.clone().map(Value::String).unwrap_or(Value::Null);
        let mut map = Map::new();
        map.insert(MATCH_KEY.to_string(), matches);
        map.insert(GLOSSARY_UNIT_KEY.to_string(), unit);
        Value::Object(map)
    }
}

pub type GlossaryTree = Tree<GlossaryEntry>;

/// Write a JSON artifact: UTF-8, two-space indent, non-ASCII kept verbatim.
pub fn save_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::conversion(path, e))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|e| Error::conversion(path, e))
}
