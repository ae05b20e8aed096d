//! Nested, order-preserving attribute store addressed by dot-paths.
//!
//! An [`AttrNode`] owns its children exclusively. Reads come in two flavours:
//! [`AttrNode::peek`] never mutates, while [`AttrNode::get`] materializes empty
//! nodes for every missing segment of the path (auto-vivification). Sibling
//! order is kept for display and serialization but never feeds the content
//! hash.

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Stored explicitly but carries nothing serializable.
    Null,
    Bool(bool),
    Int(i64),
    /// Only for integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<AttrValue>),
    Node(AttrNode),
}

impl AttrValue {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            AttrValue::Bool(_)
                | AttrValue::Int(_)
                | AttrValue::UInt(_)
                | AttrValue::Float(_)
                | AttrValue::Str(_)
        )
    }

    pub fn as_node(&self) -> Option<&AttrNode> {
        match self {
            AttrValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut AttrNode> {
        match self {
            AttrValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::UInt(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// True for a node without entries, the result of reading an unset path.
    pub fn is_empty_node(&self) -> bool {
        matches!(self, AttrValue::Node(node) if node.is_empty())
    }

    fn scalar_text(&self) -> Option<String> {
        match self {
            AttrValue::Bool(v) => Some(v.to_string()),
            AttrValue::Int(v) => Some(v.to_string()),
            AttrValue::UInt(v) => Some(v.to_string()),
            AttrValue::Float(v) => Some(v.to_string()),
            AttrValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// JSON form of this value, or `None` when it has no JSON-safe form.
    /// Lists keep only their scalar elements.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            AttrValue::Null => None,
            AttrValue::Bool(v) => Some(Value::Bool(*v)),
            AttrValue::Int(v) => Some(Value::Number((*v).into())),
            AttrValue::UInt(v) => Some(Value::Number((*v).into())),
            AttrValue::Float(v) => Number::from_f64(*v).map(Value::Number),
            AttrValue::Str(v) => Some(Value::String(v.clone())),
            AttrValue::List(items) => Some(Value::Array(
                items
                    .iter()
                    .filter(|item| item.is_scalar())
                    .filter_map(AttrValue::to_json)
                    .collect(),
            )),
            AttrValue::Node(node) => Some(Value::Object(node.to_jsonable())),
        }
    }

    /// Kind byte followed by the content, so an empty string, an empty node,
    /// an empty list and `Null` never share a hash.
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            AttrValue::Null => hasher.update(b"z"),
            AttrValue::Node(node) => {
                hasher.update(b"n");
                hasher.update(node.hash().as_bytes());
            }
            AttrValue::List(items) => {
                hasher.update(b"l");
                for item in items {
                    hasher.update(item.content_hash().as_bytes());
                }
            }
            scalar => {
                hasher.update(b"s");
                if let Some(text) = scalar.scalar_text() {
                    hasher.update(text.as_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => AttrValue::Int(i),
            Err(_) => AttrValue::UInt(v),
        }
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(v: Vec<T>) -> Self {
        AttrValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<AttrNode> for AttrValue {
    fn from(v: AttrNode) -> Self {
        AttrValue::Node(v)
    }
}

impl From<Map<String, Value>> for AttrValue {
    fn from(v: Map<String, Value>) -> Self {
        AttrValue::Node(v.into())
    }
}

impl From<Value> for AttrValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => AttrValue::Null,
            Value::Bool(b) => AttrValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    AttrValue::UInt(u)
                } else {
                    n.as_f64().map_or(AttrValue::Null, AttrValue::Float)
                }
            }
            Value::String(s) => AttrValue::Str(s),
            Value::Array(items) => AttrValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => AttrValue::Node(map.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrNode {
    entries: IndexMap<String, AttrValue>,
}

fn split_parent(path: &str) -> (Vec<&str>, &str) {
    match path.rsplit_once('.') {
        Some((head, leaf)) => (head.split('.').collect(), leaf),
        None => (Vec::new(), path),
    }
}

impl AttrNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a node from a JSON document; anything but an object yields an
    /// empty node. Keys are taken literally, nested objects become nodes.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => map.clone().into(),
            _ => Self::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Walks to the node at `segments`, creating empty nodes for absent or
    /// `Null` segments.
    fn descend_mut(&mut self, path: &str, segments: &[&str]) -> Result<&mut AttrNode> {
        let mut cur = self;
        for seg in segments {
            let slot = cur
                .entries
                .entry((*seg).to_string())
                .or_insert(AttrValue::Null);
            if matches!(slot, AttrValue::Null) {
                *slot = AttrValue::Node(AttrNode::new());
            }
            cur = match slot {
                AttrValue::Node(node) => node,
                _ => {
                    return Err(Error::NotANode {
                        path: path.to_string(),
                        segment: (*seg).to_string(),
                    })
                }
            };
        }
        Ok(cur)
    }

    /// Get-or-create read. A missing (or `Null`) leaf is materialized as an
    /// empty node and stays in the store.
    pub fn get(&mut self, path: &str) -> Result<&mut AttrValue> {
        let (parents, leaf) = split_parent(path);
        let node = self.descend_mut(path, &parents)?;
        let slot = node
            .entries
            .entry(leaf.to_string())
            .or_insert(AttrValue::Null);
        if matches!(slot, AttrValue::Null) {
            *slot = AttrValue::Node(AttrNode::new());
        }
        Ok(slot)
    }

    /// Non-mutating read.
    pub fn peek(&self, path: &str) -> Option<&AttrValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut cur = self.entries.get(first)?;
        for seg in segments {
            cur = cur.as_node()?.entries.get(seg)?;
        }
        Some(cur)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.peek(path).is_some()
    }

    pub fn set(&mut self, path: &str, value: impl Into<AttrValue>) -> Result<()> {
        let (parents, leaf) = split_parent(path);
        let node = self.descend_mut(path, &parents)?;
        node.entries.insert(leaf.to_string(), value.into());
        Ok(())
    }

    /// Sets every pair in order.
    pub fn update<K, V>(&mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: Into<AttrValue>,
    {
        for (key, value) in pairs {
            self.set(key.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Option<AttrValue> {
        let (parents, leaf) = split_parent(path);
        let mut cur = self;
        for seg in parents {
            cur = cur.entries.get_mut(seg)?.as_node_mut()?;
        }
        cur.entries.shift_remove(leaf)
    }

    /// Depth-first `(dot_path, leaf)` pairs in insertion order. Nodes are
    /// expanded, never yielded.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(None, self.entries.iter())],
        }
    }

    pub fn to_jsonable(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
            .collect()
    }

    pub fn to_json_value(&self) -> Value {
        Value::Object(self.to_jsonable())
    }

    /// Hex SHA-256 over keys in sorted order and the recursive hashes of
    /// their values.
    pub fn hash(&self) -> String {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        let mut hasher = Sha256::new();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(self.entries[key].content_hash().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn same_content(&self, other: &AttrNode) -> bool {
        self.hash() == other.hash()
    }

    /// Overlays the top-level keys of `other`; nested nodes are replaced
    /// wholesale.
    pub fn merge(&mut self, other: &AttrNode) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Like [`AttrNode::merge`] but recurses where both sides hold a node.
    pub fn deep_merge(&mut self, other: &AttrNode) {
        for (key, value) in &other.entries {
            match (self.entries.get_mut(key), value) {
                (Some(AttrValue::Node(mine)), AttrValue::Node(theirs)) => mine.deep_merge(theirs),
                _ => {
                    self.entries.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

impl From<Map<String, Value>> for AttrNode {
    fn from(map: Map<String, Value>) -> Self {
        AttrNode {
            entries: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

impl fmt::Display for AttrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(&self.to_json_value()) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

pub struct Walk<'a> {
    stack: Vec<(Option<String>, indexmap::map::Iter<'a, String, AttrValue>)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (String, &'a AttrValue);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, iter) = self.stack.last_mut()?;
            let Some((key, value)) = iter.next() else {
                self.stack.pop();
                continue;
            };
            let path = match prefix {
                Some(prefix) => format!("{}.{}", prefix, key),
                None => key.clone(),
            };
            match value {
                AttrValue::Node(node) => self.stack.push((Some(path), node.entries.iter())),
                leaf => return Some((path, leaf)),
            }
        }
    }
}
