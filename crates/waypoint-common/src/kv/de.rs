// Weakly typed serde Deserializer over flattened key/value pairs.
//
// Registry values are always strings, so scalars are parsed on demand into whatever
// the target type asks for. A branch whose keys are all decimal indices is a sequence.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};

use super::{KvPair, PATH_SEPARATOR};
use crate::error::{RegistryError, Result};

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
    missing: Option<&'static str>,
}

impl de::Error for DecodeError {
    fn custom<T: Display>(msg: T) -> Self {
        DecodeError {
            message: msg.to_string(),
            missing: None,
        }
    }

    fn missing_field(field: &'static str) -> Self {
        DecodeError {
            message: format!("missing field `{}`", field),
            missing: Some(field),
        }
    }
}

impl From<DecodeError> for RegistryError {
    fn from(e: DecodeError) -> Self {
        RegistryError::Decode(e.message)
    }
}

/// Decode flattened pairs into `T`
///
/// Empty sequences and maps flatten to no pairs at all. A field serde reports as
/// missing is therefore retried as an empty value; scalars stay missing.
pub fn from_pairs<T: DeserializeOwned>(pairs: &[KvPair]) -> Result<T> {
    let tree = build_tree(pairs);
    let mut absent = BTreeSet::new();

    loop {
        let deserializer = NodeDeserializer {
            node: tree.clone(),
            absent: &absent,
        };
        match T::deserialize(deserializer) {
            Ok(value) => return Ok(value),
            Err(DecodeError {
                missing: Some(field),
                ..
            }) if absent.insert(field) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf(String),
    Branch(BTreeMap<String, Node>),
    Absent(&'static str),
}

impl Node {
    fn unexpected(&self) -> de::Unexpected<'_> {
        match self {
            Node::Leaf(s) => de::Unexpected::Str(s),
            Node::Branch(_) => de::Unexpected::Map,
            Node::Absent(_) => de::Unexpected::Unit,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Leaf(s) => s.is_empty(),
            Node::Branch(_) => false,
            Node::Absent(_) => true,
        }
    }
}

// When a key is both a value and a parent of other keys, the branch wins.
fn build_tree(pairs: &[KvPair]) -> Node {
    let mut root = Node::Branch(BTreeMap::new());

    for pair in pairs {
        let segments: Vec<&str> = pair
            .key
            .split(PATH_SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();
        let is_folder = pair.key.ends_with(PATH_SEPARATOR);

        let Some((last, parents)) = segments.split_last() else {
            if !pair.value.is_empty() && matches!(&root, Node::Branch(m) if m.is_empty()) {
                root = Node::Leaf(pair.value.clone());
            }
            continue;
        };

        let mut current = &mut root;
        for segment in parents {
            current = ensure_branch(current).entry(segment.to_string()).or_insert_with(empty_branch);
        }

        let children = ensure_branch(current);
        if is_folder {
            let entry = children.entry(last.to_string()).or_insert_with(empty_branch);
            ensure_branch(entry);
        } else if !matches!(children.get(*last), Some(Node::Branch(_))) {
            children.insert(last.to_string(), Node::Leaf(pair.value.clone()));
        }
    }

    root
}

fn empty_branch() -> Node {
    Node::Branch(BTreeMap::new())
}

fn ensure_branch(node: &mut Node) -> &mut BTreeMap<String, Node> {
    if !matches!(node, Node::Branch(_)) {
        *node = empty_branch();
    }
    match node {
        Node::Branch(children) => children,
        _ => unreachable!("node replaced by branch above"),
    }
}

fn is_sequence(children: &BTreeMap<String, Node>) -> bool {
    !children.is_empty()
        && children
            .keys()
            .all(|k| k.bytes().all(|b| b.is_ascii_digit()) && k.parse::<usize>().is_ok())
}

fn into_sequence(children: BTreeMap<String, Node>) -> Vec<Node> {
    let mut items: Vec<(usize, Node)> = children
        .into_iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
        .collect();
    items.sort_by_key(|(i, _)| *i);
    items.into_iter().map(|(_, v)| v).collect()
}

fn looks_numeric(s: &str) -> bool {
    s.bytes()
        .any(|b| b.is_ascii_digit())
        && s.bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
}

struct NodeDeserializer<'a> {
    node: Node,
    absent: &'a BTreeSet<&'static str>,
}

impl NodeDeserializer<'_> {
    fn leaf(self) -> std::result::Result<String, DecodeError> {
        match self.node {
            Node::Leaf(s) => Ok(s),
            Node::Absent(field) => Err(de::Error::missing_field(field)),
            other => Err(de::Error::invalid_type(other.unexpected(), &"a scalar value")),
        }
    }

    // Empty leaves and absent fields read as empty collections
    fn children(self, expected: &str) -> std::result::Result<BTreeMap<String, Node>, DecodeError> {
        match self.node {
            Node::Branch(children) => Ok(children),
            node if node.is_empty() => Ok(BTreeMap::new()),
            leaf => Err(de::Error::invalid_type(leaf.unexpected(), &expected)),
        }
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
                let s = self.leaf()?;
                let parsed = s.trim().parse::<$ty>().map_err(|_| {
                    <DecodeError as de::Error>::invalid_value(de::Unexpected::Str(&s), &stringify!($ty))
                })?;
                visitor.$visit(parsed)
            }
        )*
    };
}

impl<'de, 'a> de::Deserializer<'de> for NodeDeserializer<'a> {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        let absent = self.absent;
        match self.node {
            Node::Absent(_) => visitor.visit_unit(),
            Node::Leaf(s) => {
                if s.is_empty() {
                    return visitor.visit_unit();
                }
                match s.as_str() {
                    "true" => return visitor.visit_bool(true),
                    "false" => return visitor.visit_bool(false),
                    _ => {}
                }
                if looks_numeric(&s) {
                    if let Ok(i) = s.parse::<i64>() {
                        return visitor.visit_i64(i);
                    }
                    if let Ok(u) = s.parse::<u64>() {
                        return visitor.visit_u64(u);
                    }
                    if let Ok(f) = s.parse::<f64>() {
                        return visitor.visit_f64(f);
                    }
                }
                visitor.visit_string(s)
            }
            Node::Branch(children) if is_sequence(&children) => {
                visitor.visit_seq(SeqDeserializer::new(into_sequence(children), absent))
            }
            Node::Branch(children) => visitor.visit_map(MapDeserializer::new(children, absent)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        let s = self.leaf()?;
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => visitor.visit_bool(true),
            "false" | "0" | "" => visitor.visit_bool(false),
            _ => Err(de::Error::invalid_value(de::Unexpected::Str(&s), &"a boolean")),
        }
    }

    deserialize_parsed! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        let s = self.leaf()?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(de::Error::invalid_value(de::Unexpected::Str(&s), &"a single character")),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_string(self.leaf()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_string(self.leaf()?)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_byte_buf(self.leaf()?.into_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_byte_buf(self.leaf()?.into_bytes())
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        if self.node.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        let absent = self.absent;
        let items = match self.node {
            Node::Branch(children) => into_sequence(children),
            node if node.is_empty() => Vec::new(),
            leaf => vec![leaf],
        };
        visitor.visit_seq(SeqDeserializer::new(items, absent))
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        let absent = self.absent;
        let children = self.children("a map")?;
        visitor.visit_map(MapDeserializer::new(children, absent))
    }

    // Keys are matched to field names case-insensitively.
    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        let absent = self.absent;
        let children = self.children("a struct")?;

        let mut children: BTreeMap<String, Node> = children
            .into_iter()
            .map(|(key, node)| {
                let canonical = if fields.contains(&key.as_str()) {
                    key
                } else {
                    fields
                        .iter()
                        .find(|f| f.eq_ignore_ascii_case(&key))
                        .map(|f| f.to_string())
                        .unwrap_or(key)
                };
                (canonical, node)
            })
            .collect();

        for field in fields.iter().filter(|f| absent.contains(*f)) {
            children
                .entry(field.to_string())
                .or_insert(Node::Absent(*field));
        }

        visitor.visit_map(MapDeserializer::new(children, absent))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        let absent = self.absent;
        match self.node {
            Node::Leaf(s) => visitor.visit_enum(s.into_deserializer()),
            Node::Absent(field) => Err(de::Error::missing_field(field)),
            Node::Branch(children) if children.len() == 1 => {
                let Some((variant, value)) = children.into_iter().next() else {
                    return Err(de::Error::custom("enum branch has no variant"));
                };
                visitor.visit_enum(EnumDeserializer {
                    variant,
                    value,
                    absent,
                })
            }
            Node::Branch(_) => Err(de::Error::custom(
                "an enum must be a string or a map with a single key",
            )),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_string(self.leaf()?)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}

struct SeqDeserializer<'a> {
    iter: std::vec::IntoIter<Node>,
    absent: &'a BTreeSet<&'static str>,
}

impl<'a> SeqDeserializer<'a> {
    fn new(items: Vec<Node>, absent: &'a BTreeSet<&'static str>) -> Self {
        Self {
            iter: items.into_iter(),
            absent,
        }
    }
}

impl<'de, 'a> SeqAccess<'de> for SeqDeserializer<'a> {
    type Error = DecodeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> std::result::Result<Option<T::Value>, Self::Error> {
        match self.iter.next() {
            Some(node) => seed
                .deserialize(NodeDeserializer {
                    node,
                    absent: self.absent,
                })
                .map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapDeserializer<'a> {
    iter: std::collections::btree_map::IntoIter<String, Node>,
    value: Option<Node>,
    absent: &'a BTreeSet<&'static str>,
}

impl<'a> MapDeserializer<'a> {
    fn new(children: BTreeMap<String, Node>, absent: &'a BTreeSet<&'static str>) -> Self {
        Self {
            iter: children.into_iter(),
            value: None,
            absent,
        }
    }
}

impl<'de, 'a> MapAccess<'de> for MapDeserializer<'a> {
    type Error = DecodeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> std::result::Result<Option<K::Value>, Self::Error> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                // Keys go through the scalar parser so integer-keyed maps work.
                seed.deserialize(NodeDeserializer {
                    node: Node::Leaf(key),
                    absent: self.absent,
                })
                .map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        match self.value.take() {
            Some(node) => seed.deserialize(NodeDeserializer {
                node,
                absent: self.absent,
            }),
            None => Err(de::Error::custom("value requested before key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumDeserializer<'a> {
    variant: String,
    value: Node,
    absent: &'a BTreeSet<&'static str>,
}

impl<'de, 'a> EnumAccess<'de> for EnumDeserializer<'a> {
    type Error = DecodeError;
    type Variant = NodeDeserializer<'a>;

    fn variant_seed<V: DeserializeSeed<'de>>(
        self,
        seed: V,
    ) -> std::result::Result<(V::Value, Self::Variant), Self::Error> {
        let name = NodeDeserializer {
            node: Node::Leaf(self.variant),
            absent: self.absent,
        };
        let variant = seed.deserialize(name)?;
        Ok((
            variant,
            NodeDeserializer {
                node: self.value,
                absent: self.absent,
            },
        ))
    }
}

impl<'de, 'a> VariantAccess<'de> for NodeDeserializer<'a> {
    type Error = DecodeError;

    fn unit_variant(self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(
        self,
        seed: T,
    ) -> std::result::Result<T::Value, Self::Error> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        de::Deserializer::deserialize_seq(self, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        de::Deserializer::deserialize_struct(self, "", fields, visitor)
    }
}
