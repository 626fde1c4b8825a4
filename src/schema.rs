//! Schema model and parser.
//!
//! A schema text declares messages and their fields; [`parse`] turns it into
//! a [`Registry`], the scope within which `msg(name, version)` references
//! resolve. Parsing is two-pass: messages and fields accumulate first, and
//! message references are checked against the completed registry, so forward
//! references within one schema are valid.

use crate::error::{ParseError, SendlibError};
use crate::reader::Reader;
use crate::wire::Kind;
use crate::writer::Writer;
use crate::{FlexString, Result};

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Write};

static MESSAGE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\(([^,]+),\s*(\d+)\):\s*$").unwrap());
static FIELD_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-\s*([^:]+):\s+(.+?)\s*$").unwrap());
static MSG_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^msg\s*\(\s*(\w+)\s*,\s*(\d+)\s*\)$").unwrap());
static MANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^many\s+(.+)$").unwrap());
static OR_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+or\s+").unwrap());

/// A primitive field type keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Prim {
    Str,
    Int,
    Float,
    Bool,
    Data,
    Nil,
}

impl Prim {
    fn from_keyword(keyword: &str) -> Option<Self> {
        use Prim::*;
        match keyword {
            "str" => Some(Str),
            "int" => Some(Int),
            "float" => Some(Float),
            "bool" => Some(Bool),
            "data" => Some(Data),
            "nil" => Some(Nil),
            _ => None,
        }
    }

    pub(crate) fn from_wire_kind(kind: Kind) -> Option<Self> {
        use Prim::*;
        match kind {
            Kind::Str => Some(Str),
            Kind::Int => Some(Int),
            Kind::Float => Some(Float),
            Kind::Bool => Some(Bool),
            Kind::Data => Some(Data),
            Kind::Nil => Some(Nil),
            Kind::Message | Kind::List => None,
        }
    }
}

impl Display for Prim {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Prim::*;
        match self {
            Str => write!(f, "str"),
            Int => write!(f, "int"),
            Float => write!(f, "float"),
            Bool => write!(f, "bool"),
            Data => write!(f, "data"),
            Nil => write!(f, "nil"),
        }
    }
}

/// Identity of a message within its registry. A pure lookup key, never an
/// owning edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageId {
    pub name: FlexString,
    pub version: u32,
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.version)
    }
}

/// The element type of a `many` list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Elem {
    Prim(Prim),
    MsgRef(MessageId),
}

impl Display for Elem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Elem::Prim(p) => write!(f, "{}", p),
            Elem::MsgRef(id) => write!(f, "msg {}", id),
        }
    }
}

/// One alternative in a field's type spec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeAlt {
    Prim(Prim),
    Many(Elem),
    MsgRef(MessageId),
}

impl Display for TypeAlt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TypeAlt::Prim(p) => write!(f, "{}", p),
            TypeAlt::Many(e) => write!(f, "many {}", e),
            TypeAlt::MsgRef(id) => write!(f, "msg {}", id),
        }
    }
}

/// The definition of a single field: a name and an ordered set of accepted
/// type alternatives. The raw right-hand side of the schema line is kept for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    name: FlexString,
    spec: String,
    types: Vec<TypeAlt>,
}

impl Field {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn types(&self) -> &[TypeAlt] {
        &self.types
    }

    /// Whether a nil may stand in for this field.
    pub fn accepts_nil(&self) -> bool {
        self.has_prim(Prim::Nil)
    }

    pub(crate) fn has_prim(&self, prim: Prim) -> bool {
        self.types
            .iter()
            .any(|t| matches!(t, TypeAlt::Prim(p) if *p == prim))
    }

    pub(crate) fn msg_refs(&self) -> impl Iterator<Item = &MessageId> {
        self.types.iter().filter_map(|t| match t {
            TypeAlt::MsgRef(id) => Some(id),
            _ => None,
        })
    }

    pub(crate) fn many_elems(&self) -> impl Iterator<Item = &Elem> {
        self.types.iter().filter_map(|t| match t {
            TypeAlt::Many(e) => Some(e),
            _ => None,
        })
    }

    pub(crate) fn accepts_many_prim(&self, prim: Prim) -> bool {
        self.many_elems()
            .any(|e| matches!(e, Elem::Prim(p) if *p == prim))
    }

    pub(crate) fn many_msg_refs(&self) -> impl Iterator<Item = &MessageId> {
        self.many_elems().filter_map(|e| match e {
            Elem::MsgRef(id) => Some(id),
            _ => None,
        })
    }

    /// Whether a value of the given wire kind can appear in this field.
    pub(crate) fn accepts_wire_kind(&self, kind: Kind) -> bool {
        match kind {
            Kind::Message => self.msg_refs().next().is_some(),
            Kind::List => self.many_elems().next().is_some(),
            _ => match Prim::from_wire_kind(kind) {
                Some(prim) => self.has_prim(prim),
                None => false,
            },
        }
    }
}

/// The owned definition of a message: identity plus the ordered fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct MessageDef {
    pub(crate) name: FlexString,
    pub(crate) version: u32,
    pub(crate) fields: Vec<Field>,
}

/// A non-owning handle to a message definition, tied to the registry it was
/// parsed into. Obtained from [`Registry::lookup`] or [`Registry::get`];
/// constructs per-instance codecs via [`Message::writer`] and
/// [`Message::reader`].
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    registry: &'a Registry,
    def: &'a MessageDef,
}

impl<'a> Message<'a> {
    pub fn name(&self) -> &'a str {
        self.def.name.as_str()
    }

    pub fn version(&self) -> u32 {
        self.def.version
    }

    pub fn fields(&self) -> &'a [Field] {
        &self.def.fields
    }

    /// Return a [`Writer`] which writes one instance of this message to
    /// `stream`.
    pub fn writer<W: Write>(self, stream: W) -> Writer<'a, W> {
        Writer::new(self.registry, self.def, stream)
    }

    /// Return a [`Reader`] which reads one instance of this message from
    /// `stream`.
    pub fn reader<R: Read>(self, stream: R) -> Reader<'a, R> {
        Reader::new(self.registry, self.def, stream)
    }
}

impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.registry, other.registry)
            && self.def.name == other.def.name
            && self.def.version == other.def.version
    }
}

/// The set of messages produced by parsing one schema text. Immutable once
/// parsed.
#[derive(Debug, Serialize)]
pub struct Registry {
    messages: Vec<MessageDef>,
    #[serde(skip)]
    index: HashMap<(FlexString, u32), usize>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message, failing with `NotFound` if it does not exist.
    pub fn lookup(&self, name: &str, version: u32) -> Result<Message<'_>> {
        self.get(name, version).ok_or_else(|| SendlibError::NotFound {
            name: name.to_string(),
            version,
        })
    }

    /// Look up a message, returning `None` if it does not exist.
    pub fn get(&self, name: &str, version: u32) -> Option<Message<'_>> {
        self.def(name, version).map(|def| Message {
            registry: self,
            def,
        })
    }

    /// Iterate over all messages in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Message<'_>> {
        self.messages.iter().map(move |def| Message {
            registry: self,
            def,
        })
    }

    pub(crate) fn def(&self, name: &str, version: u32) -> Option<&MessageDef> {
        self.index
            .get(&(FlexString::from(name), version))
            .map(|&i| &self.messages[i])
    }
}

/// Parse a schema text into a [`Registry`].
pub fn parse(schema: &str) -> Result<Registry> {
    let mut messages: Vec<MessageDef> = Vec::new();
    let mut index: HashMap<(FlexString, u32), usize> = HashMap::new();
    let mut field_names: HashSet<FlexString> = HashSet::new();

    for (lineno, raw) in schema.lines().enumerate() {
        let line = lineno + 1;
        let mut text = raw.trim();
        if let Some(hash) = text.find('#') {
            text = &text[..hash];
        }
        if text.trim().is_empty() {
            continue;
        }

        if let Some(caps) = FIELD_LINE.captures(text) {
            let name = caps[1].trim();
            let spec = &caps[2];
            let curr = match messages.last_mut() {
                Some(curr) => curr,
                None => return Err(ParseError::OrphanField { line }.into()),
            };
            if !field_names.insert(FlexString::from(name)) {
                return Err(ParseError::DuplicateField {
                    name: name.to_string(),
                    line,
                }
                .into());
            }
            let types = parse_typespec(spec, line)?;
            curr.fields.push(Field {
                name: FlexString::from(name),
                spec: spec.to_string(),
                types,
            });
            continue;
        }

        if let Some(caps) = MESSAGE_LINE.captures(text) {
            let name = caps[1].trim();
            let version = parse_version(&caps[2], line)?;
            let key = (FlexString::from(name), version);
            if index.contains_key(&key) {
                return Err(ParseError::DuplicateMessage {
                    name: name.to_string(),
                    version,
                    line,
                }
                .into());
            }
            debug!("registered message ({}, {})", name, version);
            index.insert(key, messages.len());
            messages.push(MessageDef {
                name: FlexString::from(name),
                version,
                fields: Vec::new(),
            });
            field_names.clear();
        }
    }

    // Second pass: every message reference must resolve against the full
    // registry, which makes forward references within one schema legal.
    for def in &messages {
        for field in &def.fields {
            for alt in &field.types {
                let msgref = match alt {
                    TypeAlt::MsgRef(id) => Some(id),
                    TypeAlt::Many(Elem::MsgRef(id)) => Some(id),
                    _ => None,
                };
                if let Some(id) = msgref {
                    if !index.contains_key(&(id.name.clone(), id.version)) {
                        return Err(ParseError::UnresolvedMessage {
                            name: id.name.to_string(),
                            version: id.version,
                        }
                        .into());
                    }
                }
            }
        }
    }

    Ok(Registry { messages, index })
}

/// Parse a schema drawn from a readable source; the whole text is read
/// first.
pub fn parse_reader<R: Read>(mut schema: R) -> Result<Registry> {
    let mut text = String::new();
    schema.read_to_string(&mut text)?;
    parse(&text)
}

fn parse_version(digits: &str, line: usize) -> Result<u32> {
    digits.parse().map_err(|_| {
        ParseError::InvalidVersion {
            version: digits.to_string(),
            line,
        }
        .into()
    })
}

fn parse_typespec(spec: &str, line: usize) -> Result<Vec<TypeAlt>> {
    let mut types = Vec::new();
    for alt in OR_SPLIT.split(spec) {
        let alt = alt.trim();
        let parsed = if let Some(caps) = MANY.captures(alt) {
            TypeAlt::Many(parse_elem(caps[1].trim(), line)?)
        } else if let Some(id) = parse_msg_ref(alt, line)? {
            TypeAlt::MsgRef(id)
        } else if let Some(prim) = Prim::from_keyword(alt) {
            TypeAlt::Prim(prim)
        } else {
            return Err(ParseError::UnknownType {
                keyword: alt.to_string(),
                line,
            }
            .into());
        };
        types.push(parsed);
    }
    Ok(types)
}

fn parse_elem(inner: &str, line: usize) -> Result<Elem> {
    if let Some(id) = parse_msg_ref(inner, line)? {
        return Ok(Elem::MsgRef(id));
    }
    match Prim::from_keyword(inner) {
        Some(prim) => Ok(Elem::Prim(prim)),
        None => Err(ParseError::UnknownType {
            keyword: inner.to_string(),
            line,
        }
        .into()),
    }
}

fn parse_msg_ref(alt: &str, line: usize) -> Result<Option<MessageId>> {
    match MSG_REF.captures(alt) {
        None => Ok(None),
        Some(caps) => {
            let version = parse_version(&caps[2], line)?;
            Ok(Some(MessageId {
                name: FlexString::from(&caps[1]),
                version,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fields() {
        let registry = parse("\n(foo, 1):\n").unwrap();
        assert_eq!(registry.len(), 1);

        let msg = registry.lookup("foo", 1).unwrap();
        assert_eq!(msg.name(), "foo");
        assert_eq!(msg.version(), 1);
        assert!(msg.fields().is_empty());
    }

    #[test]
    fn field_types() {
        let definition = "
        (foo, 1):
          - i: int
          - in: int or nil
          - s: str
          - sn: str or nil
          - f: float
          - fn: float or nil
          - b: bool
          - bn: bool or nil
          - d: data
          - dn: data or nil
          - n: nil
          - sifbdn: str or int or float or bool or data or nil
        ";

        let registry = parse(definition).unwrap();
        let msg = registry.lookup("foo", 1).unwrap();

        // spot-check fields
        assert_eq!(msg.fields()[0].types(), &[TypeAlt::Prim(Prim::Int)]);
        assert_eq!(
            msg.fields()[3].types(),
            &[TypeAlt::Prim(Prim::Str), TypeAlt::Prim(Prim::Nil)]
        );
        assert_eq!(
            msg.fields()[11].types(),
            &[
                TypeAlt::Prim(Prim::Str),
                TypeAlt::Prim(Prim::Int),
                TypeAlt::Prim(Prim::Float),
                TypeAlt::Prim(Prim::Bool),
                TypeAlt::Prim(Prim::Data),
                TypeAlt::Prim(Prim::Nil),
            ]
        );
        assert!(msg.fields()[1].accepts_nil());
        assert!(!msg.fields()[0].accepts_nil());
    }

    #[test]
    fn unknown_type() {
        let err = parse("(foo, 1):\n - broken: not_a_type\n").unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::UnknownType { .. })
        ));
    }

    #[test]
    fn duplicate_message() {
        let definition = "
        (foo, 1):
         - i: int

        (foo, 1):
         - i: int
        ";
        let err = parse(definition).unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::DuplicateMessage { .. })
        ));
    }

    #[test]
    fn same_name_new_version_is_fine() {
        let definition = "
        (foo, 1):
         - i: int

        (foo, 2):
         - i: int
        ";
        let registry = parse(definition).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("foo", 1).is_some());
        assert!(registry.get("foo", 2).is_some());
    }

    #[test]
    fn duplicate_field() {
        let definition = "
        (foo, 1):
         - a: int
         - b: str
         - a: int
        ";
        let err = parse(definition).unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::DuplicateField { .. })
        ));
    }

    #[test]
    fn orphan_field() {
        let err = parse(" - a: int\n(foo, 1):\n").unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::OrphanField { line: 1 })
        ));
    }

    #[test]
    fn comments_and_blank_lines() {
        let definition = "
        # schema for the upload protocol
        (foo, 1):  # trailing comment
          - a: int # another one

        # done
        ";
        let registry = parse(definition).unwrap();
        let msg = registry.lookup("foo", 1).unwrap();
        assert_eq!(msg.fields().len(), 1);
        assert_eq!(msg.fields()[0].name(), "a");
    }

    #[test]
    fn message_name_may_contain_spaces() {
        let registry = parse("(hello world, 1):\n - a: int\n").unwrap();
        assert!(registry.get("hello world", 1).is_some());
    }

    #[test]
    fn forward_references_resolve() {
        let definition = "
        (envelope, 1):
         - payload: msg(body, 1) or nil
         - extras: many msg(body, 1)

        (body, 1):
         - text: str
        ";
        let registry = parse(definition).unwrap();
        let envelope = registry.lookup("envelope", 1).unwrap();
        assert_eq!(
            envelope.fields()[0].types()[0],
            TypeAlt::MsgRef(MessageId {
                name: FlexString::from("body"),
                version: 1
            })
        );
        assert_eq!(
            envelope.fields()[1].types()[0],
            TypeAlt::Many(Elem::MsgRef(MessageId {
                name: FlexString::from("body"),
                version: 1
            }))
        );
    }

    #[test]
    fn unresolved_reference() {
        let err = parse("(foo, 1):\n - a: msg(nothere, 3)\n").unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::UnresolvedMessage { version: 3, .. })
        ));
    }

    #[test]
    fn spec_is_preserved_for_diagnostics() {
        let registry = parse("(foo, 1):\n - a: str or nil\n").unwrap();
        let msg = registry.lookup("foo", 1).unwrap();
        assert_eq!(msg.fields()[0].spec(), "str or nil");
    }

    #[test]
    fn lookup_and_get() {
        let registry = parse("(foo, 1):\n - a: int\n").unwrap();
        assert!(registry.get("foo", 2).is_none());
        assert!(registry.get("bar", 1).is_none());
        let err = registry.lookup("bar", 1).unwrap_err();
        assert!(matches!(err, SendlibError::NotFound { version: 1, .. }));

        let a = registry.lookup("foo", 1).unwrap();
        let b = registry.get("foo", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parse_from_reader() {
        let text = "(foo, 1):\n - a: int\n";
        let registry = parse_reader(text.as_bytes()).unwrap();
        assert!(registry.get("foo", 1).is_some());
    }

    #[test]
    fn version_must_fit_u32() {
        let err = parse("(foo, 99999999999):\n").unwrap_err();
        assert!(matches!(
            err,
            SendlibError::Parse(ParseError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn schema_model_serializes() {
        let registry = parse("(foo, 1):\n - a: str or nil\n").unwrap();
        let value = serde_json::to_value(&registry).unwrap();
        assert_eq!(value["messages"][0]["name"], "foo");
        assert_eq!(value["messages"][0]["version"], 1);
        assert_eq!(value["messages"][0]["fields"][0]["spec"], "str or nil");
    }
}
