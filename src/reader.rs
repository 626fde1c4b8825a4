//! Reader state machine.

use crate::blob::Blob;
use crate::error::SendlibError;
use crate::schema::{Field, MessageDef, Prim, Registry};
use crate::wire::{self, Kind};
use crate::Result;

use log::trace;

use std::cmp::min;
use std::io::Read;

/// A decoded primitive value.
///
/// `Bytes` only appears for `data` elements inside lists, which are small by
/// construction; a top-level `data` field is returned as a streaming
/// [`Blob`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Str(String),
    Int(u32),
    Float(f64),
    Bool(bool),
    Nil,
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            Datum::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Datum::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Datum::Nil)
    }
}

/// What a successful [`Reader::read`] hands back to the caller.
#[derive(Debug)]
pub enum ReadOutcome<'a, 'p, R> {
    /// A decoded primitive.
    Datum(Datum),
    /// A decoded list of primitives.
    List(Vec<Datum>),
    /// A `data` field; consume or [`skip`](Blob::skip) the view before the
    /// next `read`.
    Blob(Blob<'p, R>),
    /// A nested message; drive the sub-reader to decode it. Its header has
    /// already been read and validated.
    Nested(Reader<'a, &'p mut R>),
    /// A list of nested messages; drive one sub-reader per element, in
    /// order.
    NestedList(NestedListReader<'a, 'p, R>),
}

impl<'a, 'p, R> ReadOutcome<'a, 'p, R> {
    pub fn into_datum(self) -> Option<Datum> {
        match self {
            ReadOutcome::Datum(datum) => Some(datum),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Datum>> {
        match self {
            ReadOutcome::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<Blob<'p, R>> {
        match self {
            ReadOutcome::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn into_nested(self) -> Option<Reader<'a, &'p mut R>> {
        match self {
            ReadOutcome::Nested(reader) => Some(reader),
            _ => None,
        }
    }

    pub fn into_nested_list(self) -> Option<NestedListReader<'a, 'p, R>> {
        match self {
            ReadOutcome::NestedList(readers) => Some(readers),
            _ => None,
        }
    }
}

/// Hands out one sub-reader per element of a list-of-messages field. Each
/// element's header is read and validated against the field's message
/// alternatives before the sub-reader is returned.
#[derive(Debug)]
pub struct NestedListReader<'a, 'p, R> {
    registry: &'a Registry,
    field: &'a Field,
    stream: &'p mut R,
    remaining: u32,
    first_tag_consumed: bool,
}

impl<'a, 'p, R: Read> NestedListReader<'a, 'p, R> {
    /// The sub-reader for the next element, or `None` once every element
    /// has been decoded.
    pub fn next_message(&mut self) -> Result<Option<Reader<'a, &mut R>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.first_tag_consumed {
            self.first_tag_consumed = false;
        } else {
            let tag = wire::read_u8(&mut *self.stream)?;
            if tag != Kind::Message.tag() {
                return Err(SendlibError::BadHeader);
            }
        }
        let (name, version) = read_header_rest(&mut *self.stream)?;
        if !self
            .field
            .many_msg_refs()
            .any(|id| id.name.as_str() == name && id.version == version)
        {
            return Err(SendlibError::WrongMessage {
                expected: self.field.spec().to_string(),
                name,
                version,
            });
        }
        let def = self
            .registry
            .def(&name, version)
            .ok_or(SendlibError::NotFound { name, version })?;
        self.remaining -= 1;
        Ok(Some(Reader::new_started(
            self.registry,
            def,
            &mut *self.stream,
        )))
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// A `Reader` is bound to a specific stream and message definition, and
/// maintains the state for reading a single instance of that message. It is
/// not restartable: one reader consumes exactly one message.
///
/// Obtain one by calling [`Message::reader`](crate::Message::reader).
#[derive(Debug)]
pub struct Reader<'a, R> {
    registry: &'a Registry,
    message: &'a MessageDef,
    stream: R,
    pos: usize,
    started: bool,
    peeked: Option<u8>,
    blob_remaining: u32,
}

impl<'a, R: Read> Reader<'a, R> {
    pub(crate) fn new(registry: &'a Registry, message: &'a MessageDef, stream: R) -> Self {
        Reader {
            registry,
            message,
            stream,
            pos: 0,
            started: false,
            peeked: None,
            blob_remaining: 0,
        }
    }

    /// A sub-reader whose header has already been consumed and validated by
    /// its parent.
    fn new_started(registry: &'a Registry, message: &'a MessageDef, stream: R) -> Self {
        Reader {
            started: true,
            ..Reader::new(registry, message, stream)
        }
    }

    /// The name of the message this reader decodes.
    pub fn name(&self) -> &'a str {
        self.message.name.as_str()
    }

    pub fn version(&self) -> u32 {
        self.message.version
    }

    /// Read the next field from the stream. `fieldname` must match the next
    /// field of the message definition; unlike the writer, the reader never
    /// advances across nil-capable fields on its own — the wire already
    /// contains nils in those positions, and each field is requested in
    /// schema order by name.
    ///
    /// The first call validates the message header. A failed call does not
    /// consume the peeked field tag, so a `WrongField` error leaves the
    /// stream position intact.
    pub fn read<'p>(&'p mut self, fieldname: &str) -> Result<ReadOutcome<'a, 'p, R>> {
        if !self.started {
            self.read_header()?;
            self.started = true;
        }
        if self.blob_remaining > 0 {
            return Err(SendlibError::BlobNotConsumed {
                remaining: self.blob_remaining,
            });
        }
        let message = self.message;
        if self.pos >= message.fields.len() {
            return Err(SendlibError::PastEnd);
        }
        let field = &message.fields[self.pos];

        let tag = match self.peeked {
            Some(tag) => tag,
            None => {
                let tag = wire::read_u8(&mut self.stream)?;
                self.peeked = Some(tag);
                tag
            }
        };
        if field.name() != fieldname {
            return Err(SendlibError::WrongField {
                requested: fieldname.to_string(),
                expected: field.name().to_string(),
            });
        }
        let kind = Kind::from_tag(tag).ok_or(SendlibError::BadPrefix(tag))?;
        if !field.accepts_wire_kind(kind) {
            return Err(SendlibError::WrongType {
                found: kind.to_string(),
                field: field.name().to_string(),
                spec: field.spec().to_string(),
            });
        }

        trace!("reading field \"{}\" as {}", fieldname, kind);
        self.peeked = None;
        self.pos += 1;
        self.decode(field, kind)
    }

    fn read_header(&mut self) -> Result<()> {
        let tag = wire::read_u8(&mut self.stream)?;
        if tag != Kind::Message.tag() {
            return Err(SendlibError::BadHeader);
        }
        let (name, version) = read_header_rest(&mut self.stream)?;
        if name != self.message.name.as_str() || version != self.message.version {
            return Err(SendlibError::WrongMessage {
                expected: format!("({}, {})", self.message.name, self.message.version),
                name,
                version,
            });
        }
        Ok(())
    }

    fn decode<'p>(&'p mut self, field: &'a Field, kind: Kind) -> Result<ReadOutcome<'a, 'p, R>> {
        match kind {
            Kind::Str => Ok(ReadOutcome::Datum(Datum::Str(self.read_str()?))),
            Kind::Int => Ok(ReadOutcome::Datum(Datum::Int(wire::read_u32(
                &mut self.stream,
            )?))),
            Kind::Float => Ok(ReadOutcome::Datum(Datum::Float(wire::read_f64(
                &mut self.stream,
            )?))),
            Kind::Bool => {
                let byte = wire::read_u8(&mut self.stream)?;
                Ok(ReadOutcome::Datum(Datum::Bool(byte == b't')))
            }
            Kind::Nil => Ok(ReadOutcome::Datum(Datum::Nil)),
            Kind::Data => {
                let length = wire::read_u32(&mut self.stream)?;
                self.blob_remaining = length;
                let Reader {
                    stream,
                    blob_remaining,
                    ..
                } = self;
                Ok(ReadOutcome::Blob(Blob::new(stream, length, blob_remaining)))
            }
            Kind::Message => {
                let (name, version) = read_header_rest(&mut self.stream)?;
                if !field
                    .msg_refs()
                    .any(|id| id.name.as_str() == name && id.version == version)
                {
                    return Err(SendlibError::WrongMessage {
                        expected: field.spec().to_string(),
                        name,
                        version,
                    });
                }
                let def = self
                    .registry
                    .def(&name, version)
                    .ok_or(SendlibError::NotFound { name, version })?;
                Ok(ReadOutcome::Nested(Reader::new_started(
                    self.registry,
                    def,
                    &mut self.stream,
                )))
            }
            Kind::List => self.decode_list(field),
        }
    }

    fn decode_list<'p>(&'p mut self, field: &'a Field) -> Result<ReadOutcome<'a, 'p, R>> {
        let count = wire::read_u32(&mut self.stream)?;
        if count == 0 {
            return Ok(ReadOutcome::List(Vec::new()));
        }

        let first_tag = wire::read_u8(&mut self.stream)?;
        let first_kind = Kind::from_tag(first_tag).ok_or(SendlibError::BadPrefix(first_tag))?;

        if first_kind == Kind::Message {
            if field.many_msg_refs().next().is_none() {
                return Err(SendlibError::ListTypeMismatch {
                    found: first_kind.to_string(),
                    field: field.name().to_string(),
                    spec: field.spec().to_string(),
                });
            }
            return Ok(ReadOutcome::NestedList(NestedListReader {
                registry: self.registry,
                field,
                stream: &mut self.stream,
                remaining: count,
                first_tag_consumed: true,
            }));
        }

        let prim = match Prim::from_wire_kind(first_kind) {
            Some(prim) if field.accepts_many_prim(prim) => prim,
            _ => {
                return Err(SendlibError::ListTypeMismatch {
                    found: first_kind.to_string(),
                    field: field.name().to_string(),
                    spec: field.spec().to_string(),
                })
            }
        };

        let mut items = Vec::with_capacity(min(count as usize, 1024));
        items.push(self.decode_list_elem(prim)?);
        for _ in 1..count {
            let tag = wire::read_u8(&mut self.stream)?;
            let kind = Kind::from_tag(tag).ok_or(SendlibError::BadPrefix(tag))?;
            if kind != first_kind {
                return Err(SendlibError::ListTypeMismatch {
                    found: format!("{} and {}", first_kind, kind),
                    field: field.name().to_string(),
                    spec: field.spec().to_string(),
                });
            }
            items.push(self.decode_list_elem(prim)?);
        }
        Ok(ReadOutcome::List(items))
    }

    fn decode_list_elem(&mut self, prim: Prim) -> Result<Datum> {
        match prim {
            Prim::Str => Ok(Datum::Str(self.read_str()?)),
            Prim::Int => Ok(Datum::Int(wire::read_u32(&mut self.stream)?)),
            Prim::Float => Ok(Datum::Float(wire::read_f64(&mut self.stream)?)),
            Prim::Bool => Ok(Datum::Bool(wire::read_u8(&mut self.stream)? == b't')),
            Prim::Nil => Ok(Datum::Nil),
            Prim::Data => {
                let length = wire::read_u32(&mut self.stream)? as usize;
                Ok(Datum::Bytes(wire::read_exact_vec(&mut self.stream, length)?))
            }
        }
    }

    fn read_str(&mut self) -> Result<String> {
        let length = wire::read_u32(&mut self.stream)? as usize;
        let bytes = wire::read_exact_vec(&mut self.stream, length)?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Read the name and version that follow a message tag: an `S`-string and an
/// `I`-int.
fn read_header_rest<R: Read>(stream: &mut R) -> Result<(String, u32)> {
    if wire::read_u8(stream)? != Kind::Str.tag() {
        return Err(SendlibError::BadHeader);
    }
    let length = wire::read_u32(stream)? as usize;
    let name = String::from_utf8(wire::read_exact_vec(stream, length)?)?;
    if wire::read_u8(stream)? != Kind::Int.tag() {
        return Err(SendlibError::BadHeader);
    }
    let version = wire::read_u32(stream)?;
    Ok((name, version))
}
