//! Writer state machine.

use crate::error::SendlibError;
use crate::schema::{Field, Message, MessageDef, MessageId, Prim, Registry};
use crate::wire::{self, Kind};
use crate::{FlexString, Result};

use itertools::Itertools;
use log::trace;

use std::cmp::min;
use std::collections::BTreeSet;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Blobs are copied through a fixed-size scratch buffer; nothing larger is
/// ever held in memory.
const DATA_CHUNK_SIZE: usize = 256 * 1024;

/// A source of bytes for a `data` field. The writer asks for the total
/// length up front (it is part of the wire encoding) and then pulls the
/// bytes in chunks.
///
/// Any `Read + Seek` type is a `BlobSource`: the length is measured by
/// seeking to the end, after which the source is rewound to the start.
pub trait BlobSource {
    /// Total number of bytes this source will produce. Called before the
    /// copy starts; implementations must leave the source positioned at the
    /// first byte.
    fn len(&mut self) -> io::Result<u64>;

    /// Pull the next chunk, returning the number of bytes produced. Zero
    /// means the source is exhausted.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Seek> BlobSource for T {
    fn len(&mut self) -> io::Result<u64> {
        let length = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(0))?;
        Ok(length)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

/// A value handed to [`Writer::write`], tagged with its dynamic kind.
pub enum Value<'v> {
    Str(&'v str),
    Int(u32),
    Float(f64),
    Bool(bool),
    Nil,
    Data(&'v mut dyn BlobSource),
    /// A nested message designated by `(name, version)`.
    Msg(&'v str, u32),
    /// A nested message left unspecified; valid only when the field has
    /// exactly one message alternative.
    AnyMsg,
    List(Vec<Value<'v>>),
}

impl<'v> Value<'v> {
    /// The printable name of this value's dynamic kind, message identity
    /// included.
    fn kind_name(&self) -> String {
        use Value::*;
        match self {
            Str(_) => "str".to_string(),
            Int(_) => "int".to_string(),
            Float(_) => "float".to_string(),
            Bool(_) => "bool".to_string(),
            Nil => "nil".to_string(),
            Data(_) => "data".to_string(),
            Msg(name, version) => format!("msg ({}, {})", name, version),
            AnyMsg => "msg".to_string(),
            List(_) => "list".to_string(),
        }
    }
}

impl<'v> From<&'v str> for Value<'v> {
    fn from(value: &'v str) -> Self {
        Value::Str(value)
    }
}

impl From<u32> for Value<'_> {
    fn from(value: u32) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value<'_> {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value<'_> {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<'v> From<Message<'v>> for Value<'v> {
    fn from(message: Message<'v>) -> Self {
        Value::Msg(message.name(), message.version())
    }
}

/// What a successful [`Writer::write`] hands back to the caller.
#[derive(Debug)]
pub enum WriteOutcome<'a, 'w, W> {
    /// The field is fully written.
    Done,
    /// The field is a nested message; drive the sub-writer to emit it.
    Nested(Writer<'a, &'w mut W>),
    /// The field is a list of nested messages; drive one sub-writer per
    /// element, in order.
    NestedList(NestedListWriter<'a, 'w, W>),
}

impl<'a, 'w, W> WriteOutcome<'a, 'w, W> {
    pub fn is_done(&self) -> bool {
        matches!(self, WriteOutcome::Done)
    }

    pub fn into_nested(self) -> Option<Writer<'a, &'w mut W>> {
        match self {
            WriteOutcome::Nested(writer) => Some(writer),
            _ => None,
        }
    }

    pub fn into_nested_list(self) -> Option<NestedListWriter<'a, 'w, W>> {
        match self {
            WriteOutcome::NestedList(writers) => Some(writers),
            _ => None,
        }
    }
}

/// Hands out one sub-writer per element of a list-of-messages field. The
/// borrow of the parent's stream moves through each sub-writer in turn, so
/// elements can only be written in order.
#[derive(Debug)]
pub struct NestedListWriter<'a, 'w, W> {
    registry: &'a Registry,
    message: &'a MessageDef,
    stream: &'w mut W,
    remaining: u32,
}

impl<'a, 'w, W: Write> NestedListWriter<'a, 'w, W> {
    /// The sub-writer for the next element, or `None` once every element
    /// has been handed out.
    pub fn next_message(&mut self) -> Option<Writer<'a, &mut W>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Writer::new(self.registry, self.message, &mut *self.stream))
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// A `Writer` is bound to a specific stream and message definition, and
/// maintains the state for writing a single instance of that message.
///
/// Obtain one by calling [`Message::writer`](crate::Message::writer).
#[derive(Debug)]
pub struct Writer<'a, W> {
    registry: &'a Registry,
    message: &'a MessageDef,
    stream: W,
    pos: usize,
    header_written: bool,
}

impl<'a, W: Write> Writer<'a, W> {
    pub(crate) fn new(registry: &'a Registry, message: &'a MessageDef, stream: W) -> Self {
        Writer {
            registry,
            message,
            stream,
            pos: 0,
            header_written: false,
        }
    }

    /// Write `value` to the stream, after verifying that `fieldname` is the
    /// correct next field of the message and that the value's kind is among
    /// the field's alternatives.
    ///
    /// Fields ahead of `fieldname` that accept `nil` are skipped by writing
    /// nils for them, so optional fields need not be written explicitly.
    /// The message header is emitted before the first field.
    ///
    /// For nested-message fields the returned [`WriteOutcome`] carries a
    /// sub-writer (or, for a list of messages, a sequence of them) which the
    /// caller drives; everything else is written in full and yields
    /// [`WriteOutcome::Done`].
    pub fn write<'w>(
        &'w mut self,
        fieldname: &str,
        mut value: Value<'_>,
    ) -> Result<WriteOutcome<'a, 'w, W>> {
        let message = self.message;
        let target = self.locate_field(fieldname)?;
        let field = &message.fields[target];
        self.check_value(field, &mut value)?;

        if !self.header_written {
            self.write_header()?;
            self.header_written = true;
        }
        while self.pos < target {
            self.write_nil()?;
            self.pos += 1;
        }
        trace!("writing field \"{}\" as {}", fieldname, value.kind_name());
        self.pos += 1;
        self.write_value(field, value)
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    /// Walk forward from the current position to the requested field,
    /// without emitting anything. Every field stepped over must accept nil.
    fn locate_field(&self, fieldname: &str) -> Result<usize> {
        let fields = &self.message.fields;
        let mut idx = self.pos;
        loop {
            if idx >= fields.len() {
                return Err(SendlibError::PastEnd);
            }
            let field = &fields[idx];
            if field.name() == fieldname {
                return Ok(idx);
            }
            if !field.accepts_nil() {
                return Err(SendlibError::WrongField {
                    requested: fieldname.to_string(),
                    expected: field.name().to_string(),
                });
            }
            idx += 1;
        }
    }

    fn check_value(&self, field: &Field, value: &mut Value<'_>) -> Result<()> {
        match value {
            Value::List(items) => self.check_list(field, items),
            Value::Msg(name, version) => {
                if self.registry.def(name, *version).is_none() {
                    return Err(SendlibError::NotFound {
                        name: name.to_string(),
                        version: *version,
                    });
                }
                let id = MessageId {
                    name: FlexString::from(*name),
                    version: *version,
                };
                if field.msg_refs().any(|r| *r == id) {
                    Ok(())
                } else {
                    Err(self.type_mismatch(field, format!("msg {}", id)))
                }
            }
            Value::AnyMsg => {
                let mut refs = field.msg_refs();
                match (refs.next(), refs.next()) {
                    (None, _) => Err(self.type_mismatch(field, "msg".to_string())),
                    (Some(_), None) => Ok(()),
                    (Some(_), Some(_)) => Err(SendlibError::AmbiguousMessage {
                        field: field.name().to_string(),
                    }),
                }
            }
            Value::Data(source) => {
                if !field.has_prim(Prim::Data) {
                    return Err(self.type_mismatch(field, "data".to_string()));
                }
                wire::checked_len(source.len()?)?;
                Ok(())
            }
            Value::Str(_) => self.check_prim(field, Prim::Str),
            Value::Int(_) => self.check_prim(field, Prim::Int),
            Value::Float(_) => self.check_prim(field, Prim::Float),
            Value::Bool(_) => self.check_prim(field, Prim::Bool),
            Value::Nil => self.check_prim(field, Prim::Nil),
        }
    }

    fn check_prim(&self, field: &Field, prim: Prim) -> Result<()> {
        if field.has_prim(prim) {
            Ok(())
        } else {
            Err(self.type_mismatch(field, prim.to_string()))
        }
    }

    fn check_list(&self, field: &Field, items: &mut [Value<'_>]) -> Result<()> {
        if field.many_elems().next().is_none() {
            return Err(self.type_mismatch(field, "list".to_string()));
        }
        if items.is_empty() {
            return Ok(());
        }

        // All elements must share one dynamic kind; for messages the
        // identity is part of the kind.
        let kinds: BTreeSet<String> = items.iter().map(Value::kind_name).collect();
        if kinds.len() > 1 {
            return Err(SendlibError::ListTypeMismatch {
                found: kinds.iter().join(", "),
                field: field.name().to_string(),
                spec: field.spec().to_string(),
            });
        }

        match &mut items[0] {
            Value::Str(_) => self.check_list_prim(field, Prim::Str),
            Value::Int(_) => self.check_list_prim(field, Prim::Int),
            Value::Float(_) => self.check_list_prim(field, Prim::Float),
            Value::Bool(_) => self.check_list_prim(field, Prim::Bool),
            Value::Nil => self.check_list_prim(field, Prim::Nil),
            Value::Data(_) => {
                self.check_list_prim(field, Prim::Data)?;
                for item in items {
                    if let Value::Data(source) = item {
                        wire::checked_len(source.len()?)?;
                    }
                }
                Ok(())
            }
            Value::Msg(name, version) => {
                if self.registry.def(name, *version).is_none() {
                    return Err(SendlibError::NotFound {
                        name: name.to_string(),
                        version: *version,
                    });
                }
                let id = MessageId {
                    name: FlexString::from(*name),
                    version: *version,
                };
                if field.many_msg_refs().any(|r| *r == id) {
                    Ok(())
                } else {
                    Err(self.list_mismatch(field, format!("msg {}", id)))
                }
            }
            Value::AnyMsg | Value::List(_) => {
                Err(self.list_mismatch(field, items[0].kind_name()))
            }
        }
    }

    fn check_list_prim(&self, field: &Field, prim: Prim) -> Result<()> {
        if field.accepts_many_prim(prim) {
            Ok(())
        } else {
            Err(self.list_mismatch(field, prim.to_string()))
        }
    }

    fn type_mismatch(&self, field: &Field, found: String) -> SendlibError {
        SendlibError::WrongType {
            found,
            field: field.name().to_string(),
            spec: field.spec().to_string(),
        }
    }

    fn list_mismatch(&self, field: &Field, found: String) -> SendlibError {
        SendlibError::ListTypeMismatch {
            found,
            field: field.name().to_string(),
            spec: field.spec().to_string(),
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let message = self.message;
        trace!(
            "writing header for message ({}, {})",
            message.name,
            message.version
        );
        wire::write_u8(&mut self.stream, Kind::Message.tag())?;
        self.write_str(message.name.as_str())?;
        self.write_int(message.version)
    }

    fn write_str(&mut self, value: &str) -> Result<()> {
        let length = wire::checked_len(value.len() as u64)?;
        wire::write_u8(&mut self.stream, Kind::Str.tag())?;
        wire::write_u32(&mut self.stream, length)?;
        self.stream.write_all(value.as_bytes())?;
        Ok(())
    }

    fn write_int(&mut self, value: u32) -> Result<()> {
        wire::write_u8(&mut self.stream, Kind::Int.tag())?;
        wire::write_u32(&mut self.stream, value)
    }

    fn write_float(&mut self, value: f64) -> Result<()> {
        wire::write_u8(&mut self.stream, Kind::Float.tag())?;
        wire::write_f64(&mut self.stream, value)
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        wire::write_u8(&mut self.stream, Kind::Bool.tag())?;
        wire::write_u8(&mut self.stream, if value { b't' } else { b'f' })
    }

    fn write_nil(&mut self) -> Result<()> {
        wire::write_u8(&mut self.stream, Kind::Nil.tag())
    }

    /// Measure the source, emit the length prefix, then stream the bytes
    /// across in bounded chunks.
    fn write_data(&mut self, source: &mut dyn BlobSource) -> Result<()> {
        let length = wire::checked_len(source.len()?)?;
        wire::write_u8(&mut self.stream, Kind::Data.tag())?;
        wire::write_u32(&mut self.stream, length)?;

        let length = u64::from(length);
        let mut chunk = vec![0u8; min(DATA_CHUNK_SIZE as u64, length) as usize];
        let mut sofar: u64 = 0;
        while sofar < length {
            let want = min(chunk.len() as u64, length - sofar) as usize;
            let got = source.read(&mut chunk[..want])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "data source ended before its reported length",
                )
                .into());
            }
            self.stream.write_all(&chunk[..got])?;
            sofar += got as u64;
        }
        Ok(())
    }

    fn lookup_def(&self, name: &str, version: u32) -> Result<&'a MessageDef> {
        self.registry
            .def(name, version)
            .ok_or_else(|| SendlibError::NotFound {
                name: name.to_string(),
                version,
            })
    }

    fn write_value<'w>(
        &'w mut self,
        field: &'a Field,
        value: Value<'_>,
    ) -> Result<WriteOutcome<'a, 'w, W>> {
        match value {
            Value::Str(s) => self.write_str(s)?,
            Value::Int(i) => self.write_int(i)?,
            Value::Float(f) => self.write_float(f)?,
            Value::Bool(b) => self.write_bool(b)?,
            Value::Nil => self.write_nil()?,
            Value::Data(source) => self.write_data(source)?,
            Value::Msg(name, version) => {
                let def = self.lookup_def(name, version)?;
                return Ok(WriteOutcome::Nested(Writer::new(
                    self.registry,
                    def,
                    &mut self.stream,
                )));
            }
            Value::AnyMsg => {
                // validation guaranteed exactly one message alternative
                let id = match field.msg_refs().next() {
                    Some(id) => id,
                    None => return Err(self.type_mismatch(field, "msg".to_string())),
                };
                let def = self.lookup_def(id.name.as_str(), id.version)?;
                return Ok(WriteOutcome::Nested(Writer::new(
                    self.registry,
                    def,
                    &mut self.stream,
                )));
            }
            Value::List(items) => return self.write_list(field, items),
        }
        Ok(WriteOutcome::Done)
    }

    fn write_list<'w>(
        &'w mut self,
        field: &'a Field,
        items: Vec<Value<'_>>,
    ) -> Result<WriteOutcome<'a, 'w, W>> {
        let count = wire::checked_len(items.len() as u64)?;
        wire::write_u8(&mut self.stream, Kind::List.tag())?;
        wire::write_u32(&mut self.stream, count)?;

        if let Some(Value::Msg(name, version)) = items.first() {
            let def = self.lookup_def(name, *version)?;
            return Ok(WriteOutcome::NestedList(NestedListWriter {
                registry: self.registry,
                message: def,
                stream: &mut self.stream,
                remaining: count,
            }));
        }

        for item in items {
            match item {
                Value::Str(s) => self.write_str(s)?,
                Value::Int(i) => self.write_int(i)?,
                Value::Float(f) => self.write_float(f)?,
                Value::Bool(b) => self.write_bool(b)?,
                Value::Nil => self.write_nil()?,
                Value::Data(source) => self.write_data(source)?,
                other => return Err(self.list_mismatch(field, other.kind_name())),
            }
        }
        Ok(WriteOutcome::Done)
    }
}
