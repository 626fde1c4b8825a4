//! ## Sendlib Message Format
//!
//! This crate implements a schema-driven binary message codec. A schema is a
//! short piece of text declaring one or more *messages*, each identified by a
//! `(name, version)` pair and carrying an ordered list of typed *fields*:
//!
//! ```text
//! # a comment runs to the end of the line
//! (auth, 1):
//!   - username: str
//!   - password: str
//!   - token: str or nil
//!
//! (upload, 1):
//!   - credentials: msg (auth, 1)
//!   - tags: many str
//!   - payload: data
//! ```
//!
//! Field types are drawn from the primitives `str`, `int`, `float`, `bool`,
//! `data` and `nil`, nested message references `msg(name, version)`, and
//! homogeneous lists `many <type>`. Alternatives are separated with `or`.
//!
//! On the wire, every value is a single ASCII tag byte followed by a
//! type-specific payload. Integers are unsigned 32-bit big-endian, floats are
//! IEEE-754 doubles in big-endian order, and string/blob lengths are bare
//! 4-byte big-endian counts. A complete message looks like:
//!
//! ```text
//! +---+------------------+------------+---------+-----+---------+
//! | M | S <len> <name>   | I <ver>    | field 1 | ... | field n |
//! +---+------------------+------------+---------+-----+---------+
//! ```
//!
//! There is no terminator; the schema determines where a message ends.
//!
//! [`parse`] turns schema text into a [`Registry`]. Looking up a
//! [`Message`] in the registry yields per-instance [`Writer`]s and
//! [`Reader`]s bound to a byte stream. Both are strict state machines: the
//! writer enforces schema order and fills in nils for skipped optional
//! fields, while the reader validates the header and the tag of every field
//! it is asked for. `data` payloads are streamed in bounded chunks in both
//! directions, so multi-megabyte blobs never need to fit in memory.

pub mod blob;
pub mod error;
pub mod reader;
pub mod schema;
pub mod writer;

mod wire;

pub use crate::blob::Blob;
pub use crate::error::{ParseError, SendlibError};
pub use crate::reader::{Datum, NestedListReader, ReadOutcome, Reader};
pub use crate::schema::{
    parse, parse_reader, Elem, Field, Message, MessageId, Prim, Registry, TypeAlt,
};
pub use crate::writer::{BlobSource, NestedListWriter, Value, WriteOutcome, Writer};

use smallstr::SmallString;

/// Message and field names are short in practice; keep them inline when they
/// fit in 16 bytes.
const INLINE_NAME_LENGTH: usize = 16;
pub type FlexString = SmallString<[u8; INLINE_NAME_LENGTH]>;

/// Crate's Result type.
pub type Result<T> = std::result::Result<T, SendlibError>;
