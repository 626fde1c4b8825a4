use thiserror::Error;

/// Violations of the schema text grammar. Line numbers are 1-based.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("field definition outside of a message at line {line}")]
    OrphanField { line: usize },

    #[error("duplicate message ({name}, {version}) at line {line}")]
    DuplicateMessage {
        name: String,
        version: u32,
        line: usize,
    },

    #[error("duplicate field name \"{name}\" at line {line}")]
    DuplicateField { name: String, line: usize },

    #[error("unknown field type \"{keyword}\" at line {line}")]
    UnknownType { keyword: String, line: usize },

    #[error("message version \"{version}\" at line {line} does not fit an unsigned 32-bit integer")]
    InvalidVersion { version: String, line: usize },

    #[error("unknown referenced message ({name}, {version})")]
    UnresolvedMessage { name: String, version: u32 },
}

#[derive(Error, Debug)]
pub enum SendlibError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no message ({name}, {version}) in the registry")]
    NotFound { name: String, version: u32 },

    #[error("attempting to access field \"{requested}\", but should be \"{expected}\"")]
    WrongField { requested: String, expected: String },

    #[error("type {found} does not match field \"{field}\" spec \"{spec}\"")]
    WrongType {
        found: String,
        field: String,
        spec: String,
    },

    #[error("expected message {expected}, found ({name}, {version})")]
    WrongMessage {
        expected: String,
        name: String,
        version: u32,
    },

    #[error("unknown field prefix {0:#04x}")]
    BadPrefix(u8),

    #[error("invalid message header")]
    BadHeader,

    #[error("attempt to access past the end of the message")]
    PastEnd,

    #[error("length of {0} bytes does not fit an unsigned 32-bit integer")]
    DataTooLarge(u64),

    #[error("list elements of type {found} do not match field \"{field}\" spec \"{spec}\"")]
    ListTypeMismatch {
        found: String,
        field: String,
        spec: String,
    },

    #[error("more than one message type is valid for field \"{field}\"")]
    AmbiguousMessage { field: String },

    #[error("cannot read the next field, {remaining} bytes of a data blob are still unconsumed")]
    BlobNotConsumed { remaining: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in a string payload")]
    Utf8(#[from] std::string::FromUtf8Error),
}
