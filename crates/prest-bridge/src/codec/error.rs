use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Failure of a local encode/decode operation.
///
/// `Eof` is kept apart from everything else: running out of input usually means
/// the peer went away, while the remaining variants mean the bytes were there but
/// did not fit the expected shape.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    Eof,

    #[error("invalid int: {0}")]
    NegativeInteger(i64),

    #[error("varint does not fit in 64 bits")]
    Overflow,

    #[error("length {0} does not fit in memory")]
    LengthOverflow(u64),

    #[error("invalid bool code: {0}")]
    InvalidBool(u64),

    #[error("invalid UTF-8 in string: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("fraction with zero denominator")]
    ZeroDenominator,

    #[error("array shape {shape:?} does not match {len} elements")]
    ShapeMismatch { shape: Vec<u64>, len: usize },

    #[error("{0} trailing bytes after packed value")]
    TrailingBytes(usize),

    #[error("cannot decode enum tag: {union}/{tag}")]
    UnknownTag { union: &'static str, tag: u64 },

    #[error("cannot decode enum class: {union}/{name}")]
    UnknownTypename { union: &'static str, name: String },

    #[error("cannot encode {union}: value has no registered variant")]
    UnregisteredVariant { union: &'static str },

    #[error("{union}: tag {tag} registered twice")]
    DuplicateTag { union: &'static str, tag: u64 },

    #[error("{union}: class {name} registered twice")]
    DuplicateTypename { union: &'static str, name: &'static str },

    #[error("{record}: {codecs} codecs provided for {fields} fields")]
    FieldCount {
        record: &'static str,
        codecs: usize,
        fields: usize,
    },

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl CodecError {
    /// Input ran out before a value was complete.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// The underlying stream failed or closed (EOF, broken pipe, ...).
    ///
    /// Everything else is a malformed-data condition.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Eof | Self::Io(_))
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Eof
        } else {
            Self::Io(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_eof_maps_to_eof() {
        let err = CodecError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(err.is_eof());
        assert!(err.is_disconnect());
    }

    #[test]
    fn broken_pipe_is_disconnect_but_not_eof() {
        let err = CodecError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_eof());
        assert!(err.is_disconnect());
    }

    #[test]
    fn unknown_tag_names_union_and_tag() {
        let err = CodecError::UnknownTag {
            union: "Message",
            tag: 7,
        };
        insta::assert_snapshot!(err.to_string(), @"cannot decode enum tag: Message/7");
    }

    #[test]
    fn field_count_message() {
        let err = CodecError::FieldCount {
            record: "ChoiceRow",
            codecs: 2,
            fields: 3,
        };
        insta::assert_snapshot!(err.to_string(), @"ChoiceRow: 2 codecs provided for 3 fields");
    }
}
