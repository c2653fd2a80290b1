//! Composable binary codecs.
//!
//! A [`Codec`] pairs an encoder and a decoder for one data shape. Codecs are
//! stateless values: build them once and share them freely, only the sink or
//! source handed to each call is mutable.
//!
//! - **primitive**: varints, floats, byte buffers, strings, booleans, fractions, arrays
//! - **combinator**: sequences, sets, maps, optionals, tuples, records, packed values
//! - **union**: integer-tagged and typename-tagged sum types
//! - **progress**: wrappers that report one step per unit of work

mod combinator;
mod error;
mod primitive;
mod progress;
mod union;

use std::io::{Read, Write};

pub use combinator::{
    MapOf, Mapped, OptionalOf, Packed, Record, RecordOf, SequenceOf, SetOf, Tuple, map_of, mapped,
    optional_of, packed, record_of, sequence_of, set_of,
};
pub use error::{CodecError, Result};
pub use primitive::{
    ArrayCodec, BoolCodec, BytesCodec, Element, F32Codec, F64Codec, Fraction, FractionCodec,
    IntCodec, NumericArray, StrCodec, UnitCodec, VarintCodec, read_len, read_varint, write_len,
    write_varint,
};
pub use progress::{
    ProgressCodec, ProgressError, SequenceWithProgress, TypenameUnionWithProgress,
    TypenameUnionWithProgressBuilder, WithProgress, sequence_with_progress, with_progress,
};
pub use union::{TaggedUnion, TaggedUnionBuilder, TypenameUnion, TypenameUnionBuilder};

/// Paired encode/decode operations for values of type [`Codec::Value`].
///
/// Every codec must satisfy `decode(encode(x)) == x` for all values in its domain.
pub trait Codec: Send + Sync {
    type Value;

    fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()>;

    fn decode(&self, source: &mut dyn Read) -> Result<Self::Value>;

    fn encode_to_vec(&self, value: &Self::Value) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf, value)?;
        Ok(buf)
    }

    fn decode_from_slice(&self, bytes: &[u8]) -> Result<Self::Value> {
        let mut source = bytes;
        self.decode(&mut source)
    }
}

impl<C: Codec + ?Sized> Codec for &C {
    type Value = C::Value;

    fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()> {
        (**self).encode(sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Self::Value> {
        (**self).decode(source)
    }
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    type Value = C::Value;

    fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()> {
        (**self).encode(sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Self::Value> {
        (**self).decode(source)
    }
}

impl<C: Codec + ?Sized> Codec for std::sync::Arc<C> {
    type Value = C::Value;

    fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()> {
        (**self).encode(sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Self::Value> {
        (**self).decode(source)
    }
}
