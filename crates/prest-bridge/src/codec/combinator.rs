//! Codecs built from other codecs.

use std::hash::Hash;
use std::io::{Read, Write};
use std::marker::PhantomData;

use indexmap::{IndexMap, IndexSet};

use super::primitive::{BoolCodec, BytesCodec, read_len, write_len};
use super::{Codec, CodecError, Result};

/// Upper bound on speculative `Vec` reservation from a decoded count.
const PREALLOC_LIMIT: usize = 4096;

/// Count, then each element in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceOf<C>(pub C);

pub const fn sequence_of<C: Codec>(codec: C) -> SequenceOf<C> {
    SequenceOf(codec)
}

impl<C: Codec> Codec for SequenceOf<C> {
    type Value = Vec<C::Value>;

    fn encode(&self, sink: &mut dyn Write, value: &Vec<C::Value>) -> Result<()> {
        write_len(sink, value.len())?;
        for item in value {
            self.0.encode(sink, item)?;
        }
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Vec<C::Value>> {
        let len = read_len(source)?;
        let mut items = Vec::with_capacity(len.min(PREALLOC_LIMIT));
        for _ in 0..len {
            items.push(self.0.decode(source)?);
        }
        Ok(items)
    }
}

/// Same wire form as a sequence; decoding deduplicates.
///
/// Elements are written in insertion order, so a set decoded from duplicate-free
/// input re-encodes to identical bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOf<C>(pub C);

pub const fn set_of<C: Codec>(codec: C) -> SetOf<C> {
    SetOf(codec)
}

impl<C> Codec for SetOf<C>
where
    C: Codec,
    C::Value: Hash + Eq,
{
    type Value = IndexSet<C::Value>;

    fn encode(&self, sink: &mut dyn Write, value: &IndexSet<C::Value>) -> Result<()> {
        write_len(sink, value.len())?;
        for item in value {
            self.0.encode(sink, item)?;
        }
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<IndexSet<C::Value>> {
        let len = read_len(source)?;
        let mut items = IndexSet::with_capacity(len.min(PREALLOC_LIMIT));
        for _ in 0..len {
            items.insert(self.0.decode(source)?);
        }
        Ok(items)
    }
}

/// Sequence of `(key, value)` pairs; a repeated key keeps the last value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapOf<K, V>(pub K, pub V);

pub const fn map_of<K: Codec, V: Codec>(keys: K, values: V) -> MapOf<K, V> {
    MapOf(keys, values)
}

impl<K, V> Codec for MapOf<K, V>
where
    K: Codec,
    K::Value: Hash + Eq,
    V: Codec,
{
    type Value = IndexMap<K::Value, V::Value>;

    fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()> {
        write_len(sink, value.len())?;
        for (k, v) in value {
            self.0.encode(sink, k)?;
            self.1.encode(sink, v)?;
        }
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Self::Value> {
        let len = read_len(source)?;
        let mut map = IndexMap::with_capacity(len.min(PREALLOC_LIMIT));
        for _ in 0..len {
            let k = self.0.decode(source)?;
            let v = self.1.decode(source)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// Boolean presence flag, then the value if present.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalOf<C>(pub C);

pub const fn optional_of<C: Codec>(codec: C) -> OptionalOf<C> {
    OptionalOf(codec)
}

impl<C: Codec> Codec for OptionalOf<C> {
    type Value = Option<C::Value>;

    fn encode(&self, sink: &mut dyn Write, value: &Option<C::Value>) -> Result<()> {
        match value {
            Some(inner) => {
                BoolCodec.encode(sink, &true)?;
                self.0.encode(sink, inner)
            }
            None => BoolCodec.encode(sink, &false),
        }
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Option<C::Value>> {
        if BoolCodec.decode(source)? {
            Ok(Some(self.0.decode(source)?))
        } else {
            Ok(None)
        }
    }
}

/// A value encoded into its own length-prefixed byte buffer.
///
/// Lets a reader skip over the value, or keep it packed, without knowing its shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packed<C>(pub C);

pub const fn packed<C: Codec>(codec: C) -> Packed<C> {
    Packed(codec)
}

impl<C: Codec> Codec for Packed<C> {
    type Value = C::Value;

    fn encode(&self, sink: &mut dyn Write, value: &C::Value) -> Result<()> {
        let bytes = self.0.encode_to_vec(value)?;
        BytesCodec.encode(sink, &bytes)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<C::Value> {
        let bytes = BytesCodec.decode(source)?;
        let mut rest = bytes.as_slice();
        let value = self.0.decode(&mut rest)?;
        if !rest.is_empty() {
            return Err(CodecError::TrailingBytes(rest.len()));
        }
        Ok(value)
    }
}

/// Fixed-arity product codec. Tuples of codecs are themselves codecs, with no
/// tags or length prefixes between fields.
pub trait Tuple: Codec {
    const ARITY: usize;
}

macro_rules! impl_tuple {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Codec),+> Codec for ($($name,)+) {
            type Value = ($($name::Value,)+);

            fn encode(&self, sink: &mut dyn Write, value: &Self::Value) -> Result<()> {
                $( self.$idx.encode(sink, &value.$idx)?; )+
                Ok(())
            }

            fn decode(&self, source: &mut dyn Read) -> Result<Self::Value> {
                Ok(($( self.$idx.decode(source)?, )+))
            }
        }

        impl<$($name: Codec),+> Tuple for ($($name,)+) {
            const ARITY: usize = $arity;
        }
    };
}

impl_tuple!(1; A: 0);
impl_tuple!(2; A: 0, B: 1);
impl_tuple!(3; A: 0, B: 1, C: 2);
impl_tuple!(4; A: 0, B: 1, C: 2, D: 3);
impl_tuple!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_tuple!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_tuple!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// A struct with named fields that can be built from, and split into, a tuple.
pub trait Record: Sized {
    const NAME: &'static str;
    const FIELDS: &'static [&'static str];

    type Fields;

    fn from_fields(fields: Self::Fields) -> Self;

    fn to_fields(&self) -> Self::Fields;
}

/// Record codec: the fields' encodings concatenated in declared order.
pub struct RecordOf<T, C> {
    fields: C,
    _record: PhantomData<fn() -> T>,
}

/// Bind a tuple of field codecs to record type `T`.
///
/// Fails if the number of codecs differs from the number of declared fields.
pub fn record_of<T, C>(fields: C) -> Result<RecordOf<T, C>>
where
    T: Record,
    C: Tuple<Value = T::Fields>,
{
    if C::ARITY != T::FIELDS.len() {
        return Err(CodecError::FieldCount {
            record: T::NAME,
            codecs: C::ARITY,
            fields: T::FIELDS.len(),
        });
    }
    Ok(RecordOf {
        fields,
        _record: PhantomData,
    })
}

impl<T, C> Codec for RecordOf<T, C>
where
    T: Record,
    C: Tuple<Value = T::Fields>,
{
    type Value = T;

    fn encode(&self, sink: &mut dyn Write, value: &T) -> Result<()> {
        self.fields.encode(sink, &value.to_fields())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<T> {
        Ok(T::from_fields(self.fields.decode(source)?))
    }
}

/// Codec for a newtype, going through conversion functions.
pub struct Mapped<C: Codec, T> {
    inner: C,
    into: fn(C::Value) -> T,
    from: fn(&T) -> C::Value,
}

pub fn mapped<C: Codec, T>(
    inner: C,
    into: fn(C::Value) -> T,
    from: fn(&T) -> C::Value,
) -> Mapped<C, T> {
    Mapped { inner, into, from }
}

impl<C: Codec, T> Codec for Mapped<C, T> {
    type Value = T;

    fn encode(&self, sink: &mut dyn Write, value: &T) -> Result<()> {
        self.inner.encode(sink, &(self.from)(value))
    }

    fn decode(&self, source: &mut dyn Read) -> Result<T> {
        Ok((self.into)(self.inner.decode(source)?))
    }
}
