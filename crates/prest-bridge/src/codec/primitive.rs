//! Codecs for base types.

use std::io::{Read, Write};
use std::marker::PhantomData;

use super::{Codec, CodecError, Result};

/// Upper bound on speculative allocation for length-prefixed data.
///
/// A corrupted length prefix must not make us allocate gigabytes before we find
/// out the input is short.
const PREALLOC_LIMIT: usize = 64 * 1024;

fn read_byte(source: &mut dyn Read) -> Result<u8> {
    let mut byte = [0u8; 1];
    source.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Write `value` as a little-endian base-128 varint.
pub fn write_varint(sink: &mut dyn Write, mut value: u64) -> Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;

    while value >= 0x80 {
        buf[len] = 0x80 | (value & 0x7F) as u8;
        value >>= 7;
        len += 1;
    }

    buf[len] = value as u8;
    len += 1;

    sink.write_all(&buf[..len])?;
    Ok(())
}

/// Read a little-endian base-128 varint.
pub fn read_varint(source: &mut dyn Read) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = read_byte(source)?;
        let bits = u64::from(byte & 0x7F);

        if shift >= 64 || (shift == 63 && bits > 1) {
            return Err(CodecError::Overflow);
        }

        value |= bits << shift;

        if byte < 0x80 {
            return Ok(value);
        }

        shift += 7;
    }
}

pub fn write_len(sink: &mut dyn Write, len: usize) -> Result<()> {
    write_varint(sink, len as u64)
}

pub fn read_len(source: &mut dyn Read) -> Result<usize> {
    let len = read_varint(source)?;
    usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))
}

fn read_exact_vec(source: &mut dyn Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    (&mut *source).take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(CodecError::Eof);
    }
    Ok(buf)
}

/// Unsigned integer as a varint.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintCodec;

impl Codec for VarintCodec {
    type Value = u64;

    fn encode(&self, sink: &mut dyn Write, value: &u64) -> Result<()> {
        write_varint(sink, *value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<u64> {
        read_varint(source)
    }
}

/// Signed integer carried as a varint; negative values are rejected before
/// anything is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntCodec;

impl Codec for IntCodec {
    type Value = i64;

    fn encode(&self, sink: &mut dyn Write, value: &i64) -> Result<()> {
        let unsigned = u64::try_from(*value).map_err(|_| CodecError::NegativeInteger(*value))?;
        write_varint(sink, unsigned)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<i64> {
        let value = read_varint(source)?;
        i64::try_from(value).map_err(|_| CodecError::Overflow)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct F32Codec;

impl Codec for F32Codec {
    type Value = f32;

    fn encode(&self, sink: &mut dyn Write, value: &f32) -> Result<()> {
        sink.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<f32> {
        let mut buf = [0u8; 4];
        source.read_exact(&mut buf)?;
        Ok(f32::from_ne_bytes(buf))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct F64Codec;

impl Codec for F64Codec {
    type Value = f64;

    fn encode(&self, sink: &mut dyn Write, value: &f64) -> Result<()> {
        sink.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<f64> {
        let mut buf = [0u8; 8];
        source.read_exact(&mut buf)?;
        Ok(f64::from_ne_bytes(buf))
    }
}

/// Length-prefixed raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Vec<u8>;

    fn encode(&self, sink: &mut dyn Write, value: &Vec<u8>) -> Result<()> {
        write_len(sink, value.len())?;
        sink.write_all(value)?;
        Ok(())
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Vec<u8>> {
        let len = read_len(source)?;
        read_exact_vec(source, len)
    }
}

/// UTF-8 string inside the byte-buffer encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrCodec;

impl StrCodec {
    /// Encode a borrowed string without building a `String` first.
    pub fn encode_str(&self, sink: &mut dyn Write, value: &str) -> Result<()> {
        write_len(sink, value.len())?;
        sink.write_all(value.as_bytes())?;
        Ok(())
    }
}

impl Codec for StrCodec {
    type Value = String;

    fn encode(&self, sink: &mut dyn Write, value: &String) -> Result<()> {
        self.encode_str(sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<String> {
        let bytes = BytesCodec.decode(source)?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    type Value = bool;

    fn encode(&self, sink: &mut dyn Write, value: &bool) -> Result<()> {
        write_varint(sink, u64::from(*value))
    }

    fn decode(&self, source: &mut dyn Read) -> Result<bool> {
        match read_varint(source)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

/// Zero-width codec for payload-less variants.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitCodec;

impl Codec for UnitCodec {
    type Value = ();

    fn encode(&self, _sink: &mut dyn Write, _value: &()) -> Result<()> {
        Ok(())
    }

    fn decode(&self, _source: &mut dyn Read) -> Result<()> {
        Ok(())
    }
}

/// Non-negative rational number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Fraction {
    pub fn new(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 {
            return Err(CodecError::ZeroDenominator);
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn to_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

/// Numerator varint followed by denominator varint.
#[derive(Debug, Clone, Copy, Default)]
pub struct FractionCodec;

impl Codec for FractionCodec {
    type Value = Fraction;

    fn encode(&self, sink: &mut dyn Write, value: &Fraction) -> Result<()> {
        if value.denominator == 0 {
            return Err(CodecError::ZeroDenominator);
        }
        write_varint(sink, value.numerator)?;
        write_varint(sink, value.denominator)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<Fraction> {
        let numerator = read_varint(source)?;
        let denominator = read_varint(source)?;
        Fraction::new(numerator, denominator)
    }
}

/// Fixed-width numeric element stored in native byte order.
pub trait Element: Copy + Send + Sync + 'static {
    const WIDTH: usize;

    fn write_ne(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `WIDTH` long.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_ne(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn read_ne(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(buf)
                }
            }
        )*
    };
}

impl_element!(f32, f64, u32, i32);

/// Dense n-dimensional array of numbers, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray<E> {
    shape: Vec<u64>,
    data: Vec<E>,
}

impl<E: Element> NumericArray<E> {
    pub fn new(shape: Vec<u64>, data: Vec<E>) -> Result<Self> {
        check_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    /// One-dimensional array over `data`.
    pub fn from_vec(data: Vec<E>) -> Self {
        Self {
            shape: vec![data.len() as u64],
            data,
        }
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn check_shape(shape: &[u64], len: usize) -> Result<()> {
    let expected = shape
        .iter()
        .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
        .ok_or(CodecError::Overflow)?;

    if expected != len as u64 {
        return Err(CodecError::ShapeMismatch {
            shape: shape.to_vec(),
            len,
        });
    }
    Ok(())
}

/// Shape as a varint sequence, then the raw element bytes as a byte buffer.
pub struct ArrayCodec<E> {
    _element: PhantomData<fn() -> E>,
}

impl<E> ArrayCodec<E> {
    pub const fn new() -> Self {
        Self {
            _element: PhantomData,
        }
    }
}

impl<E> Default for ArrayCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Element> Codec for ArrayCodec<E> {
    type Value = NumericArray<E>;

    fn encode(&self, sink: &mut dyn Write, value: &NumericArray<E>) -> Result<()> {
        check_shape(&value.shape, value.data.len())?;

        write_len(sink, value.shape.len())?;
        for &dim in &value.shape {
            write_varint(sink, dim)?;
        }

        let mut raw = Vec::with_capacity(value.data.len() * E::WIDTH);
        for &x in &value.data {
            x.write_ne(&mut raw);
        }
        BytesCodec.encode(sink, &raw)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<NumericArray<E>> {
        let rank = read_len(source)?;
        let mut shape = Vec::with_capacity(rank.min(PREALLOC_LIMIT));
        for _ in 0..rank {
            shape.push(read_varint(source)?);
        }

        let raw = BytesCodec.decode(source)?;
        if raw.len() % E::WIDTH != 0 {
            return Err(CodecError::ShapeMismatch {
                shape,
                len: raw.len() / E::WIDTH,
            });
        }

        let data: Vec<E> = raw.chunks_exact(E::WIDTH).map(E::read_ne).collect();
        NumericArray::new(shape, data)
    }
}
