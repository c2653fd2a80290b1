//! Sum types on the wire: a discriminator followed by the variant's payload.
//!
//! [`TaggedUnion`] discriminates by small integer tag, [`TypenameUnion`] by a
//! class name string. Variants are registered through a builder; each one pairs
//! a payload codec with a `wrap` function (payload into the enum) and an
//! `unwrap` function (enum into payload, `None` for other variants).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io::{Read, Write};

use super::primitive::{StrCodec, VarintCodec};
use super::{Codec, CodecError, Result};

trait Variant<T>: Send + Sync {
    fn matches(&self, value: &T) -> bool;

    fn encode_payload(&self, union: &'static str, sink: &mut dyn Write, value: &T) -> Result<()>;

    fn decode_payload(&self, source: &mut dyn Read) -> Result<T>;
}

struct Case<C, W, U> {
    codec: C,
    wrap: W,
    unwrap: U,
}

impl<T, C, W, U> Variant<T> for Case<C, W, U>
where
    C: Codec,
    W: Fn(C::Value) -> T + Send + Sync,
    U: for<'a> Fn(&'a T) -> Option<&'a C::Value> + Send + Sync,
{
    fn matches(&self, value: &T) -> bool {
        (self.unwrap)(value).is_some()
    }

    fn encode_payload(&self, union: &'static str, sink: &mut dyn Write, value: &T) -> Result<()> {
        match (self.unwrap)(value) {
            Some(payload) => self.codec.encode(sink, payload),
            None => Err(CodecError::UnregisteredVariant { union }),
        }
    }

    fn decode_payload(&self, source: &mut dyn Read) -> Result<T> {
        Ok((self.wrap)(self.codec.decode(source)?))
    }
}

/// Registered variants keyed by discriminator.
pub(super) struct Registry<K, V: ?Sized> {
    pub(super) name: &'static str,
    cases: Vec<(K, Box<V>)>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash, V: ?Sized> Registry<K, V> {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            cases: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Returns `false` if `key` was already registered.
    pub(super) fn insert(&mut self, key: K, case: Box<V>) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.cases.len());
        self.cases.push((key, case));
        true
    }

    /// First variant accepted by `matches`, in registration order.
    pub(super) fn find(&self, matches: impl Fn(&V) -> bool) -> Result<(K, &V)> {
        self.cases
            .iter()
            .find(|(_, case)| matches(&**case))
            .map(|(key, case)| (*key, &**case))
            .ok_or(CodecError::UnregisteredVariant { union: self.name })
    }

    pub(super) fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).map(|&i| &*self.cases[i].1)
    }
}

impl<K: fmt::Debug, V: ?Sized> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.name)
            .field("variants", &self.cases.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

/// Union discriminated by an integer tag, written as a varint.
#[derive(Debug)]
pub struct TaggedUnion<T> {
    registry: Registry<u64, dyn Variant<T>>,
}

impl<T: 'static> TaggedUnion<T> {
    pub fn builder(name: &'static str) -> TaggedUnionBuilder<T> {
        TaggedUnionBuilder {
            registry: Registry::new(name),
            error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.registry.name
    }
}

pub struct TaggedUnionBuilder<T> {
    registry: Registry<u64, dyn Variant<T>>,
    error: Option<CodecError>,
}

impl<T: 'static> TaggedUnionBuilder<T> {
    /// Register a variant under `tag`. A repeated tag fails [`build`](Self::build).
    pub fn variant<C, W, U>(mut self, tag: u64, codec: C, wrap: W, unwrap: U) -> Self
    where
        C: Codec + 'static,
        W: Fn(C::Value) -> T + Send + Sync + 'static,
        U: for<'a> Fn(&'a T) -> Option<&'a C::Value> + Send + Sync + 'static,
    {
        let case = Box::new(Case { codec, wrap, unwrap });
        if !self.registry.insert(tag, case) && self.error.is_none() {
            self.error = Some(CodecError::DuplicateTag {
                union: self.registry.name,
                tag,
            });
        }
        self
    }

    pub fn build(self) -> Result<TaggedUnion<T>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(TaggedUnion {
                registry: self.registry,
            }),
        }
    }
}

impl<T> Codec for TaggedUnion<T> {
    type Value = T;

    fn encode(&self, sink: &mut dyn Write, value: &T) -> Result<()> {
        let (tag, case) = self.registry.find(|case| case.matches(value))?;
        VarintCodec.encode(sink, &tag)?;
        case.encode_payload(self.registry.name, sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<T> {
        let tag = VarintCodec.decode(source)?;
        let case = self.registry.get(&tag).ok_or(CodecError::UnknownTag {
            union: self.registry.name,
            tag,
        })?;
        case.decode_payload(source)
    }
}

/// Union discriminated by a class name, written as a string.
#[derive(Debug)]
pub struct TypenameUnion<T> {
    registry: Registry<&'static str, dyn Variant<T>>,
}

impl<T: 'static> TypenameUnion<T> {
    pub fn builder(name: &'static str) -> TypenameUnionBuilder<T> {
        TypenameUnionBuilder {
            registry: Registry::new(name),
            error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.registry.name
    }
}

pub struct TypenameUnionBuilder<T> {
    registry: Registry<&'static str, dyn Variant<T>>,
    error: Option<CodecError>,
}

impl<T: 'static> TypenameUnionBuilder<T> {
    /// Register a variant under class name `typename`.
    pub fn variant<C, W, U>(mut self, typename: &'static str, codec: C, wrap: W, unwrap: U) -> Self
    where
        C: Codec + 'static,
        W: Fn(C::Value) -> T + Send + Sync + 'static,
        U: for<'a> Fn(&'a T) -> Option<&'a C::Value> + Send + Sync + 'static,
    {
        let case = Box::new(Case { codec, wrap, unwrap });
        if !self.registry.insert(typename, case) && self.error.is_none() {
            self.error = Some(CodecError::DuplicateTypename {
                union: self.registry.name,
                name: typename,
            });
        }
        self
    }

    pub fn build(self) -> Result<TypenameUnion<T>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(TypenameUnion {
                registry: self.registry,
            }),
        }
    }
}

impl<T> Codec for TypenameUnion<T> {
    type Value = T;

    fn encode(&self, sink: &mut dyn Write, value: &T) -> Result<()> {
        let (typename, case) = self.registry.find(|case| case.matches(value))?;
        StrCodec.encode_str(sink, typename)?;
        case.encode_payload(self.registry.name, sink, value)
    }

    fn decode(&self, source: &mut dyn Read) -> Result<T> {
        let typename = StrCodec.decode(source)?;
        let case = self
            .registry
            .get(typename.as_str())
            .ok_or_else(|| CodecError::UnknownTypename {
                union: self.registry.name,
                name: typename.clone(),
            })?;
        case.decode_payload(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BytesCodec, Record, UnitCodec, record_of, sequence_of};
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Shape {
        Dot,
        Circle(u64),
        Label(String),
        Path(Vec<u64>),
        Rect(Rect),
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Rect {
        width: u64,
        height: u64,
        fill: String,
    }

    impl Record for Rect {
        const NAME: &'static str = "Rect";
        const FIELDS: &'static [&'static str] = &["width", "height", "fill"];

        type Fields = (u64, u64, String);

        fn from_fields((width, height, fill): Self::Fields) -> Self {
            Self {
                width,
                height,
                fill,
            }
        }

        fn to_fields(&self) -> Self::Fields {
            (self.width, self.height, self.fill.clone())
        }
    }

    fn tagged() -> TaggedUnion<Shape> {
        TaggedUnion::<Shape>::builder("Shape")
            .variant(0, UnitCodec, |()| Shape::Dot, |s| {
                matches!(s, Shape::Dot).then_some(&())
            })
            .variant(1, VarintCodec, Shape::Circle, |s| match s {
                Shape::Circle(r) => Some(r),
                _ => None,
            })
            .variant(2, StrCodec, Shape::Label, |s| match s {
                Shape::Label(l) => Some(l),
                _ => None,
            })
            .variant(3, sequence_of(VarintCodec), Shape::Path, |s| match s {
                Shape::Path(p) => Some(p),
                _ => None,
            })
            .variant(
                4,
                record_of::<Rect, _>((VarintCodec, VarintCodec, StrCodec)).unwrap(),
                Shape::Rect,
                |s| match s {
                    Shape::Rect(r) => Some(r),
                    _ => None,
                },
            )
            .build()
            .unwrap()
    }

    fn by_typename() -> TypenameUnion<Shape> {
        TypenameUnion::<Shape>::builder("Shape")
            .variant("Dot", UnitCodec, |()| Shape::Dot, |s| {
                matches!(s, Shape::Dot).then_some(&())
            })
            .variant("Circle", VarintCodec, Shape::Circle, |s| match s {
                Shape::Circle(r) => Some(r),
                _ => None,
            })
            .variant("Label", StrCodec, Shape::Label, |s| match s {
                Shape::Label(l) => Some(l),
                _ => None,
            })
            .variant("Path", sequence_of(VarintCodec), Shape::Path, |s| match s {
                Shape::Path(p) => Some(p),
                _ => None,
            })
            .variant(
                "Rect",
                record_of::<Rect, _>((VarintCodec, VarintCodec, StrCodec)).unwrap(),
                Shape::Rect,
                |s| match s {
                    Shape::Rect(r) => Some(r),
                    _ => None,
                },
            )
            .build()
            .unwrap()
    }

    fn shape() -> impl Strategy<Value = Shape> {
        prop_oneof![
            Just(Shape::Dot),
            any::<u64>().prop_map(Shape::Circle),
            any::<String>().prop_map(Shape::Label),
            proptest::collection::vec(any::<u64>(), 0..16).prop_map(Shape::Path),
            (any::<u64>(), any::<u64>(), any::<String>()).prop_map(|(width, height, fill)| {
                Shape::Rect(Rect {
                    width,
                    height,
                    fill,
                })
            }),
        ]
    }

    #[test]
    fn tag_precedes_payload() {
        let bytes = tagged().encode_to_vec(&Shape::Circle(5)).unwrap();
        assert_eq!(bytes, vec![1, 5]);
        let bytes = tagged().encode_to_vec(&Shape::Dot).unwrap();
        assert_eq!(bytes, vec![0]);
        let rect = Shape::Rect(Rect {
            width: 3,
            height: 200,
            fill: "red".into(),
        });
        let bytes = tagged().encode_to_vec(&rect).unwrap();
        assert_eq!(bytes, b"\x04\x03\xc8\x01\x03red");
    }

    #[test]
    fn typename_precedes_payload() {
        let bytes = by_typename().encode_to_vec(&Shape::Circle(5)).unwrap();
        assert_eq!(bytes, b"\x06Circle\x05");
    }

    #[test]
    fn unknown_tag() {
        let err = tagged().decode_from_slice(&[9]).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"cannot decode enum tag: Shape/9");
    }

    #[test]
    fn unknown_typename() {
        let err = by_typename().decode_from_slice(b"\x07Polygon").unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"cannot decode enum class: Shape/Polygon");
    }

    #[test]
    fn unregistered_variant_fails_encode() {
        let partial = TaggedUnion::<Shape>::builder("Shape")
            .variant(0, UnitCodec, |()| Shape::Dot, |s| {
                matches!(s, Shape::Dot).then_some(&())
            })
            .build()
            .unwrap();
        let mut sink = Vec::new();
        let err = partial
            .encode(&mut sink, &Shape::Circle(1))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredVariant { union: "Shape" }));
        assert!(sink.is_empty());
    }

    #[test]
    fn duplicate_tag_fails_build() {
        let err = TaggedUnion::<Vec<u8>>::builder("Blob")
            .variant(0, BytesCodec, |b| b, |b| Some(b))
            .variant(0, BytesCodec, |b| b, |b| Some(b))
            .build()
            .unwrap_err();
        assert!(matches!(err, CodecError::DuplicateTag { union: "Blob", tag: 0 }));
    }

    #[test]
    fn duplicate_typename_fails_build() {
        let err = TypenameUnion::<Vec<u8>>::builder("Blob")
            .variant("Raw", BytesCodec, |b| b, |b| Some(b))
            .variant("Raw", BytesCodec, |b| b, |b| Some(b))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::DuplicateTypename {
                union: "Blob",
                name: "Raw"
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_tagged_roundtrip(value in shape()) {
            let codec = tagged();
            let bytes = codec.encode_to_vec(&value).unwrap();
            prop_assert_eq!(codec.decode_from_slice(&bytes).unwrap(), value);
        }

        #[test]
        fn prop_typename_roundtrip(value in shape()) {
            let codec = by_typename();
            let bytes = codec.encode_to_vec(&value).unwrap();
            prop_assert_eq!(codec.decode_from_slice(&bytes).unwrap(), value);
        }
    }
}
