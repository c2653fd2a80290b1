//! Codecs that report progress while they work.
//!
//! A [`ProgressCodec`] knows up front how many steps encoding a value will take
//! (`size`) and calls [`Step::step`] exactly that many times. A cancelled step
//! aborts the operation immediately.

use std::io::{Read, Write};

use thiserror::Error;

use super::primitive::{StrCodec, read_len, write_len};
use super::union::Registry;
use super::{Codec, CodecError};
use crate::progress::{Cancelled, Step};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub trait ProgressCodec: Send + Sync {
    type Value;

    /// Number of steps `encode` will perform for `value`.
    fn size(&self, value: &Self::Value) -> u64;

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &Self::Value,
    ) -> Result<(), ProgressError>;

    fn decode(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<Self::Value, ProgressError>;
}

impl<P: ProgressCodec + ?Sized> ProgressCodec for &P {
    type Value = P::Value;

    fn size(&self, value: &Self::Value) -> u64 {
        (**self).size(value)
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &Self::Value,
    ) -> Result<(), ProgressError> {
        (**self).encode(steps, sink, value)
    }

    fn decode(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<Self::Value, ProgressError> {
        (**self).decode(steps, source)
    }
}

/// Any codec as a single unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct WithProgress<C>(pub C);

pub const fn with_progress<C: Codec>(codec: C) -> WithProgress<C> {
    WithProgress(codec)
}

impl<C: Codec> ProgressCodec for WithProgress<C> {
    type Value = C::Value;

    fn size(&self, _value: &C::Value) -> u64 {
        1
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &C::Value,
    ) -> Result<(), ProgressError> {
        self.0.encode(sink, value)?;
        steps.step()?;
        Ok(())
    }

    fn decode(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<C::Value, ProgressError> {
        let value = self.0.decode(source)?;
        steps.step()?;
        Ok(value)
    }
}

/// Sequence whose size is the sum of its elements' sizes.
///
/// Writing the count is free; only elements step.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceWithProgress<P>(pub P);

pub const fn sequence_with_progress<P: ProgressCodec>(codec: P) -> SequenceWithProgress<P> {
    SequenceWithProgress(codec)
}

impl<P: ProgressCodec> ProgressCodec for SequenceWithProgress<P> {
    type Value = Vec<P::Value>;

    fn size(&self, value: &Vec<P::Value>) -> u64 {
        value.iter().map(|item| self.0.size(item)).sum()
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &Vec<P::Value>,
    ) -> Result<(), ProgressError> {
        write_len(sink, value.len())?;
        for item in value {
            self.0.encode(steps, sink, item)?;
        }
        Ok(())
    }

    fn decode(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<Vec<P::Value>, ProgressError> {
        let len = read_len(source)?;
        let mut items = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            items.push(self.0.decode(steps, source)?);
        }
        Ok(items)
    }
}

trait ProgressVariant<T>: Send + Sync {
    fn matches(&self, value: &T) -> bool;

    fn size(&self, value: &T) -> u64;

    fn encode_payload(
        &self,
        union: &'static str,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &T,
    ) -> Result<(), ProgressError>;

    fn decode_payload(&self, steps: &mut dyn Step, source: &mut dyn Read)
    -> Result<T, ProgressError>;
}

struct ProgressCase<P, W, U> {
    codec: P,
    wrap: W,
    unwrap: U,
}

impl<T, P, W, U> ProgressVariant<T> for ProgressCase<P, W, U>
where
    P: ProgressCodec,
    W: Fn(P::Value) -> T + Send + Sync,
    U: for<'a> Fn(&'a T) -> Option<&'a P::Value> + Send + Sync,
{
    fn matches(&self, value: &T) -> bool {
        (self.unwrap)(value).is_some()
    }

    fn size(&self, value: &T) -> u64 {
        (self.unwrap)(value).map_or(0, |payload| self.codec.size(payload))
    }

    fn encode_payload(
        &self,
        union: &'static str,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &T,
    ) -> Result<(), ProgressError> {
        match (self.unwrap)(value) {
            Some(payload) => self.codec.encode(steps, sink, payload),
            None => Err(CodecError::UnregisteredVariant { union }.into()),
        }
    }

    fn decode_payload(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<T, ProgressError> {
        Ok((self.wrap)(self.codec.decode(steps, source)?))
    }
}

/// Typename-tagged union whose variants are progress codecs.
///
/// Size, encode and decode dispatch to the variant; the class name itself costs
/// no steps.
#[derive(Debug)]
pub struct TypenameUnionWithProgress<T> {
    registry: Registry<&'static str, dyn ProgressVariant<T>>,
}

impl<T: 'static> TypenameUnionWithProgress<T> {
    pub fn builder(name: &'static str) -> TypenameUnionWithProgressBuilder<T> {
        TypenameUnionWithProgressBuilder {
            registry: Registry::new(name),
            error: None,
        }
    }
}

pub struct TypenameUnionWithProgressBuilder<T> {
    registry: Registry<&'static str, dyn ProgressVariant<T>>,
    error: Option<CodecError>,
}

impl<T: 'static> TypenameUnionWithProgressBuilder<T> {
    pub fn variant<P, W, U>(mut self, typename: &'static str, codec: P, wrap: W, unwrap: U) -> Self
    where
        P: ProgressCodec + 'static,
        W: Fn(P::Value) -> T + Send + Sync + 'static,
        U: for<'a> Fn(&'a T) -> Option<&'a P::Value> + Send + Sync + 'static,
    {
        let case = Box::new(ProgressCase { codec, wrap, unwrap });
        if !self.registry.insert(typename, case) && self.error.is_none() {
            self.error = Some(CodecError::DuplicateTypename {
                union: self.registry.name,
                name: typename,
            });
        }
        self
    }

    pub fn build(self) -> Result<TypenameUnionWithProgress<T>, CodecError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(TypenameUnionWithProgress {
                registry: self.registry,
            }),
        }
    }
}

impl<T> ProgressCodec for TypenameUnionWithProgress<T> {
    type Value = T;

    fn size(&self, value: &T) -> u64 {
        self.registry
            .find(|case| case.matches(value))
            .map_or(0, |(_, case)| case.size(value))
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &T,
    ) -> Result<(), ProgressError> {
        let (typename, case) = self.registry.find(|case| case.matches(value))?;
        StrCodec.encode_str(sink, typename)?;
        case.encode_payload(self.registry.name, steps, sink, value)
    }

    fn decode(&self, steps: &mut dyn Step, source: &mut dyn Read) -> Result<T, ProgressError> {
        let typename = StrCodec.decode(source)?;
        let Some(case) = self.registry.get(typename.as_str()) else {
            return Err(CodecError::UnknownTypename {
                union: self.registry.name,
                name: typename,
            }
            .into());
        };
        case.decode_payload(steps, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StrCodec, VarintCodec, sequence_of};
    use crate::progress::{CancellationToken, ProgressTracker};

    /// Counts steps and cancels itself after `limit` of them.
    #[derive(Default)]
    struct Counter {
        count: u64,
        limit: Option<u64>,
    }

    impl Step for Counter {
        fn step(&mut self) -> Result<(), Cancelled> {
            if self.limit.is_some_and(|limit| self.count >= limit) {
                return Err(Cancelled);
            }
            self.count += 1;
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Item {
        Words(Vec<Vec<String>>),
        Number(u64),
    }

    fn items() -> TypenameUnionWithProgress<Item> {
        TypenameUnionWithProgress::<Item>::builder("Item")
            .variant(
                "Words",
                sequence_with_progress(with_progress(sequence_of(StrCodec))),
                Item::Words,
                |i| match i {
                    Item::Words(w) => Some(w),
                    _ => None,
                },
            )
            .variant("Number", with_progress(VarintCodec), Item::Number, |i| {
                match i {
                    Item::Number(n) => Some(n),
                    _ => None,
                }
            })
            .build()
            .unwrap()
    }

    #[test]
    fn sequence_steps_once_per_element_each_way() {
        let codec = sequence_with_progress(with_progress(VarintCodec));
        for n in [0u64, 1, 7, 100] {
            let value: Vec<u64> = (0..n).collect();
            assert_eq!(codec.size(&value), n);

            let mut steps = Counter::default();
            let mut bytes = Vec::new();
            codec.encode(&mut steps, &mut bytes, &value).unwrap();
            assert_eq!(steps.count, n);

            let mut steps = Counter::default();
            let decoded = codec.decode(&mut steps, &mut bytes.as_slice()).unwrap();
            assert_eq!(steps.count, n);
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn nested_sizes_multiply() {
        // N outer elements, each a sequence of k unit-step elements
        let codec = sequence_with_progress(sequence_with_progress(with_progress(StrCodec)));
        let (n, k) = (4, 3);
        let value: Vec<Vec<String>> = (0..n)
            .map(|i| (0..k).map(|j| format!("{i}.{j}")).collect())
            .collect();
        assert_eq!(codec.size(&value), (n * k) as u64);

        let mut steps = Counter::default();
        codec.encode(&mut steps, &mut Vec::<u8>::new(), &value).unwrap();
        assert_eq!(steps.count, (n * k) as u64);
    }

    #[test]
    fn union_dispatches_size_by_variant() {
        let codec = items();
        let words = Item::Words(vec![vec!["a".into()], vec![], vec!["b".into(), "c".into()]]);
        assert_eq!(codec.size(&words), 3);
        assert_eq!(codec.size(&Item::Number(9)), 1);

        let mut steps = Counter::default();
        let mut bytes = Vec::new();
        codec.encode(&mut steps, &mut bytes, &words).unwrap();
        assert_eq!(steps.count, 3);
        assert!(bytes.starts_with(b"\x05Words"));

        let mut steps = Counter::default();
        assert_eq!(codec.decode(&mut steps, &mut bytes.as_slice()).unwrap(), words);
        assert_eq!(steps.count, 3);
    }

    #[test]
    fn union_unknown_typename() {
        let err = items()
            .decode(&mut Counter::default(), &mut &b"\x04Bird"[..])
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"cannot decode enum class: Item/Bird");
    }

    fn as_number(item: &Item) -> Option<&u64> {
        match item {
            Item::Number(n) => Some(n),
            _ => None,
        }
    }

    #[test]
    fn case_rejects_foreign_variant() {
        let case = ProgressCase {
            codec: with_progress(VarintCodec),
            wrap: Item::Number,
            unwrap: as_number,
        };
        let mut bytes = Vec::new();
        let err = case
            .encode_payload("Item", &mut Counter::default(), &mut bytes, &Item::Words(vec![]))
            .unwrap_err();
        assert!(matches!(
            err,
            ProgressError::Codec(CodecError::UnregisteredVariant { union: "Item" })
        ));
        assert!(bytes.is_empty());
    }

    #[test]
    fn cancellation_propagates_from_step() {
        let codec = sequence_with_progress(with_progress(VarintCodec));
        let mut steps = Counter {
            count: 0,
            limit: Some(2),
        };
        let mut bytes = Vec::new();
        let err = codec
            .encode(&mut steps, &mut bytes, &vec![1, 2, 3, 4])
            .unwrap_err();
        assert!(matches!(err, ProgressError::Cancelled(Cancelled)));
        assert_eq!(steps.count, 2);
    }

    #[test]
    fn cancelled_tracker_aborts_decode() {
        let codec = sequence_with_progress(with_progress(VarintCodec));
        let mut bytes = Vec::new();
        codec
            .encode(&mut Counter::default(), &mut bytes, &vec![1, 2, 3])
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let mut tracker = ProgressTracker::new(token);
        let err = codec.decode(&mut tracker, &mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, ProgressError::Cancelled(_)));
    }
}
