//! Datasets produced by analyses: estimates, consistency counts, integrity
//! issues and tuple intransitivities.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::io::{Read, Write};

use indexmap::IndexSet;

use super::dataset::{AltSet, SubjectTable, TableCodec, read_header, write_header};
use crate::codec::{
    BytesCodec, Codec, CodecError, Mapped, ProgressCodec, ProgressError, Record, SetOf, StrCodec,
    TaggedUnion, UnitCodec, VarintCodec, mapped, record_of, sequence_of, set_of,
};
use crate::progress::Step;

/// Estimation response for one subject, as packed by the core.
pub type PackedEstimate = Vec<u8>;

/// Unordered tuple of alternatives.
pub type AltTuple = BTreeSet<u64>;

/// Unordered tuple of menus.
pub type MenuTuple = BTreeSet<AltTuple>;

/// Implements [`SubjectTable`] for a result whose subjects follow the header
/// directly, with an optional varint trailer field.
macro_rules! subject_table {
    ($ty:ty, $subject:ty) => {
        impl SubjectTable for $ty {
            type Subject = $subject;
            type Trailer = ();

            fn header(&self) -> (&str, &[String]) {
                (&self.name, &self.alternatives)
            }

            fn subjects(&self) -> &Vec<$subject> {
                &self.subjects
            }

            fn trailer(&self) {}

            fn assemble(
                name: String,
                alternatives: Vec<String>,
                subjects: Vec<$subject>,
                (): (),
            ) -> Self {
                Self {
                    name,
                    alternatives,
                    subjects,
                }
            }
        }
    };
    ($ty:ty, $subject:ty, $trailer:ident) => {
        impl SubjectTable for $ty {
            type Subject = $subject;
            type Trailer = u64;

            fn header(&self) -> (&str, &[String]) {
                (&self.name, &self.alternatives)
            }

            fn subjects(&self) -> &Vec<$subject> {
                &self.subjects
            }

            fn trailer(&self) -> u64 {
                self.$trailer
            }

            fn assemble(
                name: String,
                alternatives: Vec<String>,
                subjects: Vec<$subject>,
                $trailer: u64,
            ) -> Self {
                Self {
                    name,
                    alternatives,
                    subjects,
                    $trailer,
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimationResult {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<PackedEstimate>,
}

subject_table!(EstimationResult, PackedEstimate);

pub fn estimation_result_codec() -> impl ProgressCodec<Value = EstimationResult> {
    TableCodec::<EstimationResult, _, _>::new(BytesCodec, UnitCodec)
}

/// Violation counts for cycles of one length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRow {
    pub cycle_length: u64,
    pub garp: u64,
    pub sarp: u64,
    pub garp_binary_menus: u64,
    pub sarp_binary_menus: u64,
    pub binary_intransitivities: u64,
}

impl_record!(CycleRow, "Row" {
    cycle_length: u64,
    garp: u64,
    sarp: u64,
    garp_binary_menus: u64,
    sarp_binary_menus: u64,
    binary_intransitivities: u64,
});

/// Consistency counts of one subject as computed by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConsistency {
    pub name: String,
    pub rows: Vec<CycleRow>,
    pub warp_pairs: u64,
    pub warp_all: u64,
    pub contraction_consistency_pairs: u64,
    pub contraction_consistency_all: u64,
}

impl_record!(RawConsistency, "SubjectRaw" {
    name: String,
    rows: Vec<CycleRow>,
    warp_pairs: u64,
    warp_all: u64,
    contraction_consistency_pairs: u64,
    contraction_consistency_all: u64,
});

/// Raw counts plus their totals over all cycle lengths. The totals are stored,
/// not recomputed on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencySubject {
    pub raw: RawConsistency,
    pub total_garp: u64,
    pub total_sarp: u64,
    pub total_garp_binary_menus: u64,
    pub total_sarp_binary_menus: u64,
    pub total_binary_intransitivities: u64,
}

impl ConsistencySubject {
    pub fn from_raw(raw: RawConsistency) -> Self {
        let total = |f: fn(&CycleRow) -> u64| -> u64 { raw.rows.iter().map(f).sum() };
        Self {
            total_garp: total(|r| r.garp),
            total_sarp: total(|r| r.sarp),
            total_garp_binary_menus: total(|r| r.garp_binary_menus),
            total_sarp_binary_menus: total(|r| r.sarp_binary_menus),
            total_binary_intransitivities: total(|r| r.binary_intransitivities),
            raw,
        }
    }
}

impl_record!(ConsistencySubject, "Subject" {
    raw: RawConsistency,
    total_garp: u64,
    total_sarp: u64,
    total_garp_binary_menus: u64,
    total_sarp_binary_menus: u64,
    total_binary_intransitivities: u64,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicConsistencyResult {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<ConsistencySubject>,
    pub max_cycle_length: u64,
}

subject_table!(DeterministicConsistencyResult, ConsistencySubject, max_cycle_length);

pub fn deterministic_consistency_codec()
-> Result<impl ProgressCodec<Value = DeterministicConsistencyResult>, CodecError> {
    let row = record_of::<CycleRow, _>((
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
    ))?;
    let raw = record_of::<RawConsistency, _>((
        StrCodec,
        sequence_of(row),
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
    ))?;
    let subject = record_of::<ConsistencySubject, _>((
        raw,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
    ))?;
    Ok(TableCodec::<DeterministicConsistencyResult, _, _>::new(subject, VarintCodec))
}

/// Violation counts of the stochastic transitivity axioms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StochasticSubject {
    pub name: String,
    pub weak_stochastic_transitivity: u64,
    pub moderate_stochastic_transitivity: u64,
    pub strong_stochastic_transitivity: u64,
    pub regularity: u64,
}

impl_record!(StochasticSubject, "Subject" {
    name: String,
    weak_stochastic_transitivity: u64,
    moderate_stochastic_transitivity: u64,
    strong_stochastic_transitivity: u64,
    regularity: u64,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StochasticConsistencyResult {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<StochasticSubject>,
    pub max_cycle_length: u64,
}

subject_table!(StochasticConsistencyResult, StochasticSubject, max_cycle_length);

pub fn stochastic_consistency_codec()
-> Result<impl ProgressCodec<Value = StochasticConsistencyResult>, CodecError> {
    let subject = record_of::<StochasticSubject, _>((
        StrCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
    ))?;
    Ok(TableCodec::<StochasticConsistencyResult, _, _>::new(subject, VarintCodec))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedMenu {
    pub menu: AltSet,
}

impl_record!(RepeatedMenu, "RepeatedMenu" { menu: AltSet });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceNotInMenu {
    pub menu: AltSet,
    pub choice: u64,
}

impl_record!(ChoiceNotInMenu, "ChoiceNotInMenu" { menu: AltSet, choice: u64 });

/// Problem found in a subject's raw choices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    RepeatedMenu(RepeatedMenu),
    ChoiceNotInMenu(ChoiceNotInMenu),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegritySubject {
    pub name: String,
    pub issues: Vec<Issue>,
}

impl_record!(IntegritySubject, "Subject" { name: String, issues: Vec<Issue> });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityCheck {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<IntegritySubject>,
}

impl IntegrityCheck {
    pub fn issue_count(&self) -> usize {
        self.subjects.iter().map(|s| s.issues.len()).sum()
    }
}

subject_table!(IntegrityCheck, IntegritySubject);

pub fn issue_codec() -> Result<TaggedUnion<Issue>, CodecError> {
    TaggedUnion::<Issue>::builder("Issue")
        .variant(
            0,
            record_of::<RepeatedMenu, _>((set_of(VarintCodec),))?,
            Issue::RepeatedMenu,
            |i| match i {
                Issue::RepeatedMenu(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            1,
            record_of::<ChoiceNotInMenu, _>((set_of(VarintCodec), VarintCodec))?,
            Issue::ChoiceNotInMenu,
            |i| match i {
                Issue::ChoiceNotInMenu(x) => Some(x),
                _ => None,
            },
        )
        .build()
}

pub fn integrity_check_codec() -> Result<impl ProgressCodec<Value = IntegrityCheck>, CodecError> {
    let subject = record_of::<IntegritySubject, _>((StrCodec, sequence_of(issue_codec()?)))?;
    Ok(TableCodec::<IntegrityCheck, _, _>::new(subject, UnitCodec))
}

/// Preferences aggregated over all subjects; the instances are opaque
/// representations produced by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedPreferences {
    pub name: String,
    pub alternatives: Vec<String>,
    pub instances: Vec<Vec<u8>>,
}

/// The whole response is a single unit of work.
pub struct AggregatedPreferencesCodec;

pub fn aggregated_preferences_codec() -> AggregatedPreferencesCodec {
    AggregatedPreferencesCodec
}

impl ProgressCodec for AggregatedPreferencesCodec {
    type Value = AggregatedPreferences;

    fn size(&self, _value: &AggregatedPreferences) -> u64 {
        1
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &AggregatedPreferences,
    ) -> Result<(), ProgressError> {
        write_header(sink, &value.name, &value.alternatives)?;
        sequence_of(BytesCodec).encode(sink, &value.instances)?;
        steps.step()?;
        Ok(())
    }

    fn decode(
        &self,
        steps: &mut dyn Step,
        source: &mut dyn Read,
    ) -> Result<AggregatedPreferences, ProgressError> {
        let (name, alternatives) = read_header(source)?;
        let instances = sequence_of(BytesCodec).decode(source)?;
        steps.step()?;
        Ok(AggregatedPreferences {
            name,
            alternatives,
            instances,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violations {
    pub garp: u64,
    pub sarp: u64,
}

impl_record!(Violations, "Violations" { garp: u64, sarp: u64 });

/// Interval known to contain an exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEstimate {
    pub lower: u64,
    pub upper: u64,
}

impl BoundEstimate {
    pub fn is_exact(&self) -> bool {
        self.lower == self.upper
    }
}

impl_record!(BoundEstimate, "BoundEstimate" { lower: u64, upper: u64 });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetaryConsistencySubject {
    pub name: String,
    /// Violations per cycle length.
    pub violations: Vec<(u64, Violations)>,
    pub warp_strict: u64,
    pub warp_nonstrict: u64,
    pub hm_garp: BoundEstimate,
    pub hm_sarp: BoundEstimate,
    pub hm_warp_strict: BoundEstimate,
    pub hm_warp_nonstrict: BoundEstimate,
}

impl_record!(BudgetaryConsistencySubject, "Subject" {
    name: String,
    violations: Vec<(u64, Violations)>,
    warp_strict: u64,
    warp_nonstrict: u64,
    hm_garp: BoundEstimate,
    hm_sarp: BoundEstimate,
    hm_warp_strict: BoundEstimate,
    hm_warp_nonstrict: BoundEstimate,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetaryConsistency {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<BudgetaryConsistencySubject>,
}

subject_table!(BudgetaryConsistency, BudgetaryConsistencySubject);

pub fn budgetary_consistency_codec()
-> Result<impl ProgressCodec<Value = BudgetaryConsistency>, CodecError> {
    let bound = || record_of::<BoundEstimate, _>((VarintCodec, VarintCodec));
    let violations = record_of::<Violations, _>((VarintCodec, VarintCodec))?;
    let subject = record_of::<BudgetaryConsistencySubject, _>((
        StrCodec,
        sequence_of((VarintCodec, violations)),
        VarintCodec,
        VarintCodec,
        bound()?,
        bound()?,
        bound()?,
        bound()?,
    ))?;
    Ok(TableCodec::<BudgetaryConsistency, _, _>::new(subject, UnitCodec))
}

/// Tuples of one size that violate transitivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleRow<T: Hash + Eq> {
    pub tuple_size: u64,
    pub tuples: IndexSet<T>,
}

impl<T: Hash + Eq + Clone> Record for TupleRow<T> {
    const NAME: &'static str = "Row";
    const FIELDS: &'static [&'static str] = &["tuple_size", "tuples"];

    type Fields = (u64, IndexSet<T>);

    fn from_fields((tuple_size, tuples): Self::Fields) -> Self {
        Self { tuple_size, tuples }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.tuple_size, self.tuples.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleSubject<T: Hash + Eq> {
    pub name: String,
    pub rows: Vec<TupleRow<T>>,
}

impl<T: Hash + Eq + Clone> Record for TupleSubject<T> {
    const NAME: &'static str = "Subject";
    const FIELDS: &'static [&'static str] = &["name", "rows"];

    type Fields = (String, Vec<TupleRow<T>>);

    fn from_fields((name, rows): Self::Fields) -> Self {
        Self { name, rows }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.name.clone(), self.rows.clone())
    }
}

/// Intransitive tuples of alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleIntransAlts {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<TupleSubject<AltTuple>>,
}

subject_table!(TupleIntransAlts, TupleSubject<AltTuple>);

/// Intransitive tuples of menus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleIntransMenus {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<TupleSubject<MenuTuple>>,
}

subject_table!(TupleIntransMenus, TupleSubject<MenuTuple>);

fn sorted<T: Ord + Hash>(set: IndexSet<T>) -> BTreeSet<T> {
    set.into_iter().collect()
}

fn unsorted<T: Ord + Hash + Clone>(set: &BTreeSet<T>) -> IndexSet<T> {
    set.iter().cloned().collect()
}

type AltTupleCodec = Mapped<SetOf<VarintCodec>, AltTuple>;

/// Frozen sets are written like sets, in ascending order.
fn alt_tuple_codec() -> AltTupleCodec {
    mapped(set_of(VarintCodec), sorted::<u64>, unsorted::<u64>)
}

fn menu_tuple_codec() -> Mapped<SetOf<AltTupleCodec>, MenuTuple> {
    mapped(
        set_of(alt_tuple_codec()),
        sorted::<AltTuple>,
        unsorted::<AltTuple>,
    )
}

fn tuple_subject_codec<C>(
    tuple: C,
) -> Result<impl Codec<Value = TupleSubject<C::Value>>, CodecError>
where
    C: Codec + 'static,
    C::Value: Hash + Eq + Clone,
{
    let row = record_of::<TupleRow<C::Value>, _>((VarintCodec, set_of(tuple)))?;
    record_of::<TupleSubject<C::Value>, _>((StrCodec, sequence_of(row)))
}

pub fn tuple_intrans_alts_codec()
-> Result<impl ProgressCodec<Value = TupleIntransAlts>, CodecError> {
    let subject = tuple_subject_codec(alt_tuple_codec())?;
    Ok(TableCodec::<TupleIntransAlts, _, _>::new(subject, UnitCodec))
}

pub fn tuple_intrans_menus_codec()
-> Result<impl ProgressCodec<Value = TupleIntransMenus>, CodecError> {
    let subject = tuple_subject_codec(menu_tuple_codec())?;
    Ok(TableCodec::<TupleIntransMenus, _, _>::new(subject, UnitCodec))
}
