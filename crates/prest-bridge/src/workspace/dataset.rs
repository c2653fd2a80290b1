//! Dataset kinds stored in workspace files, and their progress codecs.
//!
//! Every kind is written as a `(name, alternatives)` header followed by its
//! subjects, one progress step per subject.

use std::io::{Read, Write};
use std::marker::PhantomData;

use indexmap::IndexSet;
use serde::Serialize;

use super::results::{
    AggregatedPreferences, BudgetaryConsistency, DeterministicConsistencyResult,
    EstimationResult, IntegrityCheck, StochasticConsistencyResult, TupleIntransAlts,
    TupleIntransMenus, aggregated_preferences_codec, budgetary_consistency_codec,
    deterministic_consistency_codec, estimation_result_codec, integrity_check_codec,
    stochastic_consistency_codec, tuple_intrans_alts_codec, tuple_intrans_menus_codec,
};
use crate::codec::{
    ArrayCodec, Codec, CodecError, NumericArray, OptionalOf, ProgressCodec, ProgressError, Record,
    RecordOf, SequenceOf, SequenceWithProgress, SetOf, StrCodec, TypenameUnionWithProgress,
    UnitCodec, VarintCodec, WithProgress, optional_of, packed, record_of, sequence_of,
    sequence_with_progress, set_of, with_progress,
};
use crate::progress::Step;

/// Set of alternative indices.
pub type AltSet = IndexSet<u64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceRow {
    pub menu: AltSet,
    pub default: Option<u64>,
    pub choice: AltSet,
}

impl Record for ChoiceRow {
    const NAME: &'static str = "ChoiceRow";
    const FIELDS: &'static [&'static str] = &["menu", "default", "choice"];

    type Fields = (AltSet, Option<u64>, AltSet);

    fn from_fields((menu, default, choice): Self::Fields) -> Self {
        Self {
            menu,
            default,
            choice,
        }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.menu.clone(), self.default, self.choice.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub name: String,
    pub alternatives: Vec<String>,
    pub choices: Vec<ChoiceRow>,
}

impl Record for Subject {
    const NAME: &'static str = "Subject";
    const FIELDS: &'static [&'static str] = &["name", "alternatives", "choices"];

    type Fields = (String, Vec<String>, Vec<ChoiceRow>);

    fn from_fields((name, alternatives, choices): Self::Fields) -> Self {
        Self {
            name,
            alternatives,
            choices,
        }
    }

    fn to_fields(&self) -> Self::Fields {
        (
            self.name.clone(),
            self.alternatives.clone(),
            self.choices.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentalData {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<Subject>,
    pub observation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectStats {
    pub name: String,
    pub observations: u64,
    pub active_choices: u64,
    pub active_choices_binary: u64,
    pub deferrals: u64,
}

impl Record for SubjectStats {
    const NAME: &'static str = "Subject";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "observations",
        "active_choices",
        "active_choices_binary",
        "deferrals",
    ];

    type Fields = (String, u64, u64, u64, u64);

    fn from_fields(
        (name, observations, active_choices, active_choices_binary, deferrals): Self::Fields,
    ) -> Self {
        Self {
            name,
            observations,
            active_choices,
            active_choices_binary,
            deferrals,
        }
    }

    fn to_fields(&self) -> Self::Fields {
        (
            self.name.clone(),
            self.observations,
            self.active_choices,
            self.active_choices_binary,
            self.deferrals,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentStats {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<SubjectStats>,
}

/// Prices and purchased amounts of one subject, one row per observation.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetarySubject {
    pub name: String,
    pub prices: NumericArray<f32>,
    pub amounts: NumericArray<f32>,
}

impl BudgetarySubject {
    pub fn observation_count(&self) -> u64 {
        self.prices.shape().first().copied().unwrap_or(0)
    }
}

impl Record for BudgetarySubject {
    const NAME: &'static str = "Subject";
    const FIELDS: &'static [&'static str] = &["name", "prices", "amounts"];

    type Fields = (String, NumericArray<f32>, NumericArray<f32>);

    fn from_fields((name, prices, amounts): Self::Fields) -> Self {
        Self {
            name,
            prices,
            amounts,
        }
    }

    fn to_fields(&self) -> Self::Fields {
        (self.name.clone(), self.prices.clone(), self.amounts.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Budgetary {
    pub name: String,
    pub alternatives: Vec<String>,
    pub subjects: Vec<BudgetarySubject>,
}

impl Budgetary {
    pub fn observation_count(&self) -> u64 {
        self.subjects.iter().map(BudgetarySubject::observation_count).sum()
    }
}

/// A dataset stored as its header, one record per subject, then a trailer.
pub trait SubjectTable: Sized {
    type Subject;

    /// Written after the subjects; `()` when there is none.
    type Trailer;

    fn header(&self) -> (&str, &[String]);

    fn subjects(&self) -> &Vec<Self::Subject>;

    fn trailer(&self) -> Self::Trailer;

    fn assemble(
        name: String,
        alternatives: Vec<String>,
        subjects: Vec<Self::Subject>,
        trailer: Self::Trailer,
    ) -> Self;
}

impl SubjectTable for ExperimentalData {
    type Subject = Subject;
    type Trailer = u64;

    fn header(&self) -> (&str, &[String]) {
        (&self.name, &self.alternatives)
    }

    fn subjects(&self) -> &Vec<Subject> {
        &self.subjects
    }

    fn trailer(&self) -> u64 {
        self.observation_count
    }

    fn assemble(
        name: String,
        alternatives: Vec<String>,
        subjects: Vec<Subject>,
        observation_count: u64,
    ) -> Self {
        Self {
            name,
            alternatives,
            subjects,
            observation_count,
        }
    }
}

impl SubjectTable for ExperimentStats {
    type Subject = SubjectStats;
    type Trailer = ();

    fn header(&self) -> (&str, &[String]) {
        (&self.name, &self.alternatives)
    }

    fn subjects(&self) -> &Vec<SubjectStats> {
        &self.subjects
    }

    fn trailer(&self) {}

    fn assemble(
        name: String,
        alternatives: Vec<String>,
        subjects: Vec<SubjectStats>,
        (): (),
    ) -> Self {
        Self {
            name,
            alternatives,
            subjects,
        }
    }
}

impl SubjectTable for Budgetary {
    type Subject = BudgetarySubject;
    type Trailer = ();

    fn header(&self) -> (&str, &[String]) {
        (&self.name, &self.alternatives)
    }

    fn subjects(&self) -> &Vec<BudgetarySubject> {
        &self.subjects
    }

    fn trailer(&self) {}

    fn assemble(
        name: String,
        alternatives: Vec<String>,
        subjects: Vec<BudgetarySubject>,
        (): (),
    ) -> Self {
        Self {
            name,
            alternatives,
            subjects,
        }
    }
}

/// Progress codec for any [`SubjectTable`]: one step per subject, header and
/// trailer are free.
pub struct TableCodec<D, S, X> {
    subjects: SequenceWithProgress<WithProgress<S>>,
    trailer: X,
    _dataset: PhantomData<fn() -> D>,
}

impl<D, S: Codec, X: Codec> TableCodec<D, S, X> {
    pub fn new(subject: S, trailer: X) -> Self {
        Self {
            subjects: sequence_with_progress(with_progress(subject)),
            trailer,
            _dataset: PhantomData,
        }
    }
}

impl<D, S, X> ProgressCodec for TableCodec<D, S, X>
where
    D: SubjectTable<Subject = S::Value, Trailer = X::Value>,
    S: Codec,
    X: Codec,
{
    type Value = D;

    fn size(&self, value: &D) -> u64 {
        self.subjects.size(value.subjects())
    }

    fn encode(
        &self,
        steps: &mut dyn Step,
        sink: &mut dyn Write,
        value: &D,
    ) -> Result<(), ProgressError> {
        let (name, alternatives) = value.header();
        write_header(sink, name, alternatives)?;
        self.subjects.encode(steps, sink, value.subjects())?;
        self.trailer.encode(sink, &value.trailer())?;
        Ok(())
    }

    fn decode(&self, steps: &mut dyn Step, source: &mut dyn Read) -> Result<D, ProgressError> {
        let (name, alternatives) = read_header(source)?;
        let subjects = self.subjects.decode(steps, source)?;
        let trailer = self.trailer.decode(source)?;
        Ok(D::assemble(name, alternatives, subjects, trailer))
    }
}

/// Every dataset kind a workspace can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    ExperimentalData(ExperimentalData),
    ExperimentStats(ExperimentStats),
    Budgetary(Budgetary),
    EstimationResult(EstimationResult),
    DeterministicConsistencyResult(DeterministicConsistencyResult),
    StochasticConsistencyResult(StochasticConsistencyResult),
    IntegrityCheck(IntegrityCheck),
    AggregatedPreferences(AggregatedPreferences),
    BudgetaryConsistency(BudgetaryConsistency),
    TupleIntransMenus(TupleIntransMenus),
    TupleIntransAlts(TupleIntransAlts),
}

impl Dataset {
    /// Class name used as the discriminator in workspace files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExperimentalData(_) => "ExperimentalData",
            Self::ExperimentStats(_) => "ExperimentStats",
            Self::Budgetary(_) => "Budgetary",
            Self::EstimationResult(_) => "EstimationResult",
            Self::DeterministicConsistencyResult(_) => "DeterministicConsistencyResult",
            Self::StochasticConsistencyResult(_) => "StochasticConsistencyResult",
            Self::IntegrityCheck(_) => "IntegrityCheck",
            Self::AggregatedPreferences(_) => "AggregatedPreferences",
            Self::BudgetaryConsistency(_) => "BudgetaryConsistency",
            Self::TupleIntransMenus(_) => "TupleIntransMenus",
            Self::TupleIntransAlts(_) => "TupleIntransAlts",
        }
    }

    fn header(&self) -> (&str, &[String]) {
        match self {
            Self::ExperimentalData(d) => d.header(),
            Self::ExperimentStats(d) => d.header(),
            Self::Budgetary(d) => d.header(),
            Self::EstimationResult(d) => d.header(),
            Self::DeterministicConsistencyResult(d) => d.header(),
            Self::StochasticConsistencyResult(d) => d.header(),
            Self::IntegrityCheck(d) => d.header(),
            Self::AggregatedPreferences(d) => (&d.name, &d.alternatives),
            Self::BudgetaryConsistency(d) => d.header(),
            Self::TupleIntransMenus(d) => d.header(),
            Self::TupleIntransAlts(d) => d.header(),
        }
    }

    pub fn name(&self) -> &str {
        self.header().0
    }

    pub fn alternatives(&self) -> &[String] {
        self.header().1
    }

    pub fn summary(&self) -> DatasetSummary {
        let subjects = match self {
            Self::ExperimentalData(d) => d.subjects.len(),
            Self::ExperimentStats(d) => d.subjects.len(),
            Self::Budgetary(d) => d.subjects.len(),
            Self::EstimationResult(d) => d.subjects.len(),
            Self::DeterministicConsistencyResult(d) => d.subjects.len(),
            Self::StochasticConsistencyResult(d) => d.subjects.len(),
            Self::IntegrityCheck(d) => d.subjects.len(),
            Self::AggregatedPreferences(_) => 0,
            Self::BudgetaryConsistency(d) => d.subjects.len(),
            Self::TupleIntransMenus(d) => d.subjects.len(),
            Self::TupleIntransAlts(d) => d.subjects.len(),
        };
        let observations = match self {
            Self::ExperimentalData(d) => Some(d.observation_count),
            Self::Budgetary(d) => Some(d.observation_count()),
            _ => None,
        };
        let size = match (self, observations) {
            (Self::IntegrityCheck(d), _) => format!("{} issues", d.issue_count()),
            (Self::AggregatedPreferences(d), _) => format!("{} instances", d.instances.len()),
            (_, Some(n)) => format!("{subjects} subjects, {n} observations"),
            (_, None) => format!("{subjects} subjects"),
        };
        DatasetSummary {
            kind: self.kind(),
            name: self.name().to_string(),
            alternatives: self.alternatives().len(),
            subjects,
            observations,
            size,
        }
    }
}

/// Short description of a dataset, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub kind: &'static str,
    pub name: String,
    pub alternatives: usize,
    pub subjects: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<u64>,
    /// Human-readable size, e.g. "3 subjects" or "12 issues".
    pub size: String,
}

type HeaderCodec = (StrCodec, SequenceOf<StrCodec>);
type AltSetCodec = SetOf<VarintCodec>;
type ChoiceRowCodec = RecordOf<ChoiceRow, (AltSetCodec, OptionalOf<VarintCodec>, AltSetCodec)>;
type SubjectCodec = RecordOf<Subject, (StrCodec, SequenceOf<StrCodec>, SequenceOf<ChoiceRowCodec>)>;

const HEADER: HeaderCodec = (StrCodec, SequenceOf(StrCodec));

pub(super) fn write_header(
    sink: &mut dyn Write,
    name: &str,
    alternatives: &[String],
) -> Result<(), CodecError> {
    StrCodec.encode_str(sink, name)?;
    HEADER.1.encode(sink, &alternatives.to_vec())
}

pub(super) fn read_header(source: &mut dyn Read) -> Result<(String, Vec<String>), CodecError> {
    HEADER.decode(source)
}

pub fn choice_row_codec() -> Result<ChoiceRowCodec, CodecError> {
    record_of((set_of(VarintCodec), optional_of(VarintCodec), set_of(VarintCodec)))
}

pub fn subject_codec() -> Result<SubjectCodec, CodecError> {
    record_of((
        StrCodec,
        sequence_of(StrCodec),
        sequence_of(choice_row_codec()?),
    ))
}

/// Subjects are stored packed, each inside its own byte buffer, followed by
/// the total observation count.
pub fn experimental_data_codec()
-> Result<impl ProgressCodec<Value = ExperimentalData>, CodecError> {
    let subject = packed(subject_codec()?);
    Ok(TableCodec::<ExperimentalData, _, _>::new(subject, VarintCodec))
}

pub fn experiment_stats_codec()
-> Result<impl ProgressCodec<Value = ExperimentStats>, CodecError> {
    let subject = record_of::<SubjectStats, _>((
        StrCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
        VarintCodec,
    ))?;
    Ok(TableCodec::<ExperimentStats, _, _>::new(subject, UnitCodec))
}

pub fn budgetary_codec() -> Result<impl ProgressCodec<Value = Budgetary>, CodecError> {
    let subject = record_of::<BudgetarySubject, _>((
        StrCodec,
        ArrayCodec::<f32>::new(),
        ArrayCodec::<f32>::new(),
    ))?;
    Ok(TableCodec::<Budgetary, _, _>::new(subject, UnitCodec))
}

/// The dataset registry: one entry per [`Dataset`] variant.
pub fn dataset_codec() -> Result<TypenameUnionWithProgress<Dataset>, CodecError> {
    TypenameUnionWithProgress::<Dataset>::builder("Dataset")
        .variant(
            "ExperimentalData",
            experimental_data_codec()?,
            Dataset::ExperimentalData,
            |d| match d {
                Dataset::ExperimentalData(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "ExperimentStats",
            experiment_stats_codec()?,
            Dataset::ExperimentStats,
            |d| match d {
                Dataset::ExperimentStats(x) => Some(x),
                _ => None,
            },
        )
        .variant("Budgetary", budgetary_codec()?, Dataset::Budgetary, |d| {
            match d {
                Dataset::Budgetary(x) => Some(x),
                _ => None,
            }
        })
        .variant(
            "EstimationResult",
            estimation_result_codec(),
            Dataset::EstimationResult,
            |d| match d {
                Dataset::EstimationResult(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "DeterministicConsistencyResult",
            deterministic_consistency_codec()?,
            Dataset::DeterministicConsistencyResult,
            |d| match d {
                Dataset::DeterministicConsistencyResult(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "StochasticConsistencyResult",
            stochastic_consistency_codec()?,
            Dataset::StochasticConsistencyResult,
            |d| match d {
                Dataset::StochasticConsistencyResult(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "IntegrityCheck",
            integrity_check_codec()?,
            Dataset::IntegrityCheck,
            |d| match d {
                Dataset::IntegrityCheck(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "AggregatedPreferences",
            aggregated_preferences_codec(),
            Dataset::AggregatedPreferences,
            |d| match d {
                Dataset::AggregatedPreferences(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "BudgetaryConsistency",
            budgetary_consistency_codec()?,
            Dataset::BudgetaryConsistency,
            |d| match d {
                Dataset::BudgetaryConsistency(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "TupleIntransMenus",
            tuple_intrans_menus_codec()?,
            Dataset::TupleIntransMenus,
            |d| match d {
                Dataset::TupleIntransMenus(x) => Some(x),
                _ => None,
            },
        )
        .variant(
            "TupleIntransAlts",
            tuple_intrans_alts_codec()?,
            Dataset::TupleIntransAlts,
            |d| match d {
                Dataset::TupleIntransAlts(x) => Some(x),
                _ => None,
            },
        )
        .build()
}
