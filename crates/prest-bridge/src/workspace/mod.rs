//! Workspace files: every dataset of a session in one gzip-compressed stream.
//!
//! Layout of the decompressed stream:
//!
//! ```text
//! "Prest Workspace\0"  signature
//! varint               format version
//! string               writer version, e.g. "Prest 3.0.0"
//! varint               total progress units
//! sequence             datasets, typename-tagged
//! ```

/// Implements [`Record`](crate::codec::Record) for a struct with the listed
/// fields, in wire order.
macro_rules! impl_record {
    ($ty:ty, $name:literal { $($field:ident : $fty:ty),+ $(,)? }) => {
        impl $crate::codec::Record for $ty {
            const NAME: &'static str = $name;
            const FIELDS: &'static [&'static str] = &[$(stringify!($field)),+];

            type Fields = ($($fty,)+);

            fn from_fields(($($field,)+): Self::Fields) -> Self {
                Self { $($field),+ }
            }

            #[allow(clippy::clone_on_copy)]
            fn to_fields(&self) -> Self::Fields {
                ($(self.$field.clone(),)+)
            }
        }
    };
}

mod dataset;
mod results;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use thiserror::Error;

pub use dataset::{
    AltSet, Budgetary, BudgetarySubject, ChoiceRow, Dataset, DatasetSummary, ExperimentStats,
    ExperimentalData, Subject, SubjectStats, SubjectTable, TableCodec, dataset_codec,
};
pub use results::{
    AggregatedPreferences, AltTuple, BoundEstimate, BudgetaryConsistency,
    BudgetaryConsistencySubject, ChoiceNotInMenu, ConsistencySubject, CycleRow,
    DeterministicConsistencyResult, EstimationResult, IntegrityCheck, IntegritySubject, Issue,
    MenuTuple, PackedEstimate, RawConsistency, RepeatedMenu, StochasticConsistencyResult,
    StochasticSubject, TupleIntransAlts, TupleIntransMenus, TupleRow, TupleSubject, Violations,
};

use crate::codec::{
    Codec, CodecError, ProgressCodec, ProgressError, StrCodec, VarintCodec,
    sequence_with_progress,
};
use crate::progress::{Cancelled, ProgressTracker};
use crate::version::program_version;

pub const SIGNATURE: &[u8; 16] = b"Prest Workspace\0";

/// Bumped whenever the layout of any persisted dataset changes.
pub const FORMAT_VERSION: u64 = 18;

/// Oldest format that recorded the writer's version string.
const FIRST_VERSION_WITH_WRITER: u64 = 3;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("not a Prest workspace file")]
    NotAWorkspace,

    #[error(
        "incompatible PWF version: expected {expected}, received {found}{}",
        saved_by(.written_by)
    )]
    IncompatibleVersion {
        expected: u64,
        found: u64,
        written_by: Option<String>,
    },

    #[error("corrupted workspace file: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProgressError> for PersistenceError {
    fn from(e: ProgressError) -> Self {
        match e {
            ProgressError::Codec(e) => Self::Codec(e),
            ProgressError::Cancelled(c) => Self::Cancelled(c),
        }
    }
}

fn saved_by(written_by: &Option<String>) -> String {
    match written_by {
        Some(v) => format!(" (saved by {v})"),
        None => String::new(),
    }
}

/// The datasets of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    pub datasets: Vec<Dataset>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the uncompressed workspace stream.
    ///
    /// The tracker's work size is set to the number of steps the datasets take.
    pub fn write_to(
        &self,
        sink: &mut dyn Write,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PersistenceError> {
        let datasets = sequence_with_progress(dataset_codec()?);
        let work_size = datasets.size(&self.datasets);

        sink.write_all(SIGNATURE)?;
        VarintCodec.encode(sink, &FORMAT_VERSION)?;
        StrCodec.encode_str(sink, &program_version())?;
        VarintCodec.encode(sink, &work_size)?;

        tracker.set_work_size(work_size);
        datasets.encode(tracker, sink, &self.datasets)?;
        Ok(())
    }

    /// Read an uncompressed workspace stream.
    pub fn read_from(
        source: &mut dyn Read,
        tracker: &mut ProgressTracker,
    ) -> Result<Self, PersistenceError> {
        let mut signature = [0u8; SIGNATURE.len()];
        if source.read_exact(&mut signature).is_err() || &signature != SIGNATURE {
            return Err(PersistenceError::NotAWorkspace);
        }

        let version = VarintCodec.decode(source)?;
        let written_by = if version >= FIRST_VERSION_WITH_WRITER {
            Some(StrCodec.decode(source)?)
        } else {
            None
        };
        if version != FORMAT_VERSION {
            return Err(PersistenceError::IncompatibleVersion {
                expected: FORMAT_VERSION,
                found: version,
                written_by,
            });
        }

        let work_size = VarintCodec.decode(source)?;
        tracker.set_work_size(work_size);

        let datasets = sequence_with_progress(dataset_codec()?).decode(tracker, source)?;
        tracing::debug!(
            datasets = datasets.len(),
            written_by = written_by.as_deref().unwrap_or("unknown"),
            "Workspace decoded"
        );
        Ok(Self { datasets })
    }

    /// Write the workspace to `path`.
    ///
    /// The file is written next to `path` and renamed over it once complete,
    /// so a failed or cancelled save leaves any previous file intact.
    pub fn save_to_file(
        &self,
        path: &Path,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PersistenceError> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir)?;
        {
            let mut encoder =
                GzEncoder::new(BufWriter::new(staged.as_file_mut()), Compression::default());
            self.write_to(&mut encoder, tracker)?;
            encoder.finish()?.flush()?;
        }
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| e.error)?;
        tracing::info!(
            path = %path.display(),
            datasets = self.datasets.len(),
            "Workspace saved"
        );
        Ok(())
    }

    /// Replace the datasets with the contents of `path`.
    ///
    /// On any error, including cancellation, the workspace is left untouched.
    pub fn load_from_file(
        &mut self,
        path: &Path,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PersistenceError> {
        let file = File::open(path)?;
        let mut source = BufReader::new(GzDecoder::new(BufReader::new(file)));
        let loaded = Self::read_from(&mut source, tracker)?;
        tracing::info!(
            path = %path.display(),
            datasets = loaded.datasets.len(),
            "Workspace loaded"
        );
        *self = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::dataset::tests::{budgetary, every_kind, experimental, stats};
    use super::*;
    use crate::progress::CancellationToken;

    fn sample() -> Workspace {
        Workspace {
            datasets: vec![experimental(), stats(), budgetary()],
        }
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn header(version: u64, writer: Option<&str>) -> Vec<u8> {
        let mut bytes = SIGNATURE.to_vec();
        VarintCodec.encode(&mut bytes, &version).unwrap();
        if let Some(w) = writer {
            StrCodec.encode_str(&mut bytes, w).unwrap();
        }
        bytes
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pwf");

        sample()
            .save_to_file(&path, &mut ProgressTracker::detached())
            .unwrap();

        let mut loaded = Workspace::new();
        loaded
            .load_from_file(&path, &mut ProgressTracker::detached())
            .unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn every_kind_survives_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.pwf");
        let workspace = Workspace {
            datasets: every_kind(),
        };
        workspace
            .save_to_file(&path, &mut ProgressTracker::detached())
            .unwrap();

        let mut loaded = Workspace::new();
        loaded
            .load_from_file(&path, &mut ProgressTracker::detached())
            .unwrap();
        assert_eq!(loaded, workspace);
    }

    #[test]
    fn empty_workspace_roundtrip() {
        let mut bytes = Vec::new();
        Workspace::new()
            .write_to(&mut bytes, &mut ProgressTracker::detached())
            .unwrap();
        let loaded =
            Workspace::read_from(&mut bytes.as_slice(), &mut ProgressTracker::detached()).unwrap();
        assert!(loaded.datasets.is_empty());
    }

    #[test]
    fn stream_starts_with_header() {
        let mut bytes = Vec::new();
        sample()
            .write_to(&mut bytes, &mut ProgressTracker::detached())
            .unwrap();

        let mut rest = &bytes[SIGNATURE.len()..];
        assert!(bytes.starts_with(SIGNATURE));
        assert_eq!(VarintCodec.decode(&mut rest).unwrap(), FORMAT_VERSION);
        assert_eq!(StrCodec.decode(&mut rest).unwrap(), program_version());
        // 2 + 4 + 1 subjects
        assert_eq!(VarintCodec.decode(&mut rest).unwrap(), 7);
    }

    #[test]
    fn progress_reaches_work_size() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut tracker = ProgressTracker::detached()
            .with_callback(move |pos, size| sink.lock().unwrap().push((pos, size)));

        let mut bytes = Vec::new();
        sample().write_to(&mut bytes, &mut tracker).unwrap();
        assert_eq!(tracker.work_size(), Some(7));
        assert_eq!(tracker.position(), 7);

        let mut tracker = ProgressTracker::detached();
        Workspace::read_from(&mut bytes.as_slice(), &mut tracker).unwrap();
        assert_eq!(tracker.position(), 7);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&(0, Some(7))));
        assert_eq!(seen.last(), Some(&(7, Some(7))));
    }

    #[test]
    fn wrong_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, gzip(b"Some other file\0\x12")).unwrap();

        let err = Workspace::new()
            .load_from_file(&path, &mut ProgressTracker::detached())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotAWorkspace));
    }

    #[test]
    fn uncompressed_file_is_not_a_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.pwf");
        std::fs::write(&path, header(FORMAT_VERSION, Some("Prest 3.0.0"))).unwrap();

        let err = Workspace::new()
            .load_from_file(&path, &mut ProgressTracker::detached())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotAWorkspace));
    }

    #[test]
    fn newer_version_names_writer() {
        let bytes = header(17, Some("Prest 2.9.1"));
        let err = Workspace::read_from(&mut bytes.as_slice(), &mut ProgressTracker::detached())
            .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"incompatible PWF version: expected 18, received 17 (saved by Prest 2.9.1)"
        );
    }

    #[test]
    fn ancient_version_has_no_writer() {
        let bytes = header(2, None);
        let err = Workspace::read_from(&mut bytes.as_slice(), &mut ProgressTracker::detached())
            .unwrap_err();
        match err {
            PersistenceError::IncompatibleVersion { found, written_by, .. } => {
                assert_eq!(found, 2);
                assert_eq!(written_by, None);
            }
            other => panic!("unexpected error: {other}"),
        }
        insta::assert_snapshot!(
            Workspace::read_from(&mut header(2, None).as_slice(), &mut ProgressTracker::detached())
                .unwrap_err()
                .to_string(),
            @"incompatible PWF version: expected 18, received 2"
        );
    }

    #[test]
    fn truncated_stream_is_corrupted() {
        let mut bytes = Vec::new();
        sample()
            .write_to(&mut bytes, &mut ProgressTracker::detached())
            .unwrap();
        bytes.truncate(bytes.len() - 3);

        let err = Workspace::read_from(&mut bytes.as_slice(), &mut ProgressTracker::detached())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Codec(CodecError::Eof)));
    }

    #[test]
    fn cancelled_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pwf");
        sample()
            .save_to_file(&path, &mut ProgressTracker::detached())
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let replacement = Workspace {
            datasets: vec![stats()],
        };
        let err = replacement
            .save_to_file(&path, &mut ProgressTracker::new(token))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Cancelled(_)));

        let mut loaded = Workspace::new();
        loaded
            .load_from_file(&path, &mut ProgressTracker::detached())
            .unwrap();
        assert_eq!(loaded, sample());
        // no staging files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("session.pwf");
        let err = sample()
            .save_to_file(&path, &mut ProgressTracker::detached())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
        assert!(!path.exists());
    }

    #[test]
    fn cancelled_load_keeps_existing_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pwf");
        sample()
            .save_to_file(&path, &mut ProgressTracker::detached())
            .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let mut tracker = ProgressTracker::new(token).with_callback(move |pos, _| {
            if pos == 3 {
                cancel.cancel();
            }
        });

        let mut workspace = Workspace {
            datasets: vec![stats()],
        };
        let err = workspace.load_from_file(&path, &mut tracker).unwrap_err();
        assert!(matches!(err, PersistenceError::Cancelled(_)));
        assert_eq!(workspace.datasets, vec![stats()]);
        assert_eq!(tracker.position(), 3);
    }
}
