use std::path::PathBuf;

use thiserror::Error;

/// The typed failure kinds of the preparation stages.
///
/// Most operations in this crate return [`anyhow::Result`] so that callers
/// get full context chains, but every failure that a caller might want to
/// branch on is rooted in one of these variants. Use
/// [`anyhow::Error::downcast_ref`] to recover the kind from a propagated
/// error.
#[derive(Debug, Error)]
pub enum PrepError {
    /// An expected structured field was absent from a remote run summary.
    /// This means the sample identifier is not resolvable from metadata,
    /// even though the run still has sequencing data, so we refuse to
    /// proceed with partial data.
    #[error("expected field `{field}` is missing from the summary of run `{record}`")]
    MissingField { field: String, record: String },

    /// A configured column does not exist in the table it refers to.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Quantification file discovery (or its restriction to the curated
    /// sample set) produced nothing to aggregate.
    #[error("no quantification files found: {0}")]
    NoQuantFilesFound(String),

    /// A quantification file contains transcript identifiers that are not
    /// present in the transcript-to-gene map.
    #[error(
        "{n_unmapped} transcript(s) in the quantification file of sample `{sample}` are absent \
         from the transcript-to-gene map (first offender: `{example}`)"
    )]
    UnmappedTranscripts {
        sample: String,
        n_unmapped: usize,
        example: String,
    },

    /// The remote archive could not be reached at all.
    #[error("remote metadata request failed: {0}")]
    RemoteHttp(String),

    /// The remote archive answered with a non-success status.
    #[error("remote metadata endpoint returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    /// An output archive with the same name already exists. Bundles are
    /// written once and never appended to or partially updated.
    #[error("output bundle already exists and will not be overwritten: {0}")]
    BundleExists(PathBuf),
}
