use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use polars::lazy::dsl::{all, col, lit, when};
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::curate::CuratedSamples;
use crate::errors::PrepError;
use crate::options::{AggregationOptions, UnmappedPolicy};

/// The expected columns of a transcript quantification file, in file
/// order: transcript identifier, length, effective length, estimated
/// abundance (TPM), and estimated count.
pub const QUANT_COLUMNS: [&str; 5] = ["Name", "Length", "EffectiveLength", "TPM", "NumReads"];

/// The mapping from sample identifiers to the on-disk location of each
/// sample's quantification output.
///
/// An index is built by directory discovery and is then restricted to the
/// curated sample set before aggregation; the restricted index's iteration
/// order defines the column order of the resulting matrices.
#[derive(Debug)]
pub struct QuantFileIndex {
    entries: Vec<(String, PathBuf)>,
    curation_signature: Option<u64>,
}

impl QuantFileIndex {
    /// The (sample identifier, file path) entries in iteration order.
    pub fn entries(&self) -> &[(String, PathBuf)] {
        &self.entries
    }

    /// The sample identifiers in iteration order.
    pub fn sample_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(s, _)| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The signature of the curation this index was restricted against,
    /// if it has been restricted.
    pub fn curation_signature(&self) -> Option<u64> {
        self.curation_signature
    }

    /// Restricts the index to the identifiers of the curated sample set,
    /// reordered to the curated table's row order.
    ///
    /// Samples present in the metadata but absent on disk are a
    /// data-availability fact, not an error: they are logged and excluded.
    /// Restricting to zero common identifiers, however, fails with
    /// [`PrepError::NoQuantFilesFound`] — an empty-but-successful bundle
    /// is never produced.
    pub fn restrict(&self, curated: &CuratedSamples) -> anyhow::Result<QuantFileIndex> {
        let on_disk: HashMap<&str, &PathBuf> = self
            .entries
            .iter()
            .map(|(s, p)| (s.as_str(), p))
            .collect();

        let mut entries = Vec::new();
        for id in curated.sample_ids()? {
            match on_disk.get(id.as_str()) {
                Some(path) => entries.push((id, (*path).clone())),
                None => {
                    info!(
                        "sample `{}` is present in the metadata but has no quantification file on disk; excluding it",
                        id
                    );
                }
            }
        }
        if entries.is_empty() {
            bail!(PrepError::NoQuantFilesFound(format!(
                "none of the {} curated samples has a quantification file in the index",
                curated.df().height()
            )));
        }
        debug!(
            "restricted the quantification index to {} of {} discovered sample(s)",
            entries.len(),
            self.entries.len()
        );
        Ok(QuantFileIndex {
            entries,
            curation_signature: Some(curated.signature()),
        })
    }
}

/// Discovers per-sample quantification files below `root`.
///
/// The walk is recursive; every file whose name equals `file_name`
/// (typically `quant.sf`) is collected, and its owning sample identifier
/// is the name of its immediate parent directory. The resulting index is
/// ordered lexically by sample identifier.
///
/// ### Errors
///
/// Fails with [`PrepError::NoQuantFilesFound`] when the walk matches
/// nothing.
pub fn discover_quant_files<P: AsRef<Path>>(
    root: P,
    file_name: &str,
) -> anyhow::Result<QuantFileIndex> {
    let root = root.as_ref();
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let rd = fs::read_dir(&dir)
            .with_context(|| format!("could not read the directory {:?}", dir))?;
        for entry in rd.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
                let sample = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(|s| s.to_string());
                match sample {
                    Some(sample) => entries.push((sample, path)),
                    None => warn!(
                        "could not derive a sample identifier for {:?}; skipping it",
                        path
                    ),
                }
            }
        }
    }

    if entries.is_empty() {
        bail!(PrepError::NoQuantFilesFound(format!(
            "no file named `{}` exists below {:?}",
            file_name, root
        )));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for pair in entries.windows(2) {
        if pair[0].0 == pair[1].0 {
            warn!(
                "sample `{}` owns more than one quantification file; keeping {:?}",
                pair[0].0, pair[0].1
            );
        }
    }
    entries.dedup_by(|a, b| a.0 == b.0);
    info!(
        "discovered quantification files for {} sample(s) below {:?}",
        entries.len(),
        root
    );
    Ok(QuantFileIndex {
        entries,
        curation_signature: None,
    })
}

/// The gene-level quantification matrices of one aggregation run: counts,
/// abundance, and effective length, each with one `gene_id` row key column
/// followed by one column per retained sample. All three share the same
/// row order (sorted by gene identifier) and the same column order (the
/// restricted index's iteration order).
#[derive(Debug)]
pub struct QuantBundle {
    pub counts: DataFrame,
    pub abundance: DataFrame,
    pub length: DataFrame,
    sample_ids: Vec<String>,
    curation_signature: Option<u64>,
    unmapped_policy: UnmappedPolicy,
    n_dropped_transcripts: usize,
}

impl QuantBundle {
    /// The sample identifiers, in matrix column order.
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// The gene identifiers, in matrix row order.
    pub fn gene_ids(&self) -> anyhow::Result<Vec<String>> {
        let ids = self
            .counts
            .column("gene_id")?
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Ok(ids)
    }

    pub fn n_genes(&self) -> usize {
        self.counts.height()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// The signature of the curation whose sample set this bundle was
    /// aggregated for.
    pub fn curation_signature(&self) -> Option<u64> {
        self.curation_signature
    }

    /// The unmapped-transcript policy this bundle was aggregated under.
    pub fn unmapped_policy(&self) -> UnmappedPolicy {
        self.unmapped_policy
    }

    /// How many transcripts the lenient unmapped policy dropped across all
    /// samples. Always zero under the strict policy.
    pub fn n_dropped_transcripts(&self) -> usize {
        self.n_dropped_transcripts
    }
}

/// Aggregates transcript-level quantifications to gene level.
///
/// For every sample in the index, the quantification table is joined to
/// the transcript→gene map and reduced per gene: counts and abundance are
/// summed, and the gene's effective length is the abundance-weighted mean
/// of its transcripts' effective lengths (falling back to the plain mean
/// for genes with zero abundance). The per-sample results are assembled
/// into three matrices over the union of observed genes; a gene absent
/// from one sample's file contributes zeros there.
///
/// ### Errors
///
/// * [`PrepError::NoQuantFilesFound`] when the index is empty.
/// * [`PrepError::SchemaMismatch`] when a quantification file lacks one of
///   the expected columns.
/// * [`PrepError::UnmappedTranscripts`] when a file contains transcripts
///   absent from the map and the policy is [`UnmappedPolicy::Strict`];
///   under [`UnmappedPolicy::Drop`] the offenders are removed and counted
///   instead.
pub fn aggregate(
    index: &QuantFileIndex,
    tx2gene: &DataFrame,
    options: &AggregationOptions,
) -> anyhow::Result<QuantBundle> {
    if index.is_empty() {
        bail!(PrepError::NoQuantFilesFound(String::from(
            "the quantification file index is empty",
        )));
    }

    let mut per_sample: Vec<(String, DataFrame)> = Vec::with_capacity(index.len());
    let mut n_dropped_total = 0usize;
    for (sample, path) in index.entries() {
        let quant = read_quant_file(path)?;
        let (per_gene, n_dropped) =
            aggregate_one_sample(sample, &quant, tx2gene, options.unmapped_policy)?;
        n_dropped_total += n_dropped;
        per_sample.push((sample.clone(), per_gene));
    }
    if n_dropped_total > 0 {
        warn!(
            "dropped {} unmapped transcript record(s) across {} sample(s)",
            n_dropped_total,
            index.len()
        );
    }

    // the row spine is the union of genes observed in any sample, sorted
    let mut all_ids = per_sample[0].1.column("gene_id")?.clone();
    for (_, df) in per_sample.iter().skip(1) {
        all_ids.append(df.column("gene_id")?)?;
    }
    let spine = DataFrame::new(vec![all_ids])?
        .unique_stable(None, UniqueKeepStrategy::First, None)?
        .lazy()
        .sort("gene_id", SortOptions::default())
        .collect()?;

    let counts = assemble_matrix(&spine, &per_sample, "counts")?;
    let abundance = assemble_matrix(&spine, &per_sample, "abundance")?;
    let length = assemble_matrix(&spine, &per_sample, "length")?;

    info!(
        "aggregated {} transcripts-level file(s) into {} gene(s) x {} sample(s)",
        index.len(),
        spine.height(),
        per_sample.len()
    );
    Ok(QuantBundle {
        counts,
        abundance,
        length,
        sample_ids: per_sample.into_iter().map(|(s, _)| s).collect(),
        curation_signature: index.curation_signature(),
        unmapped_policy: options.unmapped_policy,
        n_dropped_transcripts: n_dropped_total,
    })
}

/// Reads one transcript quantification table, verifying that all expected
/// columns are present and coercing the numeric ones to floats.
fn read_quant_file(path: &Path) -> anyhow::Result<DataFrame> {
    let df = CsvReader::from_path(path)
        .with_context(|| format!("could not open the quantification file {:?}", path))?
        .has_header(true)
        .with_separator(b'\t')
        .finish()
        .with_context(|| format!("could not parse the quantification file {:?}", path))?;

    let names = df.get_column_names();
    for required in QUANT_COLUMNS {
        if !names.contains(&required) {
            bail!(PrepError::SchemaMismatch(format!(
                "the quantification file {:?} is missing the `{}` column",
                path, required
            )));
        }
    }
    let df = df
        .lazy()
        .with_columns([
            col("EffectiveLength").cast(DataType::Float64),
            col("TPM").cast(DataType::Float64),
            col("NumReads").cast(DataType::Float64),
        ])
        .collect()?;
    Ok(df)
}

/// Joins one sample's quantifications to the transcript→gene map and
/// reduces them per gene. Returns the per-gene frame and the number of
/// transcript records dropped under the lenient policy.
fn aggregate_one_sample(
    sample: &str,
    quant: &DataFrame,
    tx2gene: &DataFrame,
    policy: UnmappedPolicy,
) -> anyhow::Result<(DataFrame, usize)> {
    let joined = quant.join(
        tx2gene,
        ["Name"],
        ["transcript_id"],
        JoinArgs::new(JoinType::Left),
    )?;

    let n_unmapped = joined.column("gene_id")?.null_count();
    let mut n_dropped = 0usize;
    let joined = if n_unmapped > 0 {
        match policy {
            UnmappedPolicy::Strict => {
                let offenders = joined
                    .clone()
                    .lazy()
                    .filter(col("gene_id").is_null())
                    .select([col("Name")])
                    .collect()?;
                let example = offenders
                    .column("Name")?
                    .str()?
                    .get(0)
                    .unwrap_or("<unknown>")
                    .to_string();
                bail!(PrepError::UnmappedTranscripts {
                    sample: sample.to_string(),
                    n_unmapped,
                    example,
                });
            }
            UnmappedPolicy::Drop => {
                n_dropped = n_unmapped;
                debug!(
                    "dropping {} unmapped transcript record(s) from sample `{}`",
                    n_unmapped, sample
                );
                joined
                    .lazy()
                    .filter(col("gene_id").is_not_null())
                    .collect()?
            }
        }
    } else {
        joined
    };

    // gene effective length is the abundance-weighted mean of the
    // transcript effective lengths; genes with zero abundance fall back
    // to the unweighted mean
    let per_gene = joined
        .lazy()
        .group_by([col("gene_id")])
        .agg([
            col("NumReads").sum().alias("counts"),
            col("TPM").sum().alias("abundance"),
            when(col("TPM").sum().gt(lit(0.0)))
                .then((col("TPM") * col("EffectiveLength")).sum() / col("TPM").sum())
                .otherwise(col("EffectiveLength").mean())
                .alias("length"),
        ])
        .collect()?;
    Ok((per_gene, n_dropped))
}

/// Left-joins one value column per sample onto the gene spine, renaming
/// each to its sample identifier and zero-filling genes a sample never
/// observed.
fn assemble_matrix(
    spine: &DataFrame,
    per_sample: &[(String, DataFrame)],
    value_column: &str,
) -> anyhow::Result<DataFrame> {
    let mut matrix = spine.clone();
    for (sample, per_gene) in per_sample {
        let mut sub = per_gene.select(["gene_id", value_column])?;
        sub.rename(value_column, sample)?;
        matrix = matrix.join(&sub, ["gene_id"], ["gene_id"], JoinArgs::new(JoinType::Left))?;
    }
    let matrix = matrix
        .lazy()
        .with_columns([all().exclude(["gene_id"]).fill_null(lit(0.0))])
        .collect()?;
    Ok(matrix)
}
