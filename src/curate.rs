use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::bail;
use lazy_static::lazy_static;
use polars::lazy::dsl::{col, lit, when};
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::errors::PrepError;
use crate::options::CurateOptions;

// each curated sample set gets a unique signature, which downstream
// artifacts record so that a bundle can be traced back to the exact
// curation that produced it
lazy_static! {
    static ref CURATION_COUNTER: AtomicU32 = AtomicU32::new(0);
}

/// The finalized per-sample metadata table: deduplicated, filtered,
/// projected to the configured columns, and carrying exactly one derived
/// group label per row.
///
/// This struct owns the sample set. The quantification aggregator and the
/// consistency checker receive it read-only; nothing mutates it after
/// curation.
#[derive(Debug)]
pub struct CuratedSamples {
    df: DataFrame,
    sample_column: String,
    label_column: String,
    signature: u64,
}

impl CuratedSamples {
    /// A reference to the curated table.
    pub fn df(&self) -> &DataFrame {
        &self.df
    }

    /// The name of the sample identifier column.
    pub fn sample_column(&self) -> &str {
        &self.sample_column
    }

    /// The name of the derived group-label column.
    pub fn label_column(&self) -> &str {
        &self.label_column
    }

    /// The unique signature of this curation.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// The sample identifiers, in table row order.
    pub fn sample_ids(&self) -> anyhow::Result<Vec<String>> {
        let ids = self
            .df
            .column(&self.sample_column)?
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Ok(ids)
    }
}

/// Curates a raw per-sample metadata table.
///
/// The operations run in a fixed order: (i) duplicate removal — duplicate
/// detection compares every column except the configured
/// `dedup_ignore_columns`, and only the first occurrence per sample
/// identifier survives; (ii) projection to the retained column set;
/// (iii) conjunctive application of the row-inclusion predicates;
/// (iv) group-label assignment, where the ordered substring rules are
/// scanned and the first match wins, with the default label covering
/// unmatched rows and rows whose annotation is missing.
///
/// ### Guarantees
///
/// The output identifier set is a subset of the input's, strictly
/// deduplicated, and every row carries exactly one group label.
///
/// ### Errors
///
/// Fails with [`PrepError::SchemaMismatch`] when the configuration
/// references a column absent from the input, rather than silently
/// dropping it.
pub fn curate(df: &DataFrame, opts: &CurateOptions) -> anyhow::Result<CuratedSamples> {
    let names = df.get_column_names();
    let missing: Vec<&str> = opts
        .referenced_columns()
        .into_iter()
        .filter(|c| !names.contains(c))
        .collect();
    if !missing.is_empty() {
        bail!(PrepError::SchemaMismatch(format!(
            "the metadata table is missing configured column(s): {}",
            missing.join(", ")
        )));
    }

    // rows without a sample identifier can never be reconciled downstream
    let df = df
        .clone()
        .lazy()
        .filter(col(&opts.sample_column).is_not_null())
        .collect()?;
    if df.height() == 0 {
        bail!(PrepError::SchemaMismatch(format!(
            "no row of the metadata table carries a `{}` identifier",
            opts.sample_column
        )));
    }

    let (deduped, n_dropped) = deduplicate(&df, opts)?;
    if n_dropped > 0 {
        info!(
            "removed {} duplicate sample record(s); {} remain",
            n_dropped,
            deduped.height()
        );
    }

    // predicates may read columns that are not retained (a consent date,
    // say), so they run before the projection; row filtering and column
    // projection commute, the output is the same as projecting first
    let mut lf = deduped.lazy();
    for filter in &opts.filters {
        lf = lf.filter(filter.to_expr());
    }

    // first-matching-rule label assignment: the rules are folded from the
    // last to the first so that the earliest rule ends up outermost
    let mut label_expr = lit(opts.default_label.clone());
    for rule in opts.label_rules.iter().rev() {
        let matches = col(&opts.label_source_column)
            .cast(DataType::String)
            .str()
            .contains_literal(lit(rule.pattern.clone()))
            .fill_null(lit(false));
        label_expr = when(matches)
            .then(lit(rule.label.clone()))
            .otherwise(label_expr);
    }
    lf = lf.with_column(label_expr.alias(&opts.label_column));

    // projection: the sample column first, the retained covariates, and
    // the derived label last
    let mut projected_cols: Vec<String> = vec![opts.sample_column.clone()];
    for c in &opts.retain_columns {
        if !projected_cols.contains(c) {
            projected_cols.push(c.clone());
        }
    }
    projected_cols.push(opts.label_column.clone());
    lf = lf.select(projected_cols.iter().map(|c| col(c)).collect::<Vec<_>>());

    let curated = lf.collect()?;
    debug!(
        "curation retained {} of {} sample record(s)",
        curated.height(),
        df.height()
    );

    let gid = CURATION_COUNTER.fetch_add(1, Ordering::SeqCst) as u64;
    Ok(CuratedSamples {
        df: curated,
        sample_column: opts.sample_column.clone(),
        label_column: opts.label_column.clone(),
        signature: gid << 32,
    })
}

/// Removes duplicate sample records, keeping the first occurrence per
/// identifier. Duplicate detection compares all columns except the
/// configured ignore set, so that benign per-row variation (typically a
/// file-path column) does not make two records of one sample look
/// distinct; conflicting duplicates are still reported before the first
/// one wins.
fn deduplicate(df: &DataFrame, opts: &CurateOptions) -> anyhow::Result<(DataFrame, usize)> {
    let compare_cols: Vec<String> = df
        .get_column_names()
        .into_iter()
        .filter(|c| !opts.dedup_ignore_columns.iter().any(|ig| ig == c))
        .map(|c| c.to_string())
        .collect();

    let n_exact = df.height()
        - df.unique_stable(Some(&compare_cols), UniqueKeepStrategy::First, None)?
            .height();
    let deduped = df.unique_stable(
        Some(&[opts.sample_column.clone()]),
        UniqueKeepStrategy::First,
        None,
    )?;
    let n_dropped = df.height() - deduped.height();
    if n_dropped > n_exact {
        warn!(
            "{} duplicate record(s) disagreed outside the ignored columns; kept the first occurrence of each identifier",
            n_dropped - n_exact
        );
    }
    Ok((deduped, n_dropped))
}
