use polars::lazy::dsl::{col, lit, Expr};
use serde::{Deserialize, Serialize};

/// One row-inclusion predicate of the metadata curation step.
///
/// Predicates are applied conjunctively: a row must satisfy every
/// configured predicate to survive. A comparison against a missing value
/// evaluates to missing and therefore excludes the row, with the exception
/// of [RowFilter::IsNull], which exists precisely to keep such rows (e.g.
/// samples whose consent-withdrawal date was never set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowFilter {
    /// Keep rows whose `column` is missing.
    IsNull { column: String },
    /// Keep rows whose `column` is present.
    IsNotNull { column: String },
    /// Keep rows whose `column` equals `value` (string comparison).
    Equals { column: String, value: String },
    /// Keep rows whose `column` differs from `value` (string comparison).
    NotEquals { column: String, value: String },
    /// Keep rows whose numeric `column` is >= `value`.
    AtLeast { column: String, value: f64 },
    /// Keep rows whose numeric `column` is <= `value`.
    AtMost { column: String, value: f64 },
}

impl RowFilter {
    /// The column this predicate reads.
    pub fn column(&self) -> &str {
        match self {
            RowFilter::IsNull { column }
            | RowFilter::IsNotNull { column }
            | RowFilter::Equals { column, .. }
            | RowFilter::NotEquals { column, .. }
            | RowFilter::AtLeast { column, .. }
            | RowFilter::AtMost { column, .. } => column,
        }
    }

    /// Lowers the predicate into a polars expression.
    pub fn to_expr(&self) -> Expr {
        match self {
            RowFilter::IsNull { column } => col(column).is_null(),
            RowFilter::IsNotNull { column } => col(column).is_not_null(),
            RowFilter::Equals { column, value } => col(column).eq(lit(value.clone())),
            RowFilter::NotEquals { column, value } => col(column).neq(lit(value.clone())),
            RowFilter::AtLeast { column, value } => col(column).gt_eq(lit(*value)),
            RowFilter::AtMost { column, value } => col(column).lt_eq(lit(*value)),
        }
    }
}

/// One (pattern, label) rule of the group-label assignment step. The
/// pattern is matched as a literal substring of the annotation field;
/// rules are scanned in configuration order and the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRule {
    pub pattern: String,
    pub label: String,
}

fn default_label_column() -> String {
    String::from("group")
}

fn default_fallback_label() -> String {
    String::from("other")
}

/// Configuration of the metadata curation stage.
///
/// Everything the curator does is driven by this struct; there is no
/// process-wide state. The duplicate-detection scope is configurable via
/// `dedup_ignore_columns` because benign per-row variation (typically a
/// file-path column) must not make two records of the same sample look
/// distinct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurateOptions {
    /// The column holding the unique sample identifier.
    pub sample_column: String,
    /// The columns to keep after curation, in output order. The sample
    /// column is always retained and need not be listed.
    pub retain_columns: Vec<String>,
    /// Columns excluded from duplicate detection.
    #[serde(default)]
    pub dedup_ignore_columns: Vec<String>,
    /// Conjunctive row-inclusion predicates, applied in order.
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    /// The categorical annotation column the label rules match against.
    pub label_source_column: String,
    /// The name of the derived group-label column.
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Ordered (pattern, label) rules; first match wins.
    #[serde(default)]
    pub label_rules: Vec<LabelRule>,
    /// Label assigned when no rule matches or the annotation is missing.
    #[serde(default = "default_fallback_label")]
    pub default_label: String,
}

impl CurateOptions {
    pub fn new<T: AsRef<str>>(
        sample_column: T,
        retain_columns: &[T],
        label_source_column: T,
    ) -> CurateOptions {
        CurateOptions {
            sample_column: sample_column.as_ref().to_string(),
            retain_columns: retain_columns
                .iter()
                .map(|c| c.as_ref().to_string())
                .collect(),
            dedup_ignore_columns: Vec::new(),
            filters: Vec::new(),
            label_source_column: label_source_column.as_ref().to_string(),
            label_column: default_label_column(),
            label_rules: Vec::new(),
            default_label: default_fallback_label(),
        }
    }

    /// Every input column the configuration references. Used to fail fast
    /// with a schema mismatch before any transformation runs.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = vec![self.sample_column.as_str()];
        cols.extend(self.retain_columns.iter().map(|c| c.as_str()));
        cols.extend(self.filters.iter().map(|f| f.column()));
        cols.push(self.label_source_column.as_str());
        cols.dedup();
        cols
    }
}

/// What to do when a quantification file contains transcript identifiers
/// that are absent from the transcript-to-gene map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedPolicy {
    /// Abort the whole aggregation. This is the default: an unmapped
    /// transcript usually means the annotation and the quantification
    /// index disagree, which is worth stopping for.
    Strict,
    /// Drop the offending transcripts and log how many were dropped.
    Drop,
}

impl Default for UnmappedPolicy {
    fn default() -> Self {
        UnmappedPolicy::Strict
    }
}

/// Configuration of the quantification aggregation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationOptions {
    /// The fixed file name of per-sample quantification outputs.
    #[serde(default = "default_quant_file_name")]
    pub file_name: String,
    /// Policy for transcripts missing from the transcript-to-gene map.
    #[serde(default)]
    pub unmapped_policy: UnmappedPolicy,
}

fn default_quant_file_name() -> String {
    String::from("quant.sf")
}

impl Default for AggregationOptions {
    fn default() -> Self {
        AggregationOptions {
            file_name: default_quant_file_name(),
            unmapped_policy: UnmappedPolicy::default(),
        }
    }
}
