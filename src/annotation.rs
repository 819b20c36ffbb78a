use std::path::Path;

use anyhow::bail;
use polars::lazy::dsl::{col, lit};
use polars::prelude::*;
use tracing::{info, warn};

use crate::errors::PrepError;
use crate::reader::FeatureStruct;

/// The columns every [Annotations] data frame carries in addition to the
/// fixed feature-interval fields.
const LOOKUP_COLUMNS: [&str; 4] = ["transcript_id", "gene_id", "gene_name", "gene_biotype"];

/// A genome annotation held as a polars [DataFrame], one row per genomic
/// feature (gene, transcript, exon, ...).
///
/// The frame always carries the typed columns `seqname`, `source`,
/// `feature_type`, `start`, `end`, `score`, `strand`, `phase`,
/// `transcript_id`, `gene_id`, `gene_name`, and `gene_biotype`. Files that
/// spell the biotype attribute `gene_type` (GENCODE GTF) are normalized on
/// ingest, so downstream code never needs to know which spelling the file
/// used. The two lookup tables consumed by the quantification aggregator —
/// the transcript→gene map and the transcript metadata table — are pure
/// filter/project/deduplicate derivations of this frame.
#[derive(Debug)]
pub struct Annotations {
    df: DataFrame,
}

impl Annotations {
    /// Wraps an existing feature table. Fails with
    /// [`PrepError::SchemaMismatch`] when one of the columns the lookup
    /// derivations rely on is absent.
    pub fn new(df: DataFrame) -> anyhow::Result<Annotations> {
        let names = df.get_column_names();
        for required in ["feature_type"].iter().chain(LOOKUP_COLUMNS.iter()) {
            if !names.contains(required) {
                bail!(PrepError::SchemaMismatch(format!(
                    "the annotation table is missing the `{}` column",
                    required
                )));
            }
        }
        Ok(Annotations { df })
    }

    /// Parses a GTF (GFF2) annotation file, plain or gzipped.
    pub fn from_gtf<P: AsRef<Path>>(file_path: P) -> anyhow::Result<Annotations> {
        let fs = FeatureStruct::from_gtf(file_path)?;
        Annotations::from_feature_struct(fs)
    }

    /// Parses a GFF3 annotation file, plain or gzipped.
    pub fn from_gff<P: AsRef<Path>>(file_path: P) -> anyhow::Result<Annotations> {
        let fs = FeatureStruct::from_gff(file_path)?;
        Annotations::from_feature_struct(fs)
    }

    /// Builds the feature table from the columnar parse result.
    pub fn from_feature_struct(fs: FeatureStruct) -> anyhow::Result<Annotations> {
        let n = fs.attributes.tally;
        let mut attr_cols = fs.attributes.columns;

        // reconcile the two biotype spellings into one column, preferring
        // gene_biotype where a record carries both
        let gene_biotype = attr_cols.remove("gene_biotype").unwrap_or_default();
        let gene_type = attr_cols.remove("gene_type").unwrap_or_default();
        let biotype: Vec<Option<String>> = (0..n)
            .map(|i| {
                gene_biotype
                    .get(i)
                    .cloned()
                    .flatten()
                    .or_else(|| gene_type.get(i).cloned().flatten())
            })
            .collect();
        if biotype.iter().all(|b| b.is_none()) {
            warn!("the annotation file carries neither a `gene_biotype` nor a `gene_type` attribute");
        }

        let mut df_vec = vec![
            Series::new("seqname", fs.seqid),
            Series::new("source", fs.source),
            Series::new("feature_type", fs.feature_type),
            Series::new("start", fs.start),
            Series::new("end", fs.end),
            Series::new("score", fs.score),
            Series::new("strand", fs.strand),
            Series::new("phase", fs.phase),
            Series::new("gene_biotype", biotype),
        ];
        for name in ["transcript_id", "gene_id", "gene_name"] {
            let values = attr_cols.remove(name).unwrap_or_default();
            df_vec.push(if values.is_empty() {
                Series::new_null(name, n)
            } else {
                Series::new(name, values)
            });
        }

        let df = DataFrame::new(df_vec)?;
        Annotations::new(df)
    }

    /// A reference to the underlying feature table.
    pub fn df(&self) -> &DataFrame {
        &self.df
    }

    /// The rows of the feature table whose type is `transcript`, with a
    /// non-missing transcript identifier.
    fn transcript_rows(&self) -> anyhow::Result<LazyFrame> {
        Ok(self
            .df
            .clone()
            .lazy()
            .filter(col("feature_type").eq(lit("transcript")))
            .drop_nulls(Some(vec![col("transcript_id")])))
    }

    /// Derives the transcript→gene map: one row per distinct
    /// (transcript_id, gene_id) pair, transcript features only.
    ///
    /// ### Returns
    ///
    /// A two-column [DataFrame] (`transcript_id`, `gene_id`) with no
    /// duplicate pairs, or an error when the annotation contains no
    /// transcript features at all.
    pub fn tx_to_gene(&self) -> anyhow::Result<DataFrame> {
        let t2g = self
            .transcript_rows()?
            .select([col("transcript_id"), col("gene_id")])
            .collect()?
            .unique_stable(None, UniqueKeepStrategy::First, None)?;

        if t2g.height() == 0 {
            bail!(PrepError::SchemaMismatch(String::from(
                "the annotation contains no usable transcript features",
            )));
        }
        info!(
            "derived a transcript-to-gene map with {} transcripts",
            t2g.height()
        );
        Ok(t2g)
    }

    /// Derives the transcript metadata table: distinct rows of
    /// (`transcript_id`, `gene_id`, `gene_name`, `gene_biotype`).
    pub fn tx_metadata(&self) -> anyhow::Result<DataFrame> {
        let txm = self
            .transcript_rows()?
            .select(LOOKUP_COLUMNS.map(col))
            .collect()?
            .unique_stable(None, UniqueKeepStrategy::First, None)?;
        Ok(txm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_annotations() -> Annotations {
        let df = df!(
            "seqname" => ["chr1", "chr1", "chr1", "chr1", "chr1"],
            "source" => ["HAVANA"; 5],
            "feature_type" => ["gene", "transcript", "exon", "transcript", "transcript"],
            "start" => [1i64, 1, 1, 21, 21],
            "end" => [50i64, 30, 10, 50, 50],
            "score" => [None::<f32>; 5],
            "strand" => ["+"; 5],
            "phase" => [None::<&str>; 5],
            "transcript_id" => [None, Some("t1"), Some("t1"), Some("t2"), Some("t2")],
            "gene_id" => ["g1", "g1", "g1", "g2", "g2"],
            "gene_name" => ["G1", "G1", "G1", "G2", "G2"],
            "gene_biotype" => ["protein_coding", "protein_coding", "protein_coding", "lncRNA", "lncRNA"],
        )
        .unwrap();
        Annotations::new(df).unwrap()
    }

    #[test]
    fn tx_to_gene_is_deduplicated_and_transcript_only() {
        // t2 appears twice with identical attributes; the gene row and the
        // exon row must not contribute
        let t2g = toy_annotations().tx_to_gene().unwrap();
        assert_eq!(t2g.height(), 2);
        assert_eq!(t2g.get_column_names(), &["transcript_id", "gene_id"]);

        let txs: Vec<Option<&str>> = t2g.column("transcript_id").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(txs, vec![Some("t1"), Some("t2")]);
    }

    #[test]
    fn tx_metadata_carries_biotype() {
        let txm = toy_annotations().tx_metadata().unwrap();
        assert_eq!(txm.height(), 2);
        let biotypes: Vec<Option<&str>> = txm.column("gene_biotype").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(biotypes, vec![Some("protein_coding"), Some("lncRNA")]);
    }

    #[test]
    fn missing_columns_are_a_schema_mismatch() {
        let df = df!(
            "feature_type" => ["transcript"],
            "transcript_id" => ["t1"],
        )
        .unwrap();
        let err = Annotations::new(df).unwrap_err();
        assert!(err.downcast_ref::<PrepError>().is_some());
    }
}
