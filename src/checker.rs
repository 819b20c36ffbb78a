use tracing::{info, warn};

use crate::curate::CuratedSamples;
use crate::quant::QuantBundle;

/// The outcome of a metadata-versus-matrix consistency check.
///
/// The report is descriptive: building one never fails and never panics,
/// whatever the two inputs look like. Callers decide what a failed check
/// means for them (typically: refuse to persist the bundle).
#[derive(Debug)]
pub struct ConsistencyReport {
    /// Whether the two sample sequences are identical, element by element.
    pub pass: bool,
    /// How many samples the curated metadata carries.
    pub n_metadata: usize,
    /// How many sample columns the matrices carry.
    pub n_bundle: usize,
    /// Every position where the two sequences disagree, as
    /// (position, metadata identifier, matrix identifier); `None` marks a
    /// sequence that ends before the other.
    pub mismatches: Vec<(usize, Option<String>, Option<String>)>,
}

impl ConsistencyReport {
    /// A one-line human-readable summary.
    pub fn summary(&self) -> String {
        if self.pass {
            format!(
                "the metadata and the matrices agree on {} sample(s)",
                self.n_metadata
            )
        } else {
            format!(
                "the metadata ({} sample(s)) and the matrices ({} column(s)) disagree at {} position(s)",
                self.n_metadata,
                self.n_bundle,
                self.mismatches.len()
            )
        }
    }
}

/// Compares the curated sample sequence against the matrix column
/// sequence, position by position.
///
/// Both the identifier sets and their order must agree: differential
/// expression tooling pairs metadata rows with matrix columns positionally,
/// so a reordering is as much of a defect as a missing sample. Positions
/// are 0-based.
pub fn check_consistency(
    curated: &CuratedSamples,
    bundle: &QuantBundle,
) -> anyhow::Result<ConsistencyReport> {
    if let Some(sig) = bundle.curation_signature() {
        if sig != curated.signature() {
            warn!(
                "the matrices were aggregated for a different curation (signature {:#x}, expected {:#x})",
                sig,
                curated.signature()
            );
        }
    }

    let metadata_ids = curated.sample_ids()?;
    let bundle_ids = bundle.sample_ids();

    let n = metadata_ids.len().max(bundle_ids.len());
    let mut mismatches = Vec::new();
    for i in 0..n {
        let m = metadata_ids.get(i);
        let b = bundle_ids.get(i);
        if m != b {
            mismatches.push((i, m.cloned(), b.cloned()));
        }
    }

    let report = ConsistencyReport {
        pass: mismatches.is_empty(),
        n_metadata: metadata_ids.len(),
        n_bundle: bundle_ids.len(),
        mismatches,
    };
    if report.pass {
        info!("{}", report.summary());
    } else {
        warn!("{}", report.summary());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curate::curate;
    use crate::options::{AggregationOptions, CurateOptions};
    use crate::quant::{aggregate, discover_quant_files};
    use polars::prelude::*;
    use std::fs;
    use std::io::Write;

    fn curated_with_ids(ids: &[&str]) -> crate::curate::CuratedSamples {
        let n = ids.len();
        let df = df!(
            "run_accession" => ids,
            "tumor_type" => vec![Some("Astrocytoma"); n],
        )
        .unwrap();
        let opts = CurateOptions::new("run_accession", &["tumor_type"], "tumor_type");
        curate(&df, &opts).unwrap()
    }

    // discovery alone orders lexically, so the index is restricted against
    // a curated table holding `ids` in the requested order; the matrix
    // columns then follow that order exactly
    fn bundle_with_ids(ids: &[&str]) -> QuantBundle {
        let tmp = tempfile::tempdir().unwrap();
        for id in ids {
            let dir = tmp.path().join(id);
            fs::create_dir_all(&dir).unwrap();
            let mut f = fs::File::create(dir.join("quant.sf")).unwrap();
            write!(
                f,
                "Name\tLength\tEffectiveLength\tTPM\tNumReads\nt1\t100\t80\t1.0\t10\n"
            )
            .unwrap();
        }
        let t2g = df!("transcript_id" => ["t1"], "gene_id" => ["g1"]).unwrap();
        let index = discover_quant_files(tmp.path(), "quant.sf")
            .unwrap()
            .restrict(&curated_with_ids(ids))
            .unwrap();
        aggregate(&index, &t2g, &AggregationOptions::default()).unwrap()
    }

    #[test]
    fn identical_sequences_pass() {
        let curated = curated_with_ids(&["A", "B", "C"]);
        let bundle = bundle_with_ids(&["A", "B", "C"]);
        let report = check_consistency(&curated, &bundle).unwrap();
        assert!(report.pass);
        assert!(report.mismatches.is_empty());
        assert_eq!(report.n_metadata, 3);
        assert_eq!(report.n_bundle, 3);
    }

    #[test]
    fn a_reordering_is_reported_position_by_position() {
        let curated = curated_with_ids(&["A", "B", "C"]);
        let bundle = bundle_with_ids(&["A", "C", "B"]);
        let report = check_consistency(&curated, &bundle).unwrap();
        assert!(!report.pass);
        assert_eq!(
            report.mismatches,
            vec![
                (1, Some(String::from("B")), Some(String::from("C"))),
                (2, Some(String::from("C")), Some(String::from("B"))),
            ]
        );
    }

    #[test]
    fn a_missing_sample_shows_up_as_a_one_sided_mismatch() {
        let curated = curated_with_ids(&["A", "B", "C"]);
        let bundle = bundle_with_ids(&["A", "B"]);
        let report = check_consistency(&curated, &bundle).unwrap();
        assert!(!report.pass);
        assert_eq!(report.n_metadata, 3);
        assert_eq!(report.n_bundle, 2);
        assert_eq!(
            report.mismatches,
            vec![(2, Some(String::from("C")), None)]
        );
    }

    #[test]
    fn a_single_sample_passes() {
        let curated = curated_with_ids(&["A"]);
        let bundle = bundle_with_ids(&["A"]);
        let report = check_consistency(&curated, &bundle).unwrap();
        assert!(report.pass);
    }
}
