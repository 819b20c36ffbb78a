use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Local;
use polars::prelude::*;
use tracing::info;
// the leading colons keep these from colliding with the `zip` module of
// the polars prelude
use ::zip::write::SimpleFileOptions;
use ::zip::ZipWriter;

use crate::curate::CuratedSamples;
use crate::errors::PrepError;
use crate::options::UnmappedPolicy;
use crate::quant::QuantBundle;

/// The fixed member names of a persisted bundle, matrices first.
pub const BUNDLE_MEMBERS: [&str; 6] = [
    "counts.tsv",
    "abundance.tsv",
    "length.tsv",
    "samples.tsv",
    "tx_metadata.tsv",
    "manifest.json",
];

/// Persists one curated sample set, its gene-level matrices, and the
/// transcript metadata table as a single date-stamped zip archive in
/// `out_dir`, returning the archive's path.
///
/// The archive is named `dge_bundle_<YYYY-MM-DD>.zip` and holds five
/// tab-separated tables plus a small JSON manifest recording the shapes,
/// the unmapped-transcript policy, and the creation date. Everything a
/// downstream differential-expression run needs travels together; no
/// member references a path outside the archive.
///
/// ### Errors
///
/// Fails with [`PrepError::BundleExists`] when the target archive already
/// exists. A bundle is a finalized analysis input, so an existing one is
/// never overwritten.
pub fn write_bundle<P: AsRef<Path>>(
    out_dir: P,
    curated: &CuratedSamples,
    quant: &QuantBundle,
    tx_metadata: &DataFrame,
) -> anyhow::Result<PathBuf> {
    let out_dir = out_dir.as_ref();
    let date = Local::now().format("%Y-%m-%d").to_string();
    let path = out_dir.join(format!("dge_bundle_{}.zip", date));

    let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            bail!(PrepError::BundleExists(path));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("could not create the bundle at {:?}", path))
        }
    };

    let mut zip = ZipWriter::new(file);
    let entry_opts = SimpleFileOptions::default();

    write_table(&mut zip, entry_opts, "counts.tsv", &quant.counts)?;
    write_table(&mut zip, entry_opts, "abundance.tsv", &quant.abundance)?;
    write_table(&mut zip, entry_opts, "length.tsv", &quant.length)?;
    write_table(&mut zip, entry_opts, "samples.tsv", curated.df())?;
    write_table(&mut zip, entry_opts, "tx_metadata.tsv", tx_metadata)?;

    let manifest = serde_json::json!({
        "created": date,
        "n_genes": quant.n_genes(),
        "n_samples": quant.n_samples(),
        "sample_ids": quant.sample_ids(),
        "sample_column": curated.sample_column(),
        "label_column": curated.label_column(),
        "curation_signature": quant.curation_signature(),
        "unmapped_policy": match quant.unmapped_policy() {
            UnmappedPolicy::Strict => "strict",
            UnmappedPolicy::Drop => "drop",
        },
        "n_dropped_transcripts": quant.n_dropped_transcripts(),
        "members": BUNDLE_MEMBERS,
    });
    zip.start_file("manifest.json", entry_opts)?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;

    zip.finish()?;
    info!(
        "wrote a bundle of {} gene(s) x {} sample(s) to {:?}",
        quant.n_genes(),
        quant.n_samples(),
        path
    );
    Ok(path)
}

/// Serializes one table as a tab-separated zip member.
fn write_table<W: Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    entry_opts: SimpleFileOptions,
    name: &str,
    df: &DataFrame,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    CsvWriter::new(&mut buf)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut df.clone())
        .with_context(|| format!("could not serialize the `{}` table", name))?;
    zip.start_file(name, entry_opts)?;
    zip.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curate::curate;
    use crate::options::{AggregationOptions, CurateOptions};
    use crate::quant::{aggregate, discover_quant_files};
    use std::fs;
    use std::io::Read;

    fn toy_inputs(dir: &Path) -> (CuratedSamples, QuantBundle, DataFrame) {
        for id in ["S1", "S2"] {
            let sample_dir = dir.join("quants").join(id);
            fs::create_dir_all(&sample_dir).unwrap();
            let mut f = fs::File::create(sample_dir.join("quant.sf")).unwrap();
            write!(
                f,
                "Name\tLength\tEffectiveLength\tTPM\tNumReads\nt1\t100\t80\t1.0\t10\n"
            )
            .unwrap();
        }
        let metadata = df!(
            "run_accession" => ["S1", "S2"],
            "tumor_type" => ["Astrocytoma", "Glioma"],
        )
        .unwrap();
        let opts = CurateOptions::new("run_accession", &["tumor_type"], "tumor_type");
        let curated = curate(&metadata, &opts).unwrap();

        let t2g = df!("transcript_id" => ["t1"], "gene_id" => ["g1"]).unwrap();
        let index = discover_quant_files(dir.join("quants"), "quant.sf")
            .unwrap()
            .restrict(&curated)
            .unwrap();
        let quant = aggregate(&index, &t2g, &AggregationOptions::default()).unwrap();

        let txm = df!(
            "transcript_id" => ["t1"],
            "gene_id" => ["g1"],
            "gene_name" => ["G1"],
            "gene_biotype" => ["protein_coding"],
        )
        .unwrap();
        (curated, quant, txm)
    }

    #[test]
    fn the_archive_carries_every_member() {
        let tmp = tempfile::tempdir().unwrap();
        let (curated, quant, txm) = toy_inputs(tmp.path());
        let path = write_bundle(tmp.path(), &curated, &quant, &txm).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("dge_bundle_"));

        let file = fs::File::open(&path).unwrap();
        let mut archive = ::zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        let mut expected: Vec<String> = BUNDLE_MEMBERS.iter().map(|m| m.to_string()).collect();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn the_manifest_records_the_shapes() {
        let tmp = tempfile::tempdir().unwrap();
        let (curated, quant, txm) = toy_inputs(tmp.path());
        let path = write_bundle(tmp.path(), &curated, &quant, &txm).unwrap();

        let file = fs::File::open(&path).unwrap();
        let mut archive = ::zip::ZipArchive::new(file).unwrap();
        let mut manifest = String::new();
        archive
            .by_name("manifest.json")
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["n_genes"], 1);
        assert_eq!(manifest["n_samples"], 2);
        assert_eq!(manifest["unmapped_policy"], "strict");
        assert_eq!(manifest["sample_ids"][0], "S1");
    }

    #[test]
    fn an_existing_bundle_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let (curated, quant, txm) = toy_inputs(tmp.path());
        write_bundle(tmp.path(), &curated, &quant, &txm).unwrap();
        let err = write_bundle(tmp.path(), &curated, &quant, &txm).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::BundleExists(_))
        ));
    }
}
