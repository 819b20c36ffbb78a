//! Dgeprep is a library for assembling the inputs of a differential gene
//! expression analysis into one consistent, persisted bundle. It covers the
//! unglamorous first mile of a bulk RNA-seq study: obtaining and curating a
//! per-sample metadata table (from a remote sequencing archive or a local
//! delimited file), deriving transcript-to-gene lookup tables from a genome
//! annotation via [Polars](https://pola.rs/) data frames, and aggregating
//! per-sample transcript-level quantifications into gene-level count,
//! abundance, and effective-length matrices. A final consistency check
//! verifies that the curated samples and the aggregated matrices agree
//! before anything is written to disk.

pub mod annotation;
pub mod bundle;
pub mod checker;
pub mod curate;
pub mod errors;
pub mod metadata;
pub mod options;
pub mod prep_utils;
pub mod quant;
pub mod reader;

pub use annotation::Annotations;
pub use bundle::write_bundle;
pub use checker::{check_consistency, ConsistencyReport};
pub use curate::{curate, CuratedSamples};
pub use errors::PrepError;
pub use metadata::{read_metadata_tsv, EnaClient, ProjectAccession};
pub use quant::{discover_quant_files, QuantBundle, QuantFileIndex};
