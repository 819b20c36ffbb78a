use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use polars::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dgeprep::annotation::Annotations;
use dgeprep::bundle::write_bundle;
use dgeprep::checker::check_consistency;
use dgeprep::curate::curate;
use dgeprep::errors::PrepError;
use dgeprep::metadata::{read_metadata_tsv, EnaClient, ProjectAccession};
use dgeprep::options::{AggregationOptions, CurateOptions, UnmappedPolicy};
use dgeprep::prep_utils::AnnotationFormat;
use dgeprep::quant::{aggregate, discover_quant_files};

#[derive(Parser)]
#[command(name = "dgeprep")]
#[command(about = "Assemble the inputs of a differential gene expression analysis")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a project's run metadata from the remote archive")]
    FetchMetadata(FetchMetadataArgs),
    #[command(about = "Curate metadata, aggregate quantifications, and write a bundle")]
    Prepare(PrepareArgs),
}

#[derive(Args)]
struct FetchMetadataArgs {
    /// The project accession, e.g. PRJNA716260
    accession: String,

    /// Where to write the metadata table (tab-separated)
    #[arg(long, default_value = "metadata.tsv")]
    out: PathBuf,
}

#[derive(Args)]
struct PrepareArgs {
    /// The raw per-sample metadata table (tab-separated)
    #[arg(long)]
    metadata: PathBuf,

    /// The curation configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// The genome annotation file, plain or gzipped
    #[arg(long)]
    annotation: PathBuf,

    /// The annotation format
    #[arg(long, value_enum, default_value = "gtf")]
    format: AnnotationFormat,

    /// The directory holding the per-sample quantification outputs
    #[arg(long)]
    quant_dir: PathBuf,

    /// The file name of per-sample quantification outputs
    #[arg(long, default_value = "quant.sf")]
    quant_file_name: String,

    /// Policy for transcripts missing from the transcript-to-gene map
    #[arg(long, value_enum, default_value_t = UnmappedPolicy::Strict)]
    unmapped_policy: UnmappedPolicy,

    /// The directory the bundle archive is written into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("Error: {report:#}");
        if let Some(prep) = report.downcast_ref::<PrepError>() {
            return ExitCode::from(map_exit_code(prep));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PrepError) -> u8 {
    match error {
        PrepError::RemoteHttp(_) | PrepError::RemoteStatus { .. } => 3,
        PrepError::NoQuantFilesFound(_) => 2,
        PrepError::BundleExists(_) => 2,
        _ => 1,
    }
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::FetchMetadata(args) => fetch_metadata(args),
        Commands::Prepare(args) => prepare(args),
    }
}

fn fetch_metadata(args: FetchMetadataArgs) -> anyhow::Result<()> {
    let accession = ProjectAccession::new(args.accession);
    let client = EnaClient::new()?;
    let mut df = client.fetch_project(&accession)?;

    let file = fs::File::create(&args.out)
        .with_context(|| format!("could not create {:?}", args.out))?;
    CsvWriter::new(file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut df)?;
    info!(
        "wrote metadata for {} run(s) of {} to {:?}",
        df.height(),
        accession,
        args.out
    );
    Ok(())
}

fn prepare(args: PrepareArgs) -> anyhow::Result<()> {
    let config = fs::read_to_string(&args.config)
        .with_context(|| format!("could not read the configuration {:?}", args.config))?;
    let curate_opts: CurateOptions = serde_json::from_str(&config)
        .with_context(|| format!("could not parse the configuration {:?}", args.config))?;

    let metadata = read_metadata_tsv(&args.metadata)?;
    let curated = curate(&metadata, &curate_opts)?;

    let annotations = match args.format {
        AnnotationFormat::Gtf => Annotations::from_gtf(&args.annotation)?,
        AnnotationFormat::Gff => Annotations::from_gff(&args.annotation)?,
    };
    let tx2gene = annotations.tx_to_gene()?;
    let tx_metadata = annotations.tx_metadata()?;

    let agg_opts = AggregationOptions {
        file_name: args.quant_file_name,
        unmapped_policy: args.unmapped_policy,
    };
    let index = discover_quant_files(&args.quant_dir, &agg_opts.file_name)?
        .restrict(&curated)?;
    let quant = aggregate(&index, &tx2gene, &agg_opts)?;

    let report = check_consistency(&curated, &quant)?;
    if !report.pass {
        warn!("{}", report.summary());
        anyhow::bail!("refusing to write a bundle whose samples disagree with the metadata");
    }

    let path = write_bundle(&args.out_dir, &curated, &quant, &tx_metadata)?;
    info!("bundle written to {:?}", path);
    Ok(())
}
