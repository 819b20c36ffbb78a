use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::trace;

/// The annotation attribute columns that downstream lookup tables are
/// derived from. GTF files from GENCODE spell the biotype attribute
/// `gene_type`; Ensembl GTF/GFF files spell it `gene_biotype`. Both are
/// collected here and reconciled when the feature table is built.
pub(crate) const ANNOTATION_ATTRIBUTES: [&str; 5] = [
    "gene_id",
    "gene_name",
    "transcript_id",
    "gene_biotype",
    "gene_type",
];

#[derive(Copy, Clone, PartialEq, Eq, Debug, clap::ValueEnum)]
/// The supported feature-interval annotation formats.
pub enum AnnotationFormat {
    Gtf,
    Gff,
}

impl std::str::FromStr for AnnotationFormat {
    type Err = anyhow::Error;

    /// Converts from a [&str] to the corresponding [AnnotationFormat].
    /// The result is an error variant if the input names a format this
    /// crate does not parse.
    fn from_str(s: &str) -> anyhow::Result<AnnotationFormat> {
        let fmt = match s.to_lowercase().as_str() {
            "gtf" | "gff2" => AnnotationFormat::Gtf,
            "gff" | "gff3" => AnnotationFormat::Gff,
            _ => anyhow::bail!("cannot parse `{}` as an annotation format", s),
        };
        Ok(fmt)
    }
}

impl std::fmt::Display for AnnotationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotationFormat::Gtf => write!(f, "GTF"),
            AnnotationFormat::Gff => write!(f, "GFF"),
        }
    }
}

/// Tests if the stream underlying the [BufReader] `reader` is gzipped or not
/// by examining the first 2 bytes for the magic header. This function
/// *requires*, but does not check, that none of the stream has yet been
/// consumed. It will fill the buffer to examine the first two bytes, but
/// will not consume them.
pub fn is_gzipped<T: BufRead>(reader: &mut T) -> std::io::Result<bool> {
    const GZIP_MAGIC_NUMBER: [u8; 2] = [0x1f, 0x8b];

    let src = reader.fill_buf()?;
    Ok(src.get(..2) == Some(&GZIP_MAGIC_NUMBER))
}

/// Opens the file at the provided path as a buffered reader, transparently
/// decompressing it when the gzip magic bytes are present.
pub fn open_maybe_gzipped<T: AsRef<Path>>(p: T) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(p.as_ref())?;
    let mut inner_rdr = BufReader::new(file);
    if is_gzipped(&mut inner_rdr)? {
        trace!("auto-detected gzipped file - reading via decompression");
        Ok(Box::new(BufReader::new(GzDecoder::new(inner_rdr))))
    } else {
        Ok(Box::new(inner_rdr))
    }
}
