use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use noodles::{gff, gtf};
use tracing::{info, warn};

use crate::prep_utils::{open_maybe_gzipped, AnnotationFormat, ANNOTATION_ATTRIBUTES};

#[derive(Clone)]
/// Columnar storage for the annotation attributes this crate cares about.
///
/// Only the attribute keys named in
/// [`ANNOTATION_ATTRIBUTES`](crate::prep_utils) are collected; every other
/// key/value pair in the attribute blob of a record is discarded. Each kept
/// key maps to one vector with exactly one (possibly missing) entry per
/// parsed record, so the vectors line up with the fixed-field vectors of the
/// surrounding [FeatureStruct].
pub struct AttributeColumns {
    pub columns: HashMap<String, Vec<Option<String>>>,
    pub tally: usize,
}

impl AttributeColumns {
    pub fn new() -> AttributeColumns {
        let columns = HashMap::from_iter(
            ANNOTATION_ATTRIBUTES
                .iter()
                .map(|s| (s.to_string(), Vec::with_capacity(1_0000))),
        );
        AttributeColumns { columns, tally: 0 }
    }

    /// Takes the attributes of one record. Keys we track are moved out of
    /// `hm`; everything left behind is ignored.
    fn push(&mut self, hm: &mut HashMap<String, String>) {
        for &key in ANNOTATION_ATTRIBUTES.iter() {
            if let Some(vec) = self.columns.get_mut(key) {
                vec.push(hm.remove(key));
            }
        }
        self.tally += 1;
    }
}

impl Default for AttributeColumns {
    fn default() -> Self {
        AttributeColumns::new()
    }
}

/// The raw, columnar content of one annotation file. It is the intermediate
/// between the noodles record iterators and the polars data frame built by
/// [`Annotations`](crate::annotation::Annotations); each field holds one
/// value per record, in file order.
#[derive(Clone)]
pub struct FeatureStruct {
    pub format: AnnotationFormat,
    pub seqid: Vec<String>,
    pub source: Vec<String>,
    pub feature_type: Vec<String>,
    pub start: Vec<i64>,
    pub end: Vec<i64>,
    pub score: Vec<Option<f32>>,
    pub strand: Vec<Option<String>>,
    pub phase: Vec<Option<String>>,
    pub attributes: AttributeColumns,
}

impl FeatureStruct {
    pub fn new(format: AnnotationFormat) -> FeatureStruct {
        FeatureStruct {
            format,
            seqid: Vec::with_capacity(1_0000),
            source: Vec::with_capacity(1_0000),
            feature_type: Vec::with_capacity(1_0000),
            start: Vec::with_capacity(1_0000),
            end: Vec::with_capacity(1_0000),
            score: Vec::with_capacity(1_0000),
            strand: Vec::with_capacity(1_0000),
            phase: Vec::with_capacity(1_0000),
            attributes: AttributeColumns::new(),
        }
    }
}

// GTF parsing
impl FeatureStruct {
    /// Reads a GTF (GFF2) file into a [FeatureStruct]. Gzip compression is
    /// detected automatically from the file's magic bytes.
    ///
    /// ### Arguments
    ///
    /// * `file_path`: the location of the GTF file, plain or gzipped.
    ///
    /// ### Returns
    ///
    /// An [`anyhow::Result`] with the populated [FeatureStruct], or the
    /// underlying I/O or parse error.
    pub fn from_gtf<T: AsRef<Path>>(file_path: T) -> anyhow::Result<FeatureStruct> {
        let mut fs = FeatureStruct::new(AnnotationFormat::Gtf);
        let rdr = open_maybe_gzipped(file_path.as_ref()).with_context(|| {
            format!("could not open the annotation file {:?}", file_path.as_ref())
        })?;
        let mut rdr = gtf::Reader::new(rdr);
        fs._from_gtf(&mut rdr)?;
        Ok(fs)
    }

    fn _from_gtf<T: BufRead>(&mut self, rdr: &mut gtf::Reader<T>) -> anyhow::Result<()> {
        // a reusable hashmap taking the attributes of each record
        let mut rec_attr_hm: HashMap<String, String> = HashMap::with_capacity(100);
        let mut n_comments = 0usize;
        let mut n_records = 0usize;

        for l in rdr.lines() {
            let line = l?;
            match line {
                gtf::Line::Record(r) => {
                    n_records += 1;
                    self.seqid.push(r.reference_sequence_name().to_string());
                    self.source.push(r.source().to_string());
                    self.feature_type.push(r.ty().to_string());
                    self.start.push(r.start().get() as i64);
                    self.end.push(r.end().get() as i64);
                    self.score.push(r.score());
                    self.strand
                        .push(r.strand().map(|st| st.as_ref().to_owned()));
                    self.phase.push(r.frame().map(|ph| ph.to_string()));

                    rec_attr_hm.clear();
                    for attr in r.attributes().iter() {
                        rec_attr_hm.insert(attr.key().to_string(), attr.value().to_string());
                    }
                    self.attributes.push(&mut rec_attr_hm);
                }
                gtf::Line::Comment(_) => {
                    n_comments += 1;
                }
            }
        }
        info!(
            "Finished parsing the input file. Found {} comments and {} records.",
            n_comments, n_records
        );
        Ok(())
    }
}

// GFF3 parsing
impl FeatureStruct {
    /// Reads a GFF3 file into a [FeatureStruct]. Gzip compression is
    /// detected automatically from the file's magic bytes.
    pub fn from_gff<T: AsRef<Path>>(file_path: T) -> anyhow::Result<FeatureStruct> {
        let mut fs = FeatureStruct::new(AnnotationFormat::Gff);
        let rdr = open_maybe_gzipped(file_path.as_ref()).with_context(|| {
            format!("could not open the annotation file {:?}", file_path.as_ref())
        })?;
        let mut rdr = gff::Reader::new(rdr);
        fs._from_gff(&mut rdr)?;
        Ok(fs)
    }

    fn _from_gff<T: BufRead>(&mut self, rdr: &mut gff::Reader<T>) -> anyhow::Result<()> {
        let mut rec_attr_hm: HashMap<String, String> = HashMap::with_capacity(100);
        let mut n_comments = 0usize;
        let mut n_directives = 0usize;
        let mut n_records = 0usize;
        let mut n_strand_missing = 0usize;

        for l in rdr.lines() {
            let line = l?;
            match line {
                gff::Line::Record(r) => {
                    n_records += 1;
                    self.seqid.push(r.reference_sequence_name().to_string());
                    self.source.push(r.source().to_string());
                    self.feature_type.push(r.ty().to_string());
                    self.start.push(r.start().get() as i64);
                    self.end.push(r.end().get() as i64);
                    self.score.push(r.score());

                    self.strand.push(match r.strand() {
                        gff::record::Strand::None | gff::record::Strand::Unknown => {
                            n_strand_missing += 1;
                            None
                        }
                        gff::record::Strand::Forward => Some(String::from("+")),
                        gff::record::Strand::Reverse => Some(String::from("-")),
                    });

                    self.phase
                        .push(r.phase().map(|p| p.as_ref().to_string()));

                    rec_attr_hm.clear();
                    for (attrk, attrv) in r.attributes().iter() {
                        match attrv {
                            gff::record::attributes::field::Value::String(val) => {
                                rec_attr_hm.insert(attrk.to_string(), val.to_string());
                            }
                            gff::record::attributes::field::Value::Array(arr) => {
                                rec_attr_hm.insert(attrk.to_string(), arr.join(","));
                            }
                        }
                    }
                    self.attributes.push(&mut rec_attr_hm);
                }
                gff::Line::Comment(_) => {
                    n_comments += 1;
                }
                gff::Line::Directive(_) => {
                    n_directives += 1;
                }
            }
        }

        if n_strand_missing > 0 {
            warn!(
                "{} records carry no strand information; their strand is left as missing",
                n_strand_missing
            );
        }

        info!(
            "Finished parsing the input file. Found {} comments, {} directives, and {} records.",
            n_comments, n_directives, n_records
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GTF_RECORD: &[u8] = b"##provider: GENCODE\nchr1\tHAVANA\tgene\t29554\t31109\t.\t+\t.\tgene_id \"ENSG00000243485\"; gene_type \"lncRNA\"; gene_name \"MIR1302-2HG\";\nchr1\tHAVANA\ttranscript\t29554\t31097\t.\t+\t.\tgene_id \"ENSG00000243485\"; transcript_id \"ENST00000473358\"; gene_type \"lncRNA\"; gene_name \"MIR1302-2HG\";\nchr1\tHAVANA\texon\t29554\t30039\t.\t+\t.\tgene_id \"ENSG00000243485\"; transcript_id \"ENST00000473358\"; gene_type \"lncRNA\"; gene_name \"MIR1302-2HG\"; exon_number 1;\nchr1\tHAVANA\ttranscript\t30267\t31109\t.\t+\t.\tgene_id \"ENSG00000243485\"; transcript_id \"ENST00000469289\"; gene_type \"lncRNA\"; gene_name \"MIR1302-2HG\";";

    const GFF_RECORD: &[u8] = b"##gff-version 3\n#provider: GENCODE\nchr1\tHAVANA\tgene\t11869\t14409\t.\t+\t.\tID=ENSG00000290825.1;gene_id=ENSG00000290825.1;gene_biotype=lncRNA;gene_name=DDX11L2\nchr1\tHAVANA\ttranscript\t11869\t14409\t.\t+\t.\tID=ENST00000456328.2;Parent=ENSG00000290825.1;gene_id=ENSG00000290825.1;transcript_id=ENST00000456328.2;gene_biotype=lncRNA;gene_name=DDX11L2\nchr1\tHAVANA\texon\t11869\t12227\t.\t+\t.\tID=exon:ENST00000456328.2:1;Parent=ENST00000456328.2;gene_id=ENSG00000290825.1;transcript_id=ENST00000456328.2;gene_biotype=lncRNA;gene_name=DDX11L2\n";

    #[test]
    fn test_from_gtf() {
        let mut rdr = gtf::Reader::new(GTF_RECORD);
        let mut fs = FeatureStruct::new(AnnotationFormat::Gtf);
        fs._from_gtf(&mut rdr).unwrap();

        assert_eq!(fs.seqid, vec![String::from("chr1"); 4]);
        assert_eq!(
            fs.feature_type,
            vec![
                String::from("gene"),
                String::from("transcript"),
                String::from("exon"),
                String::from("transcript"),
            ]
        );
        assert_eq!(fs.start, vec![29554, 29554, 29554, 30267]);
        assert_eq!(fs.end, vec![31109, 31097, 30039, 31109]);
        assert_eq!(fs.strand, vec![Some(String::from("+")); 4]);
        assert_eq!(fs.attributes.tally, 4);

        let tx_ids = fs.attributes.columns.get("transcript_id").unwrap();
        assert_eq!(
            tx_ids,
            &vec![
                None,
                Some(String::from("ENST00000473358")),
                Some(String::from("ENST00000473358")),
                Some(String::from("ENST00000469289")),
            ]
        );
        // GENCODE spells the biotype attribute gene_type
        let biotypes = fs.attributes.columns.get("gene_type").unwrap();
        assert!(biotypes.iter().all(|b| b.as_deref() == Some("lncRNA")));
        assert!(fs
            .attributes
            .columns
            .get("gene_biotype")
            .unwrap()
            .iter()
            .all(|b| b.is_none()));
    }

    #[test]
    fn test_from_gff() {
        let mut rdr = gff::Reader::new(GFF_RECORD);
        let mut fs = FeatureStruct::new(AnnotationFormat::Gff);
        fs._from_gff(&mut rdr).unwrap();

        assert_eq!(fs.seqid, vec![String::from("chr1"); 3]);
        assert_eq!(
            fs.feature_type,
            vec![
                String::from("gene"),
                String::from("transcript"),
                String::from("exon"),
            ]
        );
        assert_eq!(fs.start, vec![11869, 11869, 11869]);
        assert_eq!(fs.attributes.tally, 3);

        let gene_ids = fs.attributes.columns.get("gene_id").unwrap();
        assert!(gene_ids
            .iter()
            .all(|g| g.as_deref() == Some("ENSG00000290825.1")));
        let biotypes = fs.attributes.columns.get("gene_biotype").unwrap();
        assert!(biotypes.iter().all(|b| b.as_deref() == Some("lncRNA")));
    }
}
