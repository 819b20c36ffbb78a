use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use nutype::nutype;
use polars::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::PrepError;

/// The accession of a sequencing-archive project (e.g. `SRP123456` or
/// `PRJNA123456`), under which run-level records are cataloged.
#[nutype]
#[derive(Debug, Clone, AsRef, Display, PartialEq, Eq)]
pub struct ProjectAccession(String);

/// Reads a local tab-delimited metadata table into a [DataFrame].
///
/// The first row is taken as the column headers. Empty strings and the
/// literal token `NA` both map to missing values, so a table exported from
/// a spreadsheet and one exported from an archive browser normalize to the
/// same shape.
pub fn read_metadata_tsv<P: AsRef<Path>>(path: P) -> anyhow::Result<DataFrame> {
    let df = CsvReader::from_path(path.as_ref())
        .with_context(|| format!("could not open the metadata file {:?}", path.as_ref()))?
        .has_header(true)
        .with_separator(b'\t')
        .with_null_values(Some(NullValues::AllColumns(vec![
            String::new(),
            String::from("NA"),
        ])))
        .finish()
        .with_context(|| format!("could not parse the metadata file {:?}", path.as_ref()))?;
    info!(
        "read {} sample records ({} columns) from the local metadata file",
        df.height(),
        df.width()
    );
    Ok(df)
}

lazy_static! {
    // a <Run acc="SRR1234" .../> element inside the run description block
    static ref RUN_TAG_RE: Regex =
        Regex::new(r#"<Run\b[^>]*/?>"#).expect("static regex must compile");
    // one name="value" attribute pair inside a tag
    static ref ATTR_RE: Regex =
        Regex::new(r#"([A-Za-z_][\w]*)="([^"]*)""#).expect("static regex must compile");
    // a simple text element, e.g. <Title>whole blood, donor 3</Title>
    static ref TEXT_ELEMENT_RE: Regex =
        Regex::new(r#"<([A-Za-z_][\w]*)(?:\s[^>]*)?>([^<]+)</([A-Za-z_][\w]*)>"#)
            .expect("static regex must compile");
    // an attributed element, e.g. <Organism taxid="9606" ScientificName="Homo sapiens"/>
    static ref ATTR_ELEMENT_RE: Regex =
        Regex::new(r#"<([A-Za-z_][\w]*)((?:\s+[A-Za-z_][\w]*="[^"]*")+)\s*/?>"#)
            .expect("static regex must compile");
}

/// A client for the run catalog of a remote sequencing archive, speaking
/// the eutils-style two-step protocol: a project search returning record
/// identifiers, then per-record summaries whose experiment and run
/// descriptions are nested markup blobs that get flattened into flat,
/// per-run rows.
pub struct EnaClient {
    client: Client,
    base_url: String,
}

impl EnaClient {
    pub fn new() -> anyhow::Result<EnaClient> {
        EnaClient::with_base_url("https://eutils.ncbi.nlm.nih.gov/entrez/eutils")
    }

    /// Builds a client against a non-default catalog endpoint. Primarily
    /// useful for tests and mirrors.
    pub fn with_base_url<T: AsRef<str>>(base_url: T) -> anyhow::Result<EnaClient> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dgeprep/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PrepError::RemoteHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PrepError::RemoteHttp(err.to_string()))?;
        Ok(EnaClient {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
        })
    }

    /// Retrieves all run-level records of the given project and flattens
    /// them into one row-per-run [DataFrame] keyed by `run_accession`.
    ///
    /// ### Errors
    ///
    /// Fails with [`PrepError::MissingField`] when a summary lacks the
    /// structured fields the flattening needs (most importantly the run
    /// accession itself) — a record whose sample identifier cannot be
    /// resolved must not silently produce a partial row. Network and
    /// status failures surface as [`PrepError::RemoteHttp`] and
    /// [`PrepError::RemoteStatus`].
    pub fn fetch_project(&self, project: &ProjectAccession) -> anyhow::Result<DataFrame> {
        let uids = self.search_project(project)?;
        if uids.is_empty() {
            bail!(PrepError::RemoteStatus {
                status: 200,
                message: format!("the project `{}` matched no records", project),
            });
        }
        debug!("project `{}` matched {} catalog records", project, uids.len());

        let payload = self.fetch_summaries(&uids)?;
        let mut rows = Vec::with_capacity(uids.len());
        for uid in &uids {
            let summary = &payload["result"][uid.as_str()];
            let expxml = summary["expxml"].as_str().ok_or_else(|| {
                PrepError::MissingField {
                    field: String::from("expxml"),
                    record: uid.clone(),
                }
            })?;
            let runs_xml = summary["runs"].as_str().ok_or_else(|| {
                PrepError::MissingField {
                    field: String::from("runs"),
                    record: uid.clone(),
                }
            })?;
            rows.extend(flatten_run_summary(uid, expxml, runs_xml)?);
        }
        info!(
            "flattened {} run records for project `{}`",
            rows.len(),
            project
        );
        rows_to_dataframe(&rows)
    }

    fn search_project(&self, project: &ProjectAccession) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{}/esearch.fcgi?db=sra&term={}&retmode=json&retmax=10000",
            self.base_url, project
        );
        let payload = self.get_json(&url)?;
        let mut uids = Vec::new();
        if let Some(idlist) = payload["esearchresult"]["idlist"].as_array() {
            for id in idlist {
                if let Some(id) = id.as_str() {
                    uids.push(id.to_string());
                }
            }
        }
        uids.sort();
        uids.dedup();
        Ok(uids)
    }

    fn fetch_summaries(&self, uids: &[String]) -> anyhow::Result<Value> {
        let url = format!(
            "{}/esummary.fcgi?db=sra&id={}&retmode=json",
            self.base_url,
            uids.join(",")
        );
        self.get_json(&url)
    }

    fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        let response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| String::from("remote metadata request failed"));
            bail!(PrepError::RemoteStatus { status, message });
        }
        let payload = response
            .json()
            .map_err(|err| PrepError::RemoteHttp(err.to_string()))?;
        Ok(payload)
    }

    fn send_with_retries(&self, url: &str) -> anyhow::Result<reqwest::blocking::Response> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS << attempt;
                        warn!(
                            "remote endpoint returned status {}; retrying in {} ms",
                            status, delay
                        );
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        let delay = BASE_DELAY_MS << attempt;
                        warn!("remote request failed ({}); retrying in {} ms", err, delay);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    bail!(PrepError::RemoteHttp(err.to_string()));
                }
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Flattens one record summary into per-run rows.
///
/// The experiment description block contributes one set of key/value pairs
/// shared by every run of the record: simple text elements keep their tag
/// name as the key, and attributed elements contribute `tag_attribute`
/// keys (all lowercased). The run description block contributes one row
/// per `<Run>` element, whose attributes become `run_*` keys. A `<Run>`
/// without an `acc` attribute makes the whole record unusable, because no
/// sample identifier can be resolved for it.
pub fn flatten_run_summary(
    uid: &str,
    expxml: &str,
    runs_xml: &str,
) -> anyhow::Result<Vec<HashMap<String, String>>> {
    let mut experiment_fields: HashMap<String, String> = HashMap::new();
    for cap in TEXT_ELEMENT_RE.captures_iter(expxml) {
        // the regex crate has no backreferences, so the open/close tag
        // names are matched separately and compared here
        if cap[1] == cap[3] {
            experiment_fields.insert(cap[1].to_lowercase(), cap[2].trim().to_string());
        }
    }
    for cap in ATTR_ELEMENT_RE.captures_iter(expxml) {
        let tag = cap[1].to_lowercase();
        for attr in ATTR_RE.captures_iter(&cap[2]) {
            experiment_fields.insert(
                format!("{}_{}", tag, attr[1].to_lowercase()),
                attr[2].to_string(),
            );
        }
    }

    let mut rows = Vec::new();
    for run_tag in RUN_TAG_RE.find_iter(runs_xml) {
        let mut row = experiment_fields.clone();
        let mut acc = None;
        for attr in ATTR_RE.captures_iter(run_tag.as_str()) {
            let key = attr[1].to_lowercase();
            if key == "acc" {
                acc = Some(attr[2].to_string());
            } else {
                row.insert(format!("run_{}", key), attr[2].to_string());
            }
        }
        let acc = acc.ok_or_else(|| PrepError::MissingField {
            field: String::from("Run@acc"),
            record: uid.to_string(),
        })?;
        row.insert(String::from("run_accession"), acc);
        rows.push(row);
    }
    if rows.is_empty() {
        bail!(PrepError::MissingField {
            field: String::from("Run"),
            record: uid.to_string(),
        });
    }
    Ok(rows)
}

/// Assembles flat rows into a [DataFrame]. The column set is the union of
/// all row keys; `run_accession` comes first, the rest follow sorted, and
/// absent values become nulls.
fn rows_to_dataframe(rows: &[HashMap<String, String>]) -> anyhow::Result<DataFrame> {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        keys.extend(row.keys().map(|k| k.as_str()));
    }
    keys.remove("run_accession");

    let mut columns = Vec::with_capacity(keys.len() + 1);
    let mut ordered: Vec<&str> = vec!["run_accession"];
    ordered.extend(keys);
    for key in ordered {
        let values: Vec<Option<String>> = rows.iter().map(|r| r.get(key).cloned()).collect();
        columns.push(Series::new(key, values));
    }
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPXML: &str = r#"<Summary><Title>GBM tumor, donor 3</Title><Platform instrument_model="Illumina NovaSeq 6000">ILLUMINA</Platform><Statistics total_runs="2" total_spots="6500000"/></Summary><Organism taxid="9606" ScientificName="Homo sapiens"/><Library_descriptor><LIBRARY_STRATEGY>RNA-Seq</LIBRARY_STRATEGY><LIBRARY_SOURCE>TRANSCRIPTOMIC</LIBRARY_SOURCE></Library_descriptor>"#;

    const RUNS: &str = r#"<Run acc="SRR0000001" total_spots="3200000" total_bases="640000000"/><Run acc="SRR0000002" total_spots="3300000" total_bases="660000000"/>"#;

    #[test]
    fn project_accessions_display_their_inner_value() {
        let acc = ProjectAccession::new(String::from("PRJNA716260"));
        assert_eq!(acc.to_string(), "PRJNA716260");
        assert_eq!(acc.as_ref(), "PRJNA716260");
    }

    #[test]
    fn flatten_produces_one_row_per_run() {
        let rows = flatten_run_summary("101", EXPXML, RUNS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("run_accession").unwrap(), "SRR0000001");
        assert_eq!(rows[1].get("run_accession").unwrap(), "SRR0000002");
        // experiment-level fields are shared by both runs
        for row in &rows {
            assert_eq!(row.get("title").unwrap(), "GBM tumor, donor 3");
            assert_eq!(row.get("library_strategy").unwrap(), "RNA-Seq");
            assert_eq!(row.get("organism_scientificname").unwrap(), "Homo sapiens");
        }
        // run-level attributes stay per-run
        assert_eq!(rows[0].get("run_total_spots").unwrap(), "3200000");
        assert_eq!(rows[1].get("run_total_spots").unwrap(), "3300000");
    }

    #[test]
    fn a_run_without_accession_fails_fast() {
        let bad_runs = r#"<Run total_spots="100"/>"#;
        let err = flatten_run_summary("42", EXPXML, bad_runs).unwrap_err();
        match err.downcast_ref::<PrepError>() {
            Some(PrepError::MissingField { field, record }) => {
                assert_eq!(field, "Run@acc");
                assert_eq!(record, "42");
            }
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn rows_assemble_into_a_frame_with_union_schema() {
        let mut rows = flatten_run_summary("101", EXPXML, RUNS).unwrap();
        // drop a field from the second row to exercise the union schema
        rows[1].remove("title");
        let df = rows_to_dataframe(&rows).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.get_column_names()[0], "run_accession");
        let titles = df.column("title").unwrap();
        assert_eq!(titles.null_count(), 1);
    }
}
