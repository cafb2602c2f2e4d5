//! Client for the fingerprint database behind the fingerprint CLI.
//!
//! The CLI reports inserts and deletes as a `<receipt>` XML block somewhere in
//! its output, and the query tool prints a JSON document amid its own chatter.
//! Successful inserts are remembered next to the artifact in
//! `<artifact>.result`, which later runs and `delete` rely on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytesize::ByteSize;
use chrono::Local;
use educe::Educe;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ReceiptError;

const RECEIPT_TAG: &str = "receipt";
const RESULT_EXT: &str = "result";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome the service reports for an insert or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<i64>,
    #[serde(rename = "ErrorMsg", default)]
    pub error_message: String,
    #[serde(rename = "VobileRefID", default)]
    pub ref_id: String,
    #[serde(rename = "FilePath", default)]
    pub file_path: String,
}

impl Receipt {
    /// The artifact is in the database, whether or not this call put it there.
    pub fn is_stored(&self) -> bool {
        matches!(self.error_message.as_str(), "Success" | "Duplicate instance")
    }
}

/// On-disk form of a receipt, `<artifact>.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceiptFile {
    receipt: Receipt,
}

/// Text of the first `<tag>...</tag>` block in `output`, tags included.
pub fn extract_tagged<'a>(output: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = output.find(&open)?;
    let end = output[start..].find(&close)? + start + close.len();
    Some(&output[start..end])
}

pub fn parse_receipt(output: &str) -> Result<Receipt, ReceiptError> {
    let xml = extract_tagged(output, RECEIPT_TAG).ok_or(ReceiptError::Missing(RECEIPT_TAG))?;
    Ok(quick_xml::de::from_str(xml)?)
}

/// Everything from the first `{` to the last `}`.
pub fn extract_json(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (start < end).then(|| &output[start..=end])
}

fn receipt_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(RESULT_EXT);
    PathBuf::from(name)
}

async fn load_receipt(artifact: &Path) -> Option<Receipt> {
    let text = tokio::fs::read_to_string(receipt_path(artifact)).await.ok()?;
    match serde_json::from_str::<ReceiptFile>(&text) {
        Ok(file) => Some(file.receipt),
        Err(e) => {
            warn!(artifact = %artifact.display(), "unreadable receipt: {e}");
            None
        }
    }
}

async fn store_receipt(artifact: &Path, receipt: &Receipt) -> Result<()> {
    let path = receipt_path(artifact);
    let json = serde_json::to_string_pretty(&ReceiptFile {
        receipt: receipt.clone(),
    })?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("write receipt '{}'", path.display()))
}

#[derive(Educe, Clone)]
#[educe(Debug)]
pub struct VddbClient {
    host: String,
    user: String,
    #[educe(Debug(ignore))]
    password: String,
    program: String,
    query_program: Vec<String>,
    cache_dir: PathBuf,
}

impl VddbClient {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            program: crate::config::VDNAGEN.to_string(),
            query_program: vec!["FarQuerySampleCode".to_string()],
            cache_dir: cache_dir.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// The query tool, split on whitespace (e.g. `python2 FarQuerySampleCode.py`).
    pub fn with_query_program(mut self, query: &str) -> Self {
        self.query_program = query.split_whitespace().map(str::to_string).collect();
        self
    }

    fn credentials(&self) -> [String; 6] {
        [
            "-s".to_string(),
            self.host.clone(),
            "-u".to_string(),
            self.user.clone(),
            "-p".to_string(),
            self.password.clone(),
        ]
    }

    async fn run(&self, argv: &[String]) -> Result<(Option<i32>, String)> {
        let (program, args) = argv.split_first().context("empty command line")?;
        debug!(%program, "running database command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("run '{program}'"))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code(), text))
    }

    /// Add an artifact to the database.
    #[tracing::instrument(skip_all, fields(artifact = %artifact.display()))]
    pub async fn insert(&self, artifact: &Path) -> Result<Receipt> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.credentials());
        argv.push(artifact.to_string_lossy().into_owned());
        let (_, output) = self.run(&argv).await?;
        Ok(parse_receipt(&output)?)
    }

    /// Where the delete request for `artifact` is written.
    pub fn delete_request_path(&self, artifact: &Path) -> PathBuf {
        let digest = hex::encode(Md5::digest(artifact.to_string_lossy().as_bytes()));
        let mut name = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".delete-dna.xml");
        self.cache_dir.join(digest).join(name)
    }

    async fn write_delete_request(&self, artifact: &Path, ref_id: &str) -> Result<PathBuf> {
        let path = self.delete_request_path(artifact);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create '{}'", parent.display()))?;
        }
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, delete_request(ref_id))
                .await
                .with_context(|| format!("write delete request '{}'", path.display()))?;
        }
        Ok(path)
    }

    /// Remove a previously inserted artifact by its reference id.
    #[tracing::instrument(skip_all, fields(artifact = %artifact.display()))]
    pub async fn delete(&self, artifact: &Path, ref_id: &str) -> Result<Receipt> {
        let request = self.write_delete_request(artifact, ref_id).await?;
        let mut argv = vec![self.program.clone()];
        argv.extend(self.credentials());
        argv.push("-m".to_string());
        argv.push(request.to_string_lossy().into_owned());
        let (_, output) = self.run(&argv).await?;
        Ok(parse_receipt(&output)?)
    }

    /// Query the database with an artifact.
    #[tracing::instrument(skip_all, fields(artifact = %artifact.display()))]
    pub async fn query(&self, artifact: &Path) -> Result<MatchSummary> {
        let mut argv = self.query_program.clone();
        argv.extend(self.credentials());
        argv.push("-i".to_string());
        argv.push(artifact.to_string_lossy().into_owned());
        let (code, output) = self.run(&argv).await?;
        if code != Some(0) {
            warn!(?code, "query tool exited unsuccessfully");
        }
        let json = extract_json(&output).ok_or(ReceiptError::Missing("json"))?;
        Ok(MatchSummary::parse(json)?)
    }
}

fn delete_request(ref_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Media_Meta>
    <Actions>
        <Action>Delete VDNA</Action>
    </Actions>
    <VobileRefID>{}</VobileRefID>
</Media_Meta>"#,
        quick_xml::escape::escape(ref_id)
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct MatchResponse {
    head: ResponseHead,
    body: ResponseBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ResponseHead {
    error_code: serde_json::Value,
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ResponseBody {
    query: Vec<Query>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Query {
    query_log: QueryLog,
    #[serde(rename = "Match")]
    matches: Vec<Match>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryLog {
    #[serde(rename = "TaskID")]
    task_id: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Match {
    #[serde(rename = "AssetID")]
    asset_id: serde_json::Value,
    asset: Asset,
    match_detail: MatchDetail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Asset {
    title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct MatchDetail {
    track: Vec<Track>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Track {
    match_duration: String,
    sample_offset: serde_json::Value,
    ref_offset: serde_json::Value,
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `h:m:s` to seconds.
fn clock_secs(duration: &str) -> Option<u64> {
    let mut parts = duration.split(':').map(|p| p.trim().parse::<u64>());
    let (h, m, s) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    parts.next().is_none().then_some((h * 60 + m) * 60 + s)
}

/// One matched reference, reduced to its longest matching segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchHit {
    pub task_id: String,
    pub asset_id: String,
    pub title: String,
    pub match_duration: String,
    pub sample_offset: String,
    pub ref_offset: String,
}

impl MatchHit {
    fn from_match(task_id: &str, m: &Match) -> Self {
        let mut hit = Self {
            task_id: task_id.to_string(),
            asset_id: value_text(&m.asset_id),
            title: m.asset.title.clone(),
            ..Default::default()
        };
        let mut longest = 0;
        for track in &m.match_detail.track {
            let Some(secs) = clock_secs(&track.match_duration) else {
                continue;
            };
            if secs > longest {
                longest = secs;
                hit.match_duration = track.match_duration.clone();
                hit.sample_offset = value_text(&track.sample_offset);
                hit.ref_offset = value_text(&track.ref_offset);
            }
        }
        hit
    }
}

/// What a query returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub error_code: i64,
    pub error_message: String,
    /// Backend task ids, one per answering query node.
    pub task_ids: Vec<String>,
    pub hits: Vec<MatchHit>,
}

impl MatchSummary {
    pub fn parse(json: &str) -> Result<Self, ReceiptError> {
        let response: MatchResponse = serde_json::from_str(json)?;
        let error_code = match &response.head.error_code {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .unwrap_or(-1);
        let mut summary = Self {
            error_code,
            error_message: response
                .head
                .error_message
                .unwrap_or_else(|| "ScriptError".to_string()),
            ..Default::default()
        };
        for query in &response.body.query {
            let task_id = value_text(&query.query_log.task_id);
            summary
                .hits
                .extend(query.matches.iter().map(|m| MatchHit::from_match(&task_id, m)));
            summary.task_ids.push(task_id);
        }
        Ok(summary)
    }

    pub fn match_count(&self) -> usize {
        self.hits.len()
    }
}

/// A line of the match report; one per hit, or one per artifact without hits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchRow {
    pub far_path: String,
    pub far_size: String,
    pub start_time: String,
    pub end_time: String,
    pub error: String,
    #[serde(rename = "TaskID")]
    pub task_id: String,
    pub match_count: usize,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "AssetID")]
    pub asset_id: String,
    #[serde(rename = "SampleOffset")]
    pub sample_offset: String,
    #[serde(rename = "RefOffset")]
    pub ref_offset: String,
    #[serde(rename = "MatchDuration")]
    pub match_duration: String,
}

impl MatchRow {
    fn rows(base: MatchRow, summary: &MatchSummary) -> Vec<MatchRow> {
        let base = MatchRow {
            error: format!("{}({})", summary.error_code, summary.error_message),
            match_count: summary.match_count(),
            task_id: summary.task_ids.first().cloned().unwrap_or_default(),
            ..base
        };
        if summary.hits.is_empty() {
            return vec![base];
        }
        summary
            .hits
            .iter()
            .map(|hit| MatchRow {
                task_id: hit.task_id.clone(),
                title: hit.title.clone(),
                asset_id: hit.asset_id.clone(),
                sample_offset: hit.sample_offset.clone(),
                ref_offset: hit.ref_offset.clone(),
                match_duration: hit.match_duration.clone(),
                ..base.clone()
            })
            .collect()
    }
}

/// Artifacts named by a manifest file, or every `.far` below a directory.
pub async fn collect_artifacts(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        let text = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("read artifact list '{}'", input.display()))?;
        return Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect());
    }
    anyhow::ensure!(input.is_dir(), "'{}' is neither a file nor a directory", input.display());

    let root = input.to_path_buf();
    let artifacts = tokio::task::spawn_blocking(move || {
        WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("skipping entry: {e}");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "far"))
            .collect::<Vec<_>>()
    })
    .await?;
    Ok(artifacts)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Insert every artifact not already recorded as stored.
pub async fn upload_all(client: &VddbClient, artifacts: &[PathBuf]) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    for artifact in artifacts {
        if !artifact.is_file() {
            warn!(artifact = %artifact.display(), "artifact not found");
            summary.skipped += 1;
            continue;
        }
        if let Some(receipt) = load_receipt(artifact).await {
            info!(artifact = %artifact.display(), ref_id = %receipt.ref_id, "already exists");
            summary.skipped += 1;
            continue;
        }

        match client.insert(artifact).await {
            Ok(receipt) if receipt.is_stored() => {
                info!(
                    artifact = %artifact.display(),
                    ref_id = %receipt.ref_id,
                    message = %receipt.error_message,
                    "inserted"
                );
                store_receipt(artifact, &receipt).await?;
                summary.succeeded += 1;
            }
            Ok(receipt) => {
                warn!(
                    artifact = %artifact.display(),
                    code = ?receipt.error_code,
                    message = %receipt.error_message,
                    "insert rejected"
                );
                summary.failed += 1;
            }
            Err(e) => {
                warn!(artifact = %artifact.display(), "insert failed: {e:#}");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Delete every artifact that has a stored receipt.
pub async fn delete_all(client: &VddbClient, artifacts: &[PathBuf]) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    for artifact in artifacts {
        if !artifact.is_file() {
            warn!(artifact = %artifact.display(), "artifact not found");
            summary.skipped += 1;
            continue;
        }
        let Some(receipt) = load_receipt(artifact).await.filter(|r| !r.ref_id.is_empty()) else {
            warn!(artifact = %artifact.display(), "no insert receipt, nothing to delete");
            summary.skipped += 1;
            continue;
        };

        info!(artifact = %artifact.display(), ref_id = %receipt.ref_id, "deleting");
        match client.delete(artifact, &receipt.ref_id).await {
            Ok(result) => {
                info!(
                    artifact = %artifact.display(),
                    code = ?result.error_code,
                    message = %result.error_message,
                    "delete answered"
                );
                summary.succeeded += 1;
            }
            Err(e) => {
                warn!(artifact = %artifact.display(), "delete failed: {e:#}");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Query every artifact, `concurrency` at a time, keeping input order.
pub async fn match_all(
    client: &VddbClient,
    artifacts: &[PathBuf],
    concurrency: usize,
) -> Vec<MatchRow> {
    let artifacts: Vec<&PathBuf> = artifacts
        .iter()
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "far"))
        .collect();
    info!("Querying {} artifacts", artifacts.len());

    stream::iter(artifacts)
        .map(|artifact| async move {
            let base = MatchRow {
                far_path: artifact.display().to_string(),
                far_size: tokio::fs::metadata(artifact)
                    .await
                    .map(|md| ByteSize(md.len()).to_string())
                    .unwrap_or_default(),
                start_time: Local::now().format(TIME_FORMAT).to_string(),
                ..Default::default()
            };
            let result = client.query(artifact).await;
            let base = MatchRow {
                end_time: Local::now().format(TIME_FORMAT).to_string(),
                ..base
            };
            match result {
                Ok(summary) => {
                    info!(
                        artifact = %artifact.display(),
                        code = summary.error_code,
                        matches = summary.match_count(),
                        "queried"
                    );
                    MatchRow::rows(base, &summary)
                }
                Err(e) => {
                    warn!(artifact = %artifact.display(), "query failed: {e:#}");
                    vec![MatchRow {
                        error: format!("{e:#}"),
                        ..base
                    }]
                }
            }
        })
        .buffered(concurrency.max(1))
        .flat_map(stream::iter)
        .collect()
        .await
}

pub fn write_match_table(rows: &[MatchRow], path: &Path) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create '{}'", path.display()))?;
    for row in rows {
        writer.serialize(row).context("write match row")?;
    }
    writer.flush().context("flush match report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_OUTPUT: &str = concat!(
        "connecting...\n",
        "<receipt><ErrorCode>0</ErrorCode><ErrorMsg>Success</ErrorMsg>",
        "<VobileRefID>ref-42</VobileRefID><FilePath>/far/a.far</FilePath></receipt>\n",
        "bye",
    );

    const QUERY_JSON: &str = r#"{
        "Head": {"ErrorCode": "0", "ErrorMessage": "OK"},
        "Body": {"Query": [
            {"QueryLog": {"TaskID": "t-1"}, "Match": [
                {"AssetID": "asset-9", "Asset": {"Title": "Film"},
                 "MatchDetail": {"Track": [
                    {"MatchDuration": "0:01:05", "SampleOffset": 10, "RefOffset": 20},
                    {"MatchDuration": "", "SampleOffset": 0, "RefOffset": 0},
                    {"MatchDuration": "1:00:00", "SampleOffset": 30, "RefOffset": 40},
                    {"MatchDuration": "0:30:00", "SampleOffset": 50, "RefOffset": 60}
                 ]}}
            ]},
            {"QueryLog": {"TaskID": "t-2"}, "Match": []}
        ]}
    }"#;

    #[test]
    fn receipt_is_found_amid_tool_output() {
        let receipt = parse_receipt(INSERT_OUTPUT).unwrap();
        assert_eq!(receipt.error_code, Some(0));
        assert_eq!(receipt.ref_id, "ref-42");
        assert_eq!(receipt.file_path, "/far/a.far");
        assert!(receipt.is_stored());

        let duplicate = Receipt {
            error_message: "Duplicate instance".to_string(),
            ..Default::default()
        };
        assert!(duplicate.is_stored());
        let rejected = Receipt {
            error_message: "Invalid DNA".to_string(),
            ..Default::default()
        };
        assert!(!rejected.is_stored());

        assert!(matches!(
            parse_receipt("no receipt here"),
            Err(ReceiptError::Missing("receipt"))
        ));
    }

    #[test]
    fn json_is_cut_from_first_to_last_brace() {
        assert_eq!(extract_json("log {\"a\": {\"b\": 1}} done"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("nothing"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn longest_track_wins() {
        let summary = MatchSummary::parse(QUERY_JSON).unwrap();
        assert_eq!(summary.error_code, 0);
        assert_eq!(summary.error_message, "OK");
        assert_eq!(summary.task_ids, vec!["t-1", "t-2"]);
        assert_eq!(summary.match_count(), 1);
        let hit = &summary.hits[0];
        assert_eq!(hit.asset_id, "asset-9");
        assert_eq!(hit.title, "Film");
        assert_eq!(hit.match_duration, "1:00:00");
        assert_eq!(hit.sample_offset, "30");
        assert_eq!(hit.ref_offset, "40");
    }

    #[test]
    fn empty_response_defaults_to_script_error() {
        let summary = MatchSummary::parse("{}").unwrap();
        assert_eq!(summary.error_code, -1);
        assert_eq!(summary.error_message, "ScriptError");
        let rows = MatchRow::rows(MatchRow::default(), &summary);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error, "-1(ScriptError)");
        assert_eq!(rows[0].match_count, 0);
    }

    #[test]
    fn clock_durations() {
        assert_eq!(clock_secs("1:02:03"), Some(3723));
        assert_eq!(clock_secs(""), None);
        assert_eq!(clock_secs("1:2"), None);
        assert_eq!(clock_secs("1:2:3:4"), None);
    }

    #[tokio::test]
    async fn delete_request_is_keyed_by_artifact() {
        let cache = tempfile::tempdir().unwrap();
        let client = VddbClient::new("host", "user", "secret", cache.path());
        let path = client
            .write_delete_request(Path::new("/far/a.far"), "ref<1>")
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "a.far.delete-dna.xml");
        assert_eq!(path, client.delete_request_path(Path::new("/far/a.far")));
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<Action>Delete VDNA</Action>"));
        assert!(xml.contains("<VobileRefID>ref&lt;1&gt;</VobileRefID>"));
        assert!(!format!("{client:?}").contains("secret"));
    }

    #[tokio::test]
    async fn upload_reuses_stored_receipts() {
        let dir = tempfile::tempdir().unwrap();
        let stored = dir.path().join("stored.far");
        std::fs::write(&stored, b"far").unwrap();
        store_receipt(&stored, &parse_receipt(INSERT_OUTPUT).unwrap())
            .await
            .unwrap();
        let missing = dir.path().join("missing.far");

        // The program does not exist, so any insert attempt would fail.
        let client = VddbClient::new("host", "user", "pw", dir.path())
            .with_program(dir.path().join("no-such-tool").to_string_lossy());
        let summary = upload_all(&client, &[stored.clone(), missing]).await.unwrap();
        assert_eq!(summary, BatchSummary { succeeded: 0, skipped: 2, failed: 0 });
        assert_eq!(load_receipt(&stored).await.unwrap().ref_id, "ref-42");
    }

    #[tokio::test]
    async fn artifacts_come_from_a_list_or_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.far"), b"").unwrap();
        std::fs::write(dir.path().join("nested/a.far"), b"").unwrap();
        std::fs::write(dir.path().join("b.far.result"), b"{}").unwrap();

        let found = collect_artifacts(dir.path()).await.unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("b.far"), dir.path().join("nested/a.far")]
        );

        let list = dir.path().join("list.txt");
        std::fs::write(&list, "/x/1.far\n\n  /x/2.far  \n").unwrap();
        let listed = collect_artifacts(&list).await.unwrap();
        assert_eq!(listed, vec![PathBuf::from("/x/1.far"), PathBuf::from("/x/2.far")]);
    }
}
