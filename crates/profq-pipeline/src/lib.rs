//! Ingestion (parse, dedup, publish), the shared application context and the
//! scheduled data-quality sweep.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use profq_alerts::{AlertDispatcher, Notifier, SlackNotifier};
use profq_core::{Column, Record, NATURAL_KEY};
use profq_quality::{QualityReport, QualityRules};
use profq_query::{
    default_school_aliases, parse_school_aliases, ProfileDataset, SchoolAlias, SearchFilter,
    SharedDataset,
};
use profq_storage::{DatasetStore, ShardingPlan, StorageConfig};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "profq-pipeline";

/// Line the ingest command prints on stdout once a run succeeds.
pub const ROWS_PROCESSED_PREFIX: &str = "Total Rows Processed:";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub input_csv: PathBuf,
    pub dataset_dir: PathBuf,
    pub storage: StorageConfig,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = StorageConfig::default();
        let max_rows: u64 = env_or(
            "PROFQ_MAX_ROWS_PER_SHARD",
            defaults.sharding.max_rows_per_shard.unwrap_or(0),
        );
        Self {
            input_csv: std::env::var("PROFQ_INPUT_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rawdata/quis_data.csv")),
            dataset_dir: std::env::var("PROFQ_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("parquet")),
            storage: StorageConfig {
                sharding: ShardingPlan {
                    target_shards: env_or("PROFQ_TARGET_SHARDS", defaults.sharding.target_shards),
                    max_rows_per_shard: (max_rows > 0).then_some(max_rows),
                },
                row_group_rows: env_or("PROFQ_ROW_GROUP_ROWS", defaults.row_group_rows),
                dictionary_columns: std::env::var("PROFQ_DICTIONARY_COLUMNS")
                    .map(|list| parse_column_list(&list))
                    .unwrap_or(defaults.dictionary_columns),
            },
        }
    }
}

fn parse_column_list(list: &str) -> Vec<Column> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| {
            let column = Column::from_name(name);
            if column.is_none() {
                warn!(column = name, "ignoring unknown dictionary column");
            }
            column
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnforceStats {
    pub rows_read: u64,
    /// Rows whose field count differed from the header; recovered best-effort.
    pub ragged_rows: u64,
    pub unknown_columns: Vec<String>,
    pub missing_columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct EnforcedRecords {
    pub records: Vec<Record>,
    pub stats: EnforceStats,
}

const DELIMITER: u8 = b',';
const QUOTE: u8 = b'"';

fn ends_field(byte: u8) -> bool {
    matches!(byte, DELIMITER | b'\n' | b'\r')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted,
    /// A quote inside a quoted field whose role is not known yet.
    QuoteSeen,
}

#[derive(Debug)]
struct QuoteMachine {
    state: QuoteState,
    blanks: Vec<u8>,
    out: Vec<u8>,
}

impl QuoteMachine {
    fn push(&mut self, byte: u8) {
        match self.state {
            QuoteState::FieldStart => match byte {
                b' ' | b'\t' => self.blanks.push(byte),
                QUOTE => {
                    self.blanks.clear();
                    self.out.push(QUOTE);
                    self.state = QuoteState::Quoted;
                }
                _ => {
                    self.out.append(&mut self.blanks);
                    self.out.push(byte);
                    if !ends_field(byte) {
                        self.state = QuoteState::Unquoted;
                    }
                }
            },
            QuoteState::Unquoted => {
                self.out.push(byte);
                if ends_field(byte) {
                    self.state = QuoteState::FieldStart;
                }
            }
            QuoteState::Quoted => {
                if byte == QUOTE {
                    self.state = QuoteState::QuoteSeen;
                } else {
                    self.out.push(byte);
                }
            }
            QuoteState::QuoteSeen => match byte {
                b' ' | b'\t' => self.blanks.push(byte),
                QUOTE if self.blanks.is_empty() => {
                    self.out.extend_from_slice(b"\"\"");
                    self.state = QuoteState::Quoted;
                }
                QUOTE => {
                    // The earlier quote was literal; this one is now pending.
                    self.out.extend_from_slice(b"\"\"");
                    self.out.append(&mut self.blanks);
                }
                _ if ends_field(byte) => {
                    self.blanks.clear();
                    self.out.push(QUOTE);
                    self.out.push(byte);
                    self.state = QuoteState::FieldStart;
                }
                _ => {
                    self.out.extend_from_slice(b"\"\"");
                    self.out.append(&mut self.blanks);
                    self.out.push(byte);
                    self.state = QuoteState::Quoted;
                }
            },
        }
    }

    fn finish(&mut self) {
        match self.state {
            QuoteState::QuoteSeen => self.out.push(QUOTE),
            QuoteState::FieldStart => self.out.append(&mut self.blanks),
            QuoteState::Unquoted | QuoteState::Quoted => {}
        }
        self.blanks.clear();
    }
}

/// Rewrites loosely quoted input into CSV the `csv` reader splits correctly.
///
/// Blanks before an opening quote are dropped. Inside a quoted field a quote
/// closes the field only when followed (after optional blanks) by a delimiter,
/// a line end or end of input; any other quote is kept as literal text.
struct QuoteRepair<R> {
    inner: R,
    machine: QuoteMachine,
    pos: usize,
    done: bool,
}

impl<R: BufRead> QuoteRepair<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            machine: QuoteMachine {
                state: QuoteState::FieldStart,
                blanks: Vec::new(),
                out: Vec::new(),
            },
            pos: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Read for QuoteRepair<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.machine.out.len() && !self.done {
            self.machine.out.clear();
            self.pos = 0;
            let chunk = self.inner.fill_buf()?;
            if chunk.is_empty() {
                self.machine.finish();
                self.done = true;
                continue;
            }
            let consumed = chunk.len();
            for &byte in chunk {
                self.machine.push(byte);
            }
            self.inner.consume(consumed);
        }
        let pending = &self.machine.out[self.pos..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Parses delimited text into records under the fixed column set.
///
/// Header names select columns; unknown headers are ignored and absent columns
/// stay empty. Every field is trimmed and kept as text. Quoted fields may span
/// lines and a doubled quote escapes a quote. Blanks before an opening quote are
/// skipped, and a quote inside a quoted field only closes it when a delimiter or
/// line end follows, so stray quotes stay in the value instead of splitting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaEnforcer;

impl SchemaEnforcer {
    pub fn read_path(&self, path: &Path) -> Result<EnforcedRecords> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        self.read(file)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn read<R: io::Read>(&self, input: R) -> Result<EnforcedRecords> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(DELIMITER)
            .quote(QUOTE)
            .double_quote(true)
            .flexible(true)
            .from_reader(QuoteRepair::new(BufReader::new(input)));

        let headers = reader.byte_headers().context("reading header row")?.clone();
        let mut stats = EnforceStats::default();
        let mut seen = HashSet::new();
        let mapping = headers
            .iter()
            .map(|raw| {
                let name = String::from_utf8_lossy(raw);
                let name = name.trim_start_matches('\u{feff}').trim();
                match Column::from_name(name) {
                    Some(column) => {
                        seen.insert(column);
                        Some(column)
                    }
                    None => {
                        stats.unknown_columns.push(name.to_string());
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        stats.missing_columns = Column::ALL
            .iter()
            .copied()
            .filter(|column| !seen.contains(column))
            .collect();
        if !stats.unknown_columns.is_empty() {
            warn!(columns = ?stats.unknown_columns, "ignoring unknown input columns");
        }
        if !headers.is_empty() && !stats.missing_columns.is_empty() {
            warn!(columns = ?stats.missing_columns, "input lacks schema columns; ingesting as empty");
        }

        let mut records = Vec::new();
        let mut row = csv::ByteRecord::new();
        while reader
            .read_byte_record(&mut row)
            .with_context(|| format!("reading row {}", stats.rows_read + 1))?
        {
            stats.rows_read += 1;
            if row.len() != headers.len() {
                stats.ragged_rows += 1;
            }
            let mut record = Record::empty();
            for (field, column) in row.iter().zip(&mapping) {
                if let Some(column) = column {
                    record.set(*column, String::from_utf8_lossy(field).trim());
                }
            }
            records.push(record);
        }

        if stats.ragged_rows > 0 {
            warn!(ragged = stats.ragged_rows, "rows with mismatched field counts recovered");
        }
        Ok(EnforcedRecords { records, stats })
    }
}

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub records: Vec<Record>,
    pub before_count: u64,
    pub after_count: u64,
}

/// Keeps the first record seen for each key value, preserving input order.
///
/// The empty key is an ordinary value, so all keyless rows collapse to one.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    key: Column,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self { key: NATURAL_KEY }
    }
}

impl Deduplicator {
    pub fn new(key: Column) -> Self {
        Self { key }
    }

    pub fn apply(&self, records: Vec<Record>) -> DedupOutcome {
        let before_count = records.len() as u64;
        let mut seen = HashSet::with_capacity(records.len());
        let records = records
            .into_iter()
            .filter(|record| seen.insert(record.get(self.key).to_string()))
            .collect::<Vec<_>>();
        DedupOutcome {
            after_count: records.len() as u64,
            before_count,
            records,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_path: String,
    pub rows_read: u64,
    pub ragged_rows: u64,
    pub before_dedup: u64,
    pub after_dedup: u64,
    pub shard_count: usize,
    pub dataset_version: String,
    pub version_dir: String,
}

#[derive(Debug, Clone)]
pub struct IngestPipeline {
    config: IngestConfig,
    store: DatasetStore,
    enforcer: SchemaEnforcer,
    dedup: Deduplicator,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        let store = DatasetStore::new(config.dataset_dir.clone());
        Self {
            config,
            store,
            enforcer: SchemaEnforcer,
            dedup: Deduplicator::default(),
        }
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// One full batch run: parse, deduplicate, publish. Any failure aborts the run
    /// and leaves the previously published dataset in place.
    pub fn run_blocking(&self) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, input = %self.config.input_csv.display());
        let _guard = span.enter();

        let enforced = self.enforcer.read_path(&self.config.input_csv)?;
        let stats = enforced.stats;
        info!(rows = stats.rows_read, ragged = stats.ragged_rows, "input parsed");

        let outcome = self.dedup.apply(enforced.records);
        info!(
            before = outcome.before_count,
            after = outcome.after_count,
            "deduplicated on {}",
            NATURAL_KEY
        );

        let published = self
            .store
            .publish(run_id, &outcome.records, &self.config.storage)
            .with_context(|| format!("publishing dataset under {}", self.store.root().display()))?;

        Ok(IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_path: self.config.input_csv.display().to_string(),
            rows_read: stats.rows_read,
            ragged_rows: stats.ragged_rows,
            before_dedup: outcome.before_count,
            after_dedup: outcome.after_count,
            shard_count: published.manifest.shards.len(),
            dataset_version: published.version,
            version_dir: published.version_dir.display().to_string(),
        })
    }

    pub async fn run_once(&self) -> Result<IngestSummary> {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || pipeline.run_blocking())
            .await
            .context("ingest task did not complete")?
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestSummary> {
    IngestPipeline::new(IngestConfig::from_env()).run_once().await
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ingest: IngestConfig,
    pub rules_file: Option<PathBuf>,
    pub quality_cron: String,
    pub pipeline_command: String,
    pub dispatch_capacity: usize,
    pub school_aliases: Vec<SchoolAlias>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            ingest: IngestConfig::from_env(),
            rules_file: std::env::var("PROFQ_RULES_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            quality_cron: std::env::var("PROFQ_QUALITY_CRON")
                .unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            pipeline_command: std::env::var("PROFQ_PIPELINE_CMD")
                .unwrap_or_else(|_| "profq-cli ingest".to_string()),
            dispatch_capacity: env_or("PROFQ_ALERT_QUEUE", 64),
            school_aliases: school_aliases_from_env(),
        }
    }
}

fn school_aliases_from_env() -> Vec<SchoolAlias> {
    let Ok(raw) = std::env::var("PROFQ_SCHOOL_ALIASES") else {
        return default_school_aliases();
    };
    parse_school_aliases(&raw).unwrap_or_else(|err| {
        warn!(error = %err, "ignoring PROFQ_SCHOOL_ALIASES; using default aliases");
        default_school_aliases()
    })
}

/// Process-wide state, built once and shut down explicitly.
///
/// Must be constructed inside a Tokio runtime because the alert dispatcher
/// spawns its worker on creation.
pub struct AppContext {
    config: AppConfig,
    rules: QualityRules,
    store: DatasetStore,
    dataset: SharedDataset,
    dispatcher: AlertDispatcher,
    pipeline_lock: tokio::sync::Mutex<()>,
}

impl AppContext {
    pub fn new(config: AppConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let rules = QualityRules::load(config.rules_file.as_deref())?;
        let store = DatasetStore::new(config.ingest.dataset_dir.clone());
        let dataset = SharedDataset::open_or_empty(&store, &config.school_aliases);
        let dispatcher = AlertDispatcher::new(notifier, config.dispatch_capacity);
        Ok(Self {
            config,
            rules,
            store,
            dataset,
            dispatcher,
            pipeline_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn from_env() -> Result<Self> {
        let notifier = SlackNotifier::from_env()?;
        Self::new(AppConfig::from_env(), Arc::new(notifier))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn rules(&self) -> &QualityRules {
        &self.rules
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Snapshot of the dataset currently served to queries.
    pub fn dataset(&self) -> Arc<ProfileDataset> {
        self.dataset.snapshot()
    }

    pub fn ingest_pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(self.config.ingest.clone())
    }

    /// Re-reads the published dataset. On failure the previous snapshot keeps serving.
    pub async fn reload_dataset(&self) -> Result<Arc<ProfileDataset>> {
        let store = self.store.clone();
        let aliases = self.config.school_aliases.clone();
        let dataset = tokio::task::spawn_blocking(move || {
            ProfileDataset::open(&store).map(|dataset| dataset.with_school_aliases(aliases))
        })
        .await
            .context("dataset reload task did not complete")??;
        Ok(self.dataset.replace(dataset))
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!("application context shut down");
    }
}

fn log_metrics(report: &QualityReport) {
    for metric in report.metrics() {
        info!(
            metric = %metric.name,
            total = metric.total,
            bad = metric.bad,
            rate = metric.rate,
            threshold = metric.threshold,
            alert = metric.alert,
            "quality metric"
        );
    }
}

/// Evaluates every rule over the whole dataset and queues an alert per failing metric.
pub fn run_full_quality_check(ctx: &AppContext) -> QualityReport {
    let dataset = ctx.dataset();
    let span = info_span!("quality_check", version = dataset.version().unwrap_or("none"));
    let _guard = span.enter();

    let report = QualityReport::evaluate(dataset.records(), ctx.rules());
    log_metrics(&report);
    let mut queued = 0usize;
    for event in report.alert_events() {
        if ctx.dispatcher().submit(event) {
            queued += 1;
        }
    }
    info!(rows = report.total, queued, "quality check finished");
    report
}

/// Evaluates the rules over a filtered selection without dispatching anything.
pub fn evaluate_selection(ctx: &AppContext, filter: &SearchFilter) -> QualityReport {
    let dataset = ctx.dataset();
    let rows = dataset.select(filter);
    QualityReport::evaluate(rows.as_slice(), ctx.rules())
}

/// Schedules the full quality check on the configured cron expression.
pub async fn build_quality_monitor(ctx: Arc<AppContext>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = ctx.config().quality_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let ctx = ctx.clone();
        Box::pin(async move {
            if let Err(err) = ctx.reload_dataset().await {
                warn!(error = %format!("{err:#}"), "dataset reload failed; checking previous snapshot");
            }
            run_full_quality_check(&ctx);
        })
    })
    .with_context(|| format!("creating quality monitor job for cron {cron}"))?;
    sched.add(job).await.context("adding quality monitor job")?;
    Ok(sched)
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub rows_processed: Option<u64>,
}

/// Reads the row count from the last `Total Rows Processed:` line.
pub fn parse_rows_processed(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(ROWS_PROCESSED_PREFIX))
        .and_then(|count| count.trim().parse().ok())
}

/// Runs a whitespace-separated command line without a shell.
pub async fn run_pipeline_command(command: &str) -> Result<CommandOutput> {
    let mut parts = command.split_whitespace();
    let program = parts.next().context("pipeline command is empty")?;
    let output = tokio::process::Command::new(program)
        .args(parts)
        .output()
        .await
        .with_context(|| format!("launching `{command}`"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        rows_processed: parse_rows_processed(&stdout),
        stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub command: CommandOutput,
    pub quality: Option<QualityReport>,
}

/// Runs the configured pipeline command; on success reloads and re-checks the dataset.
///
/// Triggers are serialized: a second caller waits for the running one to finish.
pub async fn trigger_pipeline(ctx: &AppContext) -> Result<TriggerOutcome> {
    let _running = ctx.pipeline_lock.lock().await;
    let command = run_pipeline_command(&ctx.config().pipeline_command).await?;
    if !command.success {
        warn!(code = ?command.exit_code, stderr = %command.stderr.trim(), "pipeline command failed");
        return Ok(TriggerOutcome {
            command,
            quality: None,
        });
    }
    info!(rows = ?command.rows_processed, "pipeline command finished");
    ctx.reload_dataset().await?;
    let quality = run_full_quality_check(ctx);
    Ok(TriggerOutcome {
        command,
        quality: Some(quality),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use profq_alerts::NotifyOutcome;
    use profq_query::{GroupColumn, GroupCount, TopN};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn enforce(text: &str) -> EnforcedRecords {
        SchemaEnforcer.read(text.as_bytes()).expect("parse")
    }

    #[test]
    fn enforcer_maps_headers_and_trims() {
        let parsed = enforce("linkedin_id, name ,shoe_size\n  a1 ,  Ada  ,42\n");
        assert_eq!(parsed.stats.rows_read, 1);
        assert_eq!(parsed.stats.unknown_columns, vec!["shoe_size".to_string()]);
        assert_eq!(parsed.stats.missing_columns.len(), Column::COUNT - 2);
        let record = &parsed.records[0];
        assert_eq!(record.linkedin_id(), "a1");
        assert_eq!(record.get(Column::Name), "Ada");
        assert_eq!(record.get(Column::City), "");
    }

    #[test]
    fn enforcer_handles_multiline_and_escaped_quotes() {
        let parsed = enforce(
            "linkedin_id,about,similar_profiles\n\
             a1,\"line one\nline two\",\"[{\"\"name\"\":\"\"Bo\"\"}]\"\n\
             a2,plain,\n",
        );
        assert_eq!(parsed.stats.rows_read, 2);
        assert_eq!(parsed.records[0].get(Column::About), "line one\nline two");
        assert_eq!(parsed.records[0].similar_profiles()[0].name, "Bo");
        assert_eq!(parsed.records[1].get(Column::About), "plain");
    }

    #[test]
    fn enforcer_recovers_ragged_and_stray_quote_rows() {
        let parsed = enforce(
            "linkedin_id,name,city\n\
             a1,\"Ann \"Quoted\" Lee\",Paris\n\
             a2,Bob\n\
             a3,Cy,Rome,extra\n\
             a4,Di,Oslo\n",
        );
        assert_eq!(parsed.stats.rows_read, 4);
        assert_eq!(parsed.stats.ragged_rows, 2);
        assert_eq!(parsed.records[0].get(Column::Name), "Ann \"Quoted\" Lee");
        assert_eq!(parsed.records[0].get(Column::City), "Paris");
        assert_eq!(parsed.records[1].get(Column::City), "");
        assert_eq!(parsed.records[2].get(Column::City), "Rome");
        assert_eq!(parsed.records[3].get(Column::Name), "Di");
    }

    #[test]
    fn stray_quote_keeps_embedded_delimiter_in_field() {
        let parsed = enforce(
            "linkedin_id,name,city\n\
             a1,\"He said \"hi, there\" ok\",Paris\n\
             a2,\"Bo \"B\"\"\",Rome\n",
        );
        assert_eq!(parsed.stats.ragged_rows, 0);
        assert_eq!(parsed.records[0].get(Column::Name), "He said \"hi, there\" ok");
        assert_eq!(parsed.records[0].get(Column::City), "Paris");
        assert_eq!(parsed.records[1].get(Column::Name), "Bo \"B\"");
        assert_eq!(parsed.records[1].get(Column::City), "Rome");
    }

    #[test]
    fn blanks_before_opening_quote_are_skipped() {
        let parsed = enforce(
            "linkedin_id,name,city\n\
             a1, \"Doe, Jane\",Paris\n\
             a2,\t\"Roe, Rick\"  ,  Oslo \n\
             a3,  ,Rome\n",
        );
        assert_eq!(parsed.stats.ragged_rows, 0);
        assert_eq!(parsed.records[0].get(Column::Name), "Doe, Jane");
        assert_eq!(parsed.records[0].get(Column::City), "Paris");
        assert_eq!(parsed.records[1].get(Column::Name), "Roe, Rick");
        assert_eq!(parsed.records[1].get(Column::City), "Oslo");
        assert_eq!(parsed.records[2].get(Column::Name), "");
        assert_eq!(parsed.records[2].get(Column::City), "Rome");
    }

    #[test]
    fn quote_repair_survives_one_byte_reads() {
        let input = "id,\"a \"b\" c\"\n";
        let mut repaired = QuoteRepair::new(BufReader::with_capacity(1, input.as_bytes()));
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while repaired.read(&mut byte).unwrap() == 1 {
            out.push(byte[0]);
        }
        assert_eq!(String::from_utf8(out).unwrap(), "id,\"a \"\"b\"\" c\"\n");
    }

    #[test]
    fn enforcer_decodes_invalid_utf8_lossily() {
        let mut bytes = b"linkedin_id,name\na1,caf".to_vec();
        bytes.push(0xff);
        bytes.push(b'\n');
        let parsed = SchemaEnforcer.read(bytes.as_slice()).expect("parse");
        assert_eq!(parsed.records[0].get(Column::Name), "caf\u{fffd}");
    }

    #[test]
    fn empty_input_yields_no_records() {
        let parsed = enforce("");
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.stats.rows_read, 0);
        let outcome = Deduplicator::default().apply(parsed.records);
        assert_eq!((outcome.before_count, outcome.after_count), (0, 0));
    }

    #[test]
    fn dedup_keeps_first_seen() {
        let rows = vec![
            Record::from_pairs([(Column::LinkedinId, "a"), (Column::Name, "first")]),
            Record::from_pairs([(Column::LinkedinId, "b")]),
            Record::from_pairs([(Column::LinkedinId, "a"), (Column::Name, "second")]),
            Record::from_pairs([(Column::LinkedinId, ""), (Column::Name, "x")]),
            Record::from_pairs([(Column::LinkedinId, ""), (Column::Name, "y")]),
        ];
        let outcome = Deduplicator::default().apply(rows);
        assert_eq!(outcome.before_count, 5);
        assert_eq!(outcome.after_count, 3);
        assert_eq!(outcome.records[0].get(Column::Name), "first");
        assert_eq!(outcome.records[2].get(Column::Name), "x");
    }

    proptest! {
        #[test]
        fn dedup_output_has_unique_keys(keys in proptest::collection::vec("[a-d]{0,2}", 0..60)) {
            let rows = keys
                .iter()
                .map(|key| Record::from_pairs([(Column::LinkedinId, key.as_str())]))
                .collect::<Vec<_>>();
            let outcome = Deduplicator::default().apply(rows);
            let distinct = outcome
                .records
                .iter()
                .map(|r| r.linkedin_id().to_string())
                .collect::<HashSet<_>>();
            prop_assert_eq!(distinct.len(), outcome.records.len());
            prop_assert_eq!(outcome.after_count as usize, keys.iter().collect::<HashSet<_>>().len());
            prop_assert_eq!(outcome.before_count as usize, keys.len());
        }
    }

    #[test]
    fn rows_processed_line_is_parsed() {
        assert_eq!(parse_rows_processed("noise\nTotal Rows Processed: 42\n"), Some(42));
        assert_eq!(parse_rows_processed("nothing here"), None);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) -> NotifyOutcome {
            self.messages.lock().unwrap().push(message.to_string());
            NotifyOutcome::delivered("ts-1")
        }
    }

    const SAMPLE_CSV: &str = "id,name,city,position,country_code,current_company_name,url,linkedin_id\n\
        1,Ada,London,Engineer,GB,Engines,https://www.linkedin.com/in/ada,ada\n\
        2,Alan,Manchester,Scientist,GB,Bletchley,https://www.linkedin.com/in/alan,alan\n\
        3,Ada again,London,Engineer,GB,Engines,https://www.linkedin.com/in/ada,ada\n\
        4,Grace,New York,Admiral,US,Navy,https://example.com/grace,grace\n";

    fn app_config(dir: &Path, command: &str) -> AppConfig {
        let input_csv = dir.join("input.csv");
        std::fs::write(&input_csv, SAMPLE_CSV).unwrap();
        AppConfig {
            ingest: IngestConfig {
                input_csv,
                dataset_dir: dir.join("parquet"),
                storage: StorageConfig {
                    sharding: ShardingPlan {
                        target_shards: 2,
                        max_rows_per_shard: None,
                    },
                    ..StorageConfig::default()
                },
            },
            rules_file: None,
            quality_cron: "0 */15 * * * *".to_string(),
            pipeline_command: command.to_string(),
            dispatch_capacity: 16,
            school_aliases: default_school_aliases(),
        }
    }

    #[tokio::test]
    async fn ingest_run_publishes_deduplicated_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "true");
        let pipeline = IngestPipeline::new(config.ingest.clone());
        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.rows_read, 4);
        assert_eq!(summary.before_dedup, 4);
        assert_eq!(summary.after_dedup, 3);
        assert_eq!(summary.shard_count, 2);

        let dataset = ProfileDataset::open(pipeline.store()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.lookup_by_key("ada").unwrap().get(Column::Name), "Ada");
    }

    #[tokio::test]
    async fn missing_input_aborts_and_keeps_previous_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = app_config(dir.path(), "true");
        let pipeline = IngestPipeline::new(config.ingest.clone());
        pipeline.run_once().await.unwrap();

        config.ingest.input_csv = dir.path().join("missing.csv");
        let err = IngestPipeline::new(config.ingest).run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("missing.csv"));
        assert_eq!(ProfileDataset::open(pipeline.store()).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn full_quality_check_dispatches_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = AppContext::new(app_config(dir.path(), "true"), notifier.clone()).unwrap();
        assert!(ctx.dataset().is_empty());

        let empty = run_full_quality_check(&ctx);
        assert!(empty.alert_events().is_empty());

        ctx.ingest_pipeline().run_once().await.unwrap();
        ctx.reload_dataset().await.unwrap();
        let report = run_full_quality_check(&ctx);
        assert_eq!(report.url.total, 3);
        assert_eq!(report.url.bad, 1);
        assert!(report.url.alert);
        assert!(!report.company_nulls.alert);

        ctx.shutdown().await;
        let history = ctx.dispatcher().history();
        assert_eq!(history.len(), report.alert_events().len());
        assert!(history.iter().all(|event| event.dispatched));
        let messages = notifier.messages.lock().unwrap();
        assert!(messages[0].starts_with("WARNING URL quality: 1/3 rows (33.33%)"));
    }

    #[tokio::test]
    async fn selection_evaluation_does_not_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(
            app_config(dir.path(), "true"),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        ctx.ingest_pipeline().run_once().await.unwrap();
        ctx.reload_dataset().await.unwrap();

        let filter = SearchFilter {
            city_query: Some("london".into()),
            ..SearchFilter::default()
        };
        let report = evaluate_selection(&ctx, &filter);
        assert_eq!(report.total, 1);
        assert!(!report.url.alert);
        ctx.shutdown().await;
        assert!(ctx.dispatcher().history().is_empty());
    }

    #[tokio::test]
    async fn trigger_reports_command_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(
            app_config(dir.path(), "false"),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        let failed = trigger_pipeline(&ctx).await.unwrap();
        assert!(!failed.command.success);
        assert!(failed.quality.is_none());
        ctx.shutdown().await;

        let output = run_pipeline_command("echo Total Rows Processed: 3").await.unwrap();
        assert!(output.success);
        assert_eq!(output.rows_processed, Some(3));
        assert!(run_pipeline_command("   ").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_triggers_run_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(
            app_config(dir.path(), "false"),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        let running = ctx.pipeline_lock.lock().await;
        let waiting = tokio::time::timeout(Duration::from_millis(100), trigger_pipeline(&ctx)).await;
        assert!(waiting.is_err());
        drop(running);
        let outcome = trigger_pipeline(&ctx).await.unwrap();
        assert!(!outcome.command.success);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn configured_school_aliases_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = app_config(dir.path(), "true");
        std::fs::write(
            &config.ingest.input_csv,
            "linkedin_id,educations_details\na,Stanford GSB\nb,stanford university\nc,MIT\n",
        )
        .unwrap();
        config.school_aliases = parse_school_aliases("stanford=Stanford").unwrap();
        let ctx = AppContext::new(config, Arc::new(RecordingNotifier::default())).unwrap();
        ctx.ingest_pipeline().run_once().await.unwrap();
        let dataset = ctx.reload_dataset().await.unwrap();
        let top = dataset.top_by(GroupColumn::School, &SearchFilter::default(), TopN::default());
        assert_eq!(top[0], GroupCount { value: "Stanford".into(), count: 2 });
        assert_eq!(top[1], GroupCount { value: "MIT".into(), count: 1 });
        ctx.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitor_accepts_configured_cron() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(
            AppContext::new(
                app_config(dir.path(), "true"),
                Arc::new(RecordingNotifier::default()),
            )
            .unwrap(),
        );
        let sched = build_quality_monitor(ctx.clone()).await;
        assert!(sched.is_ok());
        ctx.shutdown().await;
    }
}
