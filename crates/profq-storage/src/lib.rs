//! Sharded parquet dataset store with versioned, atomically published snapshots.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef, GenericStringArray, OffsetSizeTrait, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::schema::types::ColumnPath;
use profq_core::{Column, Record};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "profq-storage";

pub const CURRENT_POINTER: &str = "_CURRENT";
pub const MANIFEST_FILE: &str = "_manifest.json";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

const VERSION_PREFIX: &str = "v-";
const STAGING_PREFIX: &str = ".staging-";
const PUBLISH_LOCK: &str = ".publish.lock";

/// The two independent shard caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardingPlan {
    pub target_shards: u64,
    pub max_rows_per_shard: Option<u64>,
}

impl Default for ShardingPlan {
    fn default() -> Self {
        Self {
            target_shards: 200,
            max_rows_per_shard: Some(800_000),
        }
    }
}

impl ShardingPlan {
    /// `max(target, ceil(rows / cap))` when a cap is set, otherwise the target.
    pub fn effective_shard_count(&self, row_count: u64) -> u64 {
        let target = self.target_shards.max(1);
        match self.max_rows_per_shard {
            Some(cap) if cap > 0 => target.max(row_count.div_ceil(cap)),
            _ => target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sharding: ShardingPlan,
    pub row_group_rows: usize,
    /// Low-cardinality columns allowed to use dictionary encoding. Everything else is plain.
    pub dictionary_columns: Vec<Column>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sharding: ShardingPlan::default(),
            row_group_rows: 65_536,
            dictionary_columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub row_count: u64,
    pub columns: Vec<String>,
    pub shards: Vec<ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct PublishedDataset {
    pub version: String,
    pub version_dir: PathBuf,
    pub manifest: DatasetManifest,
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    /// `None` when the root holds a flat directory of parquet files without a pointer.
    pub version: Option<String>,
    pub manifest: Option<DatasetManifest>,
    pub records: Vec<Record>,
}

pub fn profile_schema() -> SchemaRef {
    Arc::new(Schema::new(
        Column::ALL
            .iter()
            .map(|column| Field::new(column.as_str(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

pub fn writer_properties(config: &StorageConfig) -> WriterProperties {
    let mut builder = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(false)
        .set_max_row_group_size(config.row_group_rows.max(1));
    for column in &config.dictionary_columns {
        builder = builder.set_column_dictionary_enabled(ColumnPath::from(column.as_str()), true);
    }
    builder.build()
}

#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `records` as a new version and swaps the current pointer to it.
    ///
    /// The version is fully written under a staging directory before it becomes
    /// visible, so readers see either the previous snapshot or the new one.
    /// Publishers hold an exclusive lock on the dataset root for the whole run,
    /// so concurrent publishes cannot collect each other's versions.
    pub fn publish(
        &self,
        run_id: Uuid,
        records: &[Record],
        config: &StorageConfig,
    ) -> Result<PublishedDataset> {
        let span = info_span!("dataset_publish", %run_id, rows = records.len());
        let _guard = span.enter();

        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating dataset root {}", self.root.display()))?;
        let _lock = self.lock_publish()?;

        let staging_dir = self.root.join(format!("{STAGING_PREFIX}{run_id}"));
        let manifest = match self.write_version(&staging_dir, run_id, records, config) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging_dir);
                return Err(err);
            }
        };

        let version = format!("{VERSION_PREFIX}{run_id}");
        let version_dir = self.root.join(&version);
        if let Err(err) = fs::rename(&staging_dir, &version_dir) {
            let _ = fs::remove_dir_all(&staging_dir);
            return Err(err).with_context(|| {
                format!(
                    "renaming staged dataset {} -> {}",
                    staging_dir.display(),
                    version_dir.display()
                )
            });
        }

        let previous = self.current_version()?;
        self.write_pointer(&version)?;
        self.collect_garbage(&version, previous.as_deref());

        info!(
            version = %version,
            shards = manifest.shards.len(),
            rows = manifest.row_count,
            "dataset published"
        );
        Ok(PublishedDataset {
            version,
            version_dir,
            manifest,
        })
    }

    /// Blocks until this process owns the publish lock. Dropping the file releases it.
    fn lock_publish(&self) -> Result<File> {
        let path = self.root.join(PUBLISH_LOCK);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(file)
    }

    /// Name of the version the pointer currently designates, if any.
    pub fn current_version(&self) -> Result<Option<String>> {
        let pointer = self.root.join(CURRENT_POINTER);
        let text = match fs::read_to_string(&pointer) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", pointer.display()));
            }
        };
        let version = text.trim();
        if !version.starts_with(VERSION_PREFIX) || version.contains(['/', '\\']) {
            bail!("corrupt dataset pointer {}: {version:?}", pointer.display());
        }
        Ok(Some(version.to_string()))
    }

    pub fn load_current(&self) -> Result<LoadedDataset> {
        match self.current_version()? {
            Some(version) => {
                let version_dir = self.root.join(&version);
                let manifest = read_manifest(&version_dir.join(MANIFEST_FILE))?;
                let mut records = Vec::with_capacity(manifest.row_count as usize);
                for shard in &manifest.shards {
                    let before = records.len();
                    read_shard_into(&version_dir.join(&shard.name), &mut records)?;
                    let read = (records.len() - before) as u64;
                    if read != shard.rows {
                        bail!(
                            "shard {} holds {read} rows, manifest says {}",
                            shard.name,
                            shard.rows
                        );
                    }
                }
                Ok(LoadedDataset {
                    version: Some(version),
                    manifest: Some(manifest),
                    records,
                })
            }
            None => self.load_flat(),
        }
    }

    fn load_flat(&self) -> Result<LoadedDataset> {
        let mut files = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file() && path.extension().is_some_and(|ext| ext == "parquet")
                })
                .collect::<Vec<_>>(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.root.display()));
            }
        };
        if files.is_empty() {
            bail!("no dataset published at {}", self.root.display());
        }
        files.sort();

        let mut records = Vec::new();
        for path in &files {
            read_shard_into(path, &mut records)?;
        }
        Ok(LoadedDataset {
            version: None,
            manifest: None,
            records,
        })
    }

    fn write_version(
        &self,
        dir: &Path,
        run_id: Uuid,
        records: &[Record],
        config: &StorageConfig,
    ) -> Result<DatasetManifest> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let row_count = records.len() as u64;
        let shard_count = config.sharding.effective_shard_count(row_count);
        // Round-robin leaves shards past `row_count` empty; those are not written.
        let written = shard_count.min(row_count.max(1));
        let schema = profile_schema();
        let props = writer_properties(config);
        let batch_rows = config.row_group_rows.max(1);

        let mut shards = Vec::with_capacity(written as usize);
        for shard in 0..written {
            let name = format!("part-{shard:05}.snappy.parquet");
            let path = dir.join(&name);
            let rows = write_shard(
                &path,
                &schema,
                &props,
                records,
                shard as usize,
                shard_count as usize,
                batch_rows,
            )?;
            let (bytes, sha256) = file_digest(&path)?;
            shards.push(ShardEntry {
                name,
                rows,
                bytes,
                sha256,
            });
        }

        let manifest = DatasetManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id,
            created_at: Utc::now(),
            row_count,
            columns: Column::ALL.iter().map(|c| c.as_str().to_string()).collect(),
            shards,
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing dataset manifest")?;
        fs::write(&manifest_path, bytes)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest)
    }

    fn write_pointer(&self, version: &str) -> Result<()> {
        let pointer = self.root.join(CURRENT_POINTER);
        let temp_path = self
            .root
            .join(format!(".{CURRENT_POINTER}.{}.tmp", Uuid::new_v4()));
        let mut file = File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.write_all(version.as_bytes())
            .and_then(|()| file.sync_all())
            .with_context(|| format!("writing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &pointer) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    pointer.display()
                )
            });
        }
        Ok(())
    }

    /// Keeps the live version and the one it replaced; older versions are removed.
    fn collect_garbage(&self, live: &str, previous: Option<&str>) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "listing dataset root for cleanup failed");
                return;
            }
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(VERSION_PREFIX) || name == live || Some(name.as_str()) == previous {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(entry.path()) {
                warn!(version = %name, error = %err, "removing stale dataset version failed");
            }
        }
    }
}

fn write_shard(
    path: &Path,
    schema: &SchemaRef,
    props: &WriterProperties,
    records: &[Record],
    shard: usize,
    shard_count: usize,
    batch_rows: usize,
) -> Result<u64> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props.clone()))
        .with_context(|| format!("opening parquet writer {}", path.display()))?;

    let mut rows = 0u64;
    let mut chunk: Vec<&Record> = Vec::with_capacity(batch_rows.min(records.len()));
    for record in records.iter().skip(shard).step_by(shard_count.max(1)) {
        chunk.push(record);
        if chunk.len() == batch_rows {
            write_chunk(&mut writer, schema, &chunk, path)?;
            rows += chunk.len() as u64;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        write_chunk(&mut writer, schema, &chunk, path)?;
        rows += chunk.len() as u64;
    }

    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(rows)
}

fn write_chunk(
    writer: &mut ArrowWriter<File>,
    schema: &SchemaRef,
    rows: &[&Record],
    path: &Path,
) -> Result<()> {
    let batch = record_batch(schema, rows)?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))
}

fn record_batch(schema: &SchemaRef, rows: &[&Record]) -> Result<RecordBatch> {
    let columns = Column::ALL
        .iter()
        .map(|column| {
            let values = rows
                .iter()
                .map(|record| {
                    let value = record.get(*column);
                    (!value.is_empty()).then_some(value)
                })
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema.clone(), columns).context("building profile record batch")
}

fn file_digest(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hashing {}", path.display()))?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

fn read_manifest(path: &Path) -> Result<DatasetManifest> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let manifest: DatasetManifest =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        bail!(
            "unsupported manifest schema version {} in {}",
            manifest.schema_version,
            path.display()
        );
    }
    Ok(manifest)
}

enum TextColumn<'a> {
    Utf8(&'a GenericStringArray<i32>),
    LargeUtf8(&'a GenericStringArray<i64>),
}

impl TextColumn<'_> {
    fn value(&self, row: usize) -> &str {
        match self {
            TextColumn::Utf8(array) => text_value(*array, row),
            TextColumn::LargeUtf8(array) => text_value(*array, row),
        }
    }
}

fn text_value<O: OffsetSizeTrait>(array: &GenericStringArray<O>, row: usize) -> &str {
    if array.is_null(row) {
        ""
    } else {
        array.value(row)
    }
}

fn read_shard_into(path: &Path, out: &mut Vec<Record>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("parquet reader init {}", path.display()))?
        .build()
        .with_context(|| format!("parquet reader build {}", path.display()))?;

    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        let schema = batch.schema();
        let mut columns = Vec::with_capacity(Column::COUNT);
        for column in Column::ALL {
            let Ok(idx) = schema.index_of(column.as_str()) else {
                continue;
            };
            let array = batch.column(idx);
            let text = if let Some(array) = array.as_string_opt::<i32>() {
                TextColumn::Utf8(array)
            } else if let Some(array) = array.as_string_opt::<i64>() {
                TextColumn::LargeUtf8(array)
            } else {
                bail!(
                    "column '{}' in {} is {}, expected text",
                    column,
                    path.display(),
                    array.data_type()
                );
            };
            columns.push((*column, text));
        }

        for row in 0..batch.num_rows() {
            let mut record = Record::empty();
            for (column, text) in &columns {
                record.set(*column, text.value(row));
            }
            out.push(record);
        }
    }
    Ok(())
}
