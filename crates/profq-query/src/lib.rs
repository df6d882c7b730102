//! Read-only, parameterized access over a published profile dataset.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, RwLock};

use profq_core::{extract_linkedin_id, Column, Record};
use profq_quality::{is_bad_url, UrlRule};
use profq_storage::DatasetStore;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "profq-query";

pub const MAX_ROW_LIMIT: i64 = 10_000;
pub const MAX_TOP_N: i64 = 100;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("row limit must be between 1 and {max}, got {value}")]
    InvalidLimit { value: i64, max: i64 },
    #[error("top-n must be between 1 and {max}, got {value}")]
    InvalidTopN { value: i64, max: i64 },
    #[error("unknown group column `{0}` (expected city, company or school)")]
    UnknownGroupColumn(String),
    #[error("invalid school alias `{0}` (expected `substring=Label`)")]
    InvalidSchoolAlias(String),
    #[error("dataset unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

/// Caller-supplied row cap, validated before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLimit(usize);

impl RowLimit {
    pub fn new(value: i64) -> Result<Self, QueryError> {
        if (1..=MAX_ROW_LIMIT).contains(&value) {
            Ok(Self(value as usize))
        } else {
            Err(QueryError::InvalidLimit {
                value,
                max: MAX_ROW_LIMIT,
            })
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for RowLimit {
    fn default() -> Self {
        Self(1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopN(usize);

impl TopN {
    pub fn new(value: i64) -> Result<Self, QueryError> {
        if (1..=MAX_TOP_N).contains(&value) {
            Ok(Self(value as usize))
        } else {
            Err(QueryError::InvalidTopN {
                value,
                max: MAX_TOP_N,
            })
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for TopN {
    fn default() -> Self {
        Self(20)
    }
}

/// Filter parameters. Values are matched as data and never spliced into query text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub name_contains: Option<String>,
    pub city_query: Option<String>,
}

impl SearchFilter {
    fn compile(&self) -> CompiledFilter {
        CompiledFilter {
            name_needle: self
                .name_contains
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(str::to_lowercase),
            city_tokens: self
                .city_query
                .as_deref()
                .map(tokenize_city_query)
                .unwrap_or_default(),
        }
    }
}

struct CompiledFilter {
    name_needle: Option<String>,
    city_tokens: Vec<String>,
}

impl CompiledFilter {
    fn matches(&self, derived: &DerivedFields) -> bool {
        if let Some(needle) = &self.name_needle {
            if !derived.name_lc.contains(needle.as_str()) {
                return false;
            }
        }
        self.city_tokens
            .iter()
            .all(|token| derived.city_folded.contains(token.as_str()))
    }
}

static CITY_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("city split regex"));
static CITY_STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("city fold regex"));

/// Lowercases the query and splits it on runs of anything but letters and digits,
/// the same class [`fold_city`] keeps.
pub fn tokenize_city_query(query: &str) -> Vec<String> {
    CITY_SPLIT_RE
        .split(&query.to_lowercase())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercases a city and drops everything that is not a letter, digit or whitespace.
pub fn fold_city(city: &str) -> String {
    CITY_STRIP_RE.replace_all(&city.to_lowercase(), "").into_owned()
}

/// Normalization fields defined once when the dataset is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFields {
    pub name_lc: String,
    pub city_folded: String,
}

impl DerivedFields {
    fn for_record(record: &Record) -> Self {
        Self {
            name_lc: record.get(Column::Name).to_lowercase(),
            city_folded: fold_city(record.get(Column::City)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupColumn {
    City,
    Company,
    School,
}

impl GroupColumn {
    pub fn column(self) -> Column {
        match self {
            GroupColumn::City => Column::City,
            GroupColumn::Company => Column::CurrentCompanyName,
            GroupColumn::School => Column::EducationsDetails,
        }
    }
}

impl FromStr for GroupColumn {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "city" => Ok(GroupColumn::City),
            "company" | "current_company_name" => Ok(GroupColumn::Company),
            "school" | "educations_details" => Ok(GroupColumn::School),
            other => Err(QueryError::UnknownGroupColumn(other.to_string())),
        }
    }
}

/// Collapses spelling variants of one institution onto a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolAlias {
    pub contains: String,
    pub canonical: String,
}

impl FromStr for SchoolAlias {
    type Err = QueryError;

    /// Parses `substring=Label`; the substring is matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (contains, canonical) = s
            .split_once('=')
            .map(|(c, l)| (c.trim(), l.trim()))
            .filter(|(c, l)| !c.is_empty() && !l.is_empty())
            .ok_or_else(|| QueryError::InvalidSchoolAlias(s.to_string()))?;
        Ok(Self {
            contains: contains.to_lowercase(),
            canonical: canonical.to_string(),
        })
    }
}

/// Parses a `;`-separated alias list, skipping empty entries.
pub fn parse_school_aliases(raw: &str) -> Result<Vec<SchoolAlias>, QueryError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

pub fn default_school_aliases() -> Vec<SchoolAlias> {
    vec![SchoolAlias {
        contains: "new york university".to_string(),
        canonical: "New York University".to_string(),
    }]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkNode {
    pub name: String,
    pub title: String,
    pub url: String,
    pub linkedin_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileNetwork {
    pub center: NetworkNode,
    pub similar: Vec<NetworkNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadUrlRow {
    pub name: String,
    pub url: String,
}

#[derive(Debug)]
pub struct ProfileDataset {
    version: Option<String>,
    records: Vec<Record>,
    derived: Vec<DerivedFields>,
    key_index: HashMap<String, usize>,
    school_aliases: Vec<SchoolAlias>,
}

impl ProfileDataset {
    pub fn open(store: &DatasetStore) -> anyhow::Result<Self> {
        let loaded = store.load_current()?;
        let dataset = Self::from_records(loaded.records, loaded.version);
        info!(
            version = dataset.version().unwrap_or("flat"),
            rows = dataset.len(),
            "dataset opened"
        );
        Ok(dataset)
    }

    pub fn from_records(records: Vec<Record>, version: Option<String>) -> Self {
        let derived = records.iter().map(DerivedFields::for_record).collect();
        let mut key_index = HashMap::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            key_index.entry(record.linkedin_id().to_string()).or_insert(idx);
        }
        Self {
            version,
            records,
            derived,
            key_index,
            school_aliases: default_school_aliases(),
        }
    }

    pub fn with_school_aliases(mut self, aliases: Vec<SchoolAlias>) -> Self {
        self.school_aliases = aliases;
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn derived(&self) -> &[DerivedFields] {
        &self.derived
    }

    fn filtered<'a>(&'a self, filter: &SearchFilter) -> impl Iterator<Item = &'a Record> + 'a {
        let compiled = filter.compile();
        self.records
            .iter()
            .zip(&self.derived)
            .filter(move |(_, derived)| compiled.matches(derived))
            .map(|(record, _)| record)
    }

    /// Every record passing the filter, for metric computation.
    pub fn select(&self, filter: &SearchFilter) -> Vec<&Record> {
        self.filtered(filter).collect()
    }

    pub fn search(&self, filter: &SearchFilter, limit: RowLimit) -> Vec<&Record> {
        self.filtered(filter).take(limit.get()).collect()
    }

    /// Counts per distinct value, highest first (ties by label), truncated to `top_n`.
    pub fn top_by(&self, group: GroupColumn, filter: &SearchFilter, top_n: TopN) -> Vec<GroupCount> {
        let column = group.column();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in self.filtered(filter) {
            let value = record.get(column);
            let label = match group {
                GroupColumn::School => {
                    if value.trim().is_empty() {
                        continue;
                    }
                    self.canonical_school(value)
                }
                GroupColumn::City | GroupColumn::Company => value.to_string(),
            };
            *counts.entry(label).or_default() += 1;
        }

        let mut rows = counts
            .into_iter()
            .map(|(value, count)| GroupCount { value, count })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        rows.truncate(top_n.get());
        rows
    }

    fn canonical_school(&self, value: &str) -> String {
        let lowered = value.to_lowercase();
        self.school_aliases
            .iter()
            .find(|alias| lowered.contains(&alias.contains.to_lowercase()))
            .map(|alias| alias.canonical.clone())
            .unwrap_or_else(|| value.to_string())
    }

    pub fn lookup_by_key(&self, key: &str) -> Option<&Record> {
        self.key_index.get(key).map(|&idx| &self.records[idx])
    }

    /// The profile plus its embedded similar-profile references.
    pub fn network(&self, key: &str) -> Option<ProfileNetwork> {
        let record = self.lookup_by_key(key)?;
        let name = match record.get(Column::Name) {
            "" => key.to_string(),
            name => name.to_string(),
        };
        let url = record.get(Column::Url).to_string();
        let center = NetworkNode {
            name,
            title: record.get(Column::Position).to_string(),
            linkedin_id: extract_linkedin_id(&url),
            url,
        };
        let similar = record
            .similar_profiles()
            .into_iter()
            .filter(|profile| !profile.name.is_empty())
            .map(|profile| NetworkNode {
                linkedin_id: extract_linkedin_id(&profile.url),
                name: profile.name,
                title: profile.title,
                url: profile.url,
            })
            .collect();
        Some(ProfileNetwork { center, similar })
    }

    pub fn bad_url_sample(
        &self,
        filter: &SearchFilter,
        rule: &UrlRule,
        limit: RowLimit,
    ) -> Vec<BadUrlRow> {
        self.filtered(filter)
            .filter(|record| is_bad_url(record, rule))
            .take(limit.get())
            .map(|record| BadUrlRow {
                name: record.get(Column::Name).to_string(),
                url: record.get(Column::Url).to_string(),
            })
            .collect()
    }
}

/// Reloadable handle; readers hold an immutable snapshot for the duration of a query.
#[derive(Debug)]
pub struct SharedDataset {
    current: RwLock<Arc<ProfileDataset>>,
}

impl SharedDataset {
    pub fn new(dataset: ProfileDataset) -> Self {
        Self {
            current: RwLock::new(Arc::new(dataset)),
        }
    }

    /// Opens the store, falling back to an empty dataset when nothing is published yet.
    pub fn open_or_empty(store: &DatasetStore, aliases: &[SchoolAlias]) -> Self {
        let dataset = match ProfileDataset::open(store) {
            Ok(dataset) => dataset,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "no readable dataset; starting empty");
                ProfileDataset::from_records(Vec::new(), None)
            }
        };
        Self::new(dataset.with_school_aliases(aliases.to_vec()))
    }

    pub fn snapshot(&self) -> Arc<ProfileDataset> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swaps in a new snapshot. Readers holding the old one keep it until they drop it.
    pub fn replace(&self, dataset: ProfileDataset) -> Arc<ProfileDataset> {
        let dataset = Arc::new(dataset);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = dataset.clone();
        dataset
    }
}
