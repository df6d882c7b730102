//! Data-quality metrics and threshold evaluation over profile record sets.
//!
//! Everything here is a total function of its inputs: an empty record set
//! produces zero rates and never alerts. Delivering alerts is left to callers.

use std::borrow::Borrow;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use profq_core::{Column, Record};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "profq-quality";

/// How a rate is compared against its threshold. Configured per metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = ">")]
    Above,
}

impl Comparator {
    pub fn holds(self, rate: f64, threshold_pct: f64) -> bool {
        match self {
            Comparator::AtLeast => rate >= threshold_pct,
            Comparator::Above => rate > threshold_pct,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::AtLeast => ">=",
            Comparator::Above => ">",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub rate: f64,
    pub alert: bool,
}

/// Turns a `(total, bad)` count pair into a percentage and an alert decision.
pub fn evaluate(total: u64, bad: u64, threshold_pct: f64, comparator: Comparator) -> Evaluation {
    if total == 0 {
        return Evaluation {
            rate: 0.0,
            alert: false,
        };
    }
    let rate = bad as f64 * 100.0 / total as f64;
    Evaluation {
        rate,
        alert: comparator.holds(rate, threshold_pct),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricStatus {
    Ok,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityMetric {
    pub name: String,
    pub total: u64,
    pub bad: u64,
    pub rate: f64,
    pub threshold: f64,
    pub comparator: Comparator,
    pub alert: bool,
    pub summary: String,
}

impl QualityMetric {
    fn new(
        name: impl Into<String>,
        total: u64,
        bad: u64,
        threshold: f64,
        comparator: Comparator,
        summary: impl FnOnce(f64) -> String,
    ) -> Self {
        let Evaluation { rate, alert } = evaluate(total, bad, threshold, comparator);
        Self {
            name: name.into(),
            total,
            bad,
            rate,
            threshold,
            comparator,
            alert,
            summary: summary(rate),
        }
    }

    pub fn status(&self) -> MetricStatus {
        if self.alert {
            MetricStatus::Alert
        } else {
            MetricStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlRule {
    pub required_substring: String,
    pub threshold_pct: f64,
    pub comparator: Comparator,
}

impl Default for UrlRule {
    fn default() -> Self {
        Self {
            required_substring: "linkedin".to_string(),
            threshold_pct: 5.0,
            comparator: Comparator::AtLeast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullRateRule {
    pub column: Column,
    pub threshold_pct: f64,
    pub comparator: Comparator,
}

impl Default for NullRateRule {
    fn default() -> Self {
        Self {
            column: Column::CurrentCompanyName,
            threshold_pct: 2.0,
            comparator: Comparator::Above,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletenessRule {
    pub columns: Vec<Column>,
    pub threshold_pct: f64,
    pub comparator: Comparator,
}

impl Default for CompletenessRule {
    fn default() -> Self {
        Self {
            columns: vec![
                Column::Name,
                Column::Position,
                Column::City,
                Column::CountryCode,
                Column::CurrentCompanyName,
            ],
            threshold_pct: 5.0,
            comparator: Comparator::AtLeast,
        }
    }
}

/// Thresholds and comparators for every metric family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityRules {
    pub url: UrlRule,
    pub company_nulls: NullRateRule,
    pub completeness: CompletenessRule,
}

impl QualityRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing quality rules")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Rules from `path` when given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

fn as_record<R: Borrow<Record>>(row: &R) -> &Record {
    row.borrow()
}

/// A URL is bad when it does not mention the known-good domain, case-insensitively.
pub fn is_bad_url(record: &Record, rule: &UrlRule) -> bool {
    let needle = rule.required_substring.to_lowercase();
    !record.get(Column::Url).to_lowercase().contains(&needle)
}

pub fn compute_url_quality<R: Borrow<Record>>(rows: &[R], rule: &UrlRule) -> QualityMetric {
    let total = rows.len() as u64;
    let bad = rows
        .iter()
        .filter(|row| is_bad_url(as_record(*row), rule))
        .count() as u64;
    QualityMetric::new(
        "url_validity",
        total,
        bad,
        rule.threshold_pct,
        rule.comparator,
        |rate| {
            format!(
                "URL quality: {bad}/{total} rows ({rate:.2}%) missing '{}' in url; threshold {:.2}%",
                rule.required_substring, rule.threshold_pct
            )
        },
    )
}

pub fn compute_null_rate<R: Borrow<Record>>(rows: &[R], rule: &NullRateRule) -> QualityMetric {
    let total = rows.len() as u64;
    let nulls = rows
        .iter()
        .filter(|row| as_record(*row).is_blank(rule.column))
        .count() as u64;
    QualityMetric::new(
        format!("null_rate:{}", rule.column),
        total,
        nulls,
        rule.threshold_pct,
        rule.comparator,
        |rate| {
            format!(
                "{} nulls: {nulls}/{total} rows ({rate:.2}%) blank; threshold {:.2}%",
                rule.column, rule.threshold_pct
            )
        },
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletenessRow {
    pub column: Column,
    pub nulls: u64,
    pub total: u64,
    pub pct: f64,
    pub status: MetricStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletenessReport {
    pub total: u64,
    pub metrics: Vec<QualityMetric>,
    /// One row per tracked column; empty when there are no records.
    pub table: Vec<CompletenessRow>,
}

pub fn compute_completeness<R: Borrow<Record>>(
    rows: &[R],
    rule: &CompletenessRule,
) -> CompletenessReport {
    let total = rows.len() as u64;
    let mut nulls = vec![0u64; rule.columns.len()];
    for row in rows {
        let record = as_record(row);
        for (count, column) in nulls.iter_mut().zip(&rule.columns) {
            if record.is_blank(*column) {
                *count += 1;
            }
        }
    }

    let metrics = rule
        .columns
        .iter()
        .zip(&nulls)
        .map(|(column, &null_count)| {
            let symbol = rule.comparator.symbol();
            QualityMetric::new(
                format!("completeness:{column}"),
                total,
                null_count,
                rule.threshold_pct,
                rule.comparator,
                |rate| {
                    format!(
                        "completeness: {column} null/blank {null_count}/{total} rows ({rate:.2}%) {symbol} {:.2}%",
                        rule.threshold_pct
                    )
                },
            )
        })
        .collect::<Vec<_>>();

    let table = if total == 0 {
        Vec::new()
    } else {
        metrics
            .iter()
            .zip(&rule.columns)
            .map(|(metric, column)| CompletenessRow {
                column: *column,
                nulls: metric.bad,
                total,
                pct: round2(metric.rate),
                status: metric.status(),
            })
            .collect()
    };

    CompletenessReport {
        total,
        metrics,
        table,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One alert awaiting (or after) delivery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub metric: String,
    pub message: String,
    pub dispatched: bool,
    pub reference_or_error: String,
}

impl AlertEvent {
    pub fn pending(metric: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            message: message.into(),
            dispatched: false,
            reference_or_error: String::new(),
        }
    }

    pub fn for_metric(metric: &QualityMetric) -> Self {
        Self::pending(metric.name.clone(), format!("WARNING {}", metric.summary))
    }

    pub fn record_outcome(&mut self, delivered: bool, reference_or_error: impl Into<String>) {
        self.dispatched = delivered;
        self.reference_or_error = reference_or_error.into();
    }
}

/// All metric families evaluated over one record set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: u64,
    pub url: QualityMetric,
    pub company_nulls: QualityMetric,
    pub completeness: CompletenessReport,
}

impl QualityReport {
    pub fn evaluate<R: Borrow<Record>>(rows: &[R], rules: &QualityRules) -> Self {
        Self {
            total: rows.len() as u64,
            url: compute_url_quality(rows, &rules.url),
            company_nulls: compute_null_rate(rows, &rules.company_nulls),
            completeness: compute_completeness(rows, &rules.completeness),
        }
    }

    pub fn metrics(&self) -> impl Iterator<Item = &QualityMetric> {
        [&self.url, &self.company_nulls]
            .into_iter()
            .chain(self.completeness.metrics.iter())
    }

    /// One pending event per alerting metric.
    pub fn alert_events(&self) -> Vec<AlertEvent> {
        self.metrics()
            .filter(|metric| metric.alert)
            .map(AlertEvent::for_metric)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn with_url(url: &str) -> Record {
        Record::from_pairs([(Column::Url, url)])
    }

    #[test]
    fn inclusive_comparator_alerts_at_boundary() {
        let result = evaluate(100, 5, 5.0, Comparator::AtLeast);
        assert!(result.alert);
        assert_eq!(format!("{:.2}", result.rate), "5.00");
    }

    #[test]
    fn strict_comparator_excludes_boundary() {
        let result = evaluate(100, 2, 2.0, Comparator::Above);
        assert!(!result.alert);
        assert_eq!(format!("{:.2}", result.rate), "2.00");
        assert!(evaluate(100, 3, 2.0, Comparator::Above).alert);
    }

    #[test]
    fn completeness_status_flips_at_threshold() {
        let rule = CompletenessRule {
            columns: vec![Column::City],
            threshold_pct: 5.0,
            comparator: Comparator::AtLeast,
        };
        for (blank, expected) in [
            (499usize, MetricStatus::Ok),
            (500, MetricStatus::Alert),
            (501, MetricStatus::Alert),
        ] {
            let rows = (0..10_000)
                .map(|i| {
                    let city = if i < blank { " " } else { "Lagos" };
                    Record::from_pairs([(Column::City, city)])
                })
                .collect::<Vec<_>>();
            let report = compute_completeness(&rows, &rule);
            assert_eq!(report.table.len(), 1);
            assert_eq!(report.table[0].status, expected, "blank={blank}");
            assert_eq!(report.table[0].nulls, blank as u64);
        }
    }

    #[test]
    fn url_rule_is_case_insensitive_substring() {
        let rows = vec![
            with_url("https://www.LinkedIn.com/in/a"),
            with_url("https://example.com/a"),
            with_url(""),
            with_url("linkedin"),
        ];
        let rule = UrlRule::default();
        let metric = compute_url_quality(&rows, &rule);
        assert_eq!((metric.total, metric.bad), (4, 2));
        assert_eq!(metric.rate, 50.0);
        assert!(metric.alert);
        assert_eq!(
            metric.summary,
            "URL quality: 2/4 rows (50.00%) missing 'linkedin' in url; threshold 5.00%"
        );
    }

    #[test]
    fn empty_input_never_alerts() {
        let rows: Vec<Record> = Vec::new();
        let rules = QualityRules {
            url: UrlRule {
                threshold_pct: 0.0,
                ..UrlRule::default()
            },
            ..QualityRules::default()
        };
        let report = QualityReport::evaluate(&rows, &rules);
        assert!(report.metrics().all(|m| m.rate == 0.0 && !m.alert));
        assert!(report.completeness.table.is_empty());
        assert_eq!(report.completeness.metrics.len(), 5);
        assert!(report.alert_events().is_empty());
    }

    #[test]
    fn report_builds_events_for_alerting_metrics_only() {
        let rows = vec![
            Record::from_pairs([
                (Column::Url, "https://linkedin.com/in/a"),
                (Column::Name, "A"),
                (Column::Position, "Dev"),
                (Column::City, "Oslo"),
                (Column::CountryCode, "NO"),
            ]),
            Record::from_pairs([
                (Column::Url, "https://linkedin.com/in/b"),
                (Column::Name, "B"),
                (Column::Position, "Dev"),
                (Column::City, "Oslo"),
                (Column::CountryCode, "NO"),
                (Column::CurrentCompanyName, "Acme"),
            ]),
        ];
        let report = QualityReport::evaluate(&rows, &QualityRules::default());
        assert!(!report.url.alert);
        assert!(report.company_nulls.alert);

        let events = report.alert_events();
        let names = events.iter().map(|e| e.metric.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["null_rate:current_company_name", "completeness:current_company_name"]
        );
        assert!(events.iter().all(|e| e.message.starts_with("WARNING ")));
        assert!(events.iter().all(|e| !e.dispatched));
    }

    #[test]
    fn summaries_follow_configured_column_and_comparator() {
        let rows = vec![
            Record::from_pairs([(Column::About, "")]),
            Record::from_pairs([(Column::About, "bio")]),
        ];
        let nulls = compute_null_rate(
            &rows,
            &NullRateRule {
                column: Column::About,
                ..NullRateRule::default()
            },
        );
        assert_eq!(
            nulls.summary,
            "about nulls: 1/2 rows (50.00%) blank; threshold 2.00%"
        );

        let strict = compute_completeness(
            &rows,
            &CompletenessRule {
                columns: vec![Column::About],
                threshold_pct: 10.0,
                comparator: Comparator::Above,
            },
        );
        assert!(strict.metrics[0].summary.contains("(50.00%) > 10.00%"));
        let inclusive = compute_completeness(
            &rows,
            &CompletenessRule {
                columns: vec![Column::About],
                ..CompletenessRule::default()
            },
        );
        assert!(inclusive.metrics[0].summary.contains("(50.00%) >= 5.00%"));
    }

    #[test]
    fn rules_parse_from_partial_yaml() {
        let rules = QualityRules::from_yaml_str(
            "company_nulls:\n  threshold_pct: 40.0\ncompleteness:\n  columns: [name, about]\n",
        )
        .expect("yaml");
        assert_eq!(rules.company_nulls.threshold_pct, 40.0);
        assert_eq!(rules.company_nulls.comparator, Comparator::Above);
        assert_eq!(rules.completeness.columns, vec![Column::Name, Column::About]);
        assert_eq!(rules.url, UrlRule::default());

        assert!(QualityRules::from_yaml_str("completeness:\n  columns: [shoe_size]\n").is_err());
    }

    #[test]
    fn rules_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quality.yaml");
        std::fs::write(&path, "url:\n  comparator: \">\"\n").expect("write");
        let rules = QualityRules::load(Some(&path)).expect("load");
        assert_eq!(rules.url.comparator, Comparator::Above);
        assert_eq!(QualityRules::load(None).expect("defaults"), QualityRules::default());
    }

    proptest! {
        #[test]
        fn zero_total_is_always_quiet(threshold in -100.0f64..200.0, strict in any::<bool>()) {
            let comparator = if strict { Comparator::Above } else { Comparator::AtLeast };
            let result = evaluate(0, 0, threshold, comparator);
            prop_assert_eq!(result.rate, 0.0);
            prop_assert!(!result.alert);
        }

        #[test]
        fn rate_stays_within_percent_range(total in 1u64..1_000_000, frac in 0.0f64..=1.0) {
            let bad = (total as f64 * frac) as u64;
            let result = evaluate(total, bad, 50.0, Comparator::AtLeast);
            prop_assert!((0.0..=100.0).contains(&result.rate));
        }
    }
}
