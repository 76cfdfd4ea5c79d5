//! Core domain model for the month-end reconciliation engine.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mere-core";

/// Calendar month a reconciliation job targets, serialized as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetMonth {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target month {0:?}, expected YYYY-MM")]
pub struct MonthParseError(pub String);

impl TargetMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// Month containing the given calendar date.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("validated month")
    }

    pub fn last_day(&self) -> NaiveDate {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("validated month") - Duration::days(1)
    }
}

impl std::fmt::Display for TargetMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for TargetMonth {
    type Err = MonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| MonthParseError(s.to_string()))?;
        let year: i32 = year.parse().map_err(|_| MonthParseError(s.to_string()))?;
        let month: u32 = month.parse().map_err(|_| MonthParseError(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| MonthParseError(s.to_string()))
    }
}

impl TryFrom<String> for TargetMonth {
    type Error = MonthParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetMonth> for String {
    fn from(value: TargetMonth) -> Self {
        value.to_string()
    }
}

/// Returns true when `date` is the last calendar day of its month.
pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    (date + Duration::days(1)).month() != date.month()
}

/// Point-in-time district performance snapshot, either freshly fetched or cached.
///
/// `as_of_date` is the date embedded in the source data (what the numbers
/// represent), independent of `fetched_at` (when we pulled them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictSnapshot {
    pub district_id: String,
    pub target_month: TargetMonth,
    pub as_of_date: NaiveDate,
    pub membership: Option<i64>,
    pub club_count: Option<i64>,
    pub distinguished_clubs: Option<i64>,
    pub fetched_at: DateTime<Utc>,
    pub payload_sha256: String,
}

/// One metric compared between the cached and current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub previous: Option<i64>,
    pub current: Option<i64>,
    pub absolute: i64,
    /// Percent change relative to the previous value. `None` when the
    /// previous value is zero or absent (division undefined).
    pub percent: Option<f64>,
}

impl MetricDelta {
    pub fn between(previous: Option<i64>, current: Option<i64>) -> Self {
        let prev = previous.unwrap_or(0);
        let curr = current.unwrap_or(0);
        let absolute = curr - prev;
        let percent = if prev != 0 {
            Some((absolute as f64 / prev as f64) * 100.0)
        } else {
            None
        };
        Self {
            previous,
            current,
            absolute,
            percent,
        }
    }

    /// A delta counts as a change on any value movement or presence flip;
    /// a metric going missing (or appearing) is itself a change.
    pub fn changed(&self) -> bool {
        self.absolute != 0 || self.previous.is_some() != self.current.is_some()
    }
}

/// Output of one cached-vs-current comparison. One optional delta per known
/// metric so missing-metric handling stays exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChanges {
    pub has_changes: bool,
    pub changed_fields: Vec<String>,
    pub membership: Option<MetricDelta>,
    pub club_count: Option<MetricDelta>,
    pub distinguished: Option<MetricDelta>,
    pub timestamp: DateTime<Utc>,
    pub source_data_date: NaiveDate,
}

/// One recorded fetch/compare cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub date: NaiveDate,
    pub source_data_date: NaiveDate,
    pub changes: DataChanges,
    pub is_significant: bool,
    pub cache_updated: bool,
}

/// Append-only per-job cycle history with stability/ETA derivations.
///
/// Entries stay ordered by check date; re-recording the same calendar day
/// replaces that day's entry instead of duplicating it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressTracker {
    entries: Vec<TimelineEntry>,
}

impl ProgressTracker {
    pub fn record_entry(&mut self, entry: TimelineEntry) {
        match self.entries.binary_search_by_key(&entry.date, |e| e.date) {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn last_significant_date(&self) -> Option<NaiveDate> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.is_significant)
            .map(|e| e.date)
    }

    /// Date of the most recent recorded cycle, for "stalled since" reporting.
    pub fn stalled_since(&self) -> Option<NaiveDate> {
        self.entries.last().map(|e| e.date)
    }

    /// Start date of a qualifying stable period, if one exists.
    ///
    /// The contiguous non-significant suffix of the timeline must span at
    /// least `stability_period_days` calendar days measured back from the
    /// latest entry. An older quiet stretch followed by a later significant
    /// change does not qualify.
    pub fn stable_period(&self, stability_period_days: i64) -> Option<NaiveDate> {
        let last = self.entries.last()?;
        if last.is_significant {
            return None;
        }
        let mut suffix_start = last.date;
        for entry in self.entries.iter().rev() {
            if entry.is_significant {
                break;
            }
            suffix_start = entry.date;
        }
        let span = (last.date - suffix_start).num_days() + 1;
        (span >= stability_period_days).then_some(suffix_start)
    }

    /// ETA derived from the last significant change plus the configured
    /// stability window, capped at the job's max end date. `None` with
    /// fewer than two entries (not enough history to extrapolate).
    pub fn estimate_completion(
        &self,
        config: &ReconciliationConfig,
        max_end_date: NaiveDate,
    ) -> Option<NaiveDate> {
        if self.entries.len() < 2 {
            return None;
        }
        let anchor = self
            .last_significant_date()
            .or_else(|| self.entries.first().map(|e| e.date))?;
        let eta = anchor + Duration::days(config.stability_period_days);
        Some(eta.min(max_end_date))
    }
}

/// Operator-owned reconciliation parameters. Validated once at load time;
/// each job captures its own immutable copy at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_max_reconciliation_days")]
    pub max_reconciliation_days: i64,
    #[serde(default = "default_stability_period_days")]
    pub stability_period_days: i64,
    #[serde(default = "default_check_frequency_hours")]
    pub check_frequency_hours: i64,
    /// Membership percent-change significance threshold.
    #[serde(default = "default_membership_change_percent")]
    pub membership_change_percent: f64,
    /// Club-count absolute-change significance threshold.
    #[serde(default = "default_club_count_change")]
    pub club_count_change: i64,
    /// Distinguished-club percent-change significance threshold.
    #[serde(default = "default_distinguished_change_percent")]
    pub distinguished_change_percent: f64,
    #[serde(default = "default_auto_extension_enabled")]
    pub auto_extension_enabled: bool,
    #[serde(default = "default_max_extension_days")]
    pub max_extension_days: i64,
    /// Hard cap on extensions granted to one job.
    #[serde(default = "default_max_extensions")]
    pub max_extensions: u32,
    /// Trailing window, in days, a significant change must fall inside for
    /// an auto-extension to be granted at the max end date.
    #[serde(default = "default_extension_lookback_days")]
    pub extension_lookback_days: i64,
    /// Consecutive fetch failures before a job is logged as stalled.
    #[serde(default = "default_max_fetch_failures")]
    pub max_fetch_failures: u32,
}

fn default_max_reconciliation_days() -> i64 {
    15
}

fn default_stability_period_days() -> i64 {
    3
}

fn default_check_frequency_hours() -> i64 {
    24
}

fn default_membership_change_percent() -> f64 {
    1.0
}

fn default_club_count_change() -> i64 {
    1
}

fn default_distinguished_change_percent() -> f64 {
    5.0
}

fn default_auto_extension_enabled() -> bool {
    true
}

fn default_max_extension_days() -> i64 {
    5
}

fn default_max_extensions() -> u32 {
    2
}

fn default_extension_lookback_days() -> i64 {
    3
}

fn default_max_fetch_failures() -> u32 {
    5
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            max_reconciliation_days: default_max_reconciliation_days(),
            stability_period_days: default_stability_period_days(),
            check_frequency_hours: default_check_frequency_hours(),
            membership_change_percent: default_membership_change_percent(),
            club_count_change: default_club_count_change(),
            distinguished_change_percent: default_distinguished_change_percent(),
            auto_extension_enabled: default_auto_extension_enabled(),
            max_extension_days: default_max_extension_days(),
            max_extensions: default_max_extensions(),
            extension_lookback_days: default_extension_lookback_days(),
            max_fetch_failures: default_max_fetch_failures(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("{field} must not be negative, got {value}")]
    NegativeThreshold { field: &'static str, value: f64 },
}

impl ReconciliationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_days = [
            ("max_reconciliation_days", self.max_reconciliation_days),
            ("stability_period_days", self.stability_period_days),
            ("check_frequency_hours", self.check_frequency_hours),
            ("max_extension_days", self.max_extension_days),
            ("extension_lookback_days", self.extension_lookback_days),
        ];
        for (field, value) in positive_days {
            if value <= 0 {
                return Err(ConfigError::NonPositive { field, value });
            }
        }
        if self.club_count_change <= 0 {
            return Err(ConfigError::NonPositive {
                field: "club_count_change",
                value: self.club_count_change,
            });
        }
        if self.membership_change_percent < 0.0 {
            return Err(ConfigError::NegativeThreshold {
                field: "membership_change_percent",
                value: self.membership_change_percent,
            });
        }
        if self.distinguished_change_percent < 0.0 {
            return Err(ConfigError::NegativeThreshold {
                field: "distinguished_change_percent",
                value: self.distinguished_change_percent,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One reconciliation lifecycle for a (district, month) pair.
///
/// Created by the scheduler on month-boundary detection, mutated only by
/// the orchestrator during cycles, immutable once terminal. The embedded
/// config copy keeps in-flight jobs insulated from operator config edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationJob {
    pub id: Uuid,
    pub district_id: String,
    pub target_month: TargetMonth,
    pub status: JobStatus,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub max_end_date: NaiveDate,
    pub finalized_date: Option<NaiveDate>,
    /// Set when the job completed at its max window without a stable period.
    pub forced_finalization: bool,
    /// As-of date of the most recently applied source data, non-decreasing
    /// over the job's lifetime.
    pub current_data_date: Option<NaiveDate>,
    pub extensions_granted: u32,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fetch_failures: u32,
    /// Optimistic-concurrency revision bumped by every successful save.
    pub revision: u64,
    pub config: ReconciliationConfig,
    pub progress: ProgressTracker,
}

impl ReconciliationJob {
    pub fn new(
        district_id: impl Into<String>,
        target_month: TargetMonth,
        now: DateTime<Utc>,
        config: ReconciliationConfig,
    ) -> Self {
        let start_date = now.date_naive();
        let max_end_date = start_date + Duration::days(config.max_reconciliation_days);
        Self {
            id: Uuid::new_v4(),
            district_id: district_id.into(),
            target_month,
            status: JobStatus::Active,
            start_date,
            end_date: None,
            max_end_date,
            finalized_date: None,
            forced_finalization: false,
            current_data_date: None,
            extensions_granted: 0,
            last_cycle_at: None,
            last_error: None,
            fetch_failures: 0,
            revision: 0,
            config,
            progress: ProgressTracker::default(),
        }
    }

    /// Cache key for this job's district/month record.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.district_id, self.target_month)
    }

    /// Whether a new cycle is due given the configured check frequency.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match self.last_cycle_at {
            None => true,
            Some(last) => now - last >= Duration::hours(self.config.check_frequency_hours),
        }
    }
}
