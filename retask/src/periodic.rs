//! Recurring task definitions and their crontab schedules.
//!
//! A [`PeriodicTask`] is stored in the backend and fires an ordinary task named `task_name` every
//! time its [`Crontab`] matches. Definitions are usually loaded from configuration as a
//! [`BeatSchedule`] and written to the backend with [`sync_beat_schedule`]:
//!
//! ```
//! # use retask::periodic::{BeatSchedule, CronField};
//! let schedule: BeatSchedule = serde_json::from_value(serde_json::json!({
//!     "nightly_cleanup": {
//!         "task": "cleanup_sessions",
//!         "args": [7],
//!         "schedule": { "minute": 30, "hour": "3" }
//!     }
//! }))
//! .unwrap();
//!
//! let entry = &schedule.0["nightly_cleanup"];
//! assert_eq!(entry.schedule.minute, CronField::At(30));
//! assert_eq!(entry.schedule.day_of_week, CronField::Any);
//! ```
use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{backend::Backend, task::Arguments, RetaskError};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct PeriodicTaskId(i32);

impl From<i32> for PeriodicTaskId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<PeriodicTaskId> for i32 {
    fn from(value: PeriodicTaskId) -> Self {
        value.0
    }
}

impl Display for PeriodicTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeriodicTaskId({})", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("Invalid crontab field {0:?}")]
    InvalidField(String),
    #[error("Invalid cron expression: {0}")]
    Expression(String),
}

/// One field of a crontab: either `*` or a single explicit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CronField {
    #[default]
    Any,
    At(u32),
}

impl Display for CronField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::At(value) => write!(f, "{value}"),
        }
    }
}

impl FromStr for CronField {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "*" => Ok(Self::Any),
            value => value
                .parse()
                .map(Self::At)
                .map_err(|_| CronError::InvalidField(s.to_owned())),
        }
    }
}

impl Serialize for CronField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CronField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Self::At(value)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A five field crontab. Missing fields default to `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Crontab {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month_of_year: CronField,
    /// `0` and `7` are Sunday.
    pub day_of_week: CronField,
}

const DAYS_OF_WEEK: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

impl Crontab {
    pub const fn every_minute() -> Self {
        Self {
            minute: CronField::Any,
            hour: CronField::Any,
            day_of_month: CronField::Any,
            month_of_year: CronField::Any,
            day_of_week: CronField::Any,
        }
    }

    pub const fn with_minute(self, minute: u32) -> Self {
        Self {
            minute: CronField::At(minute),
            ..self
        }
    }

    pub const fn with_hour(self, hour: u32) -> Self {
        Self {
            hour: CronField::At(hour),
            ..self
        }
    }

    pub const fn with_day_of_month(self, day_of_month: u32) -> Self {
        Self {
            day_of_month: CronField::At(day_of_month),
            ..self
        }
    }

    pub const fn with_month_of_year(self, month_of_year: u32) -> Self {
        Self {
            month_of_year: CronField::At(month_of_year),
            ..self
        }
    }

    pub const fn with_day_of_week(self, day_of_week: u32) -> Self {
        Self {
            day_of_week: CronField::At(day_of_week),
            ..self
        }
    }

    /// Compiles the crontab, rejecting out of range values.
    pub fn schedule(&self) -> Result<Schedule, CronError> {
        let minute = checked("minute", self.minute, 0..=59)?;
        let hour = checked("hour", self.hour, 0..=23)?;
        let day_of_month = checked("day_of_month", self.day_of_month, 1..=31)?;
        let month_of_year = checked("month_of_year", self.month_of_year, 1..=12)?;
        let day_of_week = match checked("day_of_week", self.day_of_week, 0..=7)? {
            CronField::Any => "*",
            CronField::At(day) => DAYS_OF_WEEK[day as usize],
        };
        let expression =
            format!("0 {minute} {hour} {day_of_month} {month_of_year} {day_of_week}");
        Schedule::from_str(&expression).map_err(|err| CronError::Expression(err.to_string()))
    }

    /// The first matching instant strictly after `after`.
    ///
    /// `None` when the crontab never matches again, e.g. the 31st of February.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        Ok(self.schedule()?.after(&after).find(|next| *next > after))
    }
}

fn checked(
    field: &'static str,
    value: CronField,
    range: std::ops::RangeInclusive<u32>,
) -> Result<CronField, CronError> {
    match value {
        CronField::At(value) if !range.contains(&value) => {
            Err(CronError::OutOfRange { field, value })
        }
        value => Ok(value),
    }
}

impl Display for Crontab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }
}

/// A stored recurring task.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTask {
    pub id: PeriodicTaskId,
    /// Unique name of the definition.
    pub name: String,
    /// The registered handler the fired tasks run.
    pub task_name: String,
    pub arguments: Arguments,
    pub crontab: Crontab,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: i64,
}

impl PeriodicTask {
    /// The next fire time: strictly after the last run, or after `now` when it never ran.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        self.crontab.next_after(self.last_run_at.unwrap_or(now))
    }
}

/// The configurable part of a [`PeriodicTask`], upserted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTaskDefinition {
    pub name: String,
    pub task_name: String,
    pub arguments: Arguments,
    pub crontab: Crontab,
    pub enabled: bool,
}

/// A configured set of periodic tasks keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeatSchedule(pub BTreeMap<String, BeatEntry>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEntry {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub schedule: Crontab,
}

impl BeatEntry {
    fn definition(&self, name: &str) -> PeriodicTaskDefinition {
        PeriodicTaskDefinition {
            name: name.to_owned(),
            task_name: self.task.clone(),
            arguments: Arguments {
                args: self.args.clone(),
                kwargs: self.kwargs.clone(),
            },
            crontab: self.schedule,
            enabled: true,
        }
    }
}

/// Creates or updates one enabled periodic task per schedule entry.
///
/// Every crontab is validated before anything is written. Stored definitions missing from the
/// schedule are left untouched.
pub async fn sync_beat_schedule<B>(
    backend: &B,
    schedule: &BeatSchedule,
) -> Result<Vec<PeriodicTaskId>, RetaskError>
where
    B: Backend + ?Sized,
{
    if schedule.0.is_empty() {
        tracing::warn!("Beat schedule is empty, nothing to update");
        return Ok(Vec::new());
    }

    for entry in schedule.0.values() {
        entry.schedule.schedule()?;
    }

    let mut ids = Vec::with_capacity(schedule.0.len());
    for (name, entry) in &schedule.0 {
        let id = backend.upsert_periodic_task(entry.definition(name)).await?;
        tracing::info!(%id, "Updated periodic task {name} with schedule {}", entry.schedule);
        ids.push(id);
    }
    Ok(ids)
}
