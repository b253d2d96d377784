// Trigger calculation for notification dispatch times
//
// Built-in policies are Immediate, Delayed (with optional snap to a time of
// day) and Calendar (recurrence rule). Custom policies implement
// `TriggerPolicy`.

use crate::errors::TriggerError;
use crate::models::TriggerOverrides;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// TriggerPolicy is the capability custom triggers implement
///
/// `eta` overrides are applied by the engine before a custom policy is
/// consulted, so implementations only see `delay` and `recurrence`.
pub trait TriggerPolicy: Send + Sync + fmt::Debug {
    fn compute(
        &self,
        scheduled_at: DateTime<Utc>,
        overrides: &TriggerOverrides,
    ) -> Result<DispatchTime, TriggerError>;
}

/// When a scheduled notification should be dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTime {
    /// Fire in the same orchestration step
    Immediate,
    /// Fire once at an absolute instant
    At(DateTime<Utc>),
    /// Fire at every occurrence of the rule, starting with `first`
    Recurring {
        rule: RecurrenceRule,
        first: DateTime<Utc>,
    },
}

impl DispatchTime {
    /// Build a recurring dispatch time from the rule's first occurrence after `after`
    pub fn recurring(rule: RecurrenceRule, after: DateTime<Utc>) -> Result<Self, TriggerError> {
        let first = rule
            .next_after(after)?
            .ok_or_else(|| TriggerError::NoNextOccurrence {
                expression: rule.expression.clone(),
            })?;
        Ok(DispatchTime::Recurring { rule, first })
    }

    /// The instant the first dispatch happens, `now` for immediate dispatch
    pub fn instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DispatchTime::Immediate => now,
            DispatchTime::At(at) => *at,
            DispatchTime::Recurring { first, .. } => *first,
        }
    }
}

/// Trigger policy attached to a notification definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Immediate,
    Delayed(DelayedTrigger),
    Calendar(RecurrenceRule),
    #[serde(skip)]
    Custom(Arc<dyn TriggerPolicy>),
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Immediate
    }
}

impl Trigger {
    pub fn delayed(delay: Duration) -> Self {
        Trigger::Delayed(DelayedTrigger::new(delay))
    }

    pub fn custom(policy: impl TriggerPolicy + 'static) -> Self {
        Trigger::Custom(Arc::new(policy))
    }

    /// Validate static configuration (used when a definition is built)
    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            Trigger::Immediate | Trigger::Custom(_) => Ok(()),
            Trigger::Delayed(delayed) => delayed.validate(),
            Trigger::Calendar(rule) => rule.validate(),
        }
    }

    /// Compute the dispatch time for a schedule call made at `scheduled_at`
    pub fn compute(
        &self,
        scheduled_at: DateTime<Utc>,
        overrides: &TriggerOverrides,
    ) -> Result<DispatchTime, TriggerError> {
        if let Some(eta) = overrides.eta {
            return Ok(DispatchTime::At(eta));
        }

        if let Some(rule) = &overrides.recurrence {
            rule.validate()?;
            return DispatchTime::recurring(rule.clone(), scheduled_at);
        }

        match self {
            Trigger::Immediate => match overrides.delay {
                None => Ok(DispatchTime::Immediate),
                Some(delay) => Ok(DispatchTime::At(add_delay(scheduled_at, delay)?)),
            },

            Trigger::Delayed(delayed) => delayed.compute(scheduled_at, overrides.delay),

            Trigger::Calendar(rule) => match overrides.delay {
                // A delay override turns the recurrence into a one-off dispatch
                Some(delay) => Ok(DispatchTime::At(add_delay(scheduled_at, delay)?)),
                None => DispatchTime::recurring(rule.clone(), scheduled_at),
            },

            Trigger::Custom(policy) => policy.compute(scheduled_at, overrides),
        }
    }
}

/// Delay-based trigger with optional snapping to a time of day
///
/// `candidate = scheduled_at + delay`; when `at_hour` and/or `at_minute` are
/// set, those fields of the candidate are replaced (in `timezone`, seconds
/// zeroed) without touching its date. The result can land earlier than
/// `scheduled_at + delay`, or even before `scheduled_at`; set `roll_forward`
/// to move such instants to the following day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedTrigger {
    #[serde(
        rename = "delay_seconds",
        default = "zero_delay",
        with = "duration_seconds"
    )]
    pub delay: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_minute: Option<u32>,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub roll_forward: bool,
}

impl Default for DelayedTrigger {
    fn default() -> Self {
        Self::new(Duration::zero())
    }
}

impl DelayedTrigger {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            at_hour: None,
            at_minute: None,
            timezone: default_timezone(),
            roll_forward: false,
        }
    }

    pub fn at(mut self, hour: u32, minute: u32) -> Self {
        self.at_hour = Some(hour);
        self.at_minute = Some(minute);
        self
    }

    pub fn at_hour(mut self, hour: u32) -> Self {
        self.at_hour = Some(hour);
        self
    }

    pub fn at_minute(mut self, minute: u32) -> Self {
        self.at_minute = Some(minute);
        self
    }

    pub fn in_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn rolling_forward(mut self) -> Self {
        self.roll_forward = true;
        self
    }

    fn snaps(&self) -> bool {
        self.at_hour.is_some() || self.at_minute.is_some()
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        check_delay(self.delay)?;
        if let Some(hour) = self.at_hour {
            if hour > 23 {
                return Err(TriggerError::InvalidTimeOfDay {
                    field: "at_hour".to_string(),
                    value: hour,
                });
            }
        }
        if let Some(minute) = self.at_minute {
            if minute > 59 {
                return Err(TriggerError::InvalidTimeOfDay {
                    field: "at_minute".to_string(),
                    value: minute,
                });
            }
        }
        Ok(())
    }

    /// Compute the dispatch time; `delay_override` replaces the configured delay
    /// but snapping still applies
    pub fn compute(
        &self,
        scheduled_at: DateTime<Utc>,
        delay_override: Option<Duration>,
    ) -> Result<DispatchTime, TriggerError> {
        self.validate()?;
        let delay = delay_override.unwrap_or(self.delay);
        check_delay(delay)?;

        if delay_override.is_none() && delay == Duration::zero() && !self.snaps() {
            return Ok(DispatchTime::Immediate);
        }

        let candidate = add_delay(scheduled_at, delay)?;
        if !self.snaps() {
            return Ok(DispatchTime::At(candidate));
        }

        let local = candidate.with_timezone(&self.timezone);
        let hour = self.at_hour.unwrap_or_else(|| local.hour());
        let minute = self.at_minute.unwrap_or_else(|| local.minute());
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            TriggerError::CalculationFailed(format!("invalid time of day {hour}:{minute}"))
        })?;

        let naive = local.date_naive().and_time(time);
        let mut snapped = localize(&self.timezone, naive)?;

        if self.roll_forward && snapped < scheduled_at {
            snapped = localize(&self.timezone, naive + Duration::days(1))?;
        }

        Ok(DispatchTime::At(snapped))
    }
}

/// Recurrence rule for calendar triggers
///
/// Cron syntax with second precision, evaluated in `timezone`, exhausted
/// after `end_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    /// Create a rule, rejecting malformed expressions
    pub fn new(expression: impl Into<String>) -> Result<Self, TriggerError> {
        let rule = Self {
            expression: expression.into(),
            timezone: default_timezone(),
            end_date: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn in_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn until(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        parse_cron_expression(&self.expression).map(|_| ())
    }

    /// Next occurrence strictly after `after`, or `None` once past `end_date`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let schedule = parse_cron_expression(&self.expression)?;
        let reference = after.with_timezone(&self.timezone);

        let next = match schedule.after(&reference).next() {
            Some(next) => next.with_timezone(&Utc),
            None => return Ok(None),
        };

        if let Some(end) = self.end_date {
            if next > end {
                return Ok(None);
            }
        }

        Ok(Some(next))
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, TriggerError> {
    CronSchedule::from_str(expression).map_err(|e| TriggerError::InvalidRecurrence {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Default timezone for time-of-day snapping and recurrence rules
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

fn zero_delay() -> Duration {
    Duration::zero()
}

fn check_delay(delay: Duration) -> Result<(), TriggerError> {
    if delay < Duration::zero() {
        return Err(TriggerError::InvalidDelay {
            seconds: delay.num_seconds(),
        });
    }
    Ok(())
}

fn add_delay(at: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, TriggerError> {
    check_delay(delay)?;
    at.checked_add_signed(delay)
        .ok_or_else(|| TriggerError::CalculationFailed("delay overflows the calendar".to_string()))
}

fn localize(timezone: &Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>, TriggerError> {
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| TriggerError::NonexistentLocalTime(naive.to_string()))
}

/// Serialize a `chrono::Duration` as whole seconds
pub mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = i64::deserialize(deserializer)?;
        Duration::try_seconds(seconds)
            .ok_or_else(|| serde::de::Error::custom(format!("delay out of range: {seconds}")))
    }
}

/// Serialize an optional `chrono::Duration` as whole seconds
pub mod optional_duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<i64>::deserialize(deserializer)? {
            Some(seconds) => Duration::try_seconds(seconds)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("delay out of range: {seconds}"))),
            None => Ok(None),
        }
    }
}
