//! Schedule parsing for cron and interval triggers.
//!
//! Cron expressions use six-field, second-precision syntax with an optional
//! IANA timezone (UTC by default). Intervals accept humantime strings
//! (`"30s"`, `"1h30m"`) or a positive number of seconds.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use mbflow_workflow::Trigger;
use serde_json::Value;

use crate::error::TriggerError;

/// A parsed, armable schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
  Cron { schedule: cron::Schedule, timezone: Tz },
  Interval(Duration),
}

impl Schedule {
  /// Parse the schedule out of a cron or interval trigger's config.
  pub fn from_trigger(trigger: &Trigger) -> Result<Self, TriggerError> {
    use mbflow_workflow::TriggerType;
    match trigger.trigger_type {
      TriggerType::Cron => {
        let expression = trigger.config_str("schedule").ok_or_else(|| {
          TriggerError::InvalidSchedule {
            schedule: String::new(),
            message: "missing 'schedule'".to_string(),
          }
        })?;
        let timezone = match trigger.config_str("timezone") {
          Some(name) => Tz::from_str(name).map_err(|_| TriggerError::InvalidSchedule {
            schedule: expression.to_string(),
            message: format!("unknown timezone '{}'", name),
          })?,
          None => chrono_tz::UTC,
        };
        let schedule =
          cron::Schedule::from_str(expression).map_err(|e| TriggerError::InvalidSchedule {
            schedule: expression.to_string(),
            message: e.to_string(),
          })?;
        Ok(Self::Cron { schedule, timezone })
      }
      TriggerType::Interval => {
        let duration = match trigger.config.get("duration") {
          Some(Value::String(text)) => {
            humantime::parse_duration(text).map_err(|e| TriggerError::InvalidInterval {
              value: text.clone(),
              message: e.to_string(),
            })?
          }
          Some(Value::Number(n)) => {
            let seconds = n.as_f64().unwrap_or(-1.0);
            if seconds <= 0.0 {
              return Err(TriggerError::InvalidInterval {
                value: n.to_string(),
                message: "interval must be positive".to_string(),
              });
            }
            Duration::from_secs_f64(seconds)
          }
          other => {
            return Err(TriggerError::InvalidInterval {
              value: other.map(|v| v.to_string()).unwrap_or_default(),
              message: "missing or non-numeric 'duration'".to_string(),
            });
          }
        };
        if duration.is_zero() {
          return Err(TriggerError::InvalidInterval {
            value: "0".to_string(),
            message: "interval must be positive".to_string(),
          });
        }
        Ok(Self::Interval(duration))
      }
      _ => Err(TriggerError::InvalidSchedule {
        schedule: String::new(),
        message: format!("trigger type {:?} has no schedule", trigger.trigger_type),
      }),
    }
  }

  /// The next fire time strictly after `after`.
  pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Self::Cron { schedule, timezone } => schedule
        .after(&after.with_timezone(timezone))
        .next()
        .map(|t| t.with_timezone(&Utc)),
      Self::Interval(duration) => {
        Some(after + chrono::Duration::from_std(*duration).unwrap_or(chrono::Duration::zero()))
      }
    }
  }
}
