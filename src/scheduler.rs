//! Scheduling triggers: cron expressions evaluated in a named timezone

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Why a trigger was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Cron expression did not parse
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The expression
        expression: String,
        /// Parser message
        reason: String,
    },
    /// Unknown IANA timezone
    #[error("Invalid timezone '{0}'")]
    InvalidTimezone(String),
    /// Empty id
    #[error("Trigger id must not be empty")]
    EmptyId,
    /// No such trigger
    #[error("Trigger not found: {0}")]
    NotFound(String),
}

/// Registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Stable id
    pub id: String,
    /// Five-field (minute precision) or six/seven-field (with seconds) cron
    pub cron_expression: String,
    /// IANA timezone, default UTC
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Disabled triggers are stored but never fire
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    /// Fires on schedule
    Active,
    /// Stored, never fires
    Disabled,
}

/// Trigger as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    /// Id
    pub id: String,
    /// Expression as registered
    pub cron_expression: String,
    /// Timezone
    pub timezone: String,
    /// State
    pub state: TriggerState,
    /// Next fire time (active triggers only)
    pub next_run: Option<DateTime<Utc>>,
    /// Last fire time
    pub last_fired: Option<DateTime<Utc>>,
}

struct Registered {
    spec: TriggerSpec,
    schedule: Schedule,
    tz: Tz,
    state: TriggerState,
    /// Fire times strictly after this instant are pending
    checked_until: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
}

impl Registered {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    fn status(&self, now: DateTime<Utc>) -> TriggerStatus {
        TriggerStatus {
            id: self.spec.id.clone(),
            cron_expression: self.spec.cron_expression.clone(),
            timezone: self.spec.timezone.clone(),
            state: self.state,
            next_run: match self.state {
                TriggerState::Active => self.next_after(now),
                TriggerState::Disabled => None,
            },
            last_fired: self.last_fired,
        }
    }
}

/// Receives fired triggers
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// A trigger reached its scheduled time
    async fn fire(&self, trigger_id: &str, scheduled_for: DateTime<Utc>);
}

/// Sink that only logs
pub struct LogSink;

#[async_trait]
impl TriggerSink for LogSink {
    async fn fire(&self, trigger_id: &str, scheduled_for: DateTime<Utc>) {
        info!(trigger = trigger_id, scheduled_for = %scheduled_for, "Trigger fired");
    }
}

/// Accept 5-field crontab syntax by pinning seconds to zero
fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Trigger registry plus the loop that fires due triggers
#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<HashMap<String, Registered>>,
}

impl TriggerRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a trigger, replacing any with the same id
    pub fn register(&self, spec: TriggerSpec) -> Result<TriggerStatus, ScheduleError> {
        if spec.id.trim().is_empty() {
            return Err(ScheduleError::EmptyId);
        }
        let schedule = parse_cron(&spec.cron_expression)?;
        let tz = Tz::from_str(spec.timezone.trim())
            .map_err(|_| ScheduleError::InvalidTimezone(spec.timezone.clone()))?;
        let state = if spec.enabled {
            TriggerState::Active
        } else {
            TriggerState::Disabled
        };

        let now = Utc::now();
        let registered = Registered {
            spec,
            schedule,
            tz,
            state,
            checked_until: now,
            last_fired: None,
        };
        let status = registered.status(now);
        info!(trigger = %status.id, state = ?status.state, next_run = ?status.next_run, "Trigger registered");
        self.triggers.write().insert(status.id.clone(), registered);
        Ok(status)
    }

    /// Remove a trigger
    pub fn unregister(&self, id: &str) -> Result<(), ScheduleError> {
        self.triggers
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    /// Every trigger, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<TriggerStatus> {
        let now = Utc::now();
        let mut all: Vec<_> = self.triggers.read().values().map(|r| r.status(now)).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Next fire time strictly after `after`, in UTC
    pub fn next_run(
        &self,
        id: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let triggers = self.triggers.read();
        let registered = triggers
            .get(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        Ok(registered.next_after(after))
    }

    /// Collect triggers due at `now` and advance their cursors
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut due = Vec::new();
        for registered in self.triggers.write().values_mut() {
            if registered.state != TriggerState::Active {
                registered.checked_until = now;
                continue;
            }
            // Missed fire times collapse into one
            if let Some(at) = registered
                .next_after(registered.checked_until)
                .filter(|at| *at <= now)
            {
                due.push((registered.spec.id.clone(), at));
                registered.last_fired = Some(now);
            }
            registered.checked_until = now;
        }
        due
    }

    /// Poll for due triggers until shutdown
    pub fn spawn(
        self: &Arc<Self>,
        poll_interval: Duration,
        sink: Arc<dyn TriggerSink>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Lock released before the sink is awaited
                        let due = registry.take_due(Utc::now());
                        for (id, at) in due {
                            sink.fire(&id, at).await;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Trigger loop stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(id: &str, cron: &str, tz: &str, enabled: bool) -> TriggerSpec {
        TriggerSpec {
            id: id.into(),
            cron_expression: cron.into(),
            timezone: tz.into(),
            enabled,
        }
    }

    #[test]
    fn invalid_cron_is_rejected_at_registration() {
        let registry = TriggerRegistry::new();
        let err = registry
            .register(spec("t", "not a cron", "UTC", true))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let registry = TriggerRegistry::new();
        let err = registry
            .register(spec("t", "0 9 * * *", "Mars/Olympus", true))
            .unwrap_err();
        assert_eq!(err, ScheduleError::InvalidTimezone("Mars/Olympus".into()));
    }

    #[test]
    fn disabled_triggers_are_stored_disabled() {
        let registry = TriggerRegistry::new();
        let status = registry.register(spec("t", "0 9 * * *", "UTC", false)).unwrap();
        assert_eq!(status.state, TriggerState::Disabled);
        assert_eq!(status.next_run, None);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn next_run_honors_timezone() {
        let registry = TriggerRegistry::new();
        registry
            .register(spec("morning", "0 9 * * *", "America/New_York", true))
            .unwrap();
        // 2026-01-15 12:00 UTC is 07:00 in New York (EST, UTC-5)
        let after = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let next = registry.next_run("morning", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_are_accepted() {
        let registry = TriggerRegistry::new();
        registry.register(spec("s", "30 0 * * * *", "UTC", true)).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = registry.next_run("s", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap());
    }

    #[test]
    fn due_triggers_fire_once() {
        let registry = TriggerRegistry::new();
        registry.register(spec("every-sec", "* * * * * *", "UTC", true)).unwrap();
        registry.register(spec("off", "* * * * * *", "UTC", false)).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let due = registry.take_due(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "every-sec");
        assert!(registry.take_due(later).is_empty());
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let registry = TriggerRegistry::new();
        assert!(matches!(
            registry.unregister("x"),
            Err(ScheduleError::NotFound(_))
        ));
    }
}
