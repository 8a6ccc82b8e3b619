//! Timer firing: restore → validity check → fire → delete → reschedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use jobforge_events::JobEventKind;

use crate::error::JobError;
use crate::execution::{Execution, NoExecutionScope, VariableValue};
use crate::jobs::recurrence::Iterations;
use crate::jobs::types::Job;
use crate::unit_of_work::UnitOfWork;

use super::{ExecutionOutcome, JobManager};

/// Handler configuration of a timer.
///
/// Stored either as a bare activity id or, for start-event timers, as JSON:
/// `{"activityId": "...", "endDate": "<expression>"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfiguration {
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

impl TimerConfiguration {
    pub fn parse(raw: Option<&str>) -> Result<Self, JobError> {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(Self::default());
        };
        if raw.starts_with('{') {
            return serde_json::from_str(raw).map_err(|e| JobError::TimerConfiguration(e.to_string()));
        }
        Ok(Self {
            activity_id: Some(raw.to_string()),
            end_date: None,
        })
    }

    pub fn to_json(&self) -> String {
        // Two optional strings always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl JobManager {
    pub(super) fn fire_timer(&self, uow: &mut UnitOfWork, job: &Job) -> Result<ExecutionOutcome, JobError> {
        let mut timer = job.clone();

        // Restore. Nothing is written until this succeeds.
        let configuration = TimerConfiguration::parse(timer.handler_configuration.as_deref())?;
        let execution = self.execution_of(&timer)?;
        let end_date = match &configuration.end_date {
            Some(expression) => Some(self.resolve_end_date(expression, execution.as_ref())?),
            None => None,
        };
        let max_iterations = self.max_iterations(&timer, configuration.activity_id.as_deref())?;

        let (recurrence, end_date) = {
            let Some(spec) = timer.timer_spec_mut() else {
                return Err(JobError::TimerConfiguration(format!("job {} is not a timer", job.id)));
            };
            if end_date.is_some() {
                spec.end_date = end_date;
            }
            spec.max_iterations = max_iterations;
            (spec.recurrence.clone(), spec.end_date)
        };

        // Validity check against a model that may have changed since scheduling.
        if let Some(due) = timer.due_date {
            let valid = self
                .calendar
                .validate_due_date(recurrence.as_ref(), max_iterations, end_date, due)?;
            if !valid {
                debug!(job_id = %timer.id, due_date = %due, "timer expired, deleting without firing");
                self.delete(uow, &timer)?;
                return Ok(ExecutionOutcome::TimerExpired);
            }
        }

        // Fire, then delete unconditionally: a record is single-shot.
        self.run_handler(uow, &timer, execution.as_ref(), configuration.activity_id.as_deref())?;
        self.delete(uow, &timer)?;
        self.emit_on_commit(uow, JobEventKind::TimerFired, &timer, None);

        let Some(next) = recurrence.as_ref().and_then(|r| r.after_firing()) else {
            debug!(job_id = %timer.id, "timer fired, no further repeats");
            return Ok(ExecutionOutcome::TimerFired { successor: None });
        };

        let next_due = self.calendar.resolve_due_date(&next, max_iterations)?;
        if !self
            .calendar
            .validate_due_date(Some(&next), max_iterations, end_date, next_due)?
        {
            debug!(job_id = %timer.id, next_due = %next_due, "next firing falls outside the timer window");
            return Ok(ExecutionOutcome::TimerFired { successor: None });
        }

        let Some(successor) = timer.timer_successor(next, next_due) else {
            return Ok(ExecutionOutcome::TimerFired { successor: None });
        };
        let successor = self.schedule(uow, successor)?;
        debug!(job_id = %timer.id, successor_id = %successor.id, due_date = %next_due, "timer rescheduled");
        Ok(ExecutionOutcome::TimerFired {
            successor: Some(successor.id),
        })
    }

    /// Evaluate an end-date expression against the timer's execution (or an
    /// empty scope). Only dates and calendar-parsable text are accepted.
    fn resolve_end_date(&self, expression: &str, execution: Option<&Execution>) -> Result<DateTime<Utc>, JobError> {
        let value = match execution {
            Some(execution) => self.expressions.evaluate(expression, execution)?,
            None => self.expressions.evaluate(expression, &NoExecutionScope)?,
        };
        match value {
            VariableValue::Date(date) => Ok(date),
            VariableValue::Text(text) => Ok(self.calendar.resolve_end_date(&text)?),
            other => Err(JobError::InvalidEndDateType(other.type_name())),
        }
    }

    /// Bound declared by the cycle on the originating flow element; one
    /// firing when there is no such cycle.
    fn max_iterations(&self, timer: &Job, activity_id: Option<&str>) -> Result<Iterations, JobError> {
        let (Some(definition), Some(activity_id)) = (&timer.process_definition_id, activity_id) else {
            return Ok(Iterations::default());
        };
        match self.definitions.timer_cycle(definition, activity_id)? {
            Some(cycle) => Ok(Iterations::from_cycle(&cycle)?),
            None => Ok(Iterations::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_configuration_is_an_activity_id() {
        let config = TimerConfiguration::parse(Some("reminder")).unwrap();
        assert_eq!(config.activity_id.as_deref(), Some("reminder"));
        assert_eq!(config.end_date, None);
        assert_eq!(TimerConfiguration::parse(None).unwrap(), TimerConfiguration::default());
    }

    #[test]
    fn json_configuration_carries_end_date() {
        let config = TimerConfiguration::parse(Some(r#"{"activityId":"start","endDate":"${deadline}"}"#)).unwrap();
        assert_eq!(config.activity_id.as_deref(), Some("start"));
        assert_eq!(config.end_date.as_deref(), Some("${deadline}"));
        assert_eq!(TimerConfiguration::parse(Some(&config.to_json())).unwrap(), config);

        assert!(matches!(
            TimerConfiguration::parse(Some("{not json")),
            Err(JobError::TimerConfiguration(_))
        ));
    }
}
