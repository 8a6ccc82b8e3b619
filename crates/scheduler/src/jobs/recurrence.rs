//! Timer recurrence values.
//!
//! Recurrences are stored as text (`R<n>/<rule>`, `R/<rule>` or a bare rule)
//! but handled as a structured [`Recurrence`]. Only the repeat token is
//! interpreted here; the rule after the first `/` belongs to the business
//! calendar.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("empty recurrence expression")]
    Empty,
    #[error("invalid repeat token '{0}'")]
    InvalidRepeat(String),
    #[error("recurrence '{0}' has no interval rule")]
    MissingRule(String),
}

/// Repeat token of a recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// `R/...`: fires until the end date (if any) stops it.
    Unbounded,
    /// `R<n>/...`: `n` firings remain, counting the next one.
    Remaining(u32),
}

/// A parsed recurrence expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Recurrence {
    /// `None` when the expression has no repeat token at all (e.g. a cron rule).
    repeat: Option<Repeat>,
    rule: String,
}

impl Recurrence {
    pub fn new(repeat: Option<Repeat>, rule: impl Into<String>) -> Self {
        Self {
            repeat,
            rule: rule.into(),
        }
    }

    pub fn repeat(&self) -> Option<Repeat> {
        self.repeat
    }

    /// Everything after the repeat token, e.g. `PT1H` or `2026-01-01T00:00:00Z/P1D`.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Whether the counter can ever stop this recurrence.
    pub fn is_unbounded(&self) -> bool {
        !matches!(self.repeat, Some(Repeat::Remaining(_)))
    }

    /// The recurrence carried by the successor of a firing, or `None` when the
    /// firing that just happened was the last one.
    ///
    /// `R3` yields `R2`, `R2` yields `R1`, `R1` (and `R0`) yield nothing.
    /// Unbounded and token-less recurrences carry over unchanged.
    pub fn after_firing(&self) -> Option<Recurrence> {
        match self.repeat {
            Some(Repeat::Remaining(n)) => {
                let remaining = n.saturating_sub(1);
                if remaining == 0 {
                    None
                } else {
                    Some(Recurrence::new(Some(Repeat::Remaining(remaining)), self.rule.clone()))
                }
            }
            Some(Repeat::Unbounded) | None => Some(self.clone()),
        }
    }
}

impl FromStr for Recurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RecurrenceError::Empty);
        }

        match trimmed.split_once('/') {
            Some((head, rule)) if head.starts_with('R') => {
                if rule.is_empty() {
                    return Err(RecurrenceError::MissingRule(trimmed.to_string()));
                }
                let repeat = if head.len() == 1 {
                    Repeat::Unbounded
                } else {
                    let n = head[1..]
                        .parse::<u32>()
                        .map_err(|_| RecurrenceError::InvalidRepeat(head.to_string()))?;
                    Repeat::Remaining(n)
                };
                Ok(Recurrence::new(Some(repeat), rule))
            }
            _ => Ok(Recurrence::new(None, trimmed)),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repeat {
            Some(Repeat::Unbounded) => write!(f, "R/{}", self.rule),
            Some(Repeat::Remaining(n)) => write!(f, "R{}/{}", n, self.rule),
            None => f.write_str(&self.rule),
        }
    }
}

impl TryFrom<String> for Recurrence {
    type Error = RecurrenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recurrence> for String {
    fn from(value: Recurrence) -> Self {
        value.to_string()
    }
}

/// Upper bound on the number of firings declared by a timer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Iterations {
    Bounded(u32),
    Unbounded,
}

impl Iterations {
    /// Derive the bound from a cycle declared on the process model.
    ///
    /// `R5/PT1H` gives 5, `R/PT1H` and anything without a repeat token (cron
    /// rules) give `Unbounded`.
    pub fn from_cycle(cycle: &str) -> Result<Self, RecurrenceError> {
        let recurrence: Recurrence = cycle.parse()?;
        Ok(match recurrence.repeat() {
            Some(Repeat::Remaining(n)) => Iterations::Bounded(n),
            Some(Repeat::Unbounded) | None => Iterations::Unbounded,
        })
    }

    pub fn as_option(&self) -> Option<u32> {
        match self {
            Iterations::Bounded(n) => Some(*n),
            Iterations::Unbounded => None,
        }
    }
}

impl Default for Iterations {
    fn default() -> Self {
        Iterations::Bounded(1)
    }
}
