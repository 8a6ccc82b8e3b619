//! Expression evaluation against a variable scope.

use thiserror::Error;

use crate::execution::{VariableScope, VariableValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("malformed expression '{0}'")]
    Syntax(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
}

/// Compiles and evaluates expressions found in process models.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> Result<VariableValue, ExpressionError>;
}

/// Minimal evaluator: `${name}` reads a variable, anything else is a literal.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableExpressionEvaluator;

impl ExpressionEvaluator for VariableExpressionEvaluator {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> Result<VariableValue, ExpressionError> {
        let trimmed = expression.trim();
        let Some(rest) = trimmed.strip_prefix("${") else {
            if trimmed.contains("${") {
                return Err(ExpressionError::Syntax(expression.to_string()));
            }
            return Ok(VariableValue::Text(trimmed.to_string()));
        };

        let name = rest
            .strip_suffix('}')
            .map(str::trim)
            .filter(|n| !n.is_empty() && !n.contains(['{', '}']))
            .ok_or_else(|| ExpressionError::Syntax(expression.to_string()))?;

        scope
            .variable(name)
            .ok_or_else(|| ExpressionError::UnknownVariable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, NoExecutionScope};
    use chrono::{TimeZone, Utc};
    use jobforge_core::ExecutionId;

    #[test]
    fn literals_evaluate_to_text() {
        let value = VariableExpressionEvaluator
            .evaluate(" 2026-06-01T00:00:00Z ", &NoExecutionScope)
            .unwrap();
        assert_eq!(value, VariableValue::Text("2026-06-01T00:00:00Z".into()));
    }

    #[test]
    fn variables_resolve_from_scope() {
        let end = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let execution = Execution::new(ExecutionId::new("exec-1")).with_variable("end", VariableValue::Date(end));

        let value = VariableExpressionEvaluator.evaluate("${ end }", &execution).unwrap();
        assert_eq!(value, VariableValue::Date(end));
    }

    #[test]
    fn missing_variables_and_bad_syntax_fail() {
        assert_eq!(
            VariableExpressionEvaluator.evaluate("${end}", &NoExecutionScope),
            Err(ExpressionError::UnknownVariable("end".into()))
        );
        assert!(matches!(
            VariableExpressionEvaluator.evaluate("${end", &NoExecutionScope),
            Err(ExpressionError::Syntax(_))
        ));
        assert!(matches!(
            VariableExpressionEvaluator.evaluate("until ${end}", &NoExecutionScope),
            Err(ExpressionError::Syntax(_))
        ));
    }
}
