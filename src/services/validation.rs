use crate::constants::limits::{MAX_PORT, MIN_PORT};
use crate::errors::GatewayError;
use serde_json::Value;

#[derive(Clone)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_string(&self, value: &Value, label: &str) -> Result<String, GatewayError> {
        let text = value.as_str().ok_or_else(|| {
            GatewayError::validation(format!("{} must be a non-empty string", label))
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::validation(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn ensure_identifier(&self, value: &Value, label: &str) -> Result<String, GatewayError> {
        let text = self.ensure_string(value, label)?;
        let valid = text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(GatewayError::validation(format!(
                "{} may only contain alphanumerics, dots, dashes and underscores",
                label
            )));
        }
        Ok(text)
    }

    pub fn ensure_port(
        &self,
        value: Option<&Value>,
        fallback: u16,
    ) -> Result<u16, GatewayError> {
        let Some(value) = value else {
            return Ok(fallback);
        };
        if value.is_null() {
            return Ok(fallback);
        }
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "Port must be an integer between {} and {}",
                    MIN_PORT, MAX_PORT
                ))
            })?;
        if numeric < MIN_PORT as i64 || numeric > MAX_PORT as i64 {
            return Err(GatewayError::validation(format!(
                "Port must be an integer between {} and {}",
                MIN_PORT, MAX_PORT
            )));
        }
        Ok(numeric as u16)
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_identifier_rejects_separator_characters() {
        let validation = Validation::new();
        assert!(validation
            .ensure_identifier(&Value::from("web-1.prod"), "target_id")
            .is_ok());
        assert!(validation
            .ensure_identifier(&Value::from("web/1"), "target_id")
            .is_err());
        assert!(validation
            .ensure_identifier(&Value::from(""), "target_id")
            .is_err());
    }

    #[test]
    fn ensure_port_accepts_numeric_and_string_forms() {
        let validation = Validation::new();
        assert_eq!(validation.ensure_port(None, 22).unwrap(), 22);
        assert_eq!(
            validation.ensure_port(Some(&Value::from(2222)), 22).unwrap(),
            2222
        );
        assert_eq!(
            validation
                .ensure_port(Some(&Value::from("8022")), 22)
                .unwrap(),
            8022
        );
        assert!(validation.ensure_port(Some(&Value::from(0)), 22).is_err());
    }
}
