//! Config Value
//!
//! Dynamic, schema-validated configuration values for detector packages.
//! Config values are heterogeneous (text/number/boolean/file-path/list-of-paths);
//! represented as a tagged variant and validated against a single schema-driven
//! validator rather than reflected into a per-detector static record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single, dynamically-typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    File(String),
    FileMultiple(Vec<String>),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Text(_) => "text",
            ConfigValue::Number(_) => "number",
            ConfigValue::Boolean(_) => "boolean",
            ConfigValue::File(_) => "file",
            ConfigValue::FileMultiple(_) => "file_multiple",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(s) | ConfigValue::File(s) => Some(s),
            _ => None,
        }
    }
}

/// A map of field name to configured value, as stored for a scene/detector pair.
pub type DetectorConfig = HashMap<String, ConfigValue>;

/// A recognized configuration field type, as declared in a detector manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    File,
    FileMultiple,
}

impl FieldType {
    pub fn matches(&self, value: &ConfigValue) -> bool {
        matches!(
            (self, value),
            (FieldType::Text, ConfigValue::Text(_))
                | (FieldType::Number, ConfigValue::Number(_))
                | (FieldType::Boolean, ConfigValue::Boolean(_))
                | (FieldType::File, ConfigValue::File(_))
                | (FieldType::FileMultiple, ConfigValue::FileMultiple(_))
        )
    }
}

/// Schema for a single configuration field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationField {
    pub field_type: FieldType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<ConfigValue>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub accept_extensions: Option<Vec<String>>,
}

/// Complete configuration schema for a detector package.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetectorConfigurationSchema {
    pub fields: HashMap<String, ConfigurationField>,
}

/// Error raised when a config fails schema validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("required field '{0}' is missing")]
    MissingRequired(String),
    #[error("field '{field}' expects type {expected} but got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("field '{field}' value {value} is below minimum {minimum}")]
    BelowMinimum { field: String, value: f64, minimum: f64 },
    #[error("field '{field}' value {value} is above maximum {maximum}")]
    AboveMaximum { field: String, value: f64, maximum: f64 },
    #[error("field '{field}' value '{value}' is not one of the allowed options")]
    NotAnOption { field: String, value: String },
}

impl DetectorConfigurationSchema {
    /// Validates a config against this schema, returning all violations found.
    pub fn validate(&self, config: &DetectorConfig) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        for (name, field) in &self.fields {
            let value = config.get(name);

            match value {
                None => {
                    if field.required {
                        errors.push(ConfigValidationError::MissingRequired(name.clone()));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        errors.push(ConfigValidationError::TypeMismatch {
                            field: name.clone(),
                            expected: field_type_name(field.field_type),
                            actual: value.type_name(),
                        });
                        continue;
                    }

                    if let Some(n) = value.as_f64() {
                        if let Some(min) = field.minimum {
                            if n < min {
                                errors.push(ConfigValidationError::BelowMinimum {
                                    field: name.clone(),
                                    value: n,
                                    minimum: min,
                                });
                            }
                        }
                        if let Some(max) = field.maximum {
                            if n > max {
                                errors.push(ConfigValidationError::AboveMaximum {
                                    field: name.clone(),
                                    value: n,
                                    maximum: max,
                                });
                            }
                        }
                    }

                    if let (Some(options), Some(text)) = (&field.options, value.as_str()) {
                        if !options.iter().any(|o| o == text) {
                            errors.push(ConfigValidationError::NotAnOption {
                                field: name.clone(),
                                value: text.to_string(),
                            });
                        }
                    }
                }
            }
        }

        errors
    }

    pub fn is_valid(&self, config: &DetectorConfig) -> bool {
        self.validate(config).is_empty()
    }
}

fn field_type_name(t: FieldType) -> &'static str {
    match t {
        FieldType::Text => "text",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::File => "file",
        FieldType::FileMultiple => "file_multiple",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with_required_number(min: f64, max: f64) -> DetectorConfigurationSchema {
        let mut fields = HashMap::new();
        fields.insert(
            "threshold".to_string(),
            ConfigurationField {
                field_type: FieldType::Number,
                title: "Threshold".into(),
                description: String::new(),
                required: true,
                default: None,
                minimum: Some(min),
                maximum: Some(max),
                options: None,
                accept_extensions: None,
            },
        );
        DetectorConfigurationSchema { fields }
    }

    #[test]
    fn missing_required_field_is_reported() {
        let schema = schema_with_required_number(0.0, 1.0);
        let config = HashMap::new();
        let errors = schema.validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigValidationError::MissingRequired(_)));
    }

    #[test]
    fn value_within_bounds_is_valid() {
        let schema = schema_with_required_number(0.0, 1.0);
        let mut config = HashMap::new();
        config.insert("threshold".to_string(), ConfigValue::Number(0.5));
        assert!(schema.is_valid(&config));
    }

    #[test]
    fn value_outside_bounds_is_invalid() {
        let schema = schema_with_required_number(0.0, 1.0);
        let mut config = HashMap::new();
        config.insert("threshold".to_string(), ConfigValue::Number(2.0));
        let errors = schema.validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigValidationError::AboveMaximum { .. }));
    }

    #[test]
    fn wrong_type_is_reported() {
        let schema = schema_with_required_number(0.0, 1.0);
        let mut config = HashMap::new();
        config.insert("threshold".to_string(), ConfigValue::Boolean(true));
        let errors = schema.validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigValidationError::TypeMismatch { .. }));
    }
}
