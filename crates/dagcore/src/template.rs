use crate::Value;
use serde::{Deserialize, Serialize};

/// Parameterized workflow blueprint.
///
/// The blueprint is the JSON form of a `WorkflowDefinition` in which any
/// string may contain `${name}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub blueprint: serde_json::Value,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkflowTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>, blueprint: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            blueprint,
            parameters: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_parameter(mut self, parameter: TemplateParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub validation: Option<ParameterValidation>,
}

impl TemplateParameter {
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            validation: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParameterType, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default,
            validation: None,
        }
    }

    pub fn with_validation(mut self, validation: ParameterValidation) -> Self {
        self.validation = Some(validation);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// Whether a supplied value has the declared runtime shape
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::Array => matches!(value, Value::Array(_)),
            ParameterType::String => matches!(value, Value::String(_)),
            ParameterType::Number => matches!(value, Value::Number(_)),
            ParameterType::Boolean => matches!(value, Value::Bool(_)),
            ParameterType::Object => matches!(value, Value::Object(_)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

/// Extra constraints checked after the type check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterValidation {
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
}
