//! Template registry and parameter substitution.
//!
//! Placeholders are `${name}` tokens inside any JSON string of a blueprint
//! (object keys included). A string that consists of exactly one
//! placeholder is replaced by the parameter value itself, keeping its JSON
//! type; a placeholder embedded in a longer string is replaced by the
//! value's textual form.

use crate::versions::VersionStore;
use dagcore::{
    FlowError, ParameterValidation, ResourceKind, TemplateParameter, Value, WorkflowDefinition,
    WorkflowTemplate, WorkflowVersion,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registered templates, instantiated into versions of the shared version store
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
    versions: Arc<dyn VersionStore>,
}

impl TemplateRegistry {
    pub fn new(versions: Arc<dyn VersionStore>) -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            versions,
        }
    }

    /// Store a template, replacing any template with the same id
    pub async fn register_template(&self, template: WorkflowTemplate) {
        tracing::info!("Registering template: {} ({})", template.id, template.name);
        self.templates.write().await.insert(template.id.clone(), template);
    }

    pub async fn get_template(&self, id: &str) -> Option<WorkflowTemplate> {
        self.templates.read().await.get(id).cloned()
    }

    /// Templates sorted by id, optionally restricted to one category
    pub async fn list_templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        let templates = self.templates.read().await;
        let mut matching: Vec<WorkflowTemplate> = templates
            .values()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    pub async fn count(&self) -> usize {
        self.templates.read().await.len()
    }

    pub async fn clear(&self) {
        self.templates.write().await.clear();
    }

    /// Validate parameters, substitute them into the blueprint and store the
    /// result as a new active version.
    ///
    /// The workflow id is, in order: `workflow_id`, the blueprint's own `id`
    /// after substitution, the template id.
    pub async fn instantiate(
        &self,
        template_id: &str,
        parameters: HashMap<String, Value>,
        workflow_id: Option<&str>,
    ) -> Result<WorkflowVersion, FlowError> {
        let template = self
            .get_template(template_id)
            .await
            .ok_or_else(|| FlowError::not_found(ResourceKind::Template, template_id))?;

        let values = resolve_parameters(&template.parameters, parameters)?;
        let unresolved: Vec<String> = extract_placeholders(&template.blueprint)
            .into_iter()
            .filter(|name| !values.contains_key(name))
            .collect();
        if !unresolved.is_empty() {
            tracing::warn!(
                "Template {} leaves placeholders unresolved: {}",
                template.id,
                unresolved.join(", ")
            );
        }

        let definition = materialize(&template.blueprint, &values)?;

        let workflow_id = match workflow_id {
            Some(id) => id.to_string(),
            None if !definition.id.is_empty() => definition.id.clone(),
            None => template.id.clone(),
        };

        let version = self
            .versions
            .create_version(
                &workflow_id,
                definition,
                Some(format!("Instantiated from template '{}'", template.id)),
                None,
            )
            .await?;

        tracing::info!(
            "Instantiated template {} as {} v{}",
            template.id,
            version.workflow_id,
            version.version
        );

        Ok(version)
    }
}

/// Check supplied parameters against their declarations and fill defaults
pub fn resolve_parameters(
    declared: &[TemplateParameter],
    mut supplied: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, FlowError> {
    let mut values = HashMap::new();

    for param in declared {
        match supplied.remove(&param.name) {
            Some(value) => {
                validate_parameter(param, &value)?;
                values.insert(param.name.clone(), value);
            }
            None if param.required => {
                return Err(FlowError::validation(format!(
                    "required parameter '{}' not provided",
                    param.name
                )));
            }
            None => {
                if let Some(default) = &param.default {
                    values.insert(param.name.clone(), default.clone());
                }
            }
        }
    }

    // Undeclared parameters still substitute; they have nothing to validate against.
    values.extend(supplied);
    Ok(values)
}

/// Validate one supplied value against its declared type and constraints
pub fn validate_parameter(param: &TemplateParameter, value: &Value) -> Result<(), FlowError> {
    if !param.param_type.accepts(value) {
        return Err(FlowError::validation(format!(
            "parameter '{}' must be of type {}, got {}",
            param.name,
            param.param_type.as_str(),
            value.type_name()
        )));
    }

    match &param.validation {
        Some(rules) => check_rules(&param.name, rules, value),
        None => Ok(()),
    }
}

fn check_rules(name: &str, rules: &ParameterValidation, value: &Value) -> Result<(), FlowError> {
    if let Some(allowed) = &rules.allowed {
        if !allowed.contains(value) {
            return Err(FlowError::validation(format!(
                "parameter '{}' value {} is not one of the allowed values",
                name, value
            )));
        }
    }

    if let Some(n) = value.as_f64() {
        if rules.min.is_some_and(|min| n < min) || rules.max.is_some_and(|max| n > max) {
            return Err(FlowError::validation(format!(
                "parameter '{}' value {} is out of range",
                name, value
            )));
        }
    }

    if let Some(len) = value.len() {
        if rules.min_length.is_some_and(|min| len < min) || rules.max_length.is_some_and(|max| len > max) {
            return Err(FlowError::validation(format!(
                "parameter '{}' length {} is out of range",
                name, len
            )));
        }
    }

    Ok(())
}

/// Substitute parameters into a blueprint and parse the result
pub fn materialize(
    blueprint: &serde_json::Value,
    values: &HashMap<String, Value>,
) -> Result<WorkflowDefinition, FlowError> {
    let substituted = substitute(blueprint, values);
    serde_json::from_value(substituted).map_err(|e| {
        FlowError::validation(format!("template does not produce a valid workflow definition: {}", e))
    })
}

/// Replace `${name}` placeholders throughout a JSON document
pub fn substitute(value: &serde_json::Value, params: &HashMap<String, Value>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => substitute_string(s, params),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|item| substitute(item, params)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (replace_placeholders(k, params), substitute(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(s: &str, params: &HashMap<String, Value>) -> serde_json::Value {
    if let Some(value) = whole_placeholder(s).and_then(|name| params.get(name)) {
        return serde_json::Value::from(value);
    }
    serde_json::Value::String(replace_placeholders(s, params))
}

/// Name of the placeholder if `s` is exactly `${name}`
fn whole_placeholder(s: &str) -> Option<&str> {
    let name = s.strip_prefix("${")?.strip_suffix('}')?;
    (!name.is_empty() && !name.contains(['$', '{', '}'])).then_some(name)
}

/// Replace placeholders in a single left-to-right pass.
///
/// Substituted text is never scanned again, so a value that itself contains
/// `${..}` comes through literally. Unknown placeholders are kept as written.
fn replace_placeholders(text: &str, params: &HashMap<String, Value>) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };

        match params.get(&after[..end]) {
            Some(value) => result.push_str(&value.to_string()),
            None => result.push_str(&rest[start..start + end + 3]),
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

/// Placeholder names referenced anywhere in a blueprint, sorted and deduplicated
fn extract_placeholders(blueprint: &serde_json::Value) -> Vec<String> {
    fn scan(text: &str, out: &mut Vec<String>) {
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    if !name.is_empty() {
                        out.push(name.to_string());
                    }
                    rest = &after[end + 1..];
                }
                None => break,
            }
        }
    }

    fn walk(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => scan(s, out),
            serde_json::Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    scan(k, out);
                    walk(v, out);
                }
            }
            _ => {}
        }
    }

    let mut names = Vec::new();
    walk(blueprint, &mut names);
    names.sort();
    names.dedup();
    names
}
