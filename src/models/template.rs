use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DeliveryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub code: String,

    #[serde(default, alias = "title")]
    pub subject: String,

    #[serde(alias = "body")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
}

impl Template {
    /// Substitutes `{{name}}` placeholders. Missing variables and non-scalar
    /// values are permanent failures.
    pub fn render(
        &self,
        variables: &HashMap<String, serde_json::Value>,
    ) -> Result<RenderedContent, DeliveryError> {
        let subject = replace_variables(&self.subject, variables)?;
        let body = replace_variables(&self.content, variables)?;

        Ok(RenderedContent { subject, body })
    }
}

fn replace_variables(
    template: &str,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<String, DeliveryError> {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        if !result.contains(&placeholder) {
            continue;
        }

        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            _ => {
                return Err(DeliveryError::Render(format!(
                    "Unsupported variable type for key '{}'",
                    key
                )));
            }
        };

        result = result.replace(&placeholder, &replacement);
    }

    let unreplaced = result
        .find("{{")
        .and_then(|start| result[start..].find("}}").map(|end| (start, start + end + 2)));

    if let Some((start, end)) = unreplaced {
        let missing_var = &result[start..end];

        warn!(
            missing_variable = %missing_var,
            "Template contains unreplaced variable"
        );

        return Err(DeliveryError::Render(format!(
            "Missing variable in template: {}",
            missing_var
        )));
    }

    Ok(result)
}
