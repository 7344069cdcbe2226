//! Question flows: which fields to collect and how to ask for them.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_FLOW_KEY: &str = "general";

/// One intake flow.
#[derive(Debug, Clone, Deserialize)]
pub struct Flow {
    pub key: String,
    /// Lowercase keywords that select this flow from the first message.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub required: Vec<String>,
    /// Question text per field.
    #[serde(default)]
    pub questions: HashMap<String, String>,
    /// Confirmation summary; `{summary}` is replaced with the collected values.
    #[serde(default = "default_confirm")]
    pub confirm_template: String,
    #[serde(default = "default_done")]
    pub done_template: String,
}

fn default_confirm() -> String {
    "Thanks! Here is what we have: {summary}. Is that correct?".to_string()
}

fn default_done() -> String {
    "Perfect, thank you. Someone from our team will be in touch shortly.".to_string()
}

impl Flow {
    /// Question text for `field`, with a generic fallback.
    pub fn question(&self, field: &str) -> String {
        self.questions
            .get(field)
            .cloned()
            .unwrap_or_else(|| format!("Could you share your {}?", field.replace('_', " ")))
    }

    pub fn confirmation(&self, pairs: &[(String, String)]) -> String {
        let summary = pairs
            .iter()
            .map(|(field, value)| format!("{}: {value}", field.replace('_', " ")))
            .collect::<Vec<_>>()
            .join(", ");
        self.confirm_template.replace("{summary}", &summary)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    default: Option<String>,
    flows: Vec<Flow>,
}

/// All known flows plus the fallback.
#[derive(Debug, Clone)]
pub struct FlowCatalog {
    flows: Vec<Flow>,
    default_key: String,
}

impl Default for FlowCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FlowCatalog {
    /// General intake: name, then service.
    pub fn builtin() -> Self {
        let questions = HashMap::from([
            (
                "name".to_string(),
                "Hi! Thanks for reaching out. May I have your name?".to_string(),
            ),
            (
                "service".to_string(),
                "Which service are you interested in?".to_string(),
            ),
        ]);
        Self {
            flows: vec![Flow {
                key: DEFAULT_FLOW_KEY.to_string(),
                keywords: Vec::new(),
                required: vec!["name".into(), "service".into()],
                questions,
                confirm_template: default_confirm(),
                done_template: default_done(),
            }],
            default_key: DEFAULT_FLOW_KEY.to_string(),
        }
    }

    /// Load from a JSON file, or the built-in catalog when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            flows = catalog.flows.len(),
            "Loaded reply flows"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if file.flows.is_empty() {
            return Err(ConfigError::ParseError("flow catalog has no flows".into()));
        }
        if let Some(flow) = file.flows.iter().find(|f| f.required.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: format!("flows.{}", flow.key),
                message: "a flow needs at least one required field".into(),
            });
        }

        let default_key = file
            .default
            .unwrap_or_else(|| file.flows[0].key.clone());
        if !file.flows.iter().any(|f| f.key == default_key) {
            return Err(ConfigError::InvalidValue {
                key: "default".into(),
                message: format!("no flow named '{default_key}'"),
            });
        }

        let flows = file
            .flows
            .into_iter()
            .map(|mut f| {
                f.keywords = f.keywords.iter().map(|k| k.to_lowercase()).collect();
                f
            })
            .collect();
        Ok(Self { flows, default_key })
    }

    pub fn get(&self, key: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.key == key)
    }

    pub fn default_flow(&self) -> &Flow {
        // from_json guarantees the default exists; builtin always has one.
        self.get(&self.default_key).unwrap_or(&self.flows[0])
    }

    /// First flow with a keyword in `text`, else the default.
    pub fn select(&self, text: &str) -> &Flow {
        let lowered = text.to_lowercase();
        self.flows
            .iter()
            .find(|f| f.keywords.iter().any(|k| lowered.contains(k.as_str())))
            .unwrap_or_else(|| self.default_flow())
    }

    /// The flow for a stored key, falling back to the default.
    pub fn resolve(&self, key: Option<&str>) -> &Flow {
        key.and_then(|k| self.get(k))
            .unwrap_or_else(|| self.default_flow())
    }
}
