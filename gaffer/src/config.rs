//! Engine configuration: role endpoints and workflow knobs.
//!
//! Configuration is resolved once at engine construction and passed to the
//! nodes by reference; nothing here mutates after start. The declarative
//! file maps role tags to model endpoints:
//!
//! ```json
//! {
//!   "roles": {
//!     "primary":    {"provider": "tabby", "model": "Qwen3-8B", "base_url": "http://127.0.0.1:5000/v1"},
//!     "summarizer": {"provider": "tabby", "model": "Qwen3-4B", "base_url": "http://127.0.0.1:5000/v1"}
//!   },
//!   "review_interval": 5,
//!   "max_attempts": 3
//! }
//! ```
//!
//! Roles missing from the file fall back to `primary`. API keys are
//! referenced by environment-variable name (`api_key_env`) so secrets never
//! sit in the configuration file; `.env` files are honoured via dotenvy.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::NodeName;

/// Default conversation-compression threshold, in tokens.
pub const DEFAULT_SUMMARIZE_THRESHOLD: usize = 30_000;

/// One configured model endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ModelEndpoint {
    /// Look up the API key in the environment, if one is configured.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Role-tag to endpoint mapping. Only `primary` is mandatory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleEndpoints {
    pub primary: ModelEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<ModelEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<ModelEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<ModelEndpoint>,
}

/// Per-agent input budgets, in tokens. Enforcement is advisory until the
/// summarisation middleware has had its attempt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AgentBudgets {
    pub scope: usize,
    pub planner: usize,
    pub implementor: usize,
    pub qa: usize,
    pub assessor: usize,
}

impl Default for AgentBudgets {
    fn default() -> Self {
        Self {
            scope: 15_000,
            planner: 12_000,
            implementor: 15_000,
            qa: 10_000,
            assessor: 5_000,
        }
    }
}

impl AgentBudgets {
    /// Budget for an agent node; bookkeeping nodes never invoke a model.
    #[must_use]
    pub fn for_agent(&self, node: NodeName) -> usize {
        match node {
            NodeName::ScopeAgent => self.scope,
            NodeName::TaskPlanner => self.planner,
            NodeName::Implementor => self.implementor,
            NodeName::Qa => self.qa,
            NodeName::Assessor => self.assessor,
            // Reporter and bookkeeping reuse the smallest budget.
            _ => self.assessor,
        }
    }
}

/// The resolved engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub roles: RoleEndpoints,
    #[serde(default = "default_review_interval")]
    pub review_interval: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Cap on planner rounds across the whole workflow; `None` is uncapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold_tokens: usize,
    #[serde(default)]
    pub budgets: AgentBudgets,
}

fn default_review_interval() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_summarize_threshold() -> usize {
    DEFAULT_SUMMARIZE_THRESHOLD
}

/// Errors while loading configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    #[diagnostic(code(gaffer::config::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    #[diagnostic(
        code(gaffer::config::parse),
        help("The file must be JSON with at least roles.primary configured.")
    )]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineConfig {
    /// Load from a JSON file, honouring `.env` for key resolution.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// A configuration pointing every role at one local endpoint; used when
    /// no config file is present.
    #[must_use]
    pub fn local_default() -> Self {
        Self {
            roles: RoleEndpoints {
                primary: ModelEndpoint {
                    provider: "openai-compatible".into(),
                    model: "local".into(),
                    base_url: "http://127.0.0.1:5000/v1".into(),
                    api_key_env: None,
                },
                summarizer: None,
                research: None,
                supervisor: None,
            },
            review_interval: default_review_interval(),
            max_attempts: default_max_attempts(),
            max_iterations: None,
            summarize_threshold_tokens: default_summarize_threshold(),
            budgets: AgentBudgets::default(),
        }
    }
}
