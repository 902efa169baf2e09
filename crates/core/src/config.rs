//! Configuration schemas and loaders.
//!
//! Three YAML documents drive the control plane: `servers.yaml` (remote tool
//! endpoints), `policy.yaml` (ordered allow/deny/pending policies) and
//! `risk.yaml` (declarative risk scoring). Schema violations are fatal at
//! startup and surface as [`Error::Config`].

use config::{Config, Environment};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

fn star() -> String {
    "*".to_string()
}

// =============================================================================
// servers.yaml
// =============================================================================

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
}

/// One remote tool-serving endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub transport: Transport,
    pub base_url: String,
}

/// Top-level shape of servers.yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersConfig {
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub defaults: Option<HashMap<String, String>>,
}

impl ServersConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for s in &self.servers {
            if !seen.insert(s.name.as_str()) {
                return Err(Error::config(format!("duplicate server.name: {}", s.name)));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// policy.yaml
// =============================================================================

/// A policy's prescriptive outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
    Pending,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wildcard patterns a policy matches against. Every field defaults to `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMatch {
    #[serde(default = "star")]
    pub server: String,
    #[serde(default = "star")]
    pub tool: String,
    #[serde(default = "star")]
    pub env: String,
}

impl Default for PolicyMatch {
    fn default() -> Self {
        Self {
            server: star(),
            tool: star(),
            env: star(),
        }
    }
}

/// A single ordered policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: PolicyMatch,
    pub effect: Effect,
    #[serde(default)]
    pub reason: String,
    /// Expression over the risk result; truthy forces the decision to
    /// `pending` even when `effect` is `allow`.
    #[serde(default)]
    pub require_approval_if: Option<String>,
    /// Deny-gating expression. Parsed and lint-visible; not yet consulted by
    /// the interceptor.
    #[serde(default)]
    pub deny: Option<String>,
}

/// Top-level shape of policy.yaml: first match wins, declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub policies: Vec<Policy>,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.policies {
            if !seen.insert(p.id.as_str()) {
                return Err(Error::config(format!("duplicate policy.id: {}", p.id)));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.id == id)
    }
}

// =============================================================================
// risk.yaml
// =============================================================================

/// A named risk mode with its baseline score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeDef {
    pub score: i64,
}

/// Per-argument predicates inside a rule's `when.args`. All present
/// predicates must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgPredicate {
    #[serde(default)]
    pub eq: Option<serde_json::Value>,
    #[serde(default)]
    pub ne: Option<serde_json::Value>,
    #[serde(default)]
    pub gte: Option<f64>,
    #[serde(default)]
    pub gt: Option<f64>,
    #[serde(default)]
    pub lte: Option<f64>,
    #[serde(default)]
    pub lt: Option<f64>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default, rename = "in")]
    pub one_of: Option<Vec<serde_json::Value>>,
}

/// Match clause of a risk rule: wildcard patterns plus optional argument
/// predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleWhen {
    #[serde(default = "star")]
    pub server: String,
    #[serde(default = "star")]
    pub tool: String,
    #[serde(default = "star")]
    pub env: String,
    #[serde(default)]
    pub args: Option<IndexMap<String, ArgPredicate>>,
}

impl Default for RuleWhen {
    fn default() -> Self {
        Self {
            server: star(),
            tool: star(),
            env: star(),
            args: None,
        }
    }
}

/// One ordered risk rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    pub name: String,
    #[serde(default)]
    pub when: RuleWhen,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub set_mode: Option<String>,
    /// Only `"one_level"` is supported.
    #[serde(default)]
    pub escalate: Option<String>,
    #[serde(default)]
    pub score_expr: Option<String>,
}

/// The `risk:` mapping of risk.yaml. `vars` and `set_mode_by_score` keep
/// their declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub mode: String,
    pub modes: IndexMap<String, ModeDef>,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RiskRule>,
    #[serde(default)]
    pub set_mode_by_score: IndexMap<String, String>,
}

/// Top-level shape of risk.yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfigFile {
    pub risk: RiskConfig,
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode != "modes" {
            return Err(Error::config("only risk.mode=modes is supported"));
        }
        if self.modes.is_empty() {
            return Err(Error::config("risk.modes is required"));
        }
        for must in ["safe", "review", "danger"] {
            if !self.modes.contains_key(must) {
                return Err(Error::config(format!("risk.modes must include '{must}'")));
            }
        }
        for rule in &self.rules {
            if let Some(esc) = &rule.escalate {
                if esc != "one_level" {
                    return Err(Error::config(format!(
                        "rule '{}': unsupported escalate '{}'",
                        rule.name, esc
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Loaders
// =============================================================================

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&content)
        .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))
}

/// Load and validate servers.yaml.
pub fn load_servers(path: impl AsRef<Path>) -> Result<ServersConfig> {
    let cfg: ServersConfig = read_yaml(path.as_ref())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load and validate policy.yaml.
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyConfig> {
    let cfg: PolicyConfig = read_yaml(path.as_ref())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load and validate risk.yaml.
pub fn load_risk(path: impl AsRef<Path>) -> Result<RiskConfig> {
    let cfg: RiskConfigFile = read_yaml(path.as_ref())?;
    cfg.risk.validate()?;
    Ok(cfg.risk)
}

// =============================================================================
// Process configuration
// =============================================================================

/// Process-level settings, sourced from defaults and `CTRL_*` environment
/// variables (`CTRL_DB_PATH`, `CTRL_SERVERS_PATH`, `CTRL_POLICY_PATH`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db_path: String,
    pub servers_path: String,
    pub policy_path: String,
    pub risk_path: String,
    pub host: String,
    pub port: u16,
    pub default_env: String,
    pub tool_timeout_secs: u64,
    pub json_logs: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let cfg = Config::builder()
            .set_default("db_path", "ctrl.db")
            .and_then(|b| b.set_default("servers_path", "configs/servers.yaml"))
            .and_then(|b| b.set_default("policy_path", "configs/policy.yaml"))
            .and_then(|b| b.set_default("risk_path", "configs/risk.yaml"))
            .and_then(|b| b.set_default("host", "127.0.0.1"))
            .and_then(|b| b.set_default("port", 8788_i64))
            .and_then(|b| b.set_default("default_env", "dev"))
            .and_then(|b| b.set_default("tool_timeout_secs", 30_i64))
            .and_then(|b| b.set_default("json_logs", false))
            .map_err(|e| Error::config(e.to_string()))?
            // try_parsing lets CTRL_PORT / CTRL_JSON_LOGS deserialize as
            // numbers and booleans rather than strings.
            .add_source(Environment::with_prefix("CTRL").try_parsing(true))
            .build()
            .map_err(|e| Error::config(e.to_string()))?;

        cfg.try_deserialize()
            .map_err(|e| Error::config(e.to_string()))
    }
}
