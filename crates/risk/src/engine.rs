//! Declarative risk scoring over intercepted intents.
//!
//! An intent `(server, tool, env, args)` is scored by walking the configured
//! rules in declaration order. Rules compose additively: later rules may
//! raise the mode, and the score is realigned to the mode's baseline after
//! every rule so the two never drift apart. Expression failures escalate
//! toward `review` rather than aborting the pipeline.

use std::collections::BTreeMap;

use ctrl_core::config::{ArgPredicate, RiskConfig, RuleWhen};
use ctrl_core::glob::wildcard_match;
use ctrl_core::Result;
use indexmap::IndexMap;
use serde_json::json;

use crate::expr::{safe_eval, Value};

/// Outcome of scoring one intent.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskResult {
    pub mode: String,
    pub score: i64,
    pub reasons: Vec<String>,
    pub matched_rules: Vec<String>,
}

impl RiskResult {
    /// Shape journaled in `risk.scored` events and bound into approval
    /// conditions.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "mode": self.mode,
            "score": self.score,
            "reasons": self.reasons,
            "rules": self.matched_rules,
        })
    }
}

/// Rank on the v0 ladder; unknown modes rank lowest.
fn mode_rank(mode: &str) -> u8 {
    match mode {
        "review" => 1,
        "danger" => 2,
        _ => 0,
    }
}

fn escalate_one(mode: &str) -> String {
    match mode {
        "safe" => "review".to_string(),
        "review" => "danger".to_string(),
        other => other.to_string(),
    }
}

/// Never-downgrade escalation toward at least `floor`.
fn raise_to(mode: &str, floor: &str) -> String {
    if mode_rank(floor) > mode_rank(mode) {
        floor.to_string()
    } else {
        mode.to_string()
    }
}

fn clamp_score(v: f64) -> i64 {
    (v.round().clamp(0.0, 100.0)) as i64
}

/// Numeric-aware JSON equality: `1000` and `1000.0` compare equal.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn args_match(args: &serde_json::Value, predicates: &IndexMap<String, ArgPredicate>) -> bool {
    for (key, pred) in predicates {
        let actual = args.get(key);
        let actual_or_null = actual.unwrap_or(&serde_json::Value::Null);

        if let Some(expected) = &pred.eq {
            if !json_eq(actual_or_null, expected) {
                return false;
            }
        }
        if let Some(excluded) = &pred.ne {
            if json_eq(actual_or_null, excluded) {
                return false;
            }
        }

        // Numeric predicates require a numeric actual; a string "1000"
        // deliberately does not satisfy `gte: 1000`.
        let number = actual.and_then(serde_json::Value::as_f64);
        if let Some(bound) = pred.gte {
            match number {
                Some(n) if n >= bound => {}
                _ => return false,
            }
        }
        if let Some(bound) = pred.gt {
            match number {
                Some(n) if n > bound => {}
                _ => return false,
            }
        }
        if let Some(bound) = pred.lte {
            match number {
                Some(n) if n <= bound => {}
                _ => return false,
            }
        }
        if let Some(bound) = pred.lt {
            match number {
                Some(n) if n < bound => {}
                _ => return false,
            }
        }

        if let Some(needle) = &pred.contains {
            match actual.and_then(serde_json::Value::as_str) {
                Some(s) if s.contains(needle.as_str()) => {}
                _ => return false,
            }
        }

        if let Some(allowed) = &pred.one_of {
            if !allowed.iter().any(|item| json_eq(actual_or_null, item)) {
                return false;
            }
        }
    }
    true
}

fn when_matches(when: &RuleWhen, server: &str, tool: &str, env: &str, args: &serde_json::Value) -> bool {
    if !wildcard_match(&when.server, server) {
        return false;
    }
    if !wildcard_match(&when.tool, tool) {
        return false;
    }
    if !wildcard_match(&when.env, env) {
        return false;
    }
    if let Some(predicates) = &when.args {
        if !args_match(args, predicates) {
            return false;
        }
    }
    true
}

/// Deterministic, pure scorer over a validated risk config.
pub struct RiskEngine {
    cfg: RiskConfig,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    fn baseline(&self, mode: &str) -> i64 {
        self.cfg
            .modes
            .get(mode)
            .or_else(|| self.cfg.modes.get("safe"))
            .map(|m| m.score)
            .unwrap_or(0)
    }

    /// Score an intent. Never fails: expression errors degrade to
    /// escalations with diagnostic reasons.
    pub fn score(&self, server: &str, tool: &str, env: &str, args: &serde_json::Value) -> RiskResult {
        let mut mode = "safe".to_string();
        let mut score = self.baseline("safe");
        let mut reasons: Vec<String> = Vec::new();
        let mut matched_rules: Vec<String> = Vec::new();

        // Base bindings for expressions: the intent triple plus the args map,
        // with scalar args hoisted to top-level names for convenience.
        let mut bindings: BTreeMap<String, Value> = BTreeMap::new();
        bindings.insert("server".to_string(), Value::from(server));
        bindings.insert("tool".to_string(), Value::from(tool));
        bindings.insert("env".to_string(), Value::from(env));
        bindings.insert("args".to_string(), Value::from_json(args));
        if let Some(map) = args.as_object() {
            for (key, value) in map {
                if value.is_number() || value.is_string() || value.is_boolean() {
                    bindings.insert(key.clone(), Value::from_json(value));
                }
            }
        }

        // Derived vars, declaration order; later entries see earlier ones.
        for (name, expr) in &self.cfg.vars {
            let value = match safe_eval(expr, &bindings) {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!(var = %name, error = %err, "risk var failed; binding 0");
                    Value::Int(0)
                }
            };
            bindings.insert(name.clone(), value);
        }

        for rule in &self.cfg.rules {
            if !when_matches(&rule.when, server, tool, env, args) {
                continue;
            }

            matched_rules.push(rule.name.clone());
            if let Some(reason) = &rule.reason {
                reasons.push(reason.clone());
            }

            if let Some(score_expr) = &rule.score_expr {
                let mut scope = bindings.clone();
                scope.insert("score".to_string(), Value::Int(score));
                scope.insert("mode".to_string(), Value::from(mode.as_str()));
                match safe_eval(score_expr, &scope) {
                    Ok(Value::Int(v)) => score = clamp_score(v as f64),
                    Ok(Value::Float(v)) => score = clamp_score(v),
                    Ok(Value::Bool(v)) => score = clamp_score(if v { 1.0 } else { 0.0 }),
                    // Non-numeric results are ignored, like the rule never ran.
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(rule = %rule.name, error = %err, "score_expr failed");
                        mode = raise_to(&mode, "review");
                        reasons.push(format!("Expr failed in rule '{}' -> escalated", rule.name));
                    }
                }
            }

            if let Some(set_mode) = &rule.set_mode {
                mode = set_mode.clone();
            }

            if rule.escalate.as_deref() == Some("one_level") {
                mode = escalate_one(&mode);
            }

            // Keep score aligned with the mode's baseline.
            score = score.max(self.baseline(&mode));
        }

        if !self.cfg.set_mode_by_score.is_empty() {
            for (mode_name, cond_expr) in &self.cfg.set_mode_by_score {
                let mut scope = bindings.clone();
                scope.insert("score".to_string(), Value::Int(score));
                scope.insert("mode".to_string(), Value::from(mode.as_str()));
                match safe_eval(cond_expr, &scope) {
                    Ok(v) if v.truthy() => {
                        // First truthy mapping wins.
                        mode = mode_name.clone();
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(mode = %mode_name, error = %err, "set_mode_by_score failed");
                        mode = raise_to(&mode, "review");
                        reasons.push("set_mode_by_score expression failed -> review".to_string());
                    }
                }
            }
            score = score.max(self.baseline(&mode));
        }

        score = score.clamp(0, 100);

        RiskResult {
            mode,
            score,
            reasons,
            matched_rules,
        }
    }
}
