//! Approval and deny gating conditions.
//!
//! Policies may carry a `require_approval_if` expression evaluated against
//! the risk result. These checks fail closed: a malformed or failing
//! expression means "require approval" (or "deny"), never "let it through".

use std::collections::BTreeMap;

use ctrl_risk::{safe_eval, RiskResult, Value};

/// Expressions may reference `risk.score` / `risk.mode`; the evaluator
/// forbids attribute access, so rewrite them to their underscore forms.
fn normalize(expr: &str) -> String {
    expr.replace("risk.score", "risk_score")
        .replace("risk.mode", "risk_mode")
}

fn check(expr: &str, risk: &RiskResult) -> bool {
    let mut vars: BTreeMap<String, Value> = BTreeMap::new();
    vars.insert("risk".to_string(), Value::from_json(&risk.to_json()));
    vars.insert("risk_score".to_string(), Value::Int(risk.score));
    vars.insert("risk_mode".to_string(), Value::from(risk.mode.as_str()));

    match safe_eval(&normalize(expr), &vars) {
        Ok(value) => value.truthy(),
        // Fail closed on invalid expressions.
        Err(_) => true,
    }
}

/// Whether the matched policy demands human approval for this risk result.
/// A missing expression never requires approval.
pub fn requires_approval(expr: Option<&str>, risk: &RiskResult) -> bool {
    match expr {
        None | Some("") => false,
        Some(expr) => check(expr, risk),
    }
}

/// Deny-gating twin of [`requires_approval`]. Not yet consulted by the
/// interceptor; same fail-closed contract.
pub fn denies(expr: Option<&str>, risk: &RiskResult) -> bool {
    match expr {
        None | Some("") => false,
        Some(expr) => check(expr, risk),
    }
}
