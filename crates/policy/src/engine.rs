//! First-match-wins policy evaluation, linting, and a YAML test runner.

use serde::Deserialize;

use ctrl_core::config::{Effect, PolicyConfig};
use ctrl_core::glob::wildcard_match;
use ctrl_core::{Error, Result};

/// Outcome of matching one intent against the ordered policy list.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMatchResult {
    pub decision: Effect,
    pub policy_id: Option<String>,
    pub reason: String,
    /// Human-readable description of the matched patterns.
    pub matched: String,
    /// Index of the matched policy in declaration order; -1 for the
    /// synthetic default-deny.
    pub index: i64,
}

/// Decide the effect for `(server, tool, env)`.
///
/// Policies are consulted in declaration order; the first whose three
/// wildcard patterns all match wins. No match is a deny: default-deny is
/// an invariant, not a configuration choice.
pub fn decide_explain(cfg: &PolicyConfig, server: &str, tool: &str, env: &str) -> PolicyMatchResult {
    for (index, policy) in cfg.policies.iter().enumerate() {
        let m = &policy.matcher;
        if wildcard_match(&m.server, server)
            && wildcard_match(&m.tool, tool)
            && wildcard_match(&m.env, env)
        {
            return PolicyMatchResult {
                decision: policy.effect,
                policy_id: Some(policy.id.clone()),
                reason: policy.reason.clone(),
                matched: format!("server={} tool={} env={}", m.server, m.tool, m.env),
                index: index as i64,
            };
        }
    }
    PolicyMatchResult {
        decision: Effect::Deny,
        policy_id: None,
        reason: "No policy matched".to_string(),
        matched: "none".to_string(),
        index: -1,
    }
}

/// Does pattern `a` match everything `b` would match? A strong check is
/// hard; v0 treats `*` as universal and otherwise requires equality.
fn subsumes(a: &str, b: &str) -> bool {
    a == "*" || a == b
}

/// Lint findings, split by severity. Deterministic for a given config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lint {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Static checks over a policy config.
///
/// `approvals_enabled` suppresses the pending-without-approvals warning in
/// deployments that serve the approval API.
pub fn lint_policy(cfg: &PolicyConfig, approvals_enabled: bool) -> Lint {
    let mut lint = Lint::default();
    let policies = &cfg.policies;

    let has_catch_all = policies
        .iter()
        .any(|p| p.matcher.server == "*" && p.matcher.tool == "*" && p.matcher.env == "*");
    if !has_catch_all {
        lint.warnings.push(
            "No catch-all policy found (match: server='*', tool='*', env='*').".to_string(),
        );
    }

    for (i, earlier) in policies.iter().enumerate() {
        let m_i = &earlier.matcher;
        for (j, later) in policies.iter().enumerate().skip(i + 1) {
            let m_j = &later.matcher;
            if subsumes(&m_i.server, &m_j.server)
                && subsumes(&m_i.tool, &m_j.tool)
                && subsumes(&m_i.env, &m_j.env)
            {
                lint.warnings.push(format!(
                    "Policy '{}' (index {i}) likely shadows '{}' (index {j}). \
                     Earlier: server={}, tool={}, env={} Later: server={}, tool={}, env={}",
                    earlier.id, later.id, m_i.server, m_i.tool, m_i.env, m_j.server, m_j.tool, m_j.env
                ));
            }
        }
    }

    if !approvals_enabled {
        for p in policies {
            if p.effect == Effect::Pending {
                lint.warnings.push(format!(
                    "Policy '{}' uses effect=pending but approvals are not served by this deployment.",
                    p.id
                ));
            }
        }
    }

    lint
}

// =============================================================================
// Test runner
// =============================================================================

/// A YAML test suite for a policy config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyTestSuite {
    #[serde(default)]
    pub tests: Vec<PolicyTestCase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyTestCase {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: PolicyTestInput,
    #[serde(default)]
    pub expect: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyTestInput {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub env: String,
}

impl PolicyTestSuite {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse test suite: {e}")))
    }
}

/// Run a suite through [`decide_explain`]; returns the failure count and one
/// report line per test.
pub fn run_policy_tests(cfg: &PolicyConfig, suite: &PolicyTestSuite) -> (usize, Vec<String>) {
    let mut fails = 0;
    let mut lines = Vec::with_capacity(suite.tests.len());

    for test in &suite.tests {
        let name = test.name.as_deref().unwrap_or("<unnamed>");
        let input = &test.input;
        let got = decide_explain(cfg, &input.server, &input.tool, &input.env).decision;
        let expect = test.expect.as_deref().unwrap_or("");

        if got.as_str() == expect {
            lines.push(format!(
                "✓ {name}  ({}.{} env={}) => {got}",
                input.server, input.tool, input.env
            ));
        } else {
            fails += 1;
            lines.push(format!(
                "✗ {name}  ({}.{} env={}) => got {got}, expected {expect}",
                input.server, input.tool, input.env
            ));
        }
    }

    (fails, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrl_core::config::{Policy, PolicyMatch};

    fn policy(id: &str, server: &str, tool: &str, env: &str, effect: Effect) -> Policy {
        Policy {
            id: id.to_string(),
            matcher: PolicyMatch {
                server: server.to_string(),
                tool: tool.to_string(),
                env: env.to_string(),
            },
            effect,
            reason: String::new(),
            require_approval_if: None,
            deny: None,
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let cfg = PolicyConfig {
            policies: vec![
                policy("deny-prod", "*", "*", "prod", Effect::Deny),
                policy("allow-all", "*", "*", "*", Effect::Allow),
            ],
        };

        let res = decide_explain(&cfg, "coingecko", "get_markets", "prod");
        assert_eq!(res.decision, Effect::Deny);
        assert_eq!(res.policy_id.as_deref(), Some("deny-prod"));
        assert_eq!(res.index, 0);
        assert_eq!(res.matched, "server=* tool=* env=prod");

        let res = decide_explain(&cfg, "coingecko", "get_markets", "dev");
        assert_eq!(res.decision, Effect::Allow);
        assert_eq!(res.index, 1);
    }

    #[test]
    fn no_match_is_default_deny() {
        let cfg = PolicyConfig { policies: vec![] };
        let res = decide_explain(&cfg, "x", "y", "dev");
        assert_eq!(res.decision, Effect::Deny);
        assert_eq!(res.policy_id, None);
        assert_eq!(res.reason, "No policy matched");
        assert_eq!(res.matched, "none");
        assert_eq!(res.index, -1);
    }

    #[test]
    fn wildcards_apply_per_field() {
        let cfg = PolicyConfig {
            policies: vec![policy("gh-writes", "github", "create_*", "*", Effect::Pending)],
        };
        assert_eq!(
            decide_explain(&cfg, "github", "create_issue", "dev").decision,
            Effect::Pending
        );
        assert_eq!(
            decide_explain(&cfg, "github", "list_issues", "dev").decision,
            Effect::Deny
        );
    }

    #[test]
    fn lint_warns_on_missing_catch_all() {
        let cfg = PolicyConfig {
            policies: vec![policy("p", "a", "b", "c", Effect::Allow)],
        };
        let lint = lint_policy(&cfg, true);
        assert!(lint.errors.is_empty());
        assert!(lint.warnings.iter().any(|w| w.contains("catch-all")));
    }

    #[test]
    fn lint_warns_on_shadowing() {
        let cfg = PolicyConfig {
            policies: vec![
                policy("broad", "*", "*", "*", Effect::Allow),
                policy("narrow", "github", "push", "prod", Effect::Deny),
            ],
        };
        let lint = lint_policy(&cfg, true);
        assert!(lint
            .warnings
            .iter()
            .any(|w| w.contains("'broad'") && w.contains("shadows 'narrow'")));
    }

    #[test]
    fn lint_is_idempotent() {
        let cfg = PolicyConfig {
            policies: vec![
                policy("a", "*", "*", "*", Effect::Allow),
                policy("b", "s", "t", "e", Effect::Pending),
            ],
        };
        assert_eq!(lint_policy(&cfg, false), lint_policy(&cfg, false));
    }

    #[test]
    fn lint_flags_pending_without_approvals() {
        let cfg = PolicyConfig {
            policies: vec![policy("hold", "*", "*", "*", Effect::Pending)],
        };
        assert!(lint_policy(&cfg, false)
            .warnings
            .iter()
            .any(|w| w.contains("effect=pending")));
        assert!(!lint_policy(&cfg, true)
            .warnings
            .iter()
            .any(|w| w.contains("effect=pending")));
    }

    #[test]
    fn test_runner_reports_passes_and_failures() {
        let cfg = PolicyConfig {
            policies: vec![policy("allow-dev", "*", "*", "dev", Effect::Allow)],
        };
        let suite = PolicyTestSuite::from_yaml(
            "tests:\n  - name: dev ok\n    input: {server: s, tool: t, env: dev}\n    expect: allow\n  - name: prod denied\n    input: {server: s, tool: t, env: prod}\n    expect: allow\n",
        )
        .unwrap();

        let (fails, lines) = run_policy_tests(&cfg, &suite);
        assert_eq!(fails, 1);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('✓'));
        assert!(lines[1].starts_with('✗'));
        assert!(lines[1].contains("got deny, expected allow"));
    }
}
