#![deny(unused)]
//! Policy evaluation for ctrl.
//!
//! First-match-wins wildcard policies with a linter and a YAML test runner,
//! plus the fail-closed approval/deny condition checkers.

pub mod conditions;
pub mod engine;

pub use conditions::{denies, requires_approval};
pub use engine::{
    decide_explain, lint_policy, run_policy_tests, Lint, PolicyMatchResult, PolicyTestSuite,
};
