//! Rule model, loading, and evaluation.
//!
//! Evaluation is pure: `predicate` checks one condition, `evaluator`
//! combines a rule's conditions. Loading validates definitions up front so
//! malformed rules never reach evaluation.

pub mod evaluator;
pub mod loader;
pub mod model;
pub mod predicate;

pub use loader::{JsonRuleFile, RuleSet, RuleSource, StaticRules};
pub use model::{Action, Combinator, Condition, Operator, Rule};
