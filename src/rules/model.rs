//! Core types for the rules system.
//!
//! A rule is a named, ordered list of conditions joined by a combinator,
//! plus an ordered list of actions applied to every message it matches.
//! Operators and actions are closed enums: anything else is rejected when
//! the rule is loaded, never at evaluation time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::message::fields;
use crate::store::traits::FilterHint;

/// Days per month for the `*_months` operators.
pub const DAYS_PER_MONTH: i64 = 30;

/// How a rule's conditions are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    All,
    Any,
}

/// A comparison operator together with its parsed operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Operator {
    Equals(String),
    NotEquals(String),
    Contains(String),
    NotContains(String),
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
    LessThanDays(i64),
    GreaterThanDays(i64),
    LessThanMonths(i64),
    GreaterThanMonths(i64),
}

impl Operator {
    /// The operator's name as written in rule definitions.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equals(_) => "equals",
            Self::NotEquals(_) => "does_not_equal",
            Self::Contains(_) => "contains",
            Self::NotContains(_) => "does_not_contain",
            Self::Before(_) => "before",
            Self::After(_) => "after",
            Self::LessThanDays(_) => "less_than_days",
            Self::GreaterThanDays(_) => "greater_than_days",
            Self::LessThanMonths(_) => "less_than_months",
            Self::GreaterThanMonths(_) => "greater_than_months",
        }
    }

    /// Earliest timestamp a matching value can have, if the operator implies one.
    fn lower_bound(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::After(ts) => Some(*ts),
            Self::LessThanDays(n) => now.checked_sub_signed(Duration::try_days(*n)?),
            Self::LessThanMonths(n) => {
                now.checked_sub_signed(Duration::try_days(n.checked_mul(DAYS_PER_MONTH)?)?)
            }
            _ => None,
        }
    }
}

/// One predicate over a message attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator) -> Self {
        Self {
            field: field.into(),
            operator,
        }
    }
}

/// A side effect applied to a matched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    MarkAsRead,
    MarkAsUnread,
    MoveMessage { mailbox: String },
    AddLabel { label: String },
}

impl Action {
    /// Short label for logging and the ledger's `actions_taken` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MarkAsRead => "mark_as_read",
            Self::MarkAsUnread => "mark_as_unread",
            Self::MoveMessage { .. } => "move_message",
            Self::AddLabel { .. } => "add_label",
        }
    }
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    pub combinator: Combinator,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn new(rule_id: impl Into<String>, combinator: Combinator) -> Self {
        let rule_id = rule_id.into();
        Self {
            name: rule_id.clone(),
            rule_id,
            combinator,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, field: &str, operator: Operator) -> Self {
        self.conditions.push(Condition::new(field, operator));
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Coarse pre-filter implied by this rule's `received_at` conditions.
    ///
    /// Only returns a bound that every matching message must satisfy, so the
    /// store may use it without causing false negatives.
    pub fn filter_hint(&self, now: DateTime<Utc>) -> FilterHint {
        let bound = |c: &Condition| {
            if c.field == fields::RECEIVED_AT {
                c.operator.lower_bound(now)
            } else {
                None
            }
        };

        let received_after = match self.combinator {
            Combinator::All => self.conditions.iter().filter_map(bound).max(),
            Combinator::Any => {
                let bounds: Option<Vec<_>> = self.conditions.iter().map(bound).collect();
                bounds.and_then(|b| b.into_iter().min())
            }
        };

        FilterHint { received_after }
    }
}
