//! Rule definition sources.
//!
//! Definitions arrive as loosely typed JSON:
//!
//! ```json
//! [{"id": "rule_1", "name": "...", "predicate": "all",
//!   "conditions": [{"field": "from", "predicate": "contains", "value": "x"}],
//!   "actions": [{"type": "move_message", "value": "Archive"}]}]
//! ```
//!
//! Each definition is validated on its own. A malformed one is rejected and
//! reported without affecting the others.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::message::fields;
use crate::rules::model::{Action, Combinator, Condition, Operator, Rule};

/// A definition that failed validation.
#[derive(Debug, Clone)]
pub struct RejectedRule {
    /// Position in the source.
    pub index: usize,
    pub rule_id: Option<String>,
    pub reason: String,
}

/// Rules loaded for one cycle.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub rejected: Vec<RejectedRule>,
}

/// Where rule definitions come from. Read once per cycle.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_rules(&self) -> Result<RuleSet, ConfigError>;
}

/// Serves a fixed rule set.
pub struct StaticRules(pub Vec<Rule>);

#[async_trait]
impl RuleSource for StaticRules {
    async fn load_rules(&self) -> Result<RuleSet, ConfigError> {
        Ok(RuleSet {
            rules: self.0.clone(),
            rejected: Vec::new(),
        })
    }
}

/// Rules read from a JSON file on every load.
pub struct JsonRuleFile {
    path: PathBuf,
}

impl JsonRuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the starter rule set if no file exists yet. Returns whether a file was written.
    pub async fn write_default_if_missing(&self) -> Result<bool, ConfigError> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(&default_definitions())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        tokio::fs::write(&self.path, body).await?;
        info!(path = %self.path.display(), "Wrote default rules file");
        Ok(true)
    }
}

#[async_trait]
impl RuleSource for JsonRuleFile {
    async fn load_rules(&self) -> Result<RuleSet, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let set = parse_rules(&raw)?;
        info!(
            path = %self.path.display(),
            loaded = set.rules.len(),
            rejected = set.rejected.len(),
            "Rules loaded"
        );
        Ok(set)
    }
}

/// Parse a JSON array of rule definitions.
///
/// Fails only if the document itself is not a JSON array; invalid entries
/// land in [`RuleSet::rejected`].
pub fn parse_rules(raw: &str) -> Result<RuleSet, ConfigError> {
    let entries: Vec<Value> =
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let mut set = RuleSet::default();
    let mut seen_ids = HashSet::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let rule_id = entry.get("id").and_then(operand_text);
        match parse_rule(entry) {
            Ok(rule) if !seen_ids.insert(rule.rule_id.clone()) => {
                let error =
                    ConfigError::InvalidRule(format!("duplicate rule id '{}'", rule.rule_id));
                reject(&mut set, index, rule_id, error);
            }
            Ok(rule) => set.rules.push(rule),
            Err(e) => reject(&mut set, index, rule_id, e),
        }
    }

    Ok(set)
}

fn reject(set: &mut RuleSet, index: usize, rule_id: Option<String>, error: ConfigError) {
    warn!(index, rule_id = ?rule_id, error = %error, "Skipping invalid rule");
    set.rejected.push(RejectedRule {
        index,
        rule_id,
        reason: error.to_string(),
    });
}

// ── Definition shapes ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RuleDefinition {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "combinator")]
    predicate: Option<String>,
    #[serde(default)]
    conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    actions: Vec<ActionDefinition>,
}

#[derive(Debug, Deserialize)]
struct ConditionDefinition {
    field: Option<String>,
    #[serde(alias = "operator")]
    predicate: Option<String>,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct ActionDefinition {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    value: Value,
}

fn parse_rule(entry: Value) -> Result<Rule, ConfigError> {
    let def: RuleDefinition =
        serde_json::from_value(entry).map_err(|e| ConfigError::InvalidRule(e.to_string()))?;

    let rule_id = operand_text(&def.id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ConfigError::InvalidRule("missing rule id".into()))?;

    let combinator = match def.predicate.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("all") => Combinator::All,
        Some("any") => Combinator::Any,
        Some(other) => {
            return Err(ConfigError::UnknownCombinator {
                rule_id,
                combinator: other.to_string(),
            });
        }
    };

    let conditions = def
        .conditions
        .into_iter()
        .map(|c| parse_condition(&rule_id, c))
        .collect::<Result<Vec<_>, _>>()?;

    let actions = def
        .actions
        .into_iter()
        .map(|a| parse_action(&rule_id, a))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Rule {
        name: def.name.unwrap_or_else(|| rule_id.clone()),
        rule_id,
        combinator,
        conditions,
        actions,
    })
}

fn parse_condition(rule_id: &str, def: ConditionDefinition) -> Result<Condition, ConfigError> {
    let field = def
        .field
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ConfigError::InvalidRule(format!("rule {rule_id}: condition without field")))?;
    let op = def
        .predicate
        .ok_or_else(|| ConfigError::InvalidRule(format!("rule {rule_id}: condition without operator")))?;

    let invalid = |reason: &str| ConfigError::InvalidOperand {
        rule_id: rule_id.to_string(),
        operator: op.clone(),
        reason: reason.to_string(),
    };
    let text = || operand_text(&def.value).ok_or_else(|| invalid("expected a string"));
    let count = || operand_int(&def.value).ok_or_else(|| invalid("expected an integer"));
    let instant = || {
        operand_text(&def.value)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| invalid("expected an RFC 3339 timestamp"))
    };

    let operator = match op.to_lowercase().as_str() {
        "equals" => Operator::Equals(text()?),
        "does_not_equal" | "not_equals" => Operator::NotEquals(text()?),
        "contains" => Operator::Contains(text()?),
        "does_not_contain" | "not_contains" => Operator::NotContains(text()?),
        "before" => Operator::Before(instant()?),
        "after" => Operator::After(instant()?),
        "less_than_days" => Operator::LessThanDays(count()?),
        "greater_than_days" => Operator::GreaterThanDays(count()?),
        "less_than_months" => Operator::LessThanMonths(count()?),
        "greater_than_months" => Operator::GreaterThanMonths(count()?),
        _ => {
            return Err(ConfigError::UnknownOperator {
                rule_id: rule_id.to_string(),
                operator: op.clone(),
            });
        }
    };

    Ok(Condition::new(normalize_field(&field), operator))
}

fn parse_action(rule_id: &str, def: ActionDefinition) -> Result<Action, ConfigError> {
    let kind = def
        .kind
        .ok_or_else(|| ConfigError::InvalidRule(format!("rule {rule_id}: action without type")))?;
    let target = || {
        operand_text(&def.value)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::InvalidOperand {
                rule_id: rule_id.to_string(),
                operator: kind.clone(),
                reason: "expected a non-empty string".into(),
            })
    };

    match kind.to_lowercase().as_str() {
        "mark_as_read" => Ok(Action::MarkAsRead),
        "mark_as_unread" => Ok(Action::MarkAsUnread),
        "move_message" => Ok(Action::MoveMessage { mailbox: target()? }),
        "add_label" | "label" => Ok(Action::AddLabel { label: target()? }),
        _ => Err(ConfigError::UnknownAction {
            rule_id: rule_id.to_string(),
            action: kind.clone(),
        }),
    }
}

/// Map legacy field names onto attribute names.
fn normalize_field(field: &str) -> String {
    match field {
        "from" => fields::SENDER.to_string(),
        "to" => fields::RECIPIENT.to_string(),
        "message" => fields::BODY.to_string(),
        "received_date" => fields::RECEIVED_AT.to_string(),
        other => other.to_string(),
    }
}

fn operand_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn operand_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_definitions() -> Value {
    serde_json::json!([
        {
            "id": "rule_1",
            "name": "Mark important emails as read",
            "predicate": "all",
            "conditions": [
                {"field": "from", "predicate": "contains", "value": "important@example.com"},
                {"field": "subject", "predicate": "contains", "value": "Important"}
            ],
            "actions": [{"type": "mark_as_read", "value": null}]
        },
        {
            "id": "rule_2",
            "name": "Move newsletters out of the inbox",
            "predicate": "any",
            "conditions": [
                {"field": "from", "predicate": "contains", "value": "newsletter"},
                {"field": "subject", "predicate": "contains", "value": "Newsletter"}
            ],
            "actions": [{"type": "move_message", "value": "Newsletters"}]
        }
    ])
}
