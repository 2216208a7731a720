//! Rule evaluation: combine a rule's conditions into one match decision.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::message::Message;
use crate::rules::model::{Combinator, Condition, Rule};
use crate::rules::predicate;

/// Whether `rule` matches `message` as of `now`.
///
/// Conditions run in declared order and short-circuit. A rule without
/// conditions matches nothing. A condition that fails to evaluate is logged
/// and counts as unmatched.
pub fn evaluate(rule: &Rule, message: &Message, now: DateTime<Utc>) -> bool {
    if rule.conditions.is_empty() {
        return false;
    }

    let check = |condition: &Condition| match predicate::evaluate(
        condition,
        &message.attributes,
        now,
    ) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(
                rule_id = %rule.rule_id,
                message_id = %message.message_id,
                error = %e,
                "Condition evaluation failed, treating as no match"
            );
            false
        }
    };

    match rule.combinator {
        Combinator::All => rule.conditions.iter().all(check),
        Combinator::Any => rule.conditions.iter().any(check),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::fields;
    use crate::rules::model::{Action, Operator};

    fn important_rule() -> Rule {
        Rule::new("test_rule_1", Combinator::All)
            .with_condition(fields::SENDER, Operator::Contains("test".into()))
            .with_condition(fields::SUBJECT, Operator::Contains("important".into()))
            .with_action(Action::MarkAsRead)
    }

    fn newsletter_rule() -> Rule {
        Rule::new("test_rule_2", Combinator::Any)
            .with_condition(fields::SENDER, Operator::Contains("newsletter".into()))
            .with_condition(fields::SUBJECT, Operator::Contains("newsletter".into()))
    }

    fn email(sender: &str, subject: &str) -> Message {
        Message::new("m1")
            .with(fields::SENDER, sender)
            .with(fields::SUBJECT, subject)
    }

    #[test]
    fn all_conditions_met() {
        let msg = email("test@example.com", "This is an important email");
        assert!(evaluate(&important_rule(), &msg, Utc::now()));
    }

    #[test]
    fn all_conditions_not_met() {
        let msg = email("test@example.com", "Regular email");
        assert!(!evaluate(&important_rule(), &msg, Utc::now()));
    }

    #[test]
    fn any_condition_met() {
        let msg = email("user@example.com", "Newsletter update");
        assert!(evaluate(&newsletter_rule(), &msg, Utc::now()));
    }

    #[test]
    fn any_no_condition_met() {
        let msg = email("user@example.com", "Lunch?");
        assert!(!evaluate(&newsletter_rule(), &msg, Utc::now()));
    }

    #[test]
    fn empty_conditions_match_nothing() {
        let msg = email("anyone@example.com", "anything");
        for combinator in [Combinator::All, Combinator::Any] {
            let rule = Rule::new("empty", combinator).with_action(Action::MarkAsRead);
            assert!(!evaluate(&rule, &msg, Utc::now()));
        }
    }

    #[test]
    fn type_mismatch_is_absorbed() {
        // `before` on a text field errors; the ANY rule still matches on the second condition.
        let rule = Rule::new("r", Combinator::Any)
            .with_condition(fields::SUBJECT, Operator::Before(Utc::now()))
            .with_condition(fields::SENDER, Operator::Equals("a@x.com".into()));
        let msg = email("a@x.com", "hello");
        assert!(evaluate(&rule, &msg, Utc::now()));

        let rule = Rule::new("r", Combinator::All)
            .with_condition(fields::SUBJECT, Operator::Before(Utc::now()))
            .with_condition(fields::SENDER, Operator::Equals("a@x.com".into()));
        assert!(!evaluate(&rule, &msg, Utc::now()));
    }

    #[test]
    fn missing_field_does_not_match() {
        let rule = Rule::new("r", Combinator::All)
            .with_condition(fields::RECIPIENT, Operator::NotContains("x".into()));
        assert!(!evaluate(&rule, &email("a@x.com", "s"), Utc::now()));
    }
}
