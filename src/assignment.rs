use crate::error::IngestError;
use crate::store::Store;
use crate::types::{AssignmentRule, RuleType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    /// No rule applied; the conversation waits in the queue.
    Queued,
    Assigned {
        agent_id: String,
        previous: Option<String>,
    },
}

/// Cursor position after `last` in a rotation of `len` agents. `-1` means the
/// rotation has not started.
pub fn next_index(last: i32, len: usize) -> i32 {
    (last + 1).rem_euclid(len as i32)
}

fn audit_reason(rule: &AssignmentRule) -> String {
    format!("Auto-atribuição: {}", rule.name)
}

/// Runs the active rule of `instance_id` against a freshly created conversation.
/// Round-robin picks happen under a lock on the rule, so concurrent creations
/// never share a cursor position and a failed assignment does not use one up.
pub async fn apply(
    store: &dyn Store,
    instance_id: &str,
    conversation_id: &str,
) -> Result<AssignmentOutcome, IngestError> {
    let Some(rule) = store.active_rule(instance_id).await? else {
        tracing::debug!(instance_id = %instance_id, "no active assignment rule");
        return Ok(AssignmentOutcome::Queued);
    };
    let reason = audit_reason(&rule);

    let assigned = match rule.rule_type {
        RuleType::Fixed => match rule.fixed_agent_id.as_deref().filter(|a| !a.is_empty()) {
            Some(agent_id) => {
                let previous = store
                    .assign_conversation(conversation_id, agent_id, &reason)
                    .await?;
                Some((agent_id.to_string(), previous))
            }
            None => None,
        },
        RuleType::RoundRobin => {
            store
                .assign_round_robin(&rule.id, conversation_id, &reason)
                .await?
        }
    };
    let Some((agent_id, previous)) = assigned else {
        tracing::debug!(rule = %rule.name, rule_type = rule.rule_type.as_str(), "assignment rule has no agent to pick");
        return Ok(AssignmentOutcome::Queued);
    };

    tracing::info!(
        conversation_id = %conversation_id,
        agent_id = %agent_id,
        rule = %rule.name,
        "conversation auto-assigned"
    );
    Ok(AssignmentOutcome::Assigned { agent_id, previous })
}
