//! Trigger evaluation.
//!
//! Pure function over an event descriptor and the pipeline's trigger rules.
//! Push events must match a configured branch pattern; pull-request events
//! match any target branch unless the rule restricts them.

use glob_match::glob_match;
use serde::{Deserialize, Serialize};

use crate::pipeline::Trigger;

/// An incoming event that may start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    /// A push to a ref.
    Push { r#ref: String },
    /// A pull request targeting `target_ref`, optionally from `source_ref`.
    PullRequest {
        target_ref: String,
        source_ref: Option<String>,
    },
}

impl TriggerEvent {
    /// The ref a checkout step should clone for this event.
    pub fn checkout_ref(&self) -> &str {
        match self {
            TriggerEvent::Push { r#ref } => r#ref,
            TriggerEvent::PullRequest {
                target_ref,
                source_ref,
            } => source_ref.as_deref().unwrap_or(target_ref),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => "push",
            TriggerEvent::PullRequest { .. } => "pull_request",
        }
    }
}

/// Whether any configured trigger matches the event.
pub fn matches(event: &TriggerEvent, triggers: &[Trigger]) -> bool {
    triggers.iter().any(|t| trigger_matches(event, t))
}

fn trigger_matches(event: &TriggerEvent, trigger: &Trigger) -> bool {
    match (event, trigger) {
        (TriggerEvent::Push { r#ref }, Trigger::Push { branches }) => {
            branches.iter().any(|p| glob_match(p, r#ref))
        }
        (TriggerEvent::PullRequest { target_ref, .. }, Trigger::PullRequest { branches }) => {
            match branches {
                Some(patterns) => patterns.iter().any(|p| glob_match(p, target_ref)),
                None => true,
            }
        }
        _ => false,
    }
}
