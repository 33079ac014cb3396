//! Partition ownership state machine.
//!
//! Every partition of a subscription carries an ownership record:
//! - Unassigned: no session reads the partition
//! - Assigned: one session owns the partition
//! - Reassigning: the owner is handing the partition over to `next_session`
//!
//! # State Transitions
//!
//! ```text
//! UNASSIGNED -> ASSIGNED(S) -> REASSIGNING(S, T) -> ASSIGNED(T)
//!                   |                 |
//!                   v                 v
//!              UNASSIGNED        UNASSIGNED
//! ```
//!
//! The rebalancing policy decides which transition to request. Records are
//! always checked for internal consistency; transitions are checked against
//! the stored record when strict transition checking is enabled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{SubscriptionError, SubscriptionResult};

/// Identifies a partition within a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: String,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Ownership state of a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    #[default]
    Unassigned,
    Assigned,
    Reassigning,
}

impl PartitionState {
    /// Name as stored in the coordination store.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Unassigned => "UNASSIGNED",
            PartitionState::Assigned => "ASSIGNED",
            PartitionState::Reassigning => "REASSIGNING",
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNASSIGNED" => Ok(PartitionState::Unassigned),
            "ASSIGNED" => Ok(PartitionState::Assigned),
            "REASSIGNING" => Ok(PartitionState::Reassigning),
            other => Err(format!("unknown partition state '{}'", other)),
        }
    }
}

/// Ownership record of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    key: PartitionKey,
    session: Option<String>,
    next_session: Option<String>,
    state: PartitionState,
}

impl Partition {
    /// Build a record. Consistency is checked when the record is written.
    pub fn new(
        key: PartitionKey,
        session: Option<String>,
        next_session: Option<String>,
        state: PartitionState,
    ) -> Self {
        Self {
            key,
            session,
            next_session,
            state,
        }
    }

    /// A fresh, unowned record.
    pub fn unassigned(key: PartitionKey) -> Self {
        Self::new(key, None, None, PartitionState::Unassigned)
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn next_session(&self) -> Option<&str> {
        self.next_session.as_deref()
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Copy of this record with new ownership fields.
    pub fn to_state(
        &self,
        state: PartitionState,
        session: Option<String>,
        next_session: Option<String>,
    ) -> Self {
        Self::new(self.key.clone(), session, next_session, state)
    }

    /// Check if `session_id` currently owns the partition.
    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.session.as_deref() == Some(session_id)
    }

    /// Check that the ownership fields agree with the state.
    ///
    /// - `session` is `None` exactly when the state is `UNASSIGNED`
    /// - `next_session` is `Some` exactly when the state is `REASSIGNING`
    /// - a partition is never handed over to its current owner
    pub fn validate(&self) -> SubscriptionResult<()> {
        let reason = match (self.state, &self.session, &self.next_session) {
            (PartitionState::Unassigned, None, None) => None,
            (PartitionState::Unassigned, Some(_), _) => {
                Some("unassigned partition cannot have an owner")
            }
            (PartitionState::Unassigned, None, Some(_)) => {
                Some("unassigned partition cannot have a next session")
            }
            (_, None, _) => Some("assigned partition must have an owner"),
            (PartitionState::Assigned, Some(_), None) => None,
            (PartitionState::Assigned, Some(_), Some(_)) => {
                Some("only a reassigning partition has a next session")
            }
            (PartitionState::Reassigning, Some(_), None) => {
                Some("reassigning partition must have a next session")
            }
            (PartitionState::Reassigning, Some(owner), Some(next)) if owner == next => {
                Some("partition cannot be reassigned to its owner")
            }
            (PartitionState::Reassigning, Some(_), Some(_)) => None,
        };
        match reason {
            Some(reason) => Err(SubscriptionError::InconsistentRecord {
                key: self.key.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Check that moving from `self` to `target` is a legal transition.
    pub fn validate_transition(&self, target: &Partition) -> SubscriptionResult<()> {
        if is_legal_transition(self, target) {
            Ok(())
        } else {
            Err(SubscriptionError::IllegalTransition {
                key: self.key.clone(),
                from: self.state,
                to: target.state,
            })
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.key,
            self.state,
            self.session.as_deref().unwrap_or("-"),
            self.next_session.as_deref().unwrap_or("-")
        )
    }
}

/// Both records are assumed to pass [`Partition::validate`].
fn is_legal_transition(current: &Partition, target: &Partition) -> bool {
    use PartitionState::*;

    if current == target {
        return true;
    }
    match (current.state, target.state) {
        (Unassigned, Assigned) => true,
        // Only the owner can start a handover.
        (Assigned, Reassigning) => current.session == target.session,
        // Handover completes to the announced next session.
        (Reassigning, Assigned) => current.next_session == target.session,
        // Retarget a handover that has not completed yet.
        (Reassigning, Reassigning) => current.session == target.session,
        (Assigned | Reassigning, Unassigned) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PartitionKey {
        PartitionKey::new("orders", "0")
    }

    fn assigned(owner: &str) -> Partition {
        Partition::new(
            key(),
            Some(owner.to_string()),
            None,
            PartitionState::Assigned,
        )
    }

    fn reassigning(owner: &str, next: &str) -> Partition {
        Partition::new(
            key(),
            Some(owner.to_string()),
            Some(next.to_string()),
            PartitionState::Reassigning,
        )
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            PartitionState::Unassigned,
            PartitionState::Assigned,
            PartitionState::Reassigning,
        ] {
            assert_eq!(state.as_str().parse::<PartitionState>(), Ok(state));
        }
        assert!("assigned".parse::<PartitionState>().is_err());
    }

    #[test]
    fn test_default_state_is_unassigned() {
        assert_eq!(PartitionState::default(), PartitionState::Unassigned);
        assert!(Partition::unassigned(key()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_records() {
        let owner_without_state = Partition::new(
            key(),
            Some("a".to_string()),
            None,
            PartitionState::Unassigned,
        );
        assert!(owner_without_state.validate().is_err());

        let assigned_without_owner = Partition::new(key(), None, None, PartitionState::Assigned);
        assert!(assigned_without_owner.validate().is_err());

        let next_without_reassigning = Partition::new(
            key(),
            Some("a".to_string()),
            Some("b".to_string()),
            PartitionState::Assigned,
        );
        assert!(next_without_reassigning.validate().is_err());

        let reassigning_without_next = Partition::new(
            key(),
            Some("a".to_string()),
            None,
            PartitionState::Reassigning,
        );
        assert!(reassigning_without_next.validate().is_err());

        assert!(reassigning("a", "a").validate().is_err());
        assert!(reassigning("a", "b").validate().is_ok());
    }

    #[test]
    fn test_legal_transitions() {
        let unassigned = Partition::unassigned(key());

        assert!(unassigned.validate_transition(&assigned("a")).is_ok());
        assert!(assigned("a").validate_transition(&reassigning("a", "b")).is_ok());
        assert!(reassigning("a", "b").validate_transition(&assigned("b")).is_ok());
        assert!(reassigning("a", "b").validate_transition(&reassigning("a", "c")).is_ok());
        assert!(assigned("a").validate_transition(&unassigned).is_ok());
        assert!(reassigning("a", "b").validate_transition(&unassigned).is_ok());
        assert!(assigned("a").validate_transition(&assigned("a")).is_ok());
    }

    #[test]
    fn test_illegal_transitions() {
        let unassigned = Partition::unassigned(key());

        let err = unassigned
            .validate_transition(&reassigning("a", "b"))
            .unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::IllegalTransition {
                from: PartitionState::Unassigned,
                to: PartitionState::Reassigning,
                ..
            }
        ));

        // Direct steal without a handover.
        assert!(assigned("a").validate_transition(&assigned("b")).is_err());
        // Handover started by someone who does not own the partition.
        assert!(assigned("a").validate_transition(&reassigning("c", "b")).is_err());
        // Handover completed to a session other than the announced one.
        assert!(reassigning("a", "b").validate_transition(&assigned("c")).is_err());
    }

    #[test]
    fn test_to_state_keeps_key() {
        let moved = reassigning("a", "b").to_state(
            PartitionState::Assigned,
            Some("b".to_string()),
            None,
        );
        assert_eq!(moved.key(), &key());
        assert!(moved.is_owned_by("b"));
        assert_eq!(moved.next_session(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(reassigning("a", "b").to_string(), "orders/0:REASSIGNING:a:b");
        assert_eq!(
            Partition::unassigned(key()).to_string(),
            "orders/0:UNASSIGNED:-:-"
        );
    }
}
