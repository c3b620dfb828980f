//! Call signaling.
//!
//! Control plane only: a call document per call in `calls`, plus one slot per
//! conversation in `activeCalls` naming its non-ended call. Every transition
//! goes through [`apply`] and is written with a version precondition, so a
//! call that reached `ended` is never written again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use parley_shared::constants::{ACTIVE_CALLS_COLLECTION, CALLS_COLLECTION, CONVERSATIONS_COLLECTION};
use parley_shared::models::{Call, CallKind, CallParticipant, CallStatus, ParticipantState};
use parley_shared::protocol::ConversationDoc;
use parley_shared::types::{CallId, ConversationId, UserId};
use parley_shared::{ChatError, Result};
use parley_transport::docstore::{
    to_data, Direction, Document, DocumentStore, FieldOp, FieldPath, Precondition, Query,
};
use parley_transport::Subscription;

/// Attempts made when a transition loses an optimistic-concurrency race.
const MAX_WRITE_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Join,
    Leave,
    Decline,
    End,
}

impl CallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallAction::Join => "join",
            CallAction::Leave => "leave",
            CallAction::Decline => "decline",
            CallAction::End => "end",
        }
    }
}

/// Apply `action` by `user` to `call`.
///
/// Returns `Ok(None)` when the action changes nothing (leaving, declining or
/// ending a call that already ended). Joining an ended call, or leaving a
/// call one is not part of, is a [`ChatError::CallState`].
pub fn apply(
    call: &Call,
    user: &UserId,
    action: CallAction,
    now: DateTime<Utc>,
) -> Result<Option<Call>> {
    if call.status.is_ended() {
        return match action {
            CallAction::Join => Err(ChatError::call_state(&call.id, "call has ended")),
            _ => Ok(None),
        };
    }

    let mut next = call.clone();
    match action {
        CallAction::Join => {
            set_participant(&mut next, user, ParticipantState::Joined, now);
            next.status = CallStatus::Active;
        }
        CallAction::Leave | CallAction::Decline => {
            if call.participant(user).is_none() {
                return Err(ChatError::call_state(
                    &call.id,
                    format!("{user} is not a participant"),
                ));
            }
            let state = if action == CallAction::Leave {
                ParticipantState::Left
            } else {
                ParticipantState::Declined
            };
            set_participant(&mut next, user, state, now);
            if next.joined_count() == 0 {
                finish(&mut next, now);
            }
        }
        CallAction::End => finish(&mut next, now),
    }
    Ok(Some(next))
}

fn set_participant(call: &mut Call, user: &UserId, state: ParticipantState, now: DateTime<Utc>) {
    match call.participants.iter_mut().find(|p| &p.user_id == user) {
        Some(p) => {
            p.state = state;
            p.updated_at = now;
        }
        None => call.participants.push(CallParticipant {
            user_id: user.clone(),
            state,
            updated_at: now,
        }),
    }
}

fn finish(call: &mut Call, now: DateTime<Utc>) {
    call.status = CallStatus::Ended;
    call.ended_at = Some(now);
    for p in call
        .participants
        .iter_mut()
        .filter(|p| p.state == ParticipantState::Joined)
    {
        p.state = ParticipantState::Left;
        p.updated_at = now;
    }
}

fn decode_call(doc: &Document) -> Result<Call> {
    doc.decode()
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallCoordinator {
    store: Arc<dyn DocumentStore>,
}

impl CallCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get_call(&self, call_id: &CallId) -> Result<Option<Call>> {
        self.store
            .get(CALLS_COLLECTION, call_id.as_str())
            .await?
            .map(|doc| decode_call(&doc))
            .transpose()
    }

    /// Start a ringing call. The initiator is joined, the other conversation
    /// participants are invited.
    pub async fn start_call(
        &self,
        conversation: &ConversationId,
        kind: CallKind,
        initiator: &UserId,
    ) -> Result<CallId> {
        self.clear_stale_slot(conversation).await?;

        let participant_ids = match self
            .store
            .get(CONVERSATIONS_COLLECTION, conversation.as_str())
            .await?
        {
            Some(doc) => doc.decode::<ConversationDoc>()?.participant_ids,
            None => Vec::new(),
        };

        let now = Utc::now();
        let mut participants = vec![CallParticipant {
            user_id: initiator.clone(),
            state: ParticipantState::Joined,
            updated_at: now,
        }];
        participants.extend(
            participant_ids
                .into_iter()
                .filter(|id| id != initiator)
                .map(|user_id| CallParticipant {
                    user_id,
                    state: ParticipantState::Invited,
                    updated_at: now,
                }),
        );

        let call = Call {
            id: CallId::generate(),
            conversation_id: conversation.clone(),
            status: CallStatus::Ringing,
            kind,
            initiator_id: initiator.clone(),
            participants,
            created_at: now,
            ended_at: None,
        };

        let slot = to_data(&json!({ "callId": call.id }))?;
        self.store
            .create(ACTIVE_CALLS_COLLECTION, conversation.as_str(), slot)
            .await
            .map_err(|e| match e {
                ChatError::Conflict(_) => ChatError::call_state(
                    &call.id,
                    format!("conversation {conversation} already has an active call"),
                ),
                other => other,
            })?;

        if let Err(e) = self
            .store
            .set(CALLS_COLLECTION, call.id.as_str(), to_data(&call)?)
            .await
        {
            self.release_slot(conversation, &call.id).await;
            return Err(e);
        }

        info!(
            call_id = %call.id,
            conversation = %conversation,
            kind = ?kind,
            invited = call.participants.len() - 1,
            "Call started"
        );
        Ok(call.id)
    }

    pub async fn join_call(&self, call_id: &CallId, user: &UserId) -> Result<Call> {
        self.transition(call_id, user, CallAction::Join).await
    }

    pub async fn leave_call(&self, call_id: &CallId, user: &UserId) -> Result<Call> {
        self.transition(call_id, user, CallAction::Leave).await
    }

    pub async fn decline_call(&self, call_id: &CallId, user: &UserId) -> Result<Call> {
        self.transition(call_id, user, CallAction::Decline).await
    }

    pub async fn end_call(&self, call_id: &CallId, user: &UserId) -> Result<Call> {
        self.transition(call_id, user, CallAction::End).await
    }

    async fn transition(&self, call_id: &CallId, user: &UserId, action: CallAction) -> Result<Call> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let doc = self
                .store
                .get(CALLS_COLLECTION, call_id.as_str())
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("call {call_id}")))?;
            let call = decode_call(&doc)?;

            let Some(next) = apply(&call, user, action, Utc::now())? else {
                debug!(call_id = %call_id, action = action.as_str(), "Call transition is a no-op");
                return Ok(call);
            };

            let update = vec![
                (FieldPath::from("status"), FieldOp::set(next.status.as_str())),
                (
                    FieldPath::from("participants"),
                    FieldOp::Set(serde_json::to_value(&next.participants)?),
                ),
                (
                    FieldPath::from("endedAt"),
                    FieldOp::Set(serde_json::to_value(next.ended_at)?),
                ),
            ];

            match self
                .store
                .update(
                    CALLS_COLLECTION,
                    call_id.as_str(),
                    update,
                    Precondition::Version(doc.version),
                )
                .await
            {
                Ok(_) => {
                    info!(
                        call_id = %call_id,
                        user = %user,
                        action = action.as_str(),
                        status = next.status.as_str(),
                        "Call updated"
                    );
                    if next.status.is_ended() {
                        self.release_slot(&next.conversation_id, &next.id).await;
                    }
                    return Ok(next);
                }
                Err(ChatError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(call_id = %call_id, attempt, "Call changed underneath us, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ChatError::Conflict(format!("call {call_id}")))
    }

    /// Drop the conversation's slot if the call it names has ended or vanished.
    async fn clear_stale_slot(&self, conversation: &ConversationId) -> Result<()> {
        let Some(slot) = self
            .store
            .get(ACTIVE_CALLS_COLLECTION, conversation.as_str())
            .await?
        else {
            return Ok(());
        };

        if let Some(call_id) = slot.get("callId").and_then(Value::as_str).map(CallId::from) {
            if let Some(call) = self.get_call(&call_id).await? {
                if !call.status.is_ended() {
                    return Err(ChatError::call_state(
                        &call_id,
                        format!("conversation {conversation} already has an active call"),
                    ));
                }
            }
        }

        debug!(conversation = %conversation, "Clearing stale call slot");
        self.store
            .delete(ACTIVE_CALLS_COLLECTION, conversation.as_str())
            .await
    }

    async fn release_slot(&self, conversation: &ConversationId, call_id: &CallId) {
        let slot = match self
            .store
            .get(ACTIVE_CALLS_COLLECTION, conversation.as_str())
            .await
        {
            Ok(slot) => slot,
            Err(e) => {
                warn!(conversation = %conversation, "Could not read call slot: {e}");
                return;
            }
        };
        let names_call = slot
            .as_ref()
            .and_then(|s| s.get("callId"))
            .and_then(Value::as_str)
            == Some(call_id.as_str());
        if names_call {
            if let Err(e) = self
                .store
                .delete(ACTIVE_CALLS_COLLECTION, conversation.as_str())
                .await
            {
                warn!(conversation = %conversation, "Could not release call slot: {e}");
            }
        }
    }

    /// Watch one call. `None` and an ended call both mean "no active call".
    pub fn listen_to_call<F>(&self, call_id: &CallId, mut callback: F) -> Subscription
    where
        F: FnMut(Result<Option<Call>>) + Send + 'static,
    {
        self.store.listen_document(
            CALLS_COLLECTION,
            call_id.as_str(),
            Box::new(move |result| {
                callback(result.and_then(|doc| doc.as_ref().map(decode_call).transpose()))
            }),
        )
    }

    /// Watch the newest call of a conversation.
    pub fn listen_to_conversation_calls<F>(
        &self,
        conversation: &ConversationId,
        mut callback: F,
    ) -> Subscription
    where
        F: FnMut(Result<Option<Call>>) + Send + 'static,
    {
        let query = Query::collection(CALLS_COLLECTION)
            .where_eq("conversationId", conversation.as_str())
            .order_by("createdAt", Direction::Descending)
            .limit(1);
        self.store.listen(
            query,
            Box::new(move |result| {
                callback(result.and_then(|snapshot| {
                    snapshot.documents.first().map(decode_call).transpose()
                }))
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ringing(participants: &[(&str, ParticipantState)]) -> Call {
        let now = Utc::now();
        Call {
            id: CallId::from("call-1"),
            conversation_id: ConversationId::from("c1"),
            status: CallStatus::Ringing,
            kind: CallKind::Audio,
            initiator_id: UserId::from(participants[0].0),
            participants: participants
                .iter()
                .map(|(id, state)| CallParticipant {
                    user_id: UserId::from(*id),
                    state: *state,
                    updated_at: now,
                })
                .collect(),
            created_at: now,
            ended_at: None,
        }
    }

    #[test]
    fn test_join_activates_ringing_call() {
        let call = ringing(&[("a", ParticipantState::Joined), ("b", ParticipantState::Invited)]);
        let next = apply(&call, &UserId::from("b"), CallAction::Join, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.status, CallStatus::Active);
        assert_eq!(next.joined_count(), 2);
    }

    #[test]
    fn test_join_ended_call_is_rejected() {
        let mut call = ringing(&[("a", ParticipantState::Joined)]);
        finish(&mut call, Utc::now());
        let err = apply(&call, &UserId::from("a"), CallAction::Join, Utc::now()).unwrap_err();
        assert!(matches!(err, ChatError::CallState { .. }));
    }

    #[test]
    fn test_end_is_terminal_and_idempotent() {
        let call = ringing(&[("a", ParticipantState::Joined)]);
        let ended = apply(&call, &UserId::from("a"), CallAction::End, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.joined_count(), 0);

        assert!(apply(&ended, &UserId::from("a"), CallAction::End, Utc::now())
            .unwrap()
            .is_none());
        assert!(apply(&ended, &UserId::from("a"), CallAction::Leave, Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_leave_keeps_call_while_someone_remains() {
        let call = ringing(&[("a", ParticipantState::Joined), ("b", ParticipantState::Joined)]);
        let next = apply(&call, &UserId::from("b"), CallAction::Leave, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.status, CallStatus::Ringing);

        let last = apply(&next, &UserId::from("a"), CallAction::Leave, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(last.status, CallStatus::Ended);
    }

    #[test]
    fn test_invitee_decline_does_not_end_call() {
        let call = ringing(&[("a", ParticipantState::Joined), ("b", ParticipantState::Invited)]);
        let next = apply(&call, &UserId::from("b"), CallAction::Decline, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.status, CallStatus::Ringing);
        assert_eq!(
            next.participant(&UserId::from("b")).unwrap().state,
            ParticipantState::Declined
        );
    }

    #[test]
    fn test_sole_participant_decline_ends_call() {
        let call = ringing(&[("a", ParticipantState::Joined)]);
        let next = apply(&call, &UserId::from("a"), CallAction::Decline, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.status, CallStatus::Ended);
    }

    #[test]
    fn test_stranger_cannot_leave() {
        let call = ringing(&[("a", ParticipantState::Joined)]);
        assert!(apply(&call, &UserId::from("z"), CallAction::Leave, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_call_listener_sees_the_end_of_the_call() {
        let store = Arc::new(parley_transport::MemoryStore::new());
        let calls = CallCoordinator::new(store);
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        let id = calls
            .start_call(&ConversationId::from("c1"), CallKind::Video, &a)
            .await
            .unwrap();
        calls.join_call(&id, &b).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = calls.listen_to_call(&id, move |result| {
            let _ = tx.send(result.unwrap().map(|call| call.status));
        });
        assert_eq!(rx.recv().await.unwrap(), Some(CallStatus::Active));

        calls.end_call(&id, &a).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(CallStatus::Ended));

        let err = calls.join_call(&id, &b).await.unwrap_err();
        assert!(matches!(err, ChatError::CallState { .. }));
    }

    #[tokio::test]
    async fn test_call_listener_reports_deleted_call_as_none() {
        let store = Arc::new(parley_transport::MemoryStore::new());
        let calls = CallCoordinator::new(store.clone());
        let id = calls
            .start_call(&ConversationId::from("c1"), CallKind::Audio, &UserId::from("a"))
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = calls.listen_to_call(&id, move |result| {
            let _ = tx.send(result.unwrap().is_some());
        });
        assert!(rx.recv().await.unwrap());

        store.delete(CALLS_COLLECTION, id.as_str()).await.unwrap();
        assert!(!rx.recv().await.unwrap());
    }
}
