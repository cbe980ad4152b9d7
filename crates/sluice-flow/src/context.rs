use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::error::{Result, SluiceError};
use sluice_core::status::FlowNodeStatus;
use sluice_core::types::{BatchId, ContextId, SessionId, TraceId};

use crate::session::FlowSession;

/// The unit of data flowing between nodes.
#[derive(Debug, Clone)]
pub struct FlowContext<T> {
    id: ContextId,
    session: Arc<FlowSession>,
    data: T,
    status: FlowNodeStatus,
    position: String,
    batch_id: Option<BatchId>,
    trace_id: TraceId,
    attempt: u32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<T> FlowContext<T> {
    /// A fresh context in status `NEW`, starting its own trace.
    pub fn new(session: Arc<FlowSession>, data: T, position: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ContextId::new(),
            session,
            data,
            status: FlowNodeStatus::New,
            position: position.into(),
            batch_id: None,
            trace_id: TraceId::new(),
            attempt: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the context carrying `data` to the next node: same session and
    /// trace, fresh id, status `NEW`.
    pub fn generate<R>(&self, data: R, position: impl Into<String>) -> FlowContext<R> {
        let mut next = FlowContext::new(self.session.clone(), data, position);
        next.trace_id = self.trace_id.clone();
        next.batch_id = self.batch_id.clone();
        next
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn session(&self) -> &Arc<FlowSession> {
        &self.session
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn status(&self) -> FlowNodeStatus {
        self.status
    }

    /// Move to `next`. Setting the current status again is a no-op; anything
    /// outside the transition table fails with `IllegalState`.
    pub fn set_status(&mut self, next: FlowNodeStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(SluiceError::IllegalState(format!(
                "context {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn set_position(&mut self, position: impl Into<String>) {
        self.position = position.into();
        self.touch();
    }

    pub fn batch_id(&self) -> Option<&BatchId> {
        self.batch_id.as_ref()
    }

    pub fn set_batch(&mut self, batch: BatchId) {
        self.batch_id = Some(batch);
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn bump_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.touch();
    }

    /// Text of the most recent failure.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.touch();
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl<T: Clone> FlowContext<T> {
    pub fn to_record(&self) -> ContextRecord<T> {
        ContextRecord {
            id: self.id.clone(),
            session_id: self.session.id().clone(),
            trace_id: self.trace_id.clone(),
            batch_id: self.batch_id.clone(),
            status: self.status,
            position: self.position.clone(),
            attempt: self.attempt,
            error: self.error.clone(),
            data: self.data.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Count contexts per owning session, in first-seen order.
pub(crate) fn group_by_session<T>(contexts: &[FlowContext<T>]) -> Vec<(Arc<FlowSession>, usize)> {
    let mut groups: Vec<(Arc<FlowSession>, usize)> = Vec::new();
    for ctx in contexts {
        match groups.iter_mut().find(|(s, _)| Arc::ptr_eq(s, ctx.session())) {
            Some((_, count)) => *count += 1,
            None => groups.push((ctx.session().clone(), 1)),
        }
    }
    groups
}

/// Persisted view of a context, detached from its live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord<T> {
    pub id: ContextId,
    pub session_id: SessionId,
    pub trace_id: TraceId,
    pub batch_id: Option<BatchId>,
    pub status: FlowNodeStatus,
    pub position: String,
    pub attempt: u32,
    pub error: Option<String>,
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> FlowContext<String> {
        FlowContext::new(FlowSession::new(), "payload".to_string(), "source")
    }

    #[test]
    fn test_forward_path() {
        let mut ctx = context();
        for next in [
            FlowNodeStatus::Pending,
            FlowNodeStatus::Ready,
            FlowNodeStatus::Processing,
            FlowNodeStatus::Archived,
        ] {
            ctx.set_status(next).unwrap();
        }
        assert_eq!(ctx.status(), FlowNodeStatus::Archived);
    }

    #[test]
    fn test_backward_move_rejected() {
        let mut ctx = context();
        ctx.set_status(FlowNodeStatus::Pending).unwrap();
        ctx.set_status(FlowNodeStatus::Ready).unwrap();
        let err = ctx.set_status(FlowNodeStatus::Pending).unwrap_err();
        assert!(matches!(err, SluiceError::IllegalState(_)));
        assert_eq!(ctx.status(), FlowNodeStatus::Ready);
    }

    #[test]
    fn test_end_status_is_immutable() {
        let mut ctx = context();
        ctx.set_status(FlowNodeStatus::Terminate).unwrap();
        for next in FlowNodeStatus::ALL {
            if next != FlowNodeStatus::Terminate {
                assert!(ctx.set_status(next).is_err(), "TERMINATE -> {next}");
            }
        }
    }

    #[test]
    fn test_retry_loop() {
        let mut ctx = context();
        for next in [
            FlowNodeStatus::Pending,
            FlowNodeStatus::Ready,
            FlowNodeStatus::Processing,
            FlowNodeStatus::Error,
            FlowNodeStatus::Retryable,
            FlowNodeStatus::Processing,
            FlowNodeStatus::Archived,
        ] {
            ctx.set_status(next).unwrap();
        }
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut ctx = context();
        ctx.set_status(FlowNodeStatus::New).unwrap();
        assert_eq!(ctx.status(), FlowNodeStatus::New);
    }

    #[test]
    fn test_generate_keeps_lineage() {
        let mut ctx = context();
        ctx.set_batch(BatchId::new());
        let next = ctx.generate(42u32, "sink");

        assert_ne!(next.id(), ctx.id());
        assert_eq!(next.trace_id(), ctx.trace_id());
        assert_eq!(next.batch_id(), ctx.batch_id());
        assert_eq!(next.session_id(), ctx.session_id());
        assert_eq!(next.status(), FlowNodeStatus::New);
        assert_eq!(next.position(), "sink");
        assert_eq!(*next.data(), 42);
    }

    #[test]
    fn test_group_by_session() {
        let a = FlowSession::new();
        let b = FlowSession::new();
        let contexts = vec![
            FlowContext::new(a.clone(), 1, "n"),
            FlowContext::new(b.clone(), 2, "n"),
            FlowContext::new(a.clone(), 3, "n"),
        ];
        let groups = group_by_session(&contexts);
        assert_eq!(groups.len(), 2);
        assert!(Arc::ptr_eq(&groups[0].0, &a));
        assert_eq!(groups[0].1, 2);
        assert_eq!(groups[1].1, 1);
    }

    #[test]
    fn test_record_roundtrip_through_json() {
        let mut ctx = context();
        ctx.record_failure("timeout");
        let record = ctx.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: ContextRecord<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.error.as_deref(), Some("timeout"));
    }
}
