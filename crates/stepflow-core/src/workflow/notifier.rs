//! Approval notification port.
//!
//! Notifications are best-effort: they are dispatched on a detached task and
//! their outcome never affects the run.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepflow_types::approval::ApprovalRequested;

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("no webhook url configured")]
    NotConfigured,

    #[error("delivery failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("failed to build request: {0}")]
    Request(String),
}

/// Sends `approval.requested` events somewhere outside the engine.
pub trait ApprovalNotifier: Send + Sync {
    fn notify(
        &self,
        payload: &ApprovalRequested,
    ) -> impl Future<Output = Result<(), NotifierError>> + Send;
}

/// Object-safe version of [`ApprovalNotifier`].
pub trait ApprovalNotifierDyn: Send + Sync {
    fn notify_boxed<'a>(
        &'a self,
        payload: &'a ApprovalRequested,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifierError>> + Send + 'a>>;
}

impl<T: ApprovalNotifier> ApprovalNotifierDyn for T {
    fn notify_boxed<'a>(
        &'a self,
        payload: &'a ApprovalRequested,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifierError>> + Send + 'a>> {
        Box::pin(self.notify(payload))
    }
}

/// Type-erased notifier shared by the scheduler.
pub struct BoxApprovalNotifier {
    inner: Box<dyn ApprovalNotifierDyn + Send + Sync>,
}

impl BoxApprovalNotifier {
    pub fn new<T: ApprovalNotifier + 'static>(notifier: T) -> Self {
        Self {
            inner: Box::new(notifier),
        }
    }

    pub async fn notify(&self, payload: &ApprovalRequested) -> Result<(), NotifierError> {
        self.inner.notify_boxed(payload).await
    }
}

/// Fire-and-forget dispatch on a detached task.
pub fn dispatch(notifier: Arc<BoxApprovalNotifier>, payload: ApprovalRequested) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&payload).await {
            tracing::warn!(
                approval_id = payload.approval_id.as_str(),
                run_id = %payload.run_id,
                error = %e,
                "approval notification failed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use stepflow_types::approval::{approval_id, Approval, ApprovalStatus};
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
        done: Arc<Notify>,
    }

    impl ApprovalNotifier for Recording {
        async fn notify(&self, payload: &ApprovalRequested) -> Result<(), NotifierError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(payload.approval_id.clone());
            }
            self.done.notify_one();
            Err(NotifierError::NotConfigured)
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_detached_and_swallows_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());
        let notifier = Arc::new(BoxApprovalNotifier::new(Recording {
            seen: Arc::clone(&seen),
            done: Arc::clone(&done),
        }));

        let run_id = Uuid::now_v7();
        let approval = Approval {
            id: approval_id(&run_id, "review", 0),
            run_id,
            state_id: "review".to_string(),
            message: "ok?".to_string(),
            summary_path: None,
            approvers: vec![],
            status: ApprovalStatus::Pending,
            timeout_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            comment: None,
            created_at: Utc::now(),
        };
        dispatch(notifier, ApprovalRequested::new(&approval, "http://localhost"));
        done.notified().await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[approval.id]);
    }
}
