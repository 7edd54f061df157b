//! In-progress load markers.
//!
//! A [`LoadTicket`] is the "loading" state of an instance id. Only the caller
//! that created the ticket runs the loader; everyone else waits on it and
//! then re-resolves the id. A failed load hands every waiter a copy of the
//! loading caller's error.

use tokio::sync::watch;

use wasm_sandbox_common::SandboxError;

/// Outcome of a load, as observed by waiters.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// The instance is live.
    Loaded,
    /// The load failed with this error.
    Failed(SandboxError),
}

impl LoadOutcome {
    /// Whether the instance was loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

/// One-shot completion signal for a load.
#[derive(Debug)]
pub struct LoadTicket {
    instance_id: String,
    tx: watch::Sender<Option<LoadOutcome>>,
}

impl LoadTicket {
    /// Create an unfinished ticket for `instance_id`.
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            instance_id: instance_id.into(),
            tx,
        }
    }

    /// The instance being loaded.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record the outcome and wake every waiter.
    ///
    /// Only the first call has an effect; returns whether this call finished
    /// the ticket.
    pub fn finish(&self, outcome: LoadOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// The outcome, if the load has finished.
    pub fn outcome(&self) -> Option<LoadOutcome> {
        self.tx.borrow().clone()
    }

    /// Whether the load has finished.
    pub fn is_finished(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the load to finish.
    pub async fn wait(&self) -> LoadOutcome {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            LoadOutcome::Failed(SandboxError::load_failed(&self.instance_id, "load abandoned"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_waiters_observe_outcome() {
        let ticket = Arc::new(LoadTicket::new("mod-a"));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let ticket = Arc::clone(&ticket);
                tokio::spawn(async move { ticket.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!ticket.is_finished());
        assert!(ticket.finish(LoadOutcome::Failed(SandboxError::compilation_failed("boom"))));

        for waiter in waiters {
            let LoadOutcome::Failed(err) = waiter.await.unwrap() else {
                panic!("expected a failed load");
            };
            assert!(matches!(err, SandboxError::CompilationFailed { .. }));
            assert_eq!(err.to_string(), "Compilation failed: boom");
        }
    }

    #[tokio::test]
    async fn test_finish_is_one_shot() {
        let ticket = LoadTicket::new("mod-a");
        assert_eq!(ticket.instance_id(), "mod-a");

        assert!(ticket.finish(LoadOutcome::Loaded));
        assert!(!ticket.finish(LoadOutcome::Failed(SandboxError::StoreClosed)));
        assert!(ticket.outcome().is_some_and(|outcome| outcome.is_loaded()));

        // Waiting on a finished ticket returns immediately
        assert!(ticket.wait().await.is_loaded());
    }
}
