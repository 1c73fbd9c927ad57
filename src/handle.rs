//! Asynchronous handle to a running invocation
//!
//! The invocation task owns a [`HandleWriter`]; callers hold [`ResultHandle`]s.
//! Both sides share one state on a `watch` channel, so waiters are woken on
//! every change instead of polling:
//!
//! ```text
//! invocation task                         caller
//! ───────────────                         ──────
//! push_status(turn) ──┐
//! push_status(...)  ──┼─► HandleState ──► status_stream()  replay from start
//! resolve(outcome)  ──┘   events          summary()        first summary event
//!                         summary         result / .await  terminal outcome
//!                         outcome
//! ```

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::{watch, Notify};

use crate::agent::InvocationError;
use crate::protocol::{StatusMessage, Summary};

#[derive(Debug)]
pub(crate) struct HandleState<T> {
    events: Vec<StatusMessage>,
    summary: Option<Summary>,
    outcome: Option<Result<T, InvocationError>>,
}

impl<T> Default for HandleState<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            summary: None,
            outcome: None,
        }
    }
}

/// Write side, held by the invocation task
pub(crate) struct HandleWriter<T> {
    tx: watch::Sender<HandleState<T>>,
}

impl<T> HandleWriter<T> {
    /// Append a status event. Ignored once the outcome is set.
    pub fn push_status(&self, message: StatusMessage) {
        self.tx.send_modify(|state| {
            if state.outcome.is_some() {
                return;
            }
            if let StatusMessage::Summary(summary) = &message {
                if state.summary.is_none() {
                    state.summary = Some(summary.clone());
                }
            }
            state.events.push(message);
        });
    }

    /// Set the terminal outcome. Returns false if one was already set.
    pub fn resolve(&self, outcome: Result<T, InvocationError>) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            applied = true;
            true
        });
        applied
    }
}

impl<T> Drop for HandleWriter<T> {
    fn drop(&mut self) {
        // A task that dies without resolving must not leave waiters hanging
        self.tx.send_if_modified(|state| {
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(Err(InvocationError::Cancelled));
            true
        });
    }
}

/// Create a connected writer and handle
pub(crate) fn channel<T>(invocation_id: impl Into<String>) -> (HandleWriter<T>, ResultHandle<T>) {
    let (tx, rx) = watch::channel(HandleState::default());
    let handle = ResultHandle {
        invocation_id: invocation_id.into(),
        rx,
        cancel: Arc::new(Notify::new()),
    };
    (HandleWriter { tx }, handle)
}

// ═══════════════════════════════════════════════════════════════════════════
// ResultHandle
// ═══════════════════════════════════════════════════════════════════════════
// Returned as soon as an invocation starts. Cloning is cheap; every clone
// observes the same events and the same outcome.
//
// USAGE:
//   let handle = bridge.investigate(context, None).await?;
//   let mut events = Box::pin(handle.status_stream());
//   while let Some(event) = events.next().await { ... }
//   let analysis = handle.await?;
// ═══════════════════════════════════════════════════════════════════════════

pub struct ResultHandle<T> {
    invocation_id: String,
    rx: watch::Receiver<HandleState<T>>,
    cancel: Arc<Notify>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            invocation_id: self.invocation_id.clone(),
            rx: self.rx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> ResultHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Wait for the terminal outcome
    pub async fn result(&self) -> Result<T, InvocationError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| state.outcome.is_some())
            .await
            .map_err(|_| InvocationError::Cancelled)?;
        state.outcome.clone().unwrap_or(Err(InvocationError::Cancelled))
    }

    /// Wait for the summary event
    ///
    /// Fails with [`InvocationError::NoSummary`] if the invocation ends
    /// without the agent reporting one.
    pub async fn summary(&self) -> Result<Summary, InvocationError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| state.summary.is_some() || state.outcome.is_some())
            .await
            .map_err(|_| InvocationError::NoSummary)?;
        state.summary.clone().ok_or(InvocationError::NoSummary)
    }

    /// Every status event so far
    pub fn events(&self) -> Vec<StatusMessage> {
        self.rx.borrow().events.clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().outcome.is_some()
    }

    /// Ask the invocation to stop. The agent is killed and the handle fails
    /// with [`InvocationError::Cancelled`], unless it already finished.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    pub(crate) fn cancel_signal(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    /// Status events from the beginning, then live until the invocation ends
    pub fn status_stream(&self) -> impl Stream<Item = StatusMessage> + Send + 'static {
        let mut rx = self.rx.clone();
        async_stream::stream! {
            let mut next = 0;
            loop {
                let (batch, done) = {
                    let state = rx.borrow_and_update();
                    (state.events[next..].to_vec(), state.outcome.is_some())
                };
                next += batch.len();
                for event in batch {
                    yield event;
                }
                if done {
                    break;
                }
                if rx.changed().await.is_err() {
                    let rest = rx.borrow().events[next..].to_vec();
                    for event in rest {
                        yield event;
                    }
                    break;
                }
            }
        }
    }
}

impl<T> IntoFuture for ResultHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, InvocationError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

impl<T> std::fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("invocation_id", &self.invocation_id)
            .field("done", &self.rx.borrow().outcome.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn summary_event(turns: u32) -> StatusMessage {
        StatusMessage::Summary(Summary {
            turns,
            ..Summary::default()
        })
    }

    #[tokio::test]
    async fn test_resolve_first_wins() {
        let (writer, handle) = channel::<String>("inv");
        assert!(!handle.is_done());
        assert!(writer.resolve(Ok("first".to_string())));
        assert!(!writer.resolve(Err(InvocationError::ResultNotSet)));
        assert_eq!(handle.result().await.unwrap(), "first");
        assert!(handle.is_done());
    }

    #[tokio::test]
    async fn test_await_wakes_on_resolution() {
        let (writer, handle) = channel::<u32>("inv");
        let waiter = tokio::spawn(handle.clone().into_future());
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.resolve(Ok(7));
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_replay() {
        let (writer, handle) = channel::<()>("inv");
        writer.push_status(StatusMessage::server_started("http://127.0.0.1:1/mcp"));
        writer.push_status(StatusMessage::log("working"));

        let mut stream = Box::pin(handle.status_stream());
        assert_eq!(stream.next().await.map(|e| e.kind()), Some("server_started"));
        assert_eq!(stream.next().await.map(|e| e.kind()), Some("log"));

        writer.push_status(summary_event(2));
        assert_eq!(stream.next().await.map(|e| e.kind()), Some("summary"));

        writer.resolve(Ok(()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_writer_dropped() {
        let (writer, handle) = channel::<()>("inv");
        writer.push_status(StatusMessage::log("only"));
        drop(writer);

        let kinds: Vec<_> = handle.status_stream().map(|e| e.kind()).collect().await;
        assert_eq!(kinds, vec!["log"]);
        assert!(matches!(handle.result().await, Err(InvocationError::Cancelled)));
    }

    #[tokio::test]
    async fn test_summary_resolution() {
        let (writer, handle) = channel::<()>("inv");
        writer.push_status(summary_event(4));
        assert_eq!(handle.summary().await.unwrap().turns, 4);

        let (writer, handle) = channel::<()>("inv2");
        writer.resolve(Err(InvocationError::AgentExited { code: 1 }));
        assert!(matches!(handle.summary().await, Err(InvocationError::NoSummary)));
    }

    #[tokio::test]
    async fn test_events_after_outcome_are_ignored() {
        let (writer, handle) = channel::<()>("inv");
        writer.resolve(Ok(()));
        writer.push_status(StatusMessage::log("late"));
        assert!(handle.events().is_empty());
    }
}
