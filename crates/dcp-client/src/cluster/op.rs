//! Single-shot completion adaptor.
//!
//! Pairs an agent [`Completion`] with a oneshot receiver so callback-based
//! operations become awaited futures with deadlines.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::cluster::agent::Completion;
use crate::error::DcpError;

/// An in-flight agent operation awaiting its completion.
pub(crate) struct AsyncOp<T> {
    rx: oneshot::Receiver<Result<T, DcpError>>,
}

impl<T: Send + 'static> AsyncOp<T> {
    /// Creates the op and the completion to hand to the agent.
    pub(crate) fn new() -> (Self, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        let cb: Completion<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (Self { rx }, cb)
    }

    /// Awaits the completion, bounded by `deadline` when given.
    pub(crate) async fn wait(self, deadline: Option<Duration>) -> Result<T, DcpError> {
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.rx).await {
                Ok(resolved) => Self::unwrap_resolved(resolved),
                Err(_) => Err(DcpError::Transport(format!(
                    "operation timed out after {limit:?}"
                ))),
            },
            None => Self::unwrap_resolved(self.rx.await),
        }
    }

    fn unwrap_resolved(
        resolved: Result<Result<T, DcpError>, oneshot::error::RecvError>,
    ) -> Result<T, DcpError> {
        resolved.unwrap_or_else(|_| {
            Err(DcpError::Protocol(
                "completion dropped without resolving".into(),
            ))
        })
    }
}
