use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned background future that stops when cancelled or dropped.
///
/// Must be created from within a tokio runtime.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_token(CancellationToken::new(), future)
    }

    pub(crate) fn spawn_with_token<F>(token: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let child = token.clone();
        let handle = tokio::task::spawn(async move {
            tokio::select! {
                _ = future => {},
                _ = child.cancelled() => {},
            }
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Stops the task at its next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Waits until the task has run to completion or observed cancellation.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}
