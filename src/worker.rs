use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::task::TaskHandle;

/// The set of probe tasks of one detection cycle.
///
/// The group holds exactly one task per planned check and is never reused:
/// cancelling its token (done by cycle finalization) stops every check that
/// is still running.
pub(crate) struct WorkerGroup {
    workers: Vec<TaskHandle>,
}

impl WorkerGroup {
    pub(crate) fn launch(token: &CancellationToken, checks: Vec<BoxFuture<'static, ()>>) -> Self {
        let workers = checks
            .into_iter()
            .map(|check| TaskHandle::spawn_with_token(token.child_token(), check))
            .collect();
        Self { workers }
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to finish or observe cancellation.
    pub(crate) async fn join(self) {
        futures::future::join_all(self.workers.into_iter().map(TaskHandle::join)).await;
    }
}
