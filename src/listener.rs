use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;

use crate::result::DetectionResult;

/// Receives the results of detection cycles.
///
/// Calls arrive one at a time and in order, but on an arbitrary runtime
/// thread. Within a cycle, partial results only ever improve and the final
/// result comes last.
pub trait ResultListener: Send + Sync + 'static {
    /// A probe succeeded; the cycle is still running.
    fn partial_result(&self, result: &DetectionResult);

    /// The cycle ended, either with every check done or by timing out.
    fn final_result(&self, result: &DetectionResult);
}

#[derive(Debug)]
enum Notification {
    Partial(DetectionResult),
    Final(DetectionResult),
}

/// Queues notifications and delivers them to the listener from one task.
///
/// Queuing never blocks, so it is done while the cycle state is locked and
/// the listener sees events in the order they were recorded. The dispatcher
/// drains what is queued and ends once the notifier is dropped.
pub(crate) struct Notifier {
    queue: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub(crate) fn spawn(listener: Arc<dyn ResultListener>) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel();
        tokio::task::spawn(async move {
            while let Some(notification) = pending.recv().await {
                match notification {
                    Notification::Partial(result) => listener.partial_result(&result),
                    Notification::Final(result) => listener.final_result(&result),
                }
            }
        });
        Self { queue }
    }

    pub(crate) fn partial(&self, result: DetectionResult) {
        self.send(Notification::Partial(result));
    }

    pub(crate) fn final_result(&self, result: DetectionResult) {
        self.send(Notification::Final(result));
    }

    fn send(&self, notification: Notification) {
        if let Err(err) = self.queue.send(notification) {
            warn!("result listener is gone, dropping {:?}", err.0);
        }
    }
}
