use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::task::TaskHandle;

/// A job run on every tick of a repeating schedule.
pub type RepeatingTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs jobs periodically until their handle is cancelled or dropped.
pub trait Scheduler: Send + Sync {
    fn schedule_repeating(
        &self,
        task: RepeatingTask,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle;
}

/// A [`Scheduler`] backed by the current tokio runtime.
///
/// A tick that is due while the previous run is still going is delayed, so
/// runs of one job never overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_repeating(
        &self,
        task: RepeatingTask,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        TaskHandle::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                task().await;
            }
        })
    }
}
