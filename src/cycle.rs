//! Bookkeeping of the detection cycle in progress.
//!
//! The monitor owns the only state probe tasks share: the result under
//! construction and the completed-check counter. Callers hold it behind one
//! lock and go through [`CycleMonitor::record`], [`CycleMonitor::complete_check`]
//! and [`CycleMonitor::finalize`]; each cycle yields a [`Finalized`] at most once.

use std::net::IpAddr;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::result::{DetectionResult, Evidence};

/// Identifies one cycle; events carrying an outdated id are ignored.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct CycleId(u64);

struct ActiveCycle {
    id: CycleId,
    planned: usize,
    completed: usize,
    result: DetectionResult,
    last_evidence: Option<Instant>,
    deadline: Instant,
    cancel: CancellationToken,
}

/// The outcome of a finished cycle, handed out exactly once.
#[derive(Debug)]
pub(crate) struct Finalized {
    pub(crate) result: DetectionResult,
    pub(crate) cancel: CancellationToken,
}

/// Whether evidence seen at `seen` belongs to a cycle ending at `deadline`.
///
/// The boundary is inclusive: evidence recorded exactly at the deadline still
/// counts, however late finalization itself runs.
pub(crate) fn evidence_is_current(seen: Instant, deadline: Instant) -> bool {
    seen <= deadline
}

pub(crate) struct CycleMonitor {
    next_id: u64,
    active: Option<ActiveCycle>,
    address: Option<IpAddr>,
}

impl CycleMonitor {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            active: None,
            address: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Switches the target DHCP requests are accepted for.
    pub(crate) fn set_address(&mut self, address: Option<IpAddr>) {
        self.address = address;
    }

    /// Starts a cycle of `planned` checks unless one is already running.
    ///
    /// Only evidence recorded up to `deadline` makes it into the final
    /// result; `cancel` stops the cycle's workers.
    pub(crate) fn begin(
        &mut self,
        address: IpAddr,
        planned: usize,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Option<CycleId> {
        if self.active.is_some() || planned == 0 {
            return None;
        }
        let id = CycleId(self.next_id);
        self.next_id += 1;
        self.set_address(Some(address));
        self.active = Some(ActiveCycle {
            id,
            planned,
            completed: 0,
            result: DetectionResult::not_reachable(address),
            last_evidence: None,
            deadline,
            cancel,
        });
        Some(id)
    }

    /// Adds evidence to the cycle `id` and returns the updated result.
    ///
    /// Returns `None` when `id` is no longer the running cycle.
    pub(crate) fn record(
        &mut self,
        id: CycleId,
        evidence: &Evidence,
        now: Instant,
    ) -> Option<DetectionResult> {
        let cycle = self.active.as_mut().filter(|cycle| cycle.id == id)?;
        cycle.result.record(evidence);
        cycle.last_evidence = Some(now);
        Some(cycle.result.clone())
    }

    /// Counts one finished check of cycle `id`, finalizing after the last one.
    pub(crate) fn complete_check(&mut self, id: CycleId) -> Option<Finalized> {
        let cycle = self.active.as_mut().filter(|cycle| cycle.id == id)?;
        cycle.completed += 1;
        if cycle.completed < cycle.planned {
            return None;
        }
        self.finalize(id)
    }

    /// Ends cycle `id` regardless of outstanding checks.
    pub(crate) fn finalize(&mut self, id: CycleId) -> Option<Finalized> {
        if self.active.as_ref()?.id != id {
            return None;
        }
        let cycle = self.active.take()?;
        let result = match cycle.last_evidence {
            Some(seen) if evidence_is_current(seen, cycle.deadline) => cycle.result,
            _ => DetectionResult::not_reachable(cycle.result.address()),
        };
        Some(Finalized {
            result,
            cancel: cycle.cancel,
        })
    }

    /// Records an observed DHCP request outside of the check protocol.
    ///
    /// Feeds the running cycle if there is one. Otherwise the evidence is
    /// added to `recovered`, the last published value, which the caller
    /// stores back. Returns `None` for addresses other than the target.
    pub(crate) fn observe_dhcp(
        &mut self,
        address: IpAddr,
        recovered: Option<DetectionResult>,
        now: Instant,
    ) -> Option<DetectionResult> {
        if self.address != Some(address) {
            return None;
        }
        let evidence = Evidence::dhcp();
        if let Some(cycle) = self.active.as_mut() {
            cycle.result.record(&evidence);
            cycle.last_evidence = Some(now);
            return Some(cycle.result.clone());
        }
        let mut result = recovered
            .filter(|result| result.address() == address)
            .unwrap_or_else(|| DetectionResult::not_reachable(address));
        result.record(&evidence);
        Some(result)
    }

    /// Drops the running cycle without producing a result.
    pub(crate) fn abandon(&mut self) -> Option<CancellationToken> {
        self.active.take().map(|cycle| cycle.cancel)
    }
}
