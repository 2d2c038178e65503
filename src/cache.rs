//! A single-flight cache for values that are expensive to recompute.

use std::{future::Future, time::Duration};

use log::debug;
use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};

use crate::error::{Error, Result};

type Waiter<T> = Box<dyn FnOnce(T) + Send>;

struct CacheState<T> {
    ttl: Duration,
    value: Option<T>,
    expires_at: Option<Instant>,
    refresh: Option<u64>,
    next_refresh: u64,
    waiters: Vec<Waiter<T>>,
}

impl<T: Clone> CacheState<T> {
    fn fresh_value(&self) -> Option<T> {
        match self.expires_at {
            Some(expires_at) if Instant::now() < expires_at => self.value.clone(),
            _ => None,
        }
    }

    fn release_waiters(&mut self) -> Delivery<T> {
        Delivery {
            value: self.value.clone(),
            waiters: std::mem::take(&mut self.waiters),
        }
    }
}

/// Callbacks taken out of the cache, invoked once the lock is released.
#[must_use]
pub(crate) struct Delivery<T> {
    value: Option<T>,
    waiters: Vec<Waiter<T>>,
}

impl<T: Clone> Delivery<T> {
    /// Hands the value to every waiter. Without a value, waiters are dropped.
    pub(crate) fn deliver(self) {
        let Some(value) = self.value else {
            if !self.waiters.is_empty() {
                debug!("dropping {} cache waiters without a value", self.waiters.len());
            }
            return;
        };
        for waiter in self.waiters {
            waiter(value.clone());
        }
    }
}

/// Memoizes an asynchronously computed value for a time-to-live.
///
/// Concurrent lookups of an expired value collapse into a single refresh: the
/// first caller runs it, everyone else is queued and receives the value that
/// the refresh eventually stores with [`ExpiringAsyncCache::set_value`].
pub struct ExpiringAsyncCache<T> {
    state: Mutex<CacheState<T>>,
}

impl<T: Clone + Send + 'static> ExpiringAsyncCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                ttl,
                value: None,
                expires_at: None,
                refresh: None,
                next_refresh: 0,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.state.lock().ttl
    }

    /// Changes the time-to-live used for values stored from now on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.state.lock().ttl = ttl;
    }

    /// Passes the cached value to `callback`, refreshing it first if expired.
    ///
    /// A fresh value is handed over before this function returns. Otherwise
    /// `callback` is queued and `refresh` is awaited, unless another refresh
    /// is already in flight. `refresh` resolves to `true` when a value will be
    /// stored through [`ExpiringAsyncCache::set_value`]; resolving to `false`,
    /// panicking or being dropped aborts the refresh, in which case queued
    /// callbacks get the stale value if there is one.
    pub async fn get<F, Fut, C>(&self, refresh: F, callback: C)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
        C: FnOnce(T) + Send + 'static,
    {
        let id = {
            let mut state = self.state.lock();
            if let Some(value) = state.fresh_value() {
                drop(state);
                callback(value);
                return;
            }
            state.waiters.push(Box::new(callback));
            if state.refresh.is_some() {
                return;
            }
            let id = state.next_refresh;
            state.next_refresh += 1;
            state.refresh = Some(id);
            id
        };

        let mut guard = RefreshGuard {
            cache: self,
            id,
            armed: true,
        };
        if refresh().await {
            guard.armed = false;
        }
    }

    /// Awaits the cached value, refreshing it first if expired.
    pub async fn get_value<F, Fut>(&self, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let (tx, rx) = oneshot::channel();
        self.get(refresh, move |value| {
            let _ = tx.send(value);
        })
        .await;
        rx.await.map_err(|_| Error::RefreshAborted)
    }

    /// Stores `value`, restarts its time-to-live and wakes every queued caller.
    pub fn set_value(&self, value: T) {
        self.store(value).deliver();
    }

    pub(crate) fn store(&self, value: T) -> Delivery<T> {
        let mut state = self.state.lock();
        state.expires_at = Some(Instant::now() + state.ttl);
        state.value = Some(value);
        state.refresh = None;
        state.release_waiters()
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().fresh_value().is_none()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refresh.is_some()
    }

    /// The last stored value, even if it has expired.
    pub fn value_ignoring_ttl(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Forgets the stored value so the next lookup refreshes.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.value = None;
        state.expires_at = None;
    }

    /// Abandons whatever refresh is in flight.
    pub fn cancel_refresh(&self) {
        let delivery = {
            let mut state = self.state.lock();
            if state.refresh.take().is_none() {
                return;
            }
            state.release_waiters()
        };
        debug!("cache refresh cancelled");
        delivery.deliver();
    }

    fn abort_refresh(&self, id: u64) {
        let delivery = {
            let mut state = self.state.lock();
            if state.refresh != Some(id) {
                return;
            }
            state.refresh = None;
            state.release_waiters()
        };
        debug!("cache refresh {} aborted without a value", id);
        delivery.deliver();
    }
}

struct RefreshGuard<'a, T: Clone + Send + 'static> {
    cache: &'a ExpiringAsyncCache<T>,
    id: u64,
    armed: bool,
}

impl<T: Clone + Send + 'static> Drop for RefreshGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abort_refresh(self.id);
        }
    }
}
