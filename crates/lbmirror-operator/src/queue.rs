//! Keyed work queue
//!
//! Turns a stream of trigger keys into reconcile calls with the delivery
//! guarantees the reconcilers rely on:
//!
//! - a key is never reconciled twice at the same time; a trigger that
//!   arrives while the key is in flight marks it dirty and it runs once more
//!   when the current pass finishes
//! - a key that fails with a transient error is handed back after an
//!   exponential backoff; success resets the backoff
//! - independent keys run concurrently, up to a bound
//!
//! When the trigger stream ends, in-flight passes finish and the queue
//! returns. Pending retries are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::pin::pin;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use lbmirror_common::retry::RetryConfig;
use lbmirror_common::Error;

/// Default number of keys reconciled at the same time
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Work queue settings
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum number of keys reconciled at the same time
    pub concurrency: usize,
    /// Backoff for keys whose pass failed
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

/// What to do with a key after its pass finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Nothing more to do until the next trigger
    Done,
    /// A trigger arrived during the pass; the key is queued again
    Requeued,
    /// The pass failed; hand the key back after this many consecutive failures
    RetryAfter(u32),
}

/// Bookkeeping for the keys the queue knows about
#[derive(Debug)]
pub struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    /// Record a trigger for `key`
    pub fn enqueue(&mut self, key: K) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    /// Take the next key to reconcile and mark it in flight
    pub fn next_ready(&mut self) -> Option<K> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Record the end of a pass.
    ///
    /// `retry` is whether a failed pass should be handed back; it is ignored
    /// when the pass succeeded.
    pub fn complete(&mut self, key: &K, succeeded: bool, retry: bool) -> Completion {
        self.in_flight.remove(key);

        let attempts = if succeeded {
            self.failures.remove(key);
            None
        } else {
            let count = self.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            Some(*count)
        };

        if self.dirty.remove(key) {
            self.enqueue(key.clone());
            return Completion::Requeued;
        }

        match attempts {
            Some(n) if retry => Completion::RetryAfter(n),
            _ => Completion::Done,
        }
    }

    /// Number of keys currently being reconciled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of keys waiting to be reconciled
    pub fn ready(&self) -> usize {
        self.ready.len()
    }
}

/// Run `reconcile` for every key produced by `triggers` until the stream ends.
///
/// `controller` names the loop in log lines.
pub async fn run_queue<K, S, F, Fut, T>(
    controller: &'static str,
    triggers: S,
    config: QueueConfig,
    reconcile: F,
) where
    K: Clone + Eq + Hash + Display,
    S: Stream<Item = K>,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    T: Debug,
{
    let concurrency = config.concurrency.max(1);
    let mut triggers = pin!(triggers.fuse());
    let mut state = QueueState::<K>::default();
    let mut running = FuturesUnordered::new();
    let mut retries = FuturesUnordered::new();
    let mut open = true;

    info!(controller, concurrency, "work queue started");

    loop {
        while running.len() < concurrency {
            let Some(key) = state.next_ready() else {
                break;
            };
            let pass = reconcile(key.clone());
            running.push(async move { (key, pass.await) });
        }

        if !open && running.is_empty() {
            break;
        }

        tokio::select! {
            trigger = triggers.next(), if open => match trigger {
                Some(key) => state.enqueue(key),
                None => {
                    open = false;
                    info!(controller, in_flight = state.in_flight(), "trigger stream ended, draining");
                }
            },
            Some((key, result)) = running.next(), if !running.is_empty() => {
                let (succeeded, retry) = match &result {
                    Ok(outcome) => {
                        debug!(controller, key = %key, ?outcome, "reconcile completed");
                        (true, false)
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(controller, key = %key, error = %e, "reconcile failed");
                        (false, true)
                    }
                    Err(e) => {
                        // needs a change to the object or the configuration
                        error!(controller, key = %key, error = %e, "reconcile failed permanently");
                        (false, false)
                    }
                };

                if let Completion::RetryAfter(attempt) = state.complete(&key, succeeded, retry) {
                    let delay = config.retry.delay(attempt);
                    debug!(controller, key = %key, attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
                    retries.push(delayed(key, delay));
                }
            },
            Some(key) = retries.next(), if !retries.is_empty() => state.enqueue(key),
        }
    }

    info!(controller, "work queue stopped");
}

async fn delayed<K>(key: K, delay: Duration) -> K {
    tokio::time::sleep(delay).await;
    key
}
