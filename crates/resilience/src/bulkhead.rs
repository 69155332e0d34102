//! Bulkhead limiting concurrent calls per dependency tier.
//!
//! Admission rules:
//! - a free permit is taken immediately, without queuing
//! - otherwise the caller queues, unless `queue_size` callers are already waiting,
//!   in which case the rejection policy applies
//! - a queued caller waits at most `timeout` for a permit, and the guarded call runs
//!   under whatever remains of that same budget

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{ResilienceError, Result};

/// Priority class of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BulkheadTier {
    /// Small pool, short timeout, fail fast.
    Critical,
    /// Default tier.
    #[default]
    Standard,
    /// Small pool, short timeout, first to shed load.
    Optional,
}

impl BulkheadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkheadTier::Critical => "critical",
            BulkheadTier::Standard => "standard",
            BulkheadTier::Optional => "optional",
        }
    }
}

impl std::fmt::Display for BulkheadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to a caller that finds the queue full.
///
/// `Queue` and `CallerRuns` behave like `Abort` once the bound is hit: the queue
/// bound is a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RejectionPolicy {
    #[default]
    Abort,
    /// Return `None` instead of an error.
    Discard,
    Queue,
    CallerRuns,
}

/// Bulkhead configuration.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub timeout: Duration,
    pub rejection_policy: RejectionPolicy,
}

impl BulkheadConfig {
    pub fn new(max_concurrent: usize, queue_size: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent,
            queue_size,
            timeout,
            rejection_policy: RejectionPolicy::Abort,
        }
    }

    /// Default limits for a tier.
    pub fn for_tier(tier: BulkheadTier) -> Self {
        match tier {
            BulkheadTier::Critical => Self::new(10, 5, Duration::from_secs(1)),
            BulkheadTier::Standard => Self::new(25, 50, Duration::from_secs(10)),
            BulkheadTier::Optional => Self::new(4, 4, Duration::from_secs(2)),
        }
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }
}

/// Running statistics. Advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub tier: BulkheadTier,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub active: usize,
    pub queued: usize,
    pub max_active_seen: usize,
    pub max_queued_seen: usize,
    pub rejected: u64,
    pub timed_out: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Decrements a counter when dropped, covering success, failure and cancellation.
struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrency limiter for one (dependency, tier) pair.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    tier: BulkheadTier,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    max_active_seen: AtomicUsize,
    max_queued_seen: AtomicUsize,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, tier: BulkheadTier, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            tier,
            config,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            max_active_seen: AtomicUsize::new(0),
            max_queued_seen: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Creates a bulkhead with the tier's default limits.
    pub fn for_tier(name: impl Into<String>, tier: BulkheadTier) -> Self {
        Self::new(name, tier, BulkheadConfig::for_tier(tier))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> BulkheadTier {
        self.tier
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Runs `f` once a permit is available.
    ///
    /// The wait plus the call are bounded by the smaller of `timeout` and the
    /// configured timeout. Returns `Ok(None)` only when the call was shed under
    /// [`RejectionPolicy::Discard`].
    pub async fn execute<F, Fut, T, E>(&self, f: F, timeout: Option<Duration>) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let budget = timeout.map_or(self.config.timeout, |t| t.min(self.config.timeout));
        let deadline = Instant::now() + budget;

        let _permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match self.wait_for_permit(deadline, budget).await? {
                Some(permit) => permit,
                None => return Ok(None),
            },
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = CountGuard(&self.active);
        self.max_active_seen.fetch_max(now_active, Ordering::SeqCst);

        let result = match tokio::time::timeout_at(deadline, f()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ResilienceError::Timeout { after: budget }),
        };

        match &result {
            Ok(_) => self.successful.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result.map(Some)
    }

    async fn wait_for_permit(
        &self,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let queue_size = self.config.queue_size;
        let admitted = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                (q < queue_size).then_some(q + 1)
            });
        let now_queued = match admitted {
            Ok(previous) => previous + 1,
            Err(_) => return self.reject(),
        };
        let _queued = CountGuard(&self.queued);
        self.max_queued_seen.fetch_max(now_queued, Ordering::SeqCst);

        match tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Some(permit)),
            Ok(Err(_closed)) => self.reject(),
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    "bulkhead_timeouts_total",
                    "name" => self.name.clone(),
                    "tier" => self.tier.as_str()
                )
                .increment(1);
                tracing::warn!(bulkhead = %self.name, tier = %self.tier, ?budget, "bulkhead wait timed out");
                Err(ResilienceError::BulkheadTimeout {
                    name: self.name.clone(),
                    timeout: budget,
                })
            }
        }
    }

    fn reject<T>(&self) -> Result<Option<T>> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "bulkhead_rejections_total",
            "name" => self.name.clone(),
            "tier" => self.tier.as_str()
        )
        .increment(1);
        tracing::warn!(bulkhead = %self.name, tier = %self.tier, policy = ?self.config.rejection_policy, "bulkhead full");
        match self.config.rejection_policy {
            RejectionPolicy::Discard => Ok(None),
            RejectionPolicy::Abort | RejectionPolicy::Queue | RejectionPolicy::CallerRuns => {
                Err(ResilienceError::BulkheadFull {
                    name: self.name.clone(),
                    tier: self.tier,
                })
            }
        }
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.name.clone(),
            tier: self.tier,
            max_concurrent: self.config.max_concurrent,
            queue_size: self.config.queue_size,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max_active_seen: self.max_active_seen.load(Ordering::SeqCst),
            max_queued_seen: self.max_queued_seen.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifiedError;

    /// Spawns a call that holds its permit until `gate` gets a permit.
    fn spawn_held(
        bulkhead: &Arc<Bulkhead>,
        gate: &Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<Result<Option<u32>>> {
        let bulkhead = bulkhead.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            bulkhead
                .execute(
                    || async move {
                        let _ = gate.acquire().await;
                        Ok::<u32, ClassifiedError>(7)
                    },
                    None,
                )
                .await
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_abort_rejects_beyond_capacity() {
        let bulkhead = Arc::new(Bulkhead::new(
            "inventory",
            BulkheadTier::Critical,
            BulkheadConfig::new(2, 0, Duration::from_secs(5)),
        ));
        let gate = Arc::new(Semaphore::new(0));

        let first = spawn_held(&bulkhead, &gate);
        let second = spawn_held(&bulkhead, &gate);
        settle().await;
        assert_eq!(bulkhead.stats().active, 2);

        let third = bulkhead
            .execute(|| async { Ok::<u32, ClassifiedError>(1) }, None)
            .await;
        assert!(matches!(third, Err(ResilienceError::BulkheadFull { .. })));

        gate.add_permits(2);
        assert_eq!(first.await.unwrap().unwrap(), Some(7));
        assert_eq!(second.await.unwrap().unwrap(), Some(7));

        let stats = bulkhead.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.max_active_seen, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.successful, 2);
    }

    #[tokio::test]
    async fn test_discard_returns_none() {
        let bulkhead = Arc::new(Bulkhead::new(
            "notification",
            BulkheadTier::Optional,
            BulkheadConfig::new(1, 0, Duration::from_secs(5))
                .with_rejection_policy(RejectionPolicy::Discard),
        ));
        let gate = Arc::new(Semaphore::new(0));
        let held = spawn_held(&bulkhead, &gate);
        settle().await;

        let shed = bulkhead
            .execute(|| async { Ok::<u32, ClassifiedError>(1) }, None)
            .await
            .unwrap();
        assert_eq!(shed, None);

        gate.add_permits(1);
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_queue_policy_still_bounded() {
        let bulkhead = Arc::new(Bulkhead::new(
            "shipping",
            BulkheadTier::Standard,
            BulkheadConfig::new(1, 1, Duration::from_secs(5))
                .with_rejection_policy(RejectionPolicy::Queue),
        ));
        let gate = Arc::new(Semaphore::new(0));

        let running = spawn_held(&bulkhead, &gate);
        settle().await;
        let waiting = spawn_held(&bulkhead, &gate);
        settle().await;
        assert_eq!(bulkhead.stats().queued, 1);

        let overflow = bulkhead
            .execute(|| async { Ok::<u32, ClassifiedError>(1) }, None)
            .await;
        assert!(matches!(overflow, Err(ResilienceError::BulkheadFull { .. })));

        gate.add_permits(2);
        assert_eq!(running.await.unwrap().unwrap(), Some(7));
        assert_eq!(waiting.await.unwrap().unwrap(), Some(7));
        assert_eq!(bulkhead.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_times_out() {
        let bulkhead = Arc::new(Bulkhead::new(
            "payment",
            BulkheadTier::Critical,
            BulkheadConfig::new(1, 1, Duration::from_millis(100)),
        ));
        let gate = Arc::new(Semaphore::new(0));
        let _held = spawn_held(&bulkhead, &gate);
        settle().await;

        let result = bulkhead
            .execute(
                || async { Ok::<u32, ClassifiedError>(1) },
                Some(Duration::from_millis(50)),
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::BulkheadTimeout { .. })));
        let stats = bulkhead.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_runs_under_same_budget() {
        let bulkhead = Bulkhead::new(
            "payment",
            BulkheadTier::Standard,
            BulkheadConfig::new(1, 0, Duration::from_millis(100)),
        );

        let result = bulkhead
            .execute(
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<u32, ClassifiedError>(1)
                },
                None,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        let stats = bulkhead.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_timeout_cannot_exceed_configured() {
        let bulkhead = Bulkhead::for_tier("payment", BulkheadTier::Critical);

        let result = bulkhead
            .execute(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<u32, ClassifiedError>(1)
                },
                Some(Duration::from_secs(30)),
            )
            .await;

        match result {
            Err(ResilienceError::Timeout { after }) => assert_eq!(after, Duration::from_secs(1)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_capacity_admits_nothing() {
        let bulkhead = Bulkhead::new(
            "mailer",
            BulkheadTier::Optional,
            BulkheadConfig::new(0, 0, Duration::from_secs(1))
                .with_rejection_policy(RejectionPolicy::Discard),
        );
        let calls = AtomicUsize::new(0);

        let result = bulkhead
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, ClassifiedError>(1)
                },
                None,
            )
            .await;

        assert!(matches!(result, Ok(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = bulkhead.stats();
        assert_eq!(stats.max_active_seen, 0);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_hold_under_load() {
        let bulkhead = Arc::new(Bulkhead::new(
            "inventory",
            BulkheadTier::Standard,
            BulkheadConfig::new(3, 5, Duration::from_secs(30)),
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let bulkhead = bulkhead.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    bulkhead
                        .execute(
                            || async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok::<(), ClassifiedError>(())
                            },
                            None,
                        )
                        .await
                })
            })
            .collect();

        let results = futures_util::future::join_all(tasks).await;
        let completed = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(Some(())))))
            .count();

        let stats = bulkhead.stats();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(stats.max_active_seen <= 3);
        assert!(stats.max_queued_seen <= 5);
        assert_eq!(completed as u64, stats.successful);
        assert_eq!(stats.successful + stats.rejected, 50);
    }

    #[test]
    fn test_tier_defaults() {
        let critical = BulkheadConfig::for_tier(BulkheadTier::Critical);
        let standard = BulkheadConfig::for_tier(BulkheadTier::Standard);
        let optional = BulkheadConfig::for_tier(BulkheadTier::Optional);
        assert!(critical.max_concurrent < standard.max_concurrent);
        assert!(optional.max_concurrent < standard.max_concurrent);
        assert!(critical.timeout < standard.timeout);
        assert!(optional.timeout < standard.timeout);
        assert_eq!(standard.rejection_policy, RejectionPolicy::Abort);
        assert_eq!(BulkheadTier::default(), BulkheadTier::Standard);
    }
}
