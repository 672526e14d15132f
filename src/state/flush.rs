//! Per-peer queue flush scheduling.
//!
//! At most one flush task is live per peer. A freshly scheduled task starts
//! after a uniformly random 1..=250 ms delay so a fleet of peers reconnecting
//! at once does not flush in lockstep, then loops on the queue processor's
//! verdict: drop the slot, go again after `min_flush_time`, or back off and
//! drop once the peer has gone quiet past the active-context window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::time::Clock;
use crate::peers::Peer;
use crate::state::{ActivityClock, BoxFuture, StateError};

/// Verdict returned by one pass of the queue processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing left to do; drop the per-peer task slot.
    RemoveProcess,
    /// More work queued; run again after `min_flush_time`.
    Reprocess,
    /// Work remains but the peer cannot take it right now; retry on a
    /// slower cadence, or give up once the peer has gone idle.
    BackoffProcess,
}

/// One pass over a peer's message queue. Implemented by the runtime that
/// owns the queue and the state service.
pub trait QueueProcessor: Send + Sync + 'static {
    fn process<'a>(&'a self, peer: &'a Peer) -> BoxFuture<'a, Result<ProcessResult, StateError>>;
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct FlushInner<C: Clock> {
    clock: C,
    min_flush: Duration,
    active_timeout: Duration,
    activity: Arc<ActivityClock<C>>,
    slots: Mutex<HashMap<Peer, Slot>>,
    generations: AtomicU64,
    processor: Mutex<Option<Arc<dyn QueueProcessor>>>,
}

pub struct FlushScheduler<C: Clock> {
    inner: Arc<FlushInner<C>>,
}

impl<C: Clock> Clone for FlushScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clock> FlushScheduler<C> {
    pub fn new(
        clock: C,
        activity: Arc<ActivityClock<C>>,
        min_flush: Duration,
        active_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                clock,
                min_flush,
                active_timeout,
                activity,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                processor: Mutex::new(None),
            }),
        }
    }

    /// Late-bound because the processor needs the state service, which in
    /// turn holds this scheduler.
    pub fn bind_processor(&self, processor: Arc<dyn QueueProcessor>) {
        *self.inner.processor.lock() = Some(processor);
    }

    /// Ensure a flush task exists for the peer. A live task is left alone.
    pub fn schedule_flush(&self, peer: &Peer) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get(peer) {
            if !slot.handle.is_finished() {
                return;
            }
        }
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let initial_delay = Duration::from_millis(rand::thread_rng().gen_range(1..=250));
        debug!(peer = %peer, ?initial_delay, "scheduling queue flush");
        let inner = Arc::clone(&self.inner);
        let task_peer = peer.clone();
        let handle = tokio::spawn(async move {
            run_flush(inner, task_peer, generation, initial_delay).await;
        });
        slots.insert(peer.clone(), Slot { generation, handle });
    }

    /// Cancel any pending task and drop the slot.
    pub fn unschedule_flush(&self, peer: &Peer) {
        if let Some(slot) = self.inner.slots.lock().remove(peer) {
            slot.handle.abort();
        }
    }

    /// Whether a live flush task currently exists for the peer.
    pub fn is_scheduled(&self, peer: &Peer) -> bool {
        self.inner
            .slots
            .lock()
            .get(peer)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    pub fn shutdown(&self) {
        let mut slots = self.inner.slots.lock();
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

async fn run_flush<C: Clock>(
    inner: Arc<FlushInner<C>>,
    peer: Peer,
    generation: u64,
    initial_delay: Duration,
) {
    inner.clock.sleep(initial_delay).await;
    loop {
        let processor = inner.processor.lock().clone();
        let Some(processor) = processor else {
            break;
        };
        match processor.process(&peer).await {
            Ok(ProcessResult::RemoveProcess) => {
                debug!(peer = %peer, "flush complete, dropping task");
                break;
            }
            Ok(ProcessResult::Reprocess) => {
                inner.clock.sleep(inner.min_flush).await;
            }
            Ok(ProcessResult::BackoffProcess) => {
                let idle = inner
                    .activity
                    .last_received(&peer)
                    .map(|at| inner.clock.now().saturating_duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if idle > inner.active_timeout {
                    debug!(peer = %peer, ?idle, "peer idle past active window, dropping flush");
                    break;
                }
                inner
                    .clock
                    .sleep(inner.min_flush.max(Duration::from_millis(100)))
                    .await;
            }
            Err(err) => {
                warn!(peer = %peer, %err, "queue processor failed, dropping flush task");
                break;
            }
        }
    }
    let mut slots = inner.slots.lock();
    if slots
        .get(&peer)
        .is_some_and(|slot| slot.generation == generation)
    {
        slots.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolVersion;
    use crate::core::time::SystemClock;
    use std::sync::atomic::AtomicUsize;

    fn peer(id: &str) -> Peer {
        Peer::new(id, ProtocolVersion::V1_2)
    }

    struct CountingProcessor {
        calls: AtomicUsize,
        verdicts: Mutex<Vec<ProcessResult>>,
    }

    impl CountingProcessor {
        fn new(verdicts: Vec<ProcessResult>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                verdicts: Mutex::new(verdicts),
            })
        }
    }

    impl QueueProcessor for CountingProcessor {
        fn process<'a>(
            &'a self,
            _peer: &'a Peer,
        ) -> BoxFuture<'a, Result<ProcessResult, StateError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut verdicts = self.verdicts.lock();
                Ok(if verdicts.is_empty() {
                    ProcessResult::RemoveProcess
                } else {
                    verdicts.remove(0)
                })
            })
        }
    }

    fn scheduler() -> FlushScheduler<SystemClock> {
        let clock = SystemClock;
        let activity = Arc::new(ActivityClock::new(clock.clone()));
        FlushScheduler::new(
            clock,
            activity,
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_live_task_per_peer() {
        let scheduler = scheduler();
        let processor = CountingProcessor::new(vec![ProcessResult::Reprocess; 3]);
        scheduler.bind_processor(processor.clone());
        let p = peer("c1");
        scheduler.schedule_flush(&p);
        scheduler.schedule_flush(&p);
        scheduler.schedule_flush(&p);
        assert_eq!(scheduler.slot_count(), 1);

        // Drive the jittered start plus the reprocess cadence to completion.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
        assert!(!scheduler.is_scheduled(&p));
    }

    #[tokio::test(start_paused = true)]
    async fn unschedule_cancels_a_pending_task() {
        let scheduler = scheduler();
        let processor = CountingProcessor::new(vec![]);
        scheduler.bind_processor(processor.clone());
        let p = peer("c1");
        scheduler.schedule_flush(&p);
        scheduler.unschedule_flush(&p);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_scheduled(&p));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_drops_the_task_once_the_peer_goes_quiet() {
        let scheduler = scheduler();
        // The peer never produced traffic, so last_received is unset and the
        // delta counts as zero: backoff keeps rescheduling until the verdict
        // changes.
        let processor = CountingProcessor::new(vec![
            ProcessResult::BackoffProcess,
            ProcessResult::RemoveProcess,
        ]);
        scheduler.bind_processor(processor.clone());
        let p = peer("c1");
        scheduler.schedule_flush(&p);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_scheduled(&p));
    }
}
