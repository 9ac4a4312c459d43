//! Background generator of expensive pre-computed parameters with durable
//! persistence, plus the scheduler that pauses generation while a protocol
//! is executing.

use crate::foundation::{BridgeError, Result};
use crate::infrastructure::storage::{PoolElement, PoolPersistence};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

const GENERATOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Allows at most one DKG or signing protocol to be accounted as executing
/// for this operator at a time; while any holder is active, parameter
/// generation pauses to keep CPU available for the protocol.
pub struct ProtocolLatch {
    active: AtomicUsize,
}

impl ProtocolLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { active: AtomicUsize::new(0) })
    }

    pub fn lock(&self) -> ProtocolLatchGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ProtocolLatchGuard { latch: self }
    }

    pub fn is_executing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

pub struct ProtocolLatchGuard<'a> {
    latch: &'a ProtocolLatch,
}

impl Drop for ProtocolLatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scheduler of background computations. Generation works only while no
/// registered protocol latch is held and the scheduler is not stopped.
pub struct Scheduler {
    stop_sender: watch::Sender<bool>,
    latches: Mutex<Vec<Arc<ProtocolLatch>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        let (stop_sender, _) = watch::channel(false);
        Arc::new(Self { stop_sender, latches: Mutex::new(Vec::new()) })
    }

    pub fn register_protocol(&self, latch: Arc<ProtocolLatch>) {
        lock_recovering(&self.latches).push(latch);
    }

    pub fn stop(&self) {
        let _ = self.stop_sender.send(true);
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_sender.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_sender.subscribe().borrow()
    }

    fn any_protocol_executing(&self) -> bool {
        lock_recovering(&self.latches).iter().any(|latch| latch.is_executing())
    }
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Function generating one parameter. Receives the stop signal and may
/// return `None` when cancelled before completion; a `None` result is never
/// added to the pool.
pub type GenerateFn<T> = Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, Option<T>> + Send + Sync>;

/// Bounded pool of pre-computed parameters. All persisted parameters are
/// loaded before the background generator starts; at every quiescent moment
/// the in-memory size equals the persisted size.
pub struct ParameterPool<T: PoolElement> {
    elements: Arc<Mutex<VecDeque<T>>>,
    persistence: Arc<dyn PoolPersistence<T>>,
}

impl<T: PoolElement> ParameterPool<T> {
    pub fn new(
        scheduler: Arc<Scheduler>,
        persistence: Arc<dyn PoolPersistence<T>>,
        target_size: usize,
        generate: GenerateFn<T>,
        generation_delay: Duration,
    ) -> Result<Self> {
        let persisted = persistence.read_all()?;
        info!("parameter pool loaded {} persisted elements, target size {}", persisted.len(), target_size);
        let elements = Arc::new(Mutex::new(VecDeque::from(persisted)));

        let pool = Self { elements: elements.clone(), persistence: persistence.clone() };

        let stop = scheduler.stop_signal();
        tokio::spawn(generator_loop(elements, persistence, target_size, generate, generation_delay, scheduler, stop));

        Ok(pool)
    }

    /// Takes one parameter out of the pool. The parameter is deleted from
    /// persistence before it is handed out; on a persistence failure the
    /// parameter stays pooled and the error is returned.
    pub fn get_now(&self) -> Result<T> {
        let mut elements = lock_recovering(&self.elements);
        let element = elements.pop_front().ok_or(BridgeError::PoolEmpty)?;
        if let Err(err) = self.persistence.delete(&element) {
            elements.push_front(element);
            return Err(err);
        }
        Ok(element)
    }

    pub fn current_size(&self) -> usize {
        lock_recovering(&self.elements).len()
    }
}

async fn generator_loop<T: PoolElement>(
    elements: Arc<Mutex<VecDeque<T>>>,
    persistence: Arc<dyn PoolPersistence<T>>,
    target_size: usize,
    generate: GenerateFn<T>,
    generation_delay: Duration,
    scheduler: Arc<Scheduler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        if scheduler.any_protocol_executing() {
            sleep(GENERATOR_POLL_INTERVAL).await;
            continue;
        }

        if lock_recovering(&elements).len() >= target_size {
            tokio::select! {
                _ = stop.changed() => {}
                _ = sleep(GENERATOR_POLL_INTERVAL) => {}
            }
            continue;
        }

        if let Some(element) = generate(stop.clone()).await {
            if *stop.borrow() {
                break;
            }
            // Persist first; an element that failed to persist is dropped so
            // the pool never holds more than the durable store.
            let mut elements = lock_recovering(&elements);
            match persistence.save(&element) {
                Ok(()) => elements.push_back(element),
                Err(err) => warn!("failed to persist generated parameter: {}", err),
            }
        }

        if !generation_delay.is_zero() {
            tokio::select! {
                _ = stop.changed() => {}
                _ = sleep(generation_delay) => {}
            }
        }
    }

    debug!("parameter generator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::MemoryPoolPersistence;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Param {
        value: u64,
    }

    impl PoolElement for Param {
        fn pool_key(&self) -> String {
            self.value.to_string()
        }
    }

    fn counting_generate() -> GenerateFn<Param> {
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(move |_cancel| {
            let counter = counter.clone();
            Box::pin(async move {
                sleep(Duration::from_millis(2)).await;
                Some(Param { value: counter.fetch_add(1, Ordering::SeqCst) as u64 })
            })
        })
    }

    fn blocking_generate() -> GenerateFn<Param> {
        Arc::new(|mut cancel| {
            Box::pin(async move {
                // Completes only on cancellation and yields nothing.
                while !*cancel.borrow() {
                    if cancel.changed().await.is_err() {
                        break;
                    }
                }
                None
            })
        })
    }

    async fn wait_for_size(pool: &ParameterPool<Param>, size: usize) {
        for _ in 0..500 {
            if pool.current_size() >= size {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("pool did not reach size {}", size);
    }

    #[tokio::test]
    async fn get_now_returns_generated_parameters() {
        let scheduler = Scheduler::new();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool =
            ParameterPool::new(scheduler.clone(), persistence, 5, counting_generate(), Duration::ZERO).expect("pool");

        wait_for_size(&pool, 5).await;
        for _ in 0..5 {
            pool.get_now().expect("parameter available");
        }
        scheduler.stop();
    }

    #[tokio::test]
    async fn get_now_on_empty_pool_fails() {
        let scheduler = Scheduler::new();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool =
            ParameterPool::new(scheduler.clone(), persistence, 5, blocking_generate(), Duration::ZERO).expect("pool");

        let err = pool.get_now().expect_err("pool is empty");
        assert!(matches!(err, BridgeError::PoolEmpty));
        assert_eq!(err.to_string(), "pool is empty");
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_halts_generation() {
        let scheduler = Scheduler::new();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool = ParameterPool::new(scheduler.clone(), persistence, 50_000, counting_generate(), Duration::ZERO)
            .expect("pool");

        sleep(Duration::from_millis(25)).await;
        scheduler.stop();
        sleep(Duration::from_millis(10)).await;

        let size = pool.current_size();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(size, pool.current_size(), "no new parameters may be generated after stop");
    }

    #[tokio::test]
    async fn cancelled_generation_adds_nothing() {
        let scheduler = Scheduler::new();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool = ParameterPool::new(scheduler.clone(), persistence, 50_000, blocking_generate(), Duration::ZERO)
            .expect("pool");

        sleep(Duration::from_millis(25)).await;
        scheduler.stop();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.current_size(), 0);
    }

    #[tokio::test]
    async fn generated_parameters_are_persisted() {
        let scheduler = Scheduler::new();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool = ParameterPool::new(scheduler.clone(), persistence.clone(), 5, counting_generate(), Duration::ZERO)
            .expect("pool");

        wait_for_size(&pool, 5).await;
        scheduler.stop();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.current_size(), persistence.len(), "every pooled element must be persisted");
    }

    #[tokio::test]
    async fn persisted_parameters_load_before_generation() {
        let persistence = Arc::new(MemoryPoolPersistence::new());
        persistence.save(&Param { value: 100 }).expect("seeded");
        persistence.save(&Param { value: 200 }).expect("seeded");

        let scheduler = Scheduler::new();
        let pool = ParameterPool::new(scheduler.clone(), persistence.clone(), 100, blocking_generate(), Duration::ZERO)
            .expect("pool");

        assert_eq!(pool.get_now().expect("first persisted").value, 100);
        assert_eq!(pool.get_now().expect("second persisted").value, 200);
        scheduler.stop();
    }

    #[tokio::test]
    async fn retrieval_deletes_from_persistence() {
        let persistence = Arc::new(MemoryPoolPersistence::new());
        persistence.save(&Param { value: 100 }).expect("seeded");

        let scheduler = Scheduler::new();
        let pool = ParameterPool::new(scheduler.clone(), persistence.clone(), 100, blocking_generate(), Duration::ZERO)
            .expect("pool");

        let element = pool.get_now().expect("parameter");
        assert!(!persistence.contains_key(&element.pool_key()), "element must be deleted from persistence");
        scheduler.stop();
    }

    #[tokio::test]
    async fn generation_pauses_while_a_protocol_executes() {
        let scheduler = Scheduler::new();
        let latch = ProtocolLatch::new();
        scheduler.register_protocol(latch.clone());

        let guard = latch.lock();
        let persistence = Arc::new(MemoryPoolPersistence::new());
        let pool =
            ParameterPool::new(scheduler.clone(), persistence, 5, counting_generate(), Duration::ZERO).expect("pool");

        sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.current_size(), 0, "generation must pause under the latch");

        drop(guard);
        wait_for_size(&pool, 1).await;
        scheduler.stop();
    }
}
