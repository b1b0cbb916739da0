//! Fixed-capacity pool of rendering contexts
//!
//! The pool owns every context; workers only borrow one through a
//! [`BrowserHandle`] and give it back with [`BrowserPool::release`]. A
//! semaphore with one permit per slot bounds the number of handles out at
//! once, so busy handles never exceed the configured capacity. Unhealthy and
//! long-idle contexts are destroyed and replaced in place, keeping the pool
//! size constant.

use crate::{telemetry, CaptureError, RenderOptions, Viewport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// A live rendering engine context (one browser process for Chrome).
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Loads `target` and returns the raw artifact: PNG bytes, or PDF bytes
    /// when the requested format is PDF.
    async fn capture(
        &self,
        target: &Url,
        options: &RenderOptions,
        viewport: &Viewport,
    ) -> Result<Vec<u8>, CaptureError>;

    /// False once the underlying engine has gone away.
    fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// Builds fresh contexts for pool slots.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self, slot_id: usize) -> Result<Box<dyn RenderContext>, CaptureError>;
}

/// A context sitting in a pool slot, with its usage statistics
pub struct BrowserInstance {
    pub id: usize,
    context: Box<dyn RenderContext>,
    pub last_used: Instant,
    pub capture_count: usize,
}

impl BrowserInstance {
    fn new(id: usize, context: Box<dyn RenderContext>) -> Self {
        Self {
            id,
            context,
            last_used: Instant::now(),
            capture_count: 0,
        }
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    async fn shutdown(self) {
        self.context.close().await;
    }
}

enum IdleSlot {
    Ready(BrowserInstance),
    /// Replacement launch failed; relaunched on next use
    Vacant { id: usize },
}

impl IdleSlot {
    fn id(&self) -> usize {
        match self {
            IdleSlot::Ready(instance) => instance.id,
            IdleSlot::Vacant { id } => *id,
        }
    }
}

/// A context on loan to one worker.
///
/// Give it back with [`BrowserPool::release`]. A handle dropped without
/// release (e.g. its task was cancelled) is recycled as unhealthy.
pub struct BrowserHandle {
    instance: Option<BrowserInstance>,
    permit: Option<OwnedSemaphorePermit>,
    pool: BrowserPool,
}

impl BrowserHandle {
    pub fn slot_id(&self) -> Option<usize> {
        self.instance.as_ref().map(|instance| instance.id)
    }

    pub fn context(&self) -> Option<&dyn RenderContext> {
        self.instance.as_ref().map(|instance| instance.context.as_ref())
    }
}

impl std::fmt::Debug for BrowserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserHandle")
            .field("slot_id", &self.slot_id())
            .finish_non_exhaustive()
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let permit = self.permit.take();

        warn!(
            "Browser handle for slot {} dropped without release, recycling it",
            instance.id
        );

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move {
                    pool.return_instance(instance, permit, false).await;
                });
            }
            Err(_) => {
                // no runtime to relaunch on: retire the slot's permit with it
                if let Some(permit) = permit {
                    permit.forget();
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowserPoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub vacant: usize,
    pub busy: usize,
    pub peak_busy: usize,
    pub recycled: usize,
}

pub struct BrowserPool {
    idle: Arc<Mutex<VecDeque<IdleSlot>>>,
    semaphore: Arc<Semaphore>,
    factory: Arc<dyn BrowserFactory>,
    capacity: usize,
    idle_timeout: Duration,
    busy: Arc<AtomicUsize>,
    peak_busy: Arc<AtomicUsize>,
    recycled: Arc<AtomicUsize>,
    is_shutting_down: Arc<AtomicBool>,
}

impl BrowserPool {
    /// Launches `capacity` contexts up front. Fails if any launch fails.
    pub async fn new(
        factory: Arc<dyn BrowserFactory>,
        capacity: usize,
        idle_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let pool = Self {
            idle: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            semaphore: Arc::new(Semaphore::new(capacity)),
            factory,
            capacity,
            idle_timeout,
            busy: Arc::new(AtomicUsize::new(0)),
            peak_busy: Arc::new(AtomicUsize::new(0)),
            recycled: Arc::new(AtomicUsize::new(0)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        };

        pool.initialize_instances().await?;
        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), CaptureError> {
        let mut idle = self.idle.lock().await;

        for id in 0..self.capacity {
            match self.factory.launch(id).await {
                Ok(context) => {
                    idle.push_back(IdleSlot::Ready(BrowserInstance::new(id, context)));
                    debug!("Browser instance {} created", id);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", id, e);
                    for slot in idle.drain(..) {
                        if let IdleSlot::Ready(instance) = slot {
                            instance.shutdown().await;
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!("Browser pool initialized with {} instances", idle.len());
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrows a context, waiting at most `wait` for one to free up.
    pub async fn acquire(&self, wait: Duration) -> Result<BrowserHandle, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable(
                "browser pool is shutting down".to_string(),
            ));
        }

        let permit = match tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CaptureError::BrowserUnavailable(
                    "browser pool is closed".to_string(),
                ))
            }
            Err(_) => return Err(CaptureError::ResourceExhausted(wait)),
        };

        // a permit guarantees a slot is parked in `idle`
        let slot = self.idle.lock().await.pop_front().ok_or_else(|| {
            CaptureError::BrowserUnavailable("no idle browser slot behind permit".to_string())
        })?;

        let mut instance = match slot {
            IdleSlot::Ready(instance) if instance.context.is_alive() => instance,
            IdleSlot::Ready(instance) => {
                warn!("Browser instance {} died while idle, restarting", instance.id);
                let id = instance.id;
                instance.shutdown().await;
                self.relaunch_or_park(id).await?
            }
            IdleSlot::Vacant { id } => self.relaunch_or_park(id).await?,
        };

        instance.last_used = Instant::now();
        instance.capture_count += 1;

        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_busy.fetch_max(busy, Ordering::SeqCst);
        telemetry::record_pool_usage(busy, self.capacity);

        debug!("Lent browser instance {} ({} busy)", instance.id, busy);
        Ok(BrowserHandle {
            instance: Some(instance),
            permit: Some(permit),
            pool: self.clone(),
        })
    }

    /// Launches a replacement for slot `id` during acquire; on failure the
    /// slot goes back as vacant before the caller's permit is dropped.
    async fn relaunch_or_park(&self, id: usize) -> Result<BrowserInstance, CaptureError> {
        match self.launch(id).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.idle.lock().await.push_back(IdleSlot::Vacant { id });
                Err(CaptureError::BrowserUnavailable(e.to_string()))
            }
        }
    }

    async fn launch(&self, id: usize) -> Result<BrowserInstance, CaptureError> {
        let context = self.factory.launch(id).await?;
        self.recycled.fetch_add(1, Ordering::Relaxed);
        info!("Browser instance {} restarted", id);
        Ok(BrowserInstance::new(id, context))
    }

    /// Returns a borrowed context. An unhealthy one is destroyed and
    /// replaced before its slot becomes available again.
    pub async fn release(&self, mut handle: BrowserHandle, healthy: bool) {
        let Some(instance) = handle.instance.take() else {
            return;
        };
        let permit = handle.permit.take();
        self.return_instance(instance, permit, healthy).await;
    }

    async fn return_instance(
        &self,
        mut instance: BrowserInstance,
        permit: Option<OwnedSemaphorePermit>,
        healthy: bool,
    ) {
        let busy = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        telemetry::record_pool_usage(busy, self.capacity);

        let slot = if healthy && instance.context.is_alive() {
            instance.last_used = Instant::now();
            IdleSlot::Ready(instance)
        } else {
            telemetry::record_browser_recycled("unhealthy");
            self.recycle(instance).await
        };

        self.idle.lock().await.push_back(slot);
        drop(permit);
    }

    async fn recycle(&self, instance: BrowserInstance) -> IdleSlot {
        let id = instance.id;
        debug!("Recycling browser instance {} after {} captures", id, instance.capture_count);
        instance.shutdown().await;

        if self.is_shutting_down.load(Ordering::Relaxed) {
            return IdleSlot::Vacant { id };
        }

        match self.launch(id).await {
            Ok(fresh) => IdleSlot::Ready(fresh),
            Err(e) => {
                error!("Failed to restart browser instance {}: {}", id, e);
                IdleSlot::Vacant { id }
            }
        }
    }

    /// Replaces idle contexts that sat unused past the idle timeout, died, or
    /// are vacant. Returns how many slots were recycled.
    pub async fn recycle_idle(&self) -> usize {
        let mut recycled = 0;

        for _ in 0..self.capacity {
            // hold a permit so the slot counts as taken while it is out of `idle`
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            let stale = {
                let mut idle = self.idle.lock().await;
                let position = idle.iter().position(|slot| match slot {
                    IdleSlot::Ready(instance) => {
                        instance.idle_time() >= self.idle_timeout || !instance.context.is_alive()
                    }
                    IdleSlot::Vacant { .. } => true,
                });
                position.and_then(|index| idle.remove(index))
            };

            let Some(slot) = stale else {
                break;
            };

            let id = slot.id();
            let replacement = match slot {
                IdleSlot::Ready(instance) => {
                    debug!(
                        "Browser instance {} idle for {:?}, recycling",
                        id,
                        instance.idle_time()
                    );
                    telemetry::record_browser_recycled("idle");
                    self.recycle(instance).await
                }
                IdleSlot::Vacant { id } => match self.launch(id).await {
                    Ok(fresh) => IdleSlot::Ready(fresh),
                    Err(e) => {
                        warn!("Vacant browser slot {} still failing to launch: {}", id, e);
                        IdleSlot::Vacant { id }
                    }
                },
            };

            self.idle.lock().await.push_back(replacement);
            drop(permit);
            recycled += 1;
        }

        recycled
    }

    /// Runs [`recycle_idle`](Self::recycle_idle) every `interval` until shutdown.
    pub fn start_idle_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            while !pool.is_shutting_down.load(Ordering::Relaxed) {
                ticker.tick().await;
                if pool.is_shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                let recycled = pool.recycle_idle().await;
                if recycled > 0 {
                    info!("Idle reaper recycled {} browser instances", recycled);
                }
            }
        })
    }

    pub async fn stats(&self) -> BrowserPoolStats {
        let idle = self.idle.lock().await;
        let vacant = idle
            .iter()
            .filter(|slot| matches!(slot, IdleSlot::Vacant { .. }))
            .count();

        BrowserPoolStats {
            capacity: self.capacity,
            idle: idle.len() - vacant,
            vacant,
            busy: self.busy.load(Ordering::SeqCst),
            peak_busy: self.peak_busy.load(Ordering::SeqCst),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    /// Stops lending, waits briefly for loans to come back, then closes
    /// every idle context.
    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let mut retries = 0;
        while self.busy.load(Ordering::SeqCst) > 0 && retries < 50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            retries += 1;
        }
        self.semaphore.close();

        let slots: Vec<IdleSlot> = self.idle.lock().await.drain(..).collect();
        for slot in slots {
            if let IdleSlot::Ready(instance) = slot {
                instance.shutdown().await;
            }
        }

        info!("Browser pool shutdown complete");
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            idle: self.idle.clone(),
            semaphore: self.semaphore.clone(),
            factory: self.factory.clone(),
            capacity: self.capacity,
            idle_timeout: self.idle_timeout,
            busy: self.busy.clone(),
            peak_busy: self.peak_busy.clone(),
            recycled: self.recycled.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct StubContext {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RenderContext for StubContext {
        async fn capture(
            &self,
            _target: &Url,
            _options: &RenderOptions,
            _viewport: &Viewport,
        ) -> Result<Vec<u8>, CaptureError> {
            Ok(vec![1, 2, 3])
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StubFactory {
        launches: AtomicU32,
        closed: Arc<AtomicU32>,
        fail_after: Option<u32>,
        last_alive: std::sync::Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl BrowserFactory for StubFactory {
        async fn launch(&self, _slot_id: usize) -> Result<Box<dyn RenderContext>, CaptureError> {
            let launched = self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| launched >= limit) {
                return Err(CaptureError::BrowserLaunchFailed("stub refused".to_string()));
            }
            let alive = Arc::new(AtomicBool::new(true));
            *self.last_alive.lock().unwrap() = Some(alive.clone());
            Ok(Box::new(StubContext {
                alive,
                closed: self.closed.clone(),
            }))
        }
    }

    async fn pool_with(factory: Arc<StubFactory>, capacity: usize) -> BrowserPool {
        BrowserPool::new(factory, capacity, Duration::from_secs(60))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool_with(Arc::new(StubFactory::default()), 1).await;

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, CaptureError::ResourceExhausted(Duration::from_millis(200)));

        pool.release(handle, true).await;
        assert!(pool.acquire(Duration::from_millis(200)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gets_released_handle() {
        let pool = pool_with(Arc::new(StubFactory::default()), 1).await;
        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.release(handle, true).await;

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.slot_id(), Some(0));
        assert_eq!(pool.stats().await.peak_busy, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_release_replaces_context() {
        let factory = Arc::new(StubFactory::default());
        let pool = pool_with(factory.clone(), 2).await;
        assert_eq!(factory.launches.load(Ordering::SeqCst), 2);

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(handle, false).await;

        assert_eq!(factory.launches.load(Ordering::SeqCst), 3);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.recycled, 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_vacant_slot_then_relaunches() {
        let factory = Arc::new(StubFactory {
            fail_after: Some(1),
            ..Default::default()
        });
        let pool = pool_with(factory.clone(), 1).await;

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(handle, false).await;
        assert_eq!(pool.stats().await.vacant, 1);

        // the slot is still counted: acquire tries to relaunch and reports failure
        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CaptureError::BrowserUnavailable(_)));
        assert_eq!(pool.stats().await.vacant, 1);
        assert_eq!(pool.stats().await.busy, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_context_restarts_on_acquire() {
        let factory = Arc::new(StubFactory::default());
        let pool = pool_with(factory.clone(), 1).await;

        let alive = factory.last_alive.lock().unwrap().clone().unwrap();
        alive.store(false, Ordering::SeqCst);

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(handle.context().unwrap().is_alive());
        assert_eq!(factory.launches.load(Ordering::SeqCst), 2);
        pool.release(handle, true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_instances_are_recycled() {
        let factory = Arc::new(StubFactory::default());
        let pool = BrowserPool::new(factory.clone(), 2, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(pool.recycle_idle().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let busy = pool.acquire(Duration::from_secs(1)).await.unwrap();

        // only the untouched idle slot is stale; the borrowed one is skipped
        assert_eq!(pool.recycle_idle().await, 1);
        assert_eq!(factory.launches.load(Ordering::SeqCst), 3);

        pool.release(busy, true).await;
        assert_eq!(pool.stats().await.idle, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_busy_never_exceeds_capacity() {
        let pool = pool_with(Arc::new(StubFactory::default()), 3).await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let handle = pool.acquire(Duration::from_secs(10)).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    pool.release(handle, true).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats().await;
        assert!(stats.peak_busy <= 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.idle, 3);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_returned() {
        let factory = Arc::new(StubFactory::default());
        let pool = pool_with(factory.clone(), 1).await;

        drop(pool.acquire(Duration::from_secs(1)).await.unwrap());

        // the drop hook recycles on a spawned task
        let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(factory.launches.load(Ordering::SeqCst), 2);
        pool.release(handle, true).await;
    }
}
