//! Bounded pool of native execution contexts.
//!
//! The pool is the only concurrency limiter in front of the backend. A
//! semaphore with one permit per slot gives a true async wait for
//! admission. The slot arena and free queue sit behind a single mutex
//! that is only held for bookkeeping, never across a native call.
//!
//! Contexts are created lazily. A checked-out context is moved out of the
//! arena into a [`PooledContext`] guard, so a native handle always has
//! exactly one owner. Dropping the guard releases the context.
//!
//! Creating and destroying contexts are native calls too. Both run on the
//! blocking pool whenever a runtime is present.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{classify, Backend};
use crate::error::{ErrorCode, GenerationError, Result};

/// How long `close` waits for outstanding contexts by default.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// No context; capacity is available for a fresh one.
    Empty,
    /// Reserved by an acquirer while the backend builds a context.
    Creating,
    Free,
    InUse,
}

/// One native execution context bound to the pool's model.
pub struct ManagedContext<C> {
    handle: C,
    slot: usize,
    sequence: u64,
    use_count: u64,
    created_at: Instant,
}

impl<C> ManagedContext<C> {
    /// Position in the pool arena.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Creation order across the pool's lifetime, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// What `reset_one` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// An idle context was destroyed.
    Discarded,
    /// Every context was busy; the next one released will be destroyed.
    Deferred,
    /// Nothing has been created yet.
    Nothing,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: Uuid,
    pub capacity: usize,
    /// Live contexts, including ones being created.
    pub created: usize,
    pub available: usize,
    pub in_use: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub acquire_timeouts: u64,
    /// Contexts ever created by the backend.
    pub total_created: u64,
    pub destroyed: u64,
    pub pending_resets: usize,
    pub closed: bool,
    pub uptime_secs: u64,
}

struct PoolState<C> {
    slots: Vec<SlotState>,
    free: VecDeque<ManagedContext<C>>,
    closed: bool,
    pending_resets: usize,
    /// Sequence of the last context released after a failed call.
    suspect: Option<u64>,
    next_sequence: u64,
    total_acquires: u64,
    total_releases: u64,
    acquire_timeouts: u64,
    total_created: u64,
    destroyed: u64,
}

impl<C> PoolState<C> {
    fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| **s == state).count()
    }

    fn live(&self) -> usize {
        self.slots.len() - self.count(SlotState::Empty)
    }
}

struct PoolInner<B: Backend> {
    id: Uuid,
    backend: Arc<B>,
    model_path: PathBuf,
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<B::Context>>,
    released: Notify,
    close_grace: Duration,
    started_at: Instant,
}

impl<B: Backend> PoolInner<B> {
    fn lock(&self) -> MutexGuard<'_, PoolState<B::Context>> {
        // Bookkeeping stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take back a context from a guard. Runs exactly once per checkout.
    ///
    /// With `in_place` set the caller is already on a thread that may
    /// block, so a discarded context is destroyed right here.
    fn give_back(&self, context: ManagedContext<B::Context>, release: Release) {
        let discarded = {
            let mut state = self.lock();
            state.total_releases += 1;

            let reset = !state.closed && state.pending_resets > 0;
            if reset {
                state.pending_resets -= 1;
            }

            if release.failed {
                state.suspect = Some(context.sequence);
            } else if state.suspect == Some(context.sequence) {
                state.suspect = None;
            }

            if release.broken || reset || state.closed {
                if state.suspect == Some(context.sequence) {
                    state.suspect = None;
                }
                state.slots[context.slot] = SlotState::Empty;
                state.destroyed += 1;
                Some(context)
            } else {
                state.slots[context.slot] = SlotState::Free;
                state.free.push_back(context);
                None
            }
        };

        if let Some(context) = discarded {
            tracing::debug!(
                pool = %self.id,
                slot = context.slot,
                sequence = context.sequence,
                broken = release.broken,
                "Destroying released context"
            );
            if release.in_place {
                self.backend.destroy_context(context.handle);
            } else {
                self.destroy(vec![context]);
            }
        }
        self.released.notify_waiters();
    }

    /// Destroy contexts away from the async executor.
    ///
    /// Inside a runtime the native calls go to the blocking pool and the
    /// returned handle resolves once they are done. Without a runtime they
    /// run on the current thread.
    fn destroy(&self, contexts: Vec<ManagedContext<B::Context>>) -> Option<JoinHandle<()>> {
        if contexts.is_empty() {
            return None;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = Arc::clone(&self.backend);
                Some(runtime.spawn_blocking(move || {
                    for context in contexts {
                        backend.destroy_context(context.handle);
                    }
                }))
            }
            Err(_) => {
                for context in contexts {
                    self.backend.destroy_context(context.handle);
                }
                None
            }
        }
    }
}

/// How a guard hands its context back.
#[derive(Debug, Clone, Copy, Default)]
struct Release {
    broken: bool,
    failed: bool,
    in_place: bool,
}

/// Fixed-capacity pool of contexts for one model.
///
/// Cloning is cheap and shares the same pool.
pub struct ContextPool<B: Backend> {
    inner: Arc<PoolInner<B>>,
}

impl<B: Backend> Clone for ContextPool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> ContextPool<B> {
    /// Create a pool of up to `capacity` contexts for the model at `model_path`.
    ///
    /// No context is created until the first acquire.
    pub fn new(capacity: usize, model_path: impl Into<PathBuf>, backend: Arc<B>) -> Result<Self> {
        Self::with_close_grace(capacity, model_path, backend, DEFAULT_CLOSE_GRACE)
    }

    pub fn with_close_grace(
        capacity: usize,
        model_path: impl Into<PathBuf>,
        backend: Arc<B>,
        close_grace: Duration,
    ) -> Result<Self> {
        if capacity < 1 {
            return Err(GenerationError::invalid_request(
                "context pool capacity must be at least 1",
            ));
        }

        let model_path = model_path.into();
        if !model_path.is_file() {
            return Err(GenerationError::model_not_found(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let id = Uuid::new_v4();
        tracing::info!(
            pool = %id,
            model = %model_path.display(),
            capacity,
            backend = backend.name(),
            "Created context pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                backend,
                model_path,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState {
                    slots: vec![SlotState::Empty; capacity],
                    free: VecDeque::with_capacity(capacity),
                    closed: false,
                    pending_resets: 0,
                    suspect: None,
                    next_sequence: 1,
                    total_acquires: 0,
                    total_releases: 0,
                    acquire_timeouts: 0,
                    total_created: 0,
                    destroyed: 0,
                }),
                released: Notify::new(),
                close_grace,
                started_at: Instant::now(),
            }),
        })
    }

    /// Wait up to `timeout` for a context.
    ///
    /// The timeout covers waiting for a free slot. Creating a fresh context
    /// is a native call and runs to completion once started.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledContext<B>> {
        if self.is_closed() {
            return Err(GenerationError::pool_closed());
        }

        let waiting = Arc::clone(&self.inner.permits).acquire_owned();
        let permit = match tokio::time::timeout(timeout, waiting).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GenerationError::pool_closed()),
            Err(_) => {
                self.inner.lock().acquire_timeouts += 1;
                tracing::warn!(pool = %self.inner.id, ?timeout, "Timed out waiting for a context");
                return Err(GenerationError::timeout(format!(
                    "no context available within {:?}",
                    timeout
                )));
            }
        };

        self.check_out(permit).await
    }

    /// Take a context only if a slot is free right now.
    pub async fn try_acquire(&self) -> Result<PooledContext<B>> {
        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(GenerationError::pool_closed()),
            Err(TryAcquireError::NoPermits) => {
                return Err(GenerationError::timeout("no context available"));
            }
        };

        self.check_out(permit).await
    }

    async fn check_out(&self, permit: OwnedSemaphorePermit) -> Result<PooledContext<B>> {
        // Holding a permit guarantees a free context or an empty slot. A
        // context we create can still be taken by another permit holder
        // before we get back to it, so loop until one is ours.
        loop {
            let (slot, sequence) = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(GenerationError::pool_closed());
                }

                if let Some(mut context) = state.free.pop_front() {
                    state.slots[context.slot] = SlotState::InUse;
                    state.total_acquires += 1;
                    context.use_count += 1;
                    tracing::debug!(
                        pool = %self.inner.id,
                        slot = context.slot,
                        uses = context.use_count,
                        "Acquired context"
                    );
                    return Ok(PooledContext {
                        pool: Arc::clone(&self.inner),
                        context: Some(context),
                        release: Release::default(),
                        _permit: permit,
                    });
                }

                match state.slots.iter().position(|s| *s == SlotState::Empty) {
                    Some(slot) => {
                        state.slots[slot] = SlotState::Creating;
                        let sequence = state.next_sequence;
                        state.next_sequence += 1;
                        (slot, sequence)
                    }
                    None => {
                        tracing::error!(pool = %self.inner.id, "Permit held but no slot available");
                        return Err(GenerationError::generation_failed(
                            "context pool has no free slot",
                        ));
                    }
                }
            };

            self.create_context(slot, sequence).await?;
        }
    }

    /// Build a context in a reserved slot and put it on the free queue.
    ///
    /// The commit happens on the blocking thread, so an acquirer that stops
    /// waiting never strands a reserved slot.
    async fn create_context(&self, slot: usize, sequence: u64) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || {
            let created = inner.backend.create_context(&inner.model_path);
            let mut state = inner.lock();
            match created {
                Ok(handle) => {
                    state.total_created += 1;
                    let context = ManagedContext {
                        handle,
                        slot,
                        sequence,
                        use_count: 0,
                        created_at: Instant::now(),
                    };
                    if state.closed {
                        state.slots[slot] = SlotState::Empty;
                        state.destroyed += 1;
                        drop(state);
                        inner.backend.destroy_context(context.handle);
                        return Err(GenerationError::pool_closed());
                    }
                    state.slots[slot] = SlotState::Free;
                    state.free.push_back(context);
                    tracing::info!(pool = %inner.id, slot, sequence, "Created context");
                    Ok(())
                }
                Err(err) => {
                    state.slots[slot] = SlotState::Empty;
                    drop(state);
                    inner.released.notify_waiters();
                    let err = classify(err);
                    tracing::warn!(pool = %inner.id, slot, error = %err, "Failed to create context");
                    Err(match err.code {
                        ErrorCode::GenerationFailed => {
                            GenerationError::model_load_failed(err.message.clone()).with_cause(err)
                        }
                        _ => err,
                    })
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                // The closure panicked before committing; free the reservation.
                {
                    let mut state = self.inner.lock();
                    if state.slots[slot] == SlotState::Creating {
                        state.slots[slot] = SlotState::Empty;
                    }
                }
                Err(
                    GenerationError::model_load_failed("context creation panicked")
                        .with_cause(join_err),
                )
            }
        }
    }

    /// Discard one context so the next creation starts fresh.
    ///
    /// The idle context that last failed a call goes first. Failing that,
    /// the most recently released one, since a failed call hands its
    /// context back just before recovery asks for a reset.
    pub async fn reset_one(&self) -> ResetOutcome {
        let victim = {
            let mut state = self.inner.lock();
            let suspect = state
                .suspect
                .and_then(|sequence| state.free.iter().position(|c| c.sequence == sequence));
            let picked = match suspect {
                Some(index) => state.free.remove(index),
                None => state.free.pop_back(),
            };
            if let Some(context) = picked {
                if state.suspect == Some(context.sequence) {
                    state.suspect = None;
                }
                state.slots[context.slot] = SlotState::Empty;
                state.destroyed += 1;
                Some(context)
            } else {
                let busy = state.count(SlotState::InUse);
                if busy == 0 {
                    return ResetOutcome::Nothing;
                }
                state.pending_resets = (state.pending_resets + 1).min(busy);
                None
            }
        };

        match victim {
            Some(context) => {
                tracing::info!(
                    pool = %self.inner.id,
                    slot = context.slot,
                    sequence = context.sequence,
                    "Reset idle context"
                );
                self.finish_destroy(vec![context]).await;
                ResetOutcome::Discarded
            }
            None => {
                tracing::info!(pool = %self.inner.id, "All contexts busy, reset deferred to next release");
                ResetOutcome::Deferred
            }
        }
    }

    /// Close the pool.
    ///
    /// New acquires fail with `PoolClosed` immediately. Idle contexts are
    /// destroyed, then this waits up to the grace period for checked-out
    /// contexts. A native call cannot be interrupted, so contexts still out
    /// after the grace period are destroyed whenever their guard is
    /// released instead of here.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.free.drain(..).collect();
            for context in &idle {
                state.slots[context.slot] = SlotState::Empty;
            }
            state.destroyed += idle.len() as u64;
            state.pending_resets = 0;
            idle
        };
        self.inner.permits.close();
        self.finish_destroy(idle).await;

        let deadline = tokio::time::Instant::now() + self.inner.close_grace;
        loop {
            let released = self.inner.released.notified();
            let outstanding = self.in_use();
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                tracing::warn!(
                    pool = %self.inner.id,
                    outstanding,
                    grace = ?self.inner.close_grace,
                    "Closing pool with contexts still checked out"
                );
                break;
            }
        }

        tracing::info!(pool = %self.inner.id, model = %self.inner.model_path.display(), "Closed context pool");
    }

    async fn finish_destroy(&self, contexts: Vec<ManagedContext<B::Context>>) {
        if let Some(task) = self.inner.destroy(contexts) {
            if let Err(err) = task.await {
                tracing::error!(pool = %self.inner.id, error = %err, "Context teardown panicked");
            }
        }
    }

    /// Contexts currently free.
    pub fn size(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Live contexts, free or checked out.
    pub fn created(&self) -> usize {
        self.inner.lock().live()
    }

    /// Contexts currently checked out, computed as `created - size`.
    pub fn in_use(&self) -> usize {
        let state = self.inner.lock();
        state.live() - state.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn model_path(&self) -> &Path {
        &self.inner.model_path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            pool_id: self.inner.id,
            capacity: self.inner.capacity,
            created: state.live(),
            available: state.free.len(),
            in_use: state.count(SlotState::InUse),
            total_acquires: state.total_acquires,
            total_releases: state.total_releases,
            acquire_timeouts: state.acquire_timeouts,
            total_created: state.total_created,
            destroyed: state.destroyed,
            pending_resets: state.pending_resets,
            closed: state.closed,
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
        }
    }
}

/// A checked-out context. Releases back to the pool when dropped.
pub struct PooledContext<B: Backend> {
    pool: Arc<PoolInner<B>>,
    context: Option<ManagedContext<B::Context>>,
    release: Release,
    // Dropped after `Drop::drop` has returned the context, so a woken
    // waiter always finds it.
    _permit: OwnedSemaphorePermit,
}

impl<B: Backend> PooledContext<B> {
    fn managed(&self) -> &ManagedContext<B::Context> {
        match self.context.as_ref() {
            Some(context) => context,
            None => unreachable!("context is only taken on drop"),
        }
    }

    pub fn handle(&self) -> &B::Context {
        &self.managed().handle
    }

    pub fn handle_mut(&mut self) -> &mut B::Context {
        match self.context.as_mut() {
            Some(context) => &mut context.handle,
            None => unreachable!("context is only taken on drop"),
        }
    }

    pub fn slot(&self) -> usize {
        self.managed().slot
    }

    pub fn sequence(&self) -> u64 {
        self.managed().sequence
    }

    pub fn use_count(&self) -> u64 {
        self.managed().use_count
    }

    /// Destroy this context on release instead of recycling it.
    pub fn mark_broken(&mut self) {
        self.release.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.release.broken
    }

    /// Record that the last call on this context failed. A later
    /// `reset_one` discards it ahead of other idle contexts.
    pub fn mark_failed(&mut self) {
        self.release.failed = true;
    }

    /// The guard lives on a thread that may block, such as a
    /// `spawn_blocking` closure. A discarded context is then destroyed on
    /// this thread during release.
    pub fn mark_blocking_thread(&mut self) {
        self.release.in_place = true;
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<B: Backend> Drop for PooledContext<B> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            // A panic mid-call may have left native state half-written.
            let mut release = self.release;
            release.broken |= std::thread::panicking();
            self.pool.give_back(context, release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::backend::NativeCode;
    use crate::test_util::{model_file, wait_until, ScriptedBackend};

    fn pool(capacity: usize) -> (ContextPool<ScriptedBackend>, Arc<ScriptedBackend>, tempfile::NamedTempFile) {
        let model = model_file();
        let backend = Arc::new(ScriptedBackend::new());
        let pool = ContextPool::with_close_grace(
            capacity,
            model.path(),
            Arc::clone(&backend),
            Duration::from_millis(100),
        )
        .unwrap();
        (pool, backend, model)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let model = model_file();
        let result = ContextPool::new(0, model.path(), Arc::new(ScriptedBackend::new()));
        match result {
            Err(err) => assert_eq!(err.code, ErrorCode::InvalidRequest),
            Ok(_) => panic!("Expected InvalidRequest error"),
        }
    }

    #[test]
    fn test_missing_model_rejected() {
        let result = ContextPool::new(1, "/nonexistent/model.gguf", Arc::new(ScriptedBackend::new()));
        match result {
            Err(err) => {
                assert_eq!(err.code, ErrorCode::ModelNotFound);
                assert!(err.message.contains("model.gguf"));
            }
            Ok(_) => panic!("Expected ModelNotFound error"),
        }
    }

    #[tokio::test]
    async fn test_contexts_created_lazily() {
        let (pool, backend, _model) = pool(3);
        assert_eq!(pool.created(), 0);
        assert_eq!(backend.contexts_created(), 0);

        let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.size(), 0);
        assert_eq!(first.sequence(), 1);
        first.release();

        // The released context is reused rather than a new one created.
        let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.sequence(), 1);
        assert_eq!(again.use_count(), 2);
        assert_eq!(backend.contexts_created(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_exhausted() {
        let (pool, _backend, _model) = pool(1);
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let result = pool.acquire(Duration::from_millis(50)).await;
        let elapsed = started.elapsed();

        match result {
            Err(err) => {
                assert_eq!(err.code, ErrorCode::Timeout);
                assert!(err.retryable);
            }
            Ok(_) => panic!("Expected Timeout error"),
        }
        assert!(elapsed >= Duration::from_millis(50), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "returned after {:?}", elapsed);
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (pool, _backend, _model) = pool(1);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.map(|c| c.sequence()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_wait() {
        let (pool, _backend, _model) = pool(1);
        let _held = pool.try_acquire().await.unwrap();
        match pool.try_acquire().await {
            Err(err) => assert_eq!(err.code, ErrorCode::Timeout),
            Ok(_) => panic!("Expected Timeout error"),
        }
    }

    #[tokio::test]
    async fn test_broken_context_replaced() {
        let (pool, backend, _model) = pool(1);
        let mut context = pool.acquire(Duration::from_secs(1)).await.unwrap();
        context.mark_broken();
        context.release();

        assert_eq!(pool.created(), 0);
        assert!(wait_until(Duration::from_secs(1), || backend.contexts_destroyed() == 1).await);

        let fresh = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(fresh.sequence(), 2);
        assert_eq!(fresh.use_count(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_frees_slot() {
        let (pool, backend, _model) = pool(1);
        backend.fail_next_create(BackendError::new(NativeCode::OutOfMemory, "VRAM exhausted"));

        match pool.acquire(Duration::from_secs(1)).await {
            Err(err) => assert_eq!(err.code, ErrorCode::OutOfMemory),
            Ok(_) => panic!("Expected OutOfMemory error"),
        }
        assert_eq!(pool.created(), 0);

        // Capacity is available again.
        let context = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(context.sequence(), 2);
    }

    #[tokio::test]
    async fn test_unclassified_creation_failure_is_load_failure() {
        let (pool, backend, _model) = pool(1);
        backend.fail_next_create(BackendError::message("bad tensor layout"));
        match pool.acquire(Duration::from_secs(1)).await {
            Err(err) => assert_eq!(err.code, ErrorCode::ModelLoadFailed),
            Ok(_) => panic!("Expected ModelLoadFailed error"),
        }
    }

    #[tokio::test]
    async fn test_reset_one_discards_idle_context() {
        let (pool, _backend, _model) = pool(2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        a.release();

        assert_eq!(pool.reset_one().await, ResetOutcome::Discarded);
        assert_eq!(pool.created(), 1);

        // Only `b` is live and busy now, so the next reset is deferred.
        assert_eq!(pool.reset_one().await, ResetOutcome::Deferred);
        b.release();
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.stats().pending_resets, 0);
    }

    #[tokio::test]
    async fn test_reset_discards_most_recently_released() {
        let (pool, backend, _model) = pool(2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        a.release();
        b.release();

        // Oldest idle context is handed out, then returned to the back.
        let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.sequence(), 1);
        first.release();

        assert_eq!(pool.reset_one().await, ResetOutcome::Discarded);
        assert_eq!(backend.destroyed_ids(), vec![1]);

        let survivor = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(survivor.sequence(), 2);
    }

    #[tokio::test]
    async fn test_reset_prefers_context_that_failed() {
        let (pool, backend, _model) = pool(2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        a.release();
        b.release();

        let mut failing = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(failing.sequence(), 1);
        failing.mark_failed();
        failing.release();

        // A healthy call on context 2 moves it behind the failed one.
        let healthy = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(healthy.sequence(), 2);
        healthy.release();

        assert_eq!(pool.reset_one().await, ResetOutcome::Discarded);
        assert_eq!(backend.destroyed_ids(), vec![1]);
        assert_eq!(pool.reset_one().await, ResetOutcome::Discarded);
        assert_eq!(backend.destroyed_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_teardown_runs_off_the_runtime_thread() {
        let (pool, backend, _model) = pool(3);
        let runtime_thread = std::thread::current().id();

        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let mut b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let c = pool.acquire(Duration::from_secs(1)).await.unwrap();
        a.release();
        assert_eq!(pool.reset_one().await, ResetOutcome::Discarded);

        b.mark_broken();
        b.release();
        assert!(wait_until(Duration::from_secs(1), || backend.contexts_destroyed() == 2).await);

        c.release();
        pool.close().await;

        let threads = backend.destroy_threads();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[test]
    fn test_release_without_runtime_destroys_in_place() {
        let (pool, backend, _model) = pool(1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut context = runtime
            .block_on(pool.acquire(Duration::from_secs(1)))
            .unwrap();
        context.mark_broken();
        drop(runtime);

        context.release();
        assert_eq!(backend.contexts_destroyed(), 1);
    }

    #[tokio::test]
    async fn test_reset_on_empty_pool() {
        let (pool, _backend, _model) = pool(2);
        assert_eq!(pool.reset_one().await, ResetOutcome::Nothing);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire_and_accepts_late_release() {
        let (pool, backend, _model) = pool(2);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let idle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        idle.release();

        // Grace period expires with `held` outstanding.
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(backend.contexts_destroyed(), 1);

        match pool.acquire(Duration::from_secs(1)).await {
            Err(err) => {
                assert_eq!(err.code, ErrorCode::PoolClosed);
                assert!(!err.retryable);
            }
            Ok(_) => panic!("Expected PoolClosed error"),
        }

        held.release();
        assert_eq!(pool.created(), 0);
        assert!(wait_until(Duration::from_secs(1), || backend.contexts_destroyed() == 2).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pool, _backend, _model) = pool(1);
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (pool, _backend, _model) = pool(1);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        let result = waiter.await.unwrap();
        match result {
            Err(err) => assert_eq!(err.code, ErrorCode::PoolClosed),
            Ok(_) => panic!("Expected PoolClosed error"),
        }

        held.release();
        closing.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_account_for_every_context() {
        let (pool, _backend, _model) = pool(2);
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let mut b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        b.mark_broken();
        drop(b);
        let c = pool.acquire(Duration::from_secs(1)).await.unwrap();
        a.release();
        pool.reset_one().await;

        let stats = pool.stats();
        assert_eq!(stats.total_created, 3);
        assert_eq!(
            stats.total_created,
            (stats.available + stats.in_use) as u64 + stats.destroyed
        );
        assert_eq!(stats.total_acquires, 3);
        assert_eq!(stats.total_releases, 2);
        drop(c);
    }
}
