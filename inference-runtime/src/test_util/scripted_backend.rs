//! Deterministic stand-in for a native inference library.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use inference_common::{ImageFormat, ImageRequest, StopReason, TextRequest, VisionRequest};

use crate::backend::{Backend, BackendError, BackendResult, GpuMemory, ImageOutput, TextOutput};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// What the next native call does instead of succeeding normally.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Fail(BackendError),
    Panic,
    /// Succeed, but take this long instead of the default latency.
    Delay(Duration),
}

/// Native state held by one scripted context.
#[derive(Debug)]
pub struct ScriptedContext {
    pub id: usize,
    pub calls: u64,
}

/// A backend whose calls follow a script, then succeed.
///
/// Tracks how many calls are running at once so tests can check the
/// admission bound.
pub struct ScriptedBackend {
    latency: Duration,
    available: bool,
    gpu: Option<GpuMemory>,
    script: Mutex<VecDeque<ScriptStep>>,
    create_failures: Mutex<VecDeque<BackendError>>,
    failing_contexts: Mutex<HashMap<usize, BackendError>>,
    stop_reason: Mutex<Option<StopReason>>,
    destroyed_ids: Mutex<Vec<usize>>,
    destroy_threads: Mutex<Vec<ThreadId>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            available: true,
            gpu: None,
            script: Mutex::new(VecDeque::new()),
            create_failures: Mutex::new(VecDeque::new()),
            failing_contexts: Mutex::new(HashMap::new()),
            stop_reason: Mutex::new(None),
            destroyed_ids: Mutex::new(Vec::new()),
            destroy_threads: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Every call blocks its thread for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_gpu_memory(mut self, gpu: GpuMemory) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn push(&self, step: ScriptStep) {
        lock(&self.script).push_back(step);
    }

    /// Fail the next `times` calls with `err`.
    pub fn fail_times(&self, times: usize, err: BackendError) {
        let mut script = lock(&self.script);
        for _ in 0..times {
            script.push_back(ScriptStep::Fail(err.clone()));
        }
    }

    pub fn fail_next_create(&self, err: BackendError) {
        lock(&self.create_failures).push_back(err);
    }

    /// Every call on the context with this id fails with `err`.
    pub fn fail_on_context(&self, id: usize, err: BackendError) {
        lock(&self.failing_contexts).insert(id, err);
    }

    /// The next text call reports `reason` as its stop reason.
    pub fn report_stop_reason(&self, reason: StopReason) {
        *lock(&self.stop_reason) = Some(reason);
    }

    pub fn heal_context(&self, id: usize) {
        lock(&self.failing_contexts).remove(&id);
    }

    /// Native calls made so far, including scripted failures.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls that ran at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn contexts_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Ids of destroyed contexts, in teardown order.
    pub fn destroyed_ids(&self) -> Vec<usize> {
        lock(&self.destroyed_ids).clone()
    }

    /// Threads each `destroy_context` call ran on.
    pub fn destroy_threads(&self) -> Vec<ThreadId> {
        lock(&self.destroy_threads).clone()
    }

    fn run<T>(&self, context: &mut ScriptedContext, output: impl FnOnce() -> T) -> BackendResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        context.calls += 1;
        let _active = ActiveCall::enter(self);

        if let Some(err) = lock(&self.failing_contexts).get(&context.id).cloned() {
            thread::sleep(self.latency);
            return Err(err);
        }
        let step = lock(&self.script).pop_front();
        let latency = match step {
            Some(ScriptStep::Fail(err)) => {
                thread::sleep(self.latency);
                return Err(err);
            }
            Some(ScriptStep::Panic) => panic!("scripted backend panic"),
            Some(ScriptStep::Delay(delay)) => delay,
            None => self.latency,
        };
        thread::sleep(latency);
        Ok(output())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveCall<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveCall<'a> {
    fn enter(backend: &'a ScriptedBackend) -> Self {
        let now = backend.active.fetch_add(1, Ordering::SeqCst) + 1;
        backend.peak_active.fetch_max(now, Ordering::SeqCst);
        Self {
            active: &backend.active,
        }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Backend for ScriptedBackend {
    type Context = ScriptedContext;

    fn name(&self) -> &str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn device_name(&self) -> Option<String> {
        Some("Scripted Device".to_string())
    }

    fn create_context(&self, _model_path: &Path) -> BackendResult<ScriptedContext> {
        if let Some(err) = lock(&self.create_failures).pop_front() {
            return Err(err);
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ScriptedContext { id, calls: 0 })
    }

    fn destroy_context(&self, context: ScriptedContext) {
        lock(&self.destroyed_ids).push(context.id);
        lock(&self.destroy_threads).push(thread::current().id());
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn infer_text(
        &self,
        context: &mut ScriptedContext,
        request: &TextRequest,
    ) -> BackendResult<TextOutput> {
        self.run(context, || {
            let words = request.prompt.split_whitespace().count() as u32;
            TextOutput {
                text: format!("echo: {}", request.prompt),
                prompt_tokens: words,
                tokens_generated: (words + 1).min(request.max_tokens),
                stop_reason: lock(&self.stop_reason).take(),
            }
        })
    }

    fn infer_vision(
        &self,
        context: &mut ScriptedContext,
        request: &VisionRequest,
    ) -> BackendResult<String> {
        self.run(context, || {
            format!("an image of {} bytes: {}", request.image.len(), request.prompt)
        })
    }

    fn generate_image(
        &self,
        context: &mut ScriptedContext,
        request: &ImageRequest,
        seed: i64,
    ) -> BackendResult<ImageOutput> {
        self.run(context, || {
            let mut data = PNG_SIGNATURE.to_vec();
            data.extend_from_slice(&request.width.to_be_bytes());
            data.extend_from_slice(&request.height.to_be_bytes());
            data.extend_from_slice(&seed.to_be_bytes());
            ImageOutput {
                data,
                format: ImageFormat::Png,
                width: request.width,
                height: request.height,
            }
        })
    }

    fn gpu_memory(&self) -> Option<GpuMemory> {
        self.gpu
    }
}
