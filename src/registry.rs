//! The handler registry: lifecycle singletons, named/default job handlers,
//! and public-endpoint handlers, each resolved by name at call time.
//!
//! Registration is not thread-safe and must complete before `run()`; the
//! registry is effectively immutable afterwards (§4.7, §9 "frozen at
//! `run()`").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{Context, JobResult};
use crate::error::JobError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a registered handler should be invoked: on the async executor
/// directly, or dispatched to the blocking worker pool (§9 "async/blocking
/// mix in handlers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerShape {
    Async,
    Blocking,
}

/// A registered job handler: either shape, type-erased behind a boxed
/// future so the registry can store both uniformly.
pub trait JobHandler: Send + Sync {
    fn shape(&self) -> HandlerShape;
    fn call(&self, ctx: Context, payload: Value) -> BoxFuture<'static, Result<JobResult, String>>;
}

struct AsyncJobHandler<F>(F);
impl<F, Fut> JobHandler for AsyncJobHandler<F>
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobResult, String>> + Send + 'static,
{
    fn shape(&self) -> HandlerShape {
        HandlerShape::Async
    }
    fn call(&self, ctx: Context, payload: Value) -> BoxFuture<'static, Result<JobResult, String>> {
        Box::pin((self.0)(ctx, payload))
    }
}

struct BlockingJobHandler<F>(Arc<F>);
impl<F> JobHandler for BlockingJobHandler<F>
where
    F: Fn(Context, Value) -> Result<JobResult, String> + Send + Sync + 'static,
{
    fn shape(&self) -> HandlerShape {
        HandlerShape::Blocking
    }
    fn call(&self, ctx: Context, payload: Value) -> BoxFuture<'static, Result<JobResult, String>> {
        let handler = self.0.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || handler(ctx, payload))
                .await
                .unwrap_or_else(|e| Err(format!("handler panicked: {e}")))
        })
    }
}

/// A registered lifecycle hook (`on_startup`, `on_ready`, `on_cleanup`):
/// the `(ctx) -> result` shape from §9.
pub trait LifecycleHandler: Send + Sync {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<(), String>>;
}

struct AsyncLifecycleHandler<F>(F);
impl<F, Fut> LifecycleHandler for AsyncLifecycleHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<(), String>> {
        Box::pin((self.0)(ctx))
    }
}

/// The `on_weights` singleton: computes weights from the current state.
pub trait WeightsHandler: Send + Sync {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Value, String>>;
}

struct AsyncWeightsHandler<F>(F);
impl<F, Fut> WeightsHandler for AsyncWeightsHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Value, String>> {
        Box::pin((self.0)(ctx))
    }
}

/// A registered `/sdk/public/{name}` handler.
pub trait PublicHandler: Send + Sync {
    fn call(&self, ctx: Context, payload: Value) -> BoxFuture<'static, Result<Value, String>>;
}

struct AsyncPublicHandler<F>(F);
impl<F, Fut> PublicHandler for AsyncPublicHandler<F>
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    fn call(&self, ctx: Context, payload: Value) -> BoxFuture<'static, Result<Value, String>> {
        Box::pin((self.0)(ctx, payload))
    }
}

/// Process-scoped registry of every handler the runtime may invoke.
/// Constructed explicitly in `main` and threaded into the orchestrator and
/// executor rather than kept as an ambient global (§9).
#[derive(Default)]
pub struct HandlerRegistry {
    on_startup: Option<Arc<dyn LifecycleHandler>>,
    on_ready: Option<Arc<dyn LifecycleHandler>>,
    on_cleanup: Option<Arc<dyn LifecycleHandler>>,
    on_weights: Option<Arc<dyn WeightsHandler>>,
    named_jobs: HashMap<String, Arc<dyn JobHandler>>,
    default_job: Option<Arc<dyn JobHandler>>,
    public_handlers: HashMap<String, Arc<dyn PublicHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration functions return `&mut Self` unchanged after recording
    /// the handler, mirroring the decorator-style registration of the
    /// source corpus without reproducing its "return the function itself"
    /// surface literally (§9).
    pub fn register_startup<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_startup = Some(Arc::new(AsyncLifecycleHandler(handler)));
        self
    }

    pub fn register_ready<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_ready = Some(Arc::new(AsyncLifecycleHandler(handler)));
        self
    }

    pub fn register_cleanup<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_cleanup = Some(Arc::new(AsyncLifecycleHandler(handler)));
        self
    }

    pub fn register_weights<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.on_weights = Some(Arc::new(AsyncWeightsHandler(handler)));
        self
    }

    /// Register a named async job handler.
    pub fn register_job<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult, String>> + Send + 'static,
    {
        self.named_jobs
            .insert(name.into(), Arc::new(AsyncJobHandler(handler)));
        self
    }

    /// Register a named blocking job handler, dispatched to the blocking
    /// worker pool per invocation.
    pub fn register_blocking_job<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Context, Value) -> Result<JobResult, String> + Send + Sync + 'static,
    {
        self.named_jobs
            .insert(name.into(), Arc::new(BlockingJobHandler(Arc::new(handler))));
        self
    }

    /// Register the default async job handler, invoked when no `job_name`
    /// is given or it matches no named handler.
    pub fn register_default_job<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult, String>> + Send + 'static,
    {
        self.default_job = Some(Arc::new(AsyncJobHandler(handler)));
        self
    }

    pub fn register_default_blocking_job<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Value) -> Result<JobResult, String> + Send + Sync + 'static,
    {
        self.default_job = Some(Arc::new(BlockingJobHandler(Arc::new(handler))));
        self
    }

    pub fn register_public<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.public_handlers
            .insert(name.into(), Arc::new(AsyncPublicHandler(handler)));
        self
    }

    pub fn on_startup(&self) -> Option<Arc<dyn LifecycleHandler>> {
        self.on_startup.clone()
    }

    pub fn on_ready(&self) -> Option<Arc<dyn LifecycleHandler>> {
        self.on_ready.clone()
    }

    pub fn on_cleanup(&self) -> Option<Arc<dyn LifecycleHandler>> {
        self.on_cleanup.clone()
    }

    pub fn on_weights(&self) -> Option<Arc<dyn WeightsHandler>> {
        self.on_weights.clone()
    }

    pub fn public_handler(&self, name: &str) -> Option<Arc<dyn PublicHandler>> {
        self.public_handlers.get(name).cloned()
    }

    /// Resolution rule for jobs (§4.7): a named match wins, else the
    /// default handler, else `JobError::NoHandler`.
    pub fn resolve_job(&self, job_name: Option<&str>) -> Result<Arc<dyn JobHandler>, JobError> {
        if let Some(name) = job_name {
            if let Some(handler) = self.named_jobs.get(name) {
                return Ok(handler.clone());
            }
        }
        self.default_job.clone().ok_or(JobError::NoHandler)
    }
}
