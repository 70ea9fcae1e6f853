//! Run contexts: one cancellable, traceable invocation of an owner.
//!
//! Every run-shaped entry point goes through [`RunContext::enter`]. The run
//! gets a child emitter grouped under its id, a composite abort signal and a
//! trace lineage. Nested runs name their parent explicitly through
//! [`RunOptions::parent`]; their emitter is piped into the parent run's
//! emitter until they settle, so the parent's observers see them.

use crate::emitter::{Emitter, EmitterOptions, PipeHandle};
use crate::signal::AbortSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hataori_core::{EmitterError, RunError, Snapshot, SnapshotError, TraceInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-owner run bookkeeping: the running flag and the lifetime token.
#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
    lifetime: CancellationToken,
}

impl RunState {
    /// Creates an idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a run is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Token cancelled when the owner is disposed.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Aborts the active run, if any, and every later one.
    pub fn dispose(&self) {
        self.lifetime.cancel();
    }

    fn claim(&self, owner: &str) -> Result<RunGuard<'_>, RunError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RunError::AlreadyRunning {
                owner: owner.to_string(),
            })?;
        Ok(RunGuard { state: self })
    }
}

struct RunGuard<'a> {
    state: &'a RunState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

/// An object whose public entry points run inside a [`RunContext`].
pub trait RunOwner: Send + Sync {
    /// Label used in diagnostics and errors.
    fn label(&self) -> String;

    /// The owner's emitter; run emitters are created as its children.
    fn emitter(&self) -> &Emitter;

    /// The owner's run bookkeeping.
    fn run_state(&self) -> &RunState;
}

/// Caller-supplied options for [`RunContext::enter`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra cancellation token.
    pub signal: Option<CancellationToken>,
    /// The run this one is nested in.
    pub parent: Option<RunContext>,
    /// Call parameters, kept for diagnostics.
    pub params: Value,
}

impl RunOptions {
    /// Options for a top-level run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a run nested inside `parent`.
    pub fn nested(parent: &RunContext) -> Self {
        Self::new().parent(parent)
    }

    /// Sets the caller's cancellation token.
    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Sets the parent run.
    pub fn parent(mut self, parent: &RunContext) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Sets the call parameters.
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// How a run settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunSettlement {
    /// The body returned `Ok` and the signal was not aborted.
    Succeeded,
    /// The body returned an error.
    Failed(String),
    /// The signal was aborted.
    Aborted,
}

/// Payload of the `run.*` lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Run id.
    pub run_id: String,
    /// Owner label.
    pub owner: String,
    /// Set on `success`, `error` and `finish`.
    pub settlement: Option<RunSettlement>,
}

struct ContextInner {
    id: String,
    trace: TraceInfo,
    signal: AbortSignal,
    abort: CancellationToken,
    emitter: Emitter,
    lifecycle: Emitter,
    upstream: Option<PipeHandle>,
    owner: String,
    params: Value,
    created_at: DateTime<Utc>,
}

/// One logical invocation of an owner.
///
/// Cheap to clone; every clone refers to the same run.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.inner.id)
            .field("trace", &self.inner.trace)
            .field("owner", &self.inner.owner)
            .field("aborted", &self.inner.signal.is_aborted())
            .finish()
    }
}

type Body<'a, T, E> = Box<dyn FnOnce(RunContext) -> BoxFuture<'a, Result<T, E>> + Send + 'a>;

impl RunContext {
    /// Starts a run of `owner`.
    ///
    /// Fails immediately with [`RunError::AlreadyRunning`] if the owner has
    /// an active run. The returned [`Run`] executes `body` when awaited.
    /// Dropping it without awaiting releases the owner.
    ///
    /// # Examples
    ///
    /// ```
    /// use hataori::{Emitter, EmitterOptions, RunContext, RunOptions, RunOwner, RunState};
    /// use hataori::RunError;
    ///
    /// struct Agent {
    ///     emitter: Emitter,
    ///     state: RunState,
    /// }
    ///
    /// impl RunOwner for Agent {
    ///     fn label(&self) -> String { "agent".to_string() }
    ///     fn emitter(&self) -> &Emitter { &self.emitter }
    ///     fn run_state(&self) -> &RunState { &self.state }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), RunError> {
    /// let agent = Agent {
    ///     emitter: Emitter::new(EmitterOptions::new().namespace(["agent"]))?,
    ///     state: RunState::new(),
    /// };
    /// let answer = RunContext::enter(&agent, RunOptions::new(), |ctx| async move {
    ///     ctx.emitter().emit("thought", "thinking".to_string()).await?;
    ///     Ok::<_, RunError>(42)
    /// })?
    /// .await?;
    /// assert_eq!(answer, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub fn enter<'a, O, T, E, F, Fut>(
        owner: &'a O,
        options: RunOptions,
        body: F,
    ) -> Result<Run<'a, T, E>, RunError>
    where
        O: RunOwner + ?Sized,
        F: FnOnce(RunContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: From<RunError> + fmt::Display + Send + 'a,
    {
        let label = owner.label();
        let guard = owner.run_state().claim(&label)?;
        let context = Self::create(owner, label, options)?;
        Ok(Run {
            guard,
            context,
            body: Box::new(move |ctx| Box::pin(body(ctx))),
            middleware: Vec::new(),
        })
    }

    fn create<O: RunOwner + ?Sized>(
        owner: &O,
        label: String,
        options: RunOptions,
    ) -> Result<Self, RunError> {
        let id = Uuid::new_v4().to_string();
        let trace = match &options.parent {
            Some(parent) => TraceInfo {
                id: parent.trace().id.clone(),
                run_id: id.clone(),
                parent_run_id: Some(parent.id().to_string()),
            },
            None => TraceInfo {
                id: Uuid::new_v4().to_string(),
                run_id: id.clone(),
                parent_run_id: None,
            },
        };

        let abort = CancellationToken::new();
        let mut signal =
            AbortSignal::from_token(abort.clone())
                .for_run(id.clone())
                .with(owner.run_state().lifetime().clone());
        if let Some(parent) = &options.parent {
            signal = signal.merge(parent.signal());
        }
        if let Some(token) = options.signal {
            signal = signal.with(token);
        }

        let emitter = owner.emitter().child(
            EmitterOptions::new()
                .group_id(id.clone())
                .trace(trace.clone()),
        )?;
        let lifecycle = emitter.child(EmitterOptions::new().namespace(["run"]))?;
        let upstream = match &options.parent {
            Some(parent) => Some(emitter.pipe(parent.emitter(), None)?),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                trace,
                signal,
                abort,
                emitter,
                lifecycle,
                upstream,
                owner: label,
                params: options.params,
                created_at: Utc::now(),
            }),
        })
    }

    /// Run id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Trace lineage of the run.
    pub fn trace(&self) -> &TraceInfo {
        &self.inner.trace
    }

    /// The run's abort signal.
    pub fn signal(&self) -> &AbortSignal {
        &self.inner.signal
    }

    /// Returns `true` if the run or any ancestor was aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.signal.is_aborted()
    }

    /// Fails with [`RunError::Aborted`] if the run was aborted.
    pub fn check_aborted(&self) -> Result<(), RunError> {
        self.inner.signal.check()
    }

    /// Aborts this run and every run nested in it.
    pub fn abort(&self) {
        self.inner.abort.cancel();
    }

    /// The run's emitter, grouped under the run id.
    pub fn emitter(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Label of the owner.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Parameters the run was started with.
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    async fn notify(&self, name: &str, settlement: Option<RunSettlement>) {
        let event = RunEvent {
            run_id: self.inner.id.clone(),
            owner: self.inner.owner.clone(),
            settlement,
        };
        if let Err(err) = self.inner.lifecycle.emit(name, event).await {
            warn!("Run '{}' observer failed on '{}': {}", self.inner.id, name, err);
        }
    }
}

/// Serializable description of a run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContextSnapshot {
    /// Run id.
    pub id: String,
    /// Trace lineage.
    pub trace: TraceInfo,
    /// Owner label.
    pub owner: String,
    /// Call parameters.
    pub params: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the signal was aborted when captured.
    pub aborted: bool,
}

impl Snapshot for RunContext {
    type Data = RunContextSnapshot;

    fn create_snapshot(&self) -> RunContextSnapshot {
        RunContextSnapshot {
            id: self.inner.id.clone(),
            trace: self.inner.trace.clone(),
            owner: self.inner.owner.clone(),
            params: self.inner.params.clone(),
            created_at: self.inner.created_at,
            aborted: self.is_aborted(),
        }
    }

    /// Rebuilds a detached context: it keeps its identity and lineage but
    /// has a fresh, ownerless emitter and signal.
    fn load_snapshot(data: RunContextSnapshot) -> Result<Self, SnapshotError> {
        let invalid = |err: EmitterError| SnapshotError::Invalid(err.to_string());
        let emitter = Emitter::new(
            EmitterOptions::new()
                .group_id(data.id.clone())
                .trace(data.trace.clone()),
        )
        .map_err(invalid)?;
        let lifecycle = emitter
            .child(EmitterOptions::new().namespace(["run"]))
            .map_err(invalid)?;
        let abort = CancellationToken::new();
        if data.aborted {
            abort.cancel();
        }
        let signal = AbortSignal::from_token(abort.clone()).for_run(data.id.clone());
        Ok(Self {
            inner: Arc::new(ContextInner {
                id: data.id,
                trace: data.trace,
                signal,
                abort,
                emitter,
                lifecycle,
                upstream: None,
                owner: data.owner,
                params: data.params,
                created_at: data.created_at,
            }),
        })
    }
}

/// Cross-cutting behavior wrapped around a run.
///
/// Middleware sees the context before the body runs and the settlement
/// after; it cannot change the outcome.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called before the body, after observers are attached.
    async fn on_start(&self, _context: &RunContext) {}

    /// Called after the body settles, before the run emitter is destroyed.
    async fn on_finish(&self, _context: &RunContext, _settlement: &RunSettlement) {}
}

#[async_trait]
impl<F> Middleware for F
where
    F: Fn(&RunContext) + Send + Sync,
{
    async fn on_start(&self, context: &RunContext) {
        self(context)
    }
}

/// A started, not yet executed run.
///
/// Await it to execute the body.
pub struct Run<'a, T, E> {
    guard: RunGuard<'a>,
    context: RunContext,
    body: Body<'a, T, E>,
    middleware: Vec<Arc<dyn Middleware + 'a>>,
}

impl<'a, T, E> fmt::Debug for Run<'a, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("context", &self.context)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl<'a, T, E> Run<'a, T, E>
where
    T: Send + 'a,
    E: From<RunError> + fmt::Display + Send + 'a,
{
    /// The context the body will receive.
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Registers listeners on the run emitter before the body starts.
    pub fn observe<C>(self, configure: C) -> Result<Self, RunError>
    where
        C: FnOnce(&Emitter) -> Result<(), EmitterError>,
    {
        configure(self.context.emitter())?;
        Ok(self)
    }

    /// Adds middleware around the body.
    pub fn middleware(mut self, middleware: impl Middleware + 'a) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    async fn execute(self) -> Result<T, E> {
        let Run {
            guard,
            context,
            body,
            middleware,
        } = self;

        for m in &middleware {
            m.on_start(&context).await;
        }
        debug!("Run '{}' of '{}' started", context.id(), context.owner());
        context.notify("start", None).await;

        let result = match body(context.clone()).await {
            Ok(_) if context.is_aborted() => Err(E::from(RunError::Aborted {
                run_id: context.id().to_string(),
            })),
            other => other,
        };

        let settlement = match &result {
            _ if context.is_aborted() => RunSettlement::Aborted,
            Ok(_) => RunSettlement::Succeeded,
            Err(err) => RunSettlement::Failed(err.to_string()),
        };
        let name = if settlement == RunSettlement::Succeeded {
            "success"
        } else {
            "error"
        };
        context.notify(name, Some(settlement.clone())).await;
        for m in &middleware {
            m.on_finish(&context, &settlement).await;
        }
        context.notify("finish", Some(settlement.clone())).await;
        debug!(
            "Run '{}' of '{}' settled: {:?}",
            context.id(),
            context.owner(),
            settlement
        );

        if let Some(upstream) = &context.inner.upstream {
            upstream.unpipe();
        }
        context.inner.lifecycle.destroy();
        context.inner.emitter.destroy();
        drop(guard);
        result
    }
}

impl<'a, T, E> IntoFuture for Run<'a, T, E>
where
    T: Send + 'a,
    E: From<RunError> + fmt::Display + Send + 'a,
{
    type Output = Result<T, E>;
    type IntoFuture = BoxFuture<'a, Result<T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}
