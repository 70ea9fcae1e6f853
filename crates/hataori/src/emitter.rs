//! Hierarchical typed event bus.
//!
//! An [`Emitter`] owns a namespace and a list of listeners. Events emitted on
//! a child bubble up to its ancestors, where only nested matchers see them,
//! and are forwarded to pipe targets as if emitted there.
//!
//! # Delivery order
//!
//! For one emission, the source emitter's listeners run first in registration
//! order, then its ancestors' listeners, then pipe targets'. Each emitter is
//! visited at most once per emission.
//!
//! Blocking listeners are awaited one after another before `emit` returns.
//! Non-blocking listeners have their callback invoked in registration order
//! and the returned future spawned on the tokio runtime; `emit` does not wait
//! for it, and its failure is only logged. Outside a tokio runtime the future
//! is awaited inline instead.

use futures::future::BoxFuture;
use futures::FutureExt;
use hataori_core::{
    validate_identifier, BoxError, EmitterError, EmitterId, EventMeta, EventSource,
    Handle, HandleTable, Matcher, Snapshot, SnapshotError, TraceInfo,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle as RuntimeHandle;
use tracing::{debug, warn};

/// Future returned by a listener callback.
pub type ListenerFuture = BoxFuture<'static, Result<(), BoxError>>;

type Callback = Arc<dyn Fn(Event) -> ListenerFuture + Send + Sync>;

/// An emitted event as seen by listeners.
#[derive(Clone)]
pub struct Event {
    meta: Arc<EventMeta>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    /// Event metadata.
    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    /// Event name without namespace.
    pub fn name(&self) -> &str {
        self.meta.name()
    }

    /// Full dotted path.
    pub fn path(&self) -> &str {
        self.meta.path()
    }

    /// Trace lineage, if emitted inside a run.
    pub fn trace(&self) -> Option<&TraceInfo> {
        self.meta.trace()
    }

    /// Returns the payload if it is a `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("meta", &self.meta).finish()
    }
}

/// Options for a listener registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Await the listener before `emit` returns.
    pub is_blocking: bool,
    /// Remove the listener after its first invocation.
    pub once: bool,
    /// Keep the listener across [`Emitter::reset`].
    pub persistent: bool,
    /// Receive events bubbled up from descendants. Defaults per matcher.
    pub match_nested: Option<bool>,
}

impl ListenerOptions {
    /// Default options: non-blocking, repeating, non-persistent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the listener as blocking.
    pub fn blocking(mut self) -> Self {
        self.is_blocking = true;
        self
    }

    /// Marks the listener as one-shot.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Marks the listener as surviving resets.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Overrides whether descendants' events are delivered.
    pub fn match_nested(mut self, match_nested: bool) -> Self {
        self.match_nested = Some(match_nested);
        self
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    matcher: Matcher,
    callback: Callback,
    options: ListenerOptions,
    match_nested: bool,
    fired: AtomicBool,
}

impl Listener {
    fn accepts(&self, meta: &EventMeta, delivery: Delivery) -> bool {
        if delivery == Delivery::Nested && !self.match_nested {
            return false;
        }
        self.matcher.matches(meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Direct,
    Nested,
}

struct Pipe {
    target: Emitter,
    filter: Option<Matcher>,
}

/// Options used when creating an emitter.
#[derive(Debug, Clone, Default)]
pub struct EmitterOptions {
    namespace: Vec<String>,
    creator: Option<String>,
    context: Option<Value>,
    trace: Option<TraceInfo>,
    group_id: Option<String>,
}

impl EmitterOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace segments; appended to the parent's for children.
    pub fn namespace<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace = segments.into_iter().map(Into::into).collect();
        self
    }

    /// Label of the object owning the emitter.
    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// Context attached to every event; merged over the parent's.
    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Trace lineage attached to every event.
    pub fn trace(mut self, trace: TraceInfo) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Group id attached to every event.
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

struct Inner {
    id: EmitterId,
    namespace: Vec<String>,
    creator: Option<String>,
    context: Value,
    trace: Option<TraceInfo>,
    group_id: Option<String>,
    parent: Option<Emitter>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    pipes: Mutex<HandleTable<Pipe>>,
    next_listener: AtomicU64,
    destroyed: AtomicBool,
}

/// Hierarchical publish-subscribe bus.
///
/// Cloning an `Emitter` yields another handle to the same bus.
///
/// # Examples
///
/// ```
/// use hataori::{Emitter, EmitterOptions, ListenerOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), hataori::EmitterError> {
/// let agent = Emitter::new(EmitterOptions::new().namespace(["agent"]))?;
/// agent.on(
///     "update",
///     |event| async move {
///         assert_eq!(event.payload::<String>().map(String::as_str), Some("thinking"));
///         Ok(())
///     },
///     ListenerOptions::new().blocking(),
/// )?;
///
/// agent.emit("update", "thinking".to_string()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<Inner>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.namespace)
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

static ROOT: Lazy<RwLock<Emitter>> = Lazy::new(|| RwLock::new(Emitter::root_emitter()));

impl Emitter {
    /// Creates a standalone emitter.
    pub fn new(options: EmitterOptions) -> Result<Self, EmitterError> {
        for segment in &options.namespace {
            validate_identifier(segment)?;
        }
        Ok(Self::from_parts(
            options.namespace,
            options.creator,
            options.context.unwrap_or(Value::Null),
            options.trace,
            options.group_id,
            None,
        ))
    }

    fn from_parts(
        namespace: Vec<String>,
        creator: Option<String>,
        context: Value,
        trace: Option<TraceInfo>,
        group_id: Option<String>,
        parent: Option<Emitter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: EmitterId::new(),
                namespace,
                creator,
                context,
                trace,
                group_id,
                parent,
                listeners: Mutex::new(Vec::new()),
                pipes: Mutex::new(HandleTable::new()),
                next_listener: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    fn root_emitter() -> Self {
        Self::from_parts(Vec::new(), None, Value::Null, None, None, None)
    }

    /// Returns the process-wide root emitter.
    ///
    /// Owners that want their events visible to global observers create
    /// their emitter as a child of the root. The root is created lazily on
    /// first use.
    pub fn root() -> Emitter {
        ROOT.read().clone()
    }

    /// Installs `emitter` as the root and returns the previous one.
    pub fn set_root(emitter: Emitter) -> Emitter {
        std::mem::replace(&mut *ROOT.write(), emitter)
    }

    /// Replaces the root with a fresh emitter and destroys the old one.
    pub fn reset_root() {
        let previous = Self::set_root(Self::root_emitter());
        previous.destroy();
    }

    /// Creates a child emitter whose namespace extends this one.
    ///
    /// The child starts with no listeners. Its events bubble up to this
    /// emitter as nested events.
    pub fn child(&self, options: EmitterOptions) -> Result<Emitter, EmitterError> {
        self.ensure_alive()?;
        for segment in &options.namespace {
            validate_identifier(segment)?;
        }
        let mut namespace = self.inner.namespace.clone();
        namespace.extend(options.namespace);

        let context = match (options.context, &self.inner.context) {
            (Some(Value::Object(own)), Value::Object(parent)) => {
                let mut merged = parent.clone();
                merged.extend(own);
                Value::Object(merged)
            }
            (Some(own), _) => own,
            (None, parent) => parent.clone(),
        };

        Ok(Self::from_parts(
            namespace,
            options.creator.or_else(|| self.inner.creator.clone()),
            context,
            options.trace.or_else(|| self.inner.trace.clone()),
            options.group_id.or_else(|| self.inner.group_id.clone()),
            Some(self.clone()),
        ))
    }

    /// Emitter identity.
    pub fn id(&self) -> EmitterId {
        self.inner.id
    }

    /// Namespace segments.
    pub fn namespace(&self) -> &[String] {
        &self.inner.namespace
    }

    /// Trace lineage attached to events, if any.
    pub fn trace(&self) -> Option<&TraceInfo> {
        self.inner.trace.as_ref()
    }

    /// Group id attached to events, if any.
    pub fn group_id(&self) -> Option<&str> {
        self.inner.group_id.as_deref()
    }

    /// Returns `true` once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Subscribes to events named `name`.
    pub fn on<F, Fut>(
        &self,
        name: &str,
        callback: F,
        options: ListenerOptions,
    ) -> Result<ListenerId, EmitterError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.match_event(Matcher::exact(name)?, callback, options)
    }

    /// Subscribes with an arbitrary [`Matcher`].
    pub fn match_event<F, Fut>(
        &self,
        matcher: Matcher,
        callback: F,
        options: ListenerOptions,
    ) -> Result<ListenerId, EmitterError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_alive()?;
        if let Matcher::Exact(name) = &matcher {
            validate_identifier(name)?;
        }

        let match_nested = match &matcher {
            Matcher::AllDirect => false,
            Matcher::AllNested => true,
            _ => options
                .match_nested
                .unwrap_or_else(|| matcher.default_match_nested()),
        };
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(move |event| callback(event).boxed());

        self.inner.listeners.lock().push(Arc::new(Listener {
            id,
            matcher,
            callback,
            options,
            match_nested,
            fired: AtomicBool::new(false),
        }));
        Ok(id)
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Removes every non-persistent listener.
    pub fn reset(&self) {
        self.inner
            .listeners
            .lock()
            .retain(|listener| listener.options.persistent);
    }

    /// Forwards events seen by this emitter to `target`.
    ///
    /// Both own and descendants' events are forwarded, optionally filtered;
    /// they reach `target` as direct events. Fails with
    /// [`EmitterError::PipeCycle`] if `target` is this emitter or already
    /// forwards, directly or through ancestors, back into it.
    pub fn pipe(&self, target: &Emitter, filter: Option<Matcher>) -> Result<PipeHandle, EmitterError> {
        self.ensure_alive()?;
        target.ensure_alive()?;
        if target.id() == self.id() || target.reaches(self.id()) {
            warn!(
                "Rejected pipe from '{}' into '{}': cycle",
                self.display_path(),
                target.display_path()
            );
            return Err(EmitterError::PipeCycle {
                from: self.display_path(),
                to: target.display_path(),
            });
        }

        let handle = self.inner.pipes.lock().insert(Pipe {
            target: target.clone(),
            filter,
        });
        debug!(
            "Piped '{}' into '{}'",
            self.display_path(),
            target.display_path()
        );
        Ok(PipeHandle {
            source: Arc::downgrade(&self.inner),
            handle,
        })
    }

    /// Number of active pipes out of this emitter.
    pub fn pipe_count(&self) -> usize {
        self.inner.pipes.lock().len()
    }

    /// Releases all listeners and pipes. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.listeners.lock().clear();
        self.inner.pipes.lock().clear();
    }

    /// Emits `name` with `payload`.
    ///
    /// Returns the first error raised by a blocking listener; later
    /// listeners still run.
    pub async fn emit<P>(&self, name: &str, payload: P) -> Result<(), EmitterError>
    where
        P: Any + Send + Sync,
    {
        self.ensure_alive()?;
        let source = EventSource {
            id: self.id(),
            namespace: self.inner.namespace.clone(),
        };
        let meta = EventMeta::new(name, source)?
            .with_group_id(self.inner.group_id.clone())
            .with_creator(self.inner.creator.clone())
            .with_context(self.inner.context.clone())
            .with_trace(self.inner.trace.clone());
        let event = Event {
            meta: Arc::new(meta),
            payload: Arc::new(payload),
        };
        self.dispatch(event).await
    }

    async fn dispatch(&self, event: Event) -> Result<(), EmitterError> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(self.clone(), Delivery::Direct)]);
        let mut first_error = None;

        while let Some((emitter, delivery)) = queue.pop_front() {
            if !visited.insert(emitter.id()) || emitter.is_destroyed() {
                continue;
            }
            if let Err(err) = emitter.invoke(&event, delivery).await {
                first_error.get_or_insert(err);
            }
            if let Some(parent) = &emitter.inner.parent {
                queue.push_back((parent.clone(), Delivery::Nested));
            }
            let targets: Vec<Emitter> = emitter
                .inner
                .pipes
                .lock()
                .iter()
                .filter(|(_, pipe)| {
                    pipe.filter
                        .as_ref()
                        .map_or(true, |filter| filter.matches(event.meta()))
                })
                .map(|(_, pipe)| pipe.target.clone())
                .collect();
            queue.extend(targets.into_iter().map(|target| (target, Delivery::Direct)));
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn invoke(&self, event: &Event, delivery: Delivery) -> Result<(), EmitterError> {
        let listeners: Vec<Arc<Listener>> = self.inner.listeners.lock().clone();
        let mut first_error = None;

        for listener in listeners {
            if !listener.accepts(event.meta(), delivery) {
                continue;
            }
            if listener.options.once {
                if listener.fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.off(listener.id);
            }

            let future = (listener.callback)(event.clone());
            if listener.options.is_blocking {
                if let Err(source) = future.await {
                    warn!("Blocking listener for '{}' failed: {}", event.path(), source);
                    first_error.get_or_insert(EmitterError::Listener {
                        path: event.path().to_string(),
                        source,
                    });
                }
            } else {
                let path = event.path().to_string();
                let detached = async move {
                    if let Err(err) = future.await {
                        warn!("Listener for '{}' failed: {}", path, err);
                    }
                };
                let runtime = RuntimeHandle::try_current().ok();
                match runtime {
                    Some(runtime) => {
                        runtime.spawn(detached);
                    }
                    None => {
                        warn!(
                            "No tokio runtime for listener on '{}'; running it inline",
                            event.path()
                        );
                        detached.await;
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Returns `true` if events emitted here could reach the emitter `id`.
    fn reaches(&self, id: EmitterId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(emitter) = stack.pop() {
            if emitter.id() == id {
                return true;
            }
            if !visited.insert(emitter.id()) {
                continue;
            }
            if let Some(parent) = &emitter.inner.parent {
                stack.push(parent.clone());
            }
            stack.extend(
                emitter
                    .inner
                    .pipes
                    .lock()
                    .iter()
                    .map(|(_, pipe)| pipe.target.clone()),
            );
        }
        false
    }

    fn ensure_alive(&self) -> Result<(), EmitterError> {
        if self.is_destroyed() {
            Err(EmitterError::Destroyed(self.display_path()))
        } else {
            Ok(())
        }
    }

    fn display_path(&self) -> String {
        if self.inner.namespace.is_empty() {
            "<root>".to_string()
        } else {
            self.inner.namespace.join(".")
        }
    }
}

/// Handle to an active pipe.
#[derive(Debug, Clone)]
pub struct PipeHandle {
    source: Weak<Inner>,
    handle: Handle,
}

impl PipeHandle {
    /// Stops forwarding. Returns `false` if the pipe was already removed.
    pub fn unpipe(&self) -> bool {
        self.source
            .upgrade()
            .map_or(false, |inner| inner.pipes.lock().remove(self.handle).is_some())
    }
}

/// Serializable description of an emitter. Listeners and pipes are not
/// captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitterSnapshot {
    /// Namespace segments.
    pub namespace: Vec<String>,
    /// Creator label.
    pub creator: Option<String>,
    /// Attached context.
    pub context: Value,
    /// Trace lineage.
    pub trace: Option<TraceInfo>,
    /// Group id.
    pub group_id: Option<String>,
}

impl Snapshot for Emitter {
    type Data = EmitterSnapshot;

    fn create_snapshot(&self) -> EmitterSnapshot {
        EmitterSnapshot {
            namespace: self.inner.namespace.clone(),
            creator: self.inner.creator.clone(),
            context: self.inner.context.clone(),
            trace: self.inner.trace.clone(),
            group_id: self.inner.group_id.clone(),
        }
    }

    fn load_snapshot(data: EmitterSnapshot) -> Result<Self, SnapshotError> {
        let mut options = EmitterOptions::new()
            .namespace(data.namespace)
            .context(data.context);
        options.creator = data.creator;
        options.trace = data.trace;
        options.group_id = data.group_id;
        Emitter::new(options).map_err(|err| SnapshotError::Invalid(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn emitter(namespace: &[&str]) -> Emitter {
        Emitter::new(EmitterOptions::new().namespace(namespace.iter().copied()))
            .expect("valid namespace")
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(
        log: &Log,
        label: &'static str,
    ) -> impl Fn(Event) -> futures::future::Ready<Result<(), BoxError>> + Send + Sync + 'static
    {
        let log = log.clone();
        move |event| {
            log.lock().push(format!("{label}:{}", event.path()));
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_listeners_fire_in_registration_order() {
        let bus = emitter(&["agent"]);
        let log = Log::default();

        bus.on("start", record(&log, "a"), ListenerOptions::new().blocking()).expect("listener");
        bus.on("start", record(&log, "b"), ListenerOptions::new()).expect("listener");
        bus.match_event(Matcher::AllDirect, record(&log, "c"), ListenerOptions::new().blocking())
            .expect("listener");
        bus.on("finish", record(&log, "d"), ListenerOptions::new()).expect("listener");

        bus.emit("start", ()).await.expect("emit");

        assert_eq!(
            *log.lock(),
            vec!["a:agent.start", "b:agent.start", "c:agent.start"]
        );
    }

    #[tokio::test]
    async fn test_direct_and_nested_wildcards() {
        let parent = emitter(&["x"]);
        let child = parent
            .child(EmitterOptions::new().namespace(["y"]))
            .expect("child");
        let log = Log::default();

        parent
            .match_event(Matcher::AllDirect, record(&log, "direct"), ListenerOptions::new())
            .expect("listener");
        parent
            .match_event(Matcher::AllNested, record(&log, "nested"), ListenerOptions::new())
            .expect("listener");

        child.emit("ping", ()).await.expect("emit");
        parent.emit("pong", ()).await.expect("emit");

        assert_eq!(
            *log.lock(),
            vec!["nested:x.y.ping", "direct:x.pong", "nested:x.pong"]
        );
    }

    #[tokio::test]
    async fn test_exact_name_ignores_descendants_unless_nested() {
        let parent = emitter(&["x"]);
        let child = parent
            .child(EmitterOptions::new().namespace(["y"]))
            .expect("child");
        let log = Log::default();

        parent.on("ping", record(&log, "plain"), ListenerOptions::new()).expect("listener");
        parent
            .on("ping", record(&log, "nested"), ListenerOptions::new().match_nested(true))
            .expect("listener");

        child.emit("ping", ()).await.expect("emit");

        assert_eq!(*log.lock(), vec!["nested:x.y.ping"]);
    }

    #[tokio::test]
    async fn test_once_and_persistent() {
        let bus = emitter(&["bus"]);
        let log = Log::default();

        bus.on("tick", record(&log, "once"), ListenerOptions::new().once()).expect("listener");
        bus.on("tick", record(&log, "kept"), ListenerOptions::new().persistent())
            .expect("listener");
        bus.on("tick", record(&log, "dropped"), ListenerOptions::new()).expect("listener");

        bus.emit("tick", ()).await.expect("emit");
        bus.reset();
        bus.emit("tick", ()).await.expect("emit");

        assert_eq!(
            *log.lock(),
            vec!["once:bus.tick", "kept:bus.tick", "dropped:bus.tick", "kept:bus.tick"]
        );
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_off_removes_listener() {
        let bus = emitter(&["bus"]);
        let log = Log::default();

        let id = bus.on("tick", record(&log, "a"), ListenerOptions::new()).expect("listener");
        assert!(bus.off(id));
        assert!(!bus.off(id));

        bus.emit("tick", ()).await.expect("emit");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_names_fail_fast() {
        assert!(matches!(
            Emitter::new(EmitterOptions::new().namespace(["bad-ns"])),
            Err(EmitterError::InvalidName(_))
        ));

        let bus = emitter(&["bus"]);
        assert!(bus
            .on("bad name", |_| async { Ok(()) }, ListenerOptions::new())
            .is_err());
        assert!(matches!(
            bus.emit("", ()).await,
            Err(EmitterError::InvalidName(_))
        ));
        assert!(bus.child(EmitterOptions::new().namespace(["a.b"])).is_err());
    }

    #[tokio::test]
    async fn test_blocking_error_propagates_without_stopping_others() {
        let bus = emitter(&["bus"]);
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on(
            "go",
            |_| async { Err::<(), BoxError>("boom".into()) },
            ListenerOptions::new().blocking(),
        )
        .expect("listener");
        let counter = calls.clone();
        bus.on(
            "go",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            ListenerOptions::new().blocking(),
        )
        .expect("listener");

        let result = bus.emit("go", ()).await;

        assert!(matches!(result, Err(EmitterError::Listener { path, .. }) if path == "bus.go"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_blocking_error_is_swallowed() {
        let bus = emitter(&["bus"]);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        bus.on(
            "go",
            |_| async { Err::<(), BoxError>("ignored".into()) },
            ListenerOptions::new(),
        )
        .expect("listener");
        bus.on(
            "go",
            move |_| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(());
                    }
                    Ok(())
                }
            },
            ListenerOptions::new(),
        )
        .expect("listener");

        assert!(bus.emit("go", ()).await.is_ok());
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_non_blocking_listener_runs_inline_without_runtime() {
        let bus = emitter(&["bus"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.on(
            "go",
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("ignored".into())
                }
            },
            ListenerOptions::new(),
        )
        .expect("listener");

        assert!(futures::executor::block_on(bus.emit("go", ())).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payload_and_meta() {
        let bus = Emitter::new(
            EmitterOptions::new()
                .namespace(["tool"])
                .creator("tool:search")
                .context(serde_json::json!({"tenant": "acme"}))
                .group_id("g1"),
        )
        .expect("emitter");
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        bus.on(
            "result",
            move |event| {
                *sink.lock() = Some((
                    event.payload::<u32>().copied(),
                    event.meta().creator().map(str::to_string),
                    event.meta().group_id().map(str::to_string),
                    event.meta().context().clone(),
                ));
                async { Ok(()) }
            },
            ListenerOptions::new(),
        )
        .expect("listener");
        bus.emit("result", 42u32).await.expect("emit");

        assert_eq!(
            *seen.lock(),
            Some((
                Some(42),
                Some("tool:search".to_string()),
                Some("g1".to_string()),
                serde_json::json!({"tenant": "acme"})
            ))
        );
    }

    #[tokio::test]
    async fn test_pipe_forwards_after_own_listeners() {
        let source = emitter(&["a"]);
        let target = emitter(&["b"]);
        let log = Log::default();

        target
            .match_event(Matcher::AllDirect, record(&log, "target"), ListenerOptions::new())
            .expect("listener");
        source.on("hello", record(&log, "source"), ListenerOptions::new()).expect("listener");
        let pipe = source.pipe(&target, None).expect("pipe");

        source.emit("hello", ()).await.expect("emit");
        assert!(pipe.unpipe());
        assert!(!pipe.unpipe());
        source.emit("hello", ()).await.expect("emit");

        assert_eq!(
            *log.lock(),
            vec!["source:a.hello", "target:a.hello", "source:a.hello"]
        );
    }

    #[tokio::test]
    async fn test_pipe_filter() {
        let source = emitter(&["a"]);
        let target = emitter(&["b"]);
        let log = Log::default();

        target
            .match_event(Matcher::AllNested, record(&log, "target"), ListenerOptions::new())
            .expect("listener");
        source
            .pipe(&target, Some(Matcher::exact("keep").expect("matcher")))
            .expect("pipe");

        source.emit("keep", ()).await.expect("emit");
        source.emit("skip", ()).await.expect("emit");

        assert_eq!(*log.lock(), vec!["target:a.keep"]);
    }

    #[tokio::test]
    async fn test_pipe_cycles_are_rejected() {
        let a = emitter(&["a"]);
        let b = emitter(&["b"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        b.match_event(
            Matcher::AllNested,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            ListenerOptions::new(),
        )
        .expect("listener");

        a.pipe(&b, None).expect("pipe");
        assert!(matches!(b.pipe(&a, None), Err(EmitterError::PipeCycle { .. })));
        assert!(matches!(a.pipe(&a, None), Err(EmitterError::PipeCycle { .. })));

        let child = a.child(EmitterOptions::new().namespace(["c"])).expect("child");
        assert!(a.pipe(&child, None).is_err());

        a.emit("once", ()).await.expect("emit");
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_child_piped_into_parent_is_delivered_once() {
        let parent = emitter(&["p"]);
        let child = parent.child(EmitterOptions::new().namespace(["c"])).expect("child");
        let log = Log::default();

        parent
            .match_event(Matcher::AllNested, record(&log, "parent"), ListenerOptions::new())
            .expect("listener");
        child.pipe(&parent, None).expect("pipe");

        child.emit("evt", ()).await.expect("emit");
        assert_eq!(*log.lock(), vec!["parent:p.c.evt"]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let bus = emitter(&["bus"]);
        let other = emitter(&["other"]);
        bus.on("x", |_| async { Ok(()) }, ListenerOptions::new()).expect("listener");
        bus.pipe(&other, None).expect("pipe");

        bus.destroy();
        bus.destroy();

        assert!(bus.is_destroyed());
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.pipe_count(), 0);
        assert!(matches!(bus.emit("x", ()).await, Err(EmitterError::Destroyed(_))));
        assert!(bus.on("x", |_| async { Ok(()) }, ListenerOptions::new()).is_err());
    }

    #[tokio::test]
    async fn test_child_inherits_trace_and_merges_context() {
        let trace = TraceInfo {
            id: "t".to_string(),
            run_id: "r".to_string(),
            parent_run_id: None,
        };
        let parent = Emitter::new(
            EmitterOptions::new()
                .namespace(["p"])
                .context(serde_json::json!({"a": 1}))
                .trace(trace.clone()),
        )
        .expect("emitter");
        let child = parent
            .child(
                EmitterOptions::new()
                    .namespace(["c"])
                    .context(serde_json::json!({"b": 2})),
            )
            .expect("child");

        assert_eq!(child.namespace(), ["p", "c"]);
        assert_eq!(child.trace(), Some(&trace));

        let snapshot = child.create_snapshot();
        assert_eq!(snapshot.context, serde_json::json!({"a": 1, "b": 2}));

        let restored = Emitter::load_snapshot(snapshot.clone()).expect("restore");
        assert_eq!(restored.create_snapshot(), snapshot);
        assert_ne!(restored.id(), child.id());
    }
}
