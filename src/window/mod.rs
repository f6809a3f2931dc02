//! The global environment a document runs in.
//!
//! A [`Window`] owns its document, its realm and a cooperative event loop.
//! Everything asynchronous (timers, resource loads, `fetch`) registers with
//! the loop's async task counter, and script-visible side effects only
//! happen while the loop runs: inside `advance_time`, `run_until_idle` or
//! `when_complete`.

pub mod console;
pub mod cookies;
mod event_loop;
mod location;
pub mod storage;

pub use console::{ConsoleLevel, ConsoleMessage, VirtualConsole};
pub use cookies::{Cookie, CookieJar};
pub use event_loop::{ClockMode, TaskKind, TimerId};
pub use location::Location;
pub use storage::Storage;

pub(crate) use event_loop::TaskId;
pub(crate) use storage::StorageAreas;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use url::Url;

use self::event_loop::{DueTimer, EventLoop, LoopMessage, TaskGuard};
use crate::core::dom::{parser, CustomElementRegistry, Document, Element};
use crate::core::events::{
    dispatch_trusted, AddEventListenerOptions, ErrorEventInit, Event, EventListener,
    EventListenerRegistry, EventTarget,
};
use crate::core::network::{
    Destination, FetchOptions, FetchResponse, NetworkError, Resource, ResourceLoader,
    ResourceRequest, StaticResourceLoader,
};
use crate::js_engine::{
    GlobalConstructor, JSError, NoopScriptEngine, Realm, RealmObject, ScriptEngine,
};
use crate::{BrowserSettings, Viewport};

/// Timer-free loops that keep firing timers are cut off after this many runs
/// in one `run_until_idle` call.
const TIMER_STEP_LIMIT: usize = 100_000;

/// Delay of an animation frame on the virtual clock.
const FRAME_INTERVAL_MS: u64 = 16;

/// Callbacks the DOM uses to reach the frame a window lives in.
pub trait FrameHost: Send + Sync {
    /// An `<iframe>` became connected in this frame's document.
    fn attach_iframe(&self, element: &Element);

    /// The `src` of a connected `<iframe>` changed.
    fn navigate_iframe(&self, element: &Element);

    fn detach_iframe(&self, element: &Element);

    fn content_window(&self, element: &Element) -> Option<Window>;

    /// `location.assign` and friends; processed by the frame's `when_complete`.
    fn request_navigation(&self, url: Url, replace: bool);
}

/// Everything a window needs from the page and context that create it.
#[derive(Clone)]
pub(crate) struct WindowInit {
    pub(crate) settings: Arc<BrowserSettings>,
    pub(crate) loader: Arc<dyn ResourceLoader>,
    pub(crate) engine: Arc<dyn ScriptEngine>,
    pub(crate) console: VirtualConsole,
    pub(crate) cookies: CookieJar,
    pub(crate) local_storage: Arc<StorageAreas>,
    pub(crate) session_storage: Arc<StorageAreas>,
    pub(crate) viewport: Viewport,
    pub(crate) frame_host: Option<Weak<dyn FrameHost>>,
}

impl WindowInit {
    pub(crate) fn standalone(
        settings: BrowserSettings,
        loader: Arc<dyn ResourceLoader>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Self {
        Self {
            viewport: settings.viewport,
            settings: Arc::new(settings),
            loader,
            engine,
            console: VirtualConsole::new(),
            cookies: CookieJar::new(),
            local_storage: Arc::default(),
            session_storage: Arc::default(),
            frame_host: None,
        }
    }
}

type AbortTrigger = Arc<Mutex<Option<oneshot::Sender<()>>>>;

struct WindowInner {
    id: u64,
    settings: Arc<BrowserSettings>,
    document: Document,
    listeners: EventListenerRegistry,
    event_loop: EventLoop,
    realm: Realm,
    loader: Arc<dyn ResourceLoader>,
    console: VirtualConsole,
    cookies: CookieJar,
    local_storage: Arc<StorageAreas>,
    session_storage: Arc<StorageAreas>,
    frame_host: Option<Weak<dyn FrameHost>>,
    viewport: RwLock<Viewport>,
    fetch_aborts: Mutex<HashMap<TaskId, AbortTrigger>>,
    closed: AtomicBool,
    reporting: AtomicBool,
    checkpoint: AtomicBool,
}

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Window(Arc<WindowInner>);

#[derive(Clone, Default)]
pub struct WeakWindow(Weak<WindowInner>);

impl WeakWindow {
    pub fn upgrade(&self) -> Option<Window> {
        self.0.upgrade().map(Window)
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("id", &self.0.id)
            .field("url", &self.0.document.url())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for WeakWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakWindow")
    }
}

impl Window {
    /// A window on `about:blank` that is not part of any page: no network
    /// routes and a script engine that evaluates everything to `null`.
    pub fn new(settings: BrowserSettings) -> Window {
        let init = WindowInit::standalone(
            settings,
            Arc::new(StaticResourceLoader::new()),
            Arc::new(NoopScriptEngine),
        );
        let window = Self::assemble(init, crate::core::dom::document::ABOUT_BLANK.clone(), Realm::noop());
        parser::parse_document(&window.document(), "", false);
        window.perform_microtask_checkpoint();
        window
    }

    /// A standalone window at `url` whose document is parsed from `html`.
    pub fn with_collaborators(
        settings: BrowserSettings,
        loader: Arc<dyn ResourceLoader>,
        engine: Arc<dyn ScriptEngine>,
        url: &str,
        html: &str,
    ) -> Result<Window, JSError> {
        let url = Url::parse(url).map_err(|e| JSError::TypeConversion(format!("invalid URL '{url}': {e}")))?;
        let window = Self::create(WindowInit::standalone(settings, loader, engine), url)?;
        let document = window.document();
        parser::parse_document(&document, html, !window.settings().disable_javascript_evaluation);
        window.perform_microtask_checkpoint();
        Ok(window)
    }

    /// Window with an empty document at `url`.
    pub(crate) fn create(init: WindowInit, url: Url) -> Result<Window, JSError> {
        let realm = Realm::new(init.engine.as_ref(), &url, &init.settings.user_agent)?;
        Ok(Self::assemble(init, url, realm))
    }

    fn assemble(init: WindowInit, url: Url, realm: Realm) -> Window {
        let document = Document::for_window(url);
        let window = Window(Arc::new(WindowInner {
            id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
            event_loop: EventLoop::new(init.settings.clock, init.settings.timer.max_interval_iterations),
            settings: init.settings,
            document: document.clone(),
            listeners: EventListenerRegistry::default(),
            realm,
            loader: init.loader,
            console: init.console,
            cookies: init.cookies,
            local_storage: init.local_storage,
            session_storage: init.session_storage,
            frame_host: init.frame_host,
            viewport: RwLock::new(init.viewport),
            fetch_aborts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            reporting: AtomicBool::new(false),
            checkpoint: AtomicBool::new(false),
        }));
        document.attach_window(&window);
        debug!(window = window.0.id, url = %document.url(), "window created");
        window
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn document(&self) -> Document {
        self.0.document.clone()
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.0.settings
    }

    pub fn console(&self) -> &VirtualConsole {
        &self.0.console
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.0.cookies
    }

    pub fn location(&self) -> Location {
        Location::new(self)
    }

    fn origin(&self) -> String {
        self.0.document.url_value().origin().ascii_serialization()
    }

    pub fn local_storage(&self) -> Storage {
        self.0.local_storage.for_origin(&self.origin())
    }

    pub fn session_storage(&self) -> Storage {
        self.0.session_storage.for_origin(&self.origin())
    }

    pub fn custom_elements(&self) -> CustomElementRegistry {
        self.0
            .document
            .custom_element_registry()
            .unwrap_or_default()
    }

    pub fn realm(&self) -> &Realm {
        &self.0.realm
    }

    /// The built-in constructor `name` of this window's realm.
    pub fn global_constructor(&self, name: &str) -> Option<GlobalConstructor> {
        self.0.realm.global(name)
    }

    /// Creates `value` through this window's own `constructor`, so that
    /// `instanceof` holds against this window's globals and no other's.
    pub fn construct(&self, constructor: &str, value: Value) -> Result<RealmObject, JSError> {
        if self.is_closed() {
            return Err(JSError::RealmDestroyed);
        }
        self.0.realm.construct(constructor, value)
    }

    pub fn user_agent(&self) -> &str {
        &self.0.settings.user_agent
    }

    pub fn inner_width(&self) -> u32 {
        self.0.viewport.read().width
    }

    pub fn inner_height(&self) -> u32 {
        self.0.viewport.read().height
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.0.viewport.read().device_scale_factor
    }

    /// Resizes the viewport and fires `resize` when it changed.
    pub(crate) fn set_viewport(&self, viewport: Viewport) {
        let changed = {
            let mut current = self.0.viewport.write();
            std::mem::replace(&mut *current, viewport) != viewport
        };
        if changed {
            self.fire("resize");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    pub(crate) fn frame_host(&self) -> Option<Arc<dyn FrameHost>> {
        self.0.frame_host.as_ref().and_then(Weak::upgrade)
    }

    pub fn downgrade(&self) -> WeakWindow {
        WeakWindow(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Window) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // --- events ----------------------------------------------------------------

    pub(crate) fn listeners(&self) -> &EventListenerRegistry {
        &self.0.listeners
    }

    pub fn as_event_target(&self) -> EventTarget {
        EventTarget::Window(self.clone())
    }

    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: &EventListener,
        options: impl Into<AddEventListenerOptions>,
    ) {
        self.as_event_target()
            .add_event_listener(event_type, listener, options);
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &EventListener, capture: bool) {
        self.as_event_target()
            .remove_event_listener(event_type, listener, capture);
    }

    pub fn dispatch_event(&self, event: &Event) -> crate::core::dom::Result<bool> {
        self.as_event_target().dispatch_event(event)
    }

    /// Fires a trusted, non-bubbling event at the window.
    pub(crate) fn fire(&self, event_type: &str) {
        let event = Event::new(event_type, Default::default());
        if let Err(error) = dispatch_trusted(&self.as_event_target(), &event) {
            warn!(%error, event_type, "could not fire window event");
        }
    }

    // --- error channel -----------------------------------------------------------

    /// Reports an uncaught error: `tracing`, the console, and an `ErrorEvent`
    /// on the window. Errors raised while an `error` listener runs are only
    /// logged.
    pub fn report_error(&self, error: &JSError) {
        error!(window = self.0.id, %error, "uncaught error");
        if self.0.settings.disable_error_capturing {
            return;
        }
        self.0.console.error(&error.to_string());
        if self.is_closed() || self.0.reporting.swap(true, Ordering::AcqRel) {
            return;
        }
        let (message, filename, lineno, colno) = error.location();
        let event = Event::error(ErrorEventInit {
            message,
            filename: filename.unwrap_or_else(|| self.0.document.url()),
            lineno,
            colno,
            error: Some(error.to_string()),
        });
        if let Err(dispatch_error) = dispatch_trusted(&self.as_event_target(), &event) {
            warn!(error = %dispatch_error, "could not fire error event");
        }
        self.0.reporting.store(false, Ordering::Release);
    }

    // --- scripts -------------------------------------------------------------------

    /// Evaluates `source` in this window's realm. Uncaught errors are reported
    /// to the error channel and returned.
    pub fn evaluate(&self, source: &str) -> Result<Value, JSError> {
        let filename = self.0.document.url();
        self.run_script(source, &filename)
    }

    pub(crate) fn run_script(&self, source: &str, filename: &str) -> Result<Value, JSError> {
        if self.is_closed() {
            return Err(JSError::RealmDestroyed);
        }
        if self.0.settings.disable_javascript_evaluation {
            self.0
                .console
                .warn("JavaScript evaluation is disabled, script skipped");
            return Err(JSError::Disabled);
        }
        let result = self.0.realm.evaluate(self, source, filename);
        if let Err(error) = &result {
            self.report_error(error);
        }
        self.perform_microtask_checkpoint();
        result
    }

    // --- timers ----------------------------------------------------------------------

    fn clamp_delay(&self, ms: u64) -> u64 {
        match self.0.settings.timer.max_timeout {
            Some(max) => ms.min(max),
            None => ms,
        }
    }

    pub fn set_timeout(
        &self,
        callback: impl FnOnce() -> Result<(), JSError> + Send + 'static,
        ms: u64,
    ) -> TimerId {
        if self.is_closed() {
            return TimerId(0);
        }
        self.0
            .event_loop
            .set_timeout(Box::new(callback), self.clamp_delay(ms))
    }

    pub fn clear_timeout(&self, id: TimerId) {
        self.0.event_loop.clear_timer(id);
    }

    pub fn set_interval(
        &self,
        callback: impl Fn() -> Result<(), JSError> + Send + Sync + 'static,
        ms: u64,
    ) -> TimerId {
        if self.is_closed() {
            return TimerId(0);
        }
        self.0
            .event_loop
            .set_interval(Arc::new(callback), self.clamp_delay(ms))
    }

    pub fn clear_interval(&self, id: TimerId) {
        self.0.event_loop.clear_timer(id);
    }

    /// The callback receives `performance.now()` of the frame.
    pub fn request_animation_frame(
        &self,
        callback: impl FnOnce(f64) -> Result<(), JSError> + Send + 'static,
    ) -> TimerId {
        if self.is_closed() {
            return TimerId(0);
        }
        self.0
            .event_loop
            .request_animation_frame(Box::new(callback), FRAME_INTERVAL_MS)
    }

    pub fn cancel_animation_frame(&self, id: TimerId) {
        self.0.event_loop.clear_timer(id);
    }

    /// `performance.now()` in milliseconds.
    pub fn performance_now(&self) -> f64 {
        self.0.event_loop.clock.now_ms() as f64
    }

    pub fn pending_timers(&self) -> usize {
        self.0.event_loop.pending_timers()
    }

    /// Outstanding entries of the async task counter.
    pub fn pending_tasks(&self) -> usize {
        self.0.event_loop.tasks.count()
    }

    fn run_timer(&self, due: DueTimer) {
        let result = match due {
            DueTimer::Once(callback) => callback(),
            DueTimer::Repeat(callback) => callback(),
            DueTimer::Frame(callback) => callback(self.performance_now()),
        };
        if let Err(error) = result {
            self.report_error(&error);
        }
        self.perform_microtask_checkpoint();
    }

    fn run_due_timers(&self) -> usize {
        let now = self.0.event_loop.clock.now_ms();
        let mut ran = 0;
        while let Some(due) = self.0.event_loop.pop_due(now) {
            if self.is_closed() {
                break;
            }
            self.run_timer(due);
            ran += 1;
        }
        ran
    }

    /// Moves the virtual clock forward by `ms`, firing every timer that falls
    /// due on the way at its own deadline. Returns the number of callbacks run.
    pub fn advance_time(&self, ms: u64) -> usize {
        self.drain_ready();
        let clock = &self.0.event_loop.clock;
        if !clock.is_virtual() {
            warn!("advance_time only moves the virtual clock");
            return self.run_due_timers();
        }
        let target = clock.now_ms().saturating_add(ms);
        let mut ran = 0;
        while let Some(deadline) = self.0.event_loop.next_deadline() {
            if deadline > target || self.is_closed() {
                break;
            }
            clock.advance_to(deadline);
            ran += self.run_due_timers();
        }
        clock.advance_to(target);
        ran
    }

    // --- microtasks ------------------------------------------------------------------

    pub fn queue_microtask(&self, callback: impl FnOnce() -> Result<(), JSError> + Send + 'static) {
        if self.is_closed() {
            return;
        }
        self.0.event_loop.queue_microtask(Box::new(callback));
    }

    /// Runs queued microtasks until the queue is empty, including ones queued
    /// along the way. Nested checkpoints are no-ops.
    pub fn perform_microtask_checkpoint(&self) {
        if self.0.checkpoint.swap(true, Ordering::AcqRel) {
            return;
        }
        while let Some(callback) = self.0.event_loop.pop_microtask() {
            if let Err(error) = callback() {
                self.report_error(&error);
            }
        }
        self.0.checkpoint.store(false, Ordering::Release);
    }

    // --- loop --------------------------------------------------------------------------

    fn process_message(&self, message: LoopMessage) {
        let LoopMessage::Completed { task, run } = message;
        self.0.event_loop.forget_load(task);
        if !self.is_closed() {
            if let Err(error) = run() {
                self.report_error(&error);
            }
            self.perform_microtask_checkpoint();
        }
        self.0.event_loop.tasks.end(task);
    }

    /// Runs microtasks and every completion that has already arrived.
    fn drain_ready(&self) {
        loop {
            self.perform_microtask_checkpoint();
            match self.0.event_loop.try_recv() {
                Some(message) => self.process_message(message),
                None => break,
            }
        }
    }

    /// Waits for a load completion or any change of the task counter.
    async fn wait_for_activity(&self) {
        let mut changes = self.0.event_loop.tasks.subscribe();
        changes.borrow_and_update();
        if let Some(message) = self.0.event_loop.try_recv() {
            self.process_message(message);
            return;
        }
        if self.0.event_loop.tasks.count() == 0 {
            return;
        }
        tokio::select! {
            message = self.0.event_loop.recv() => {
                if let Some(message) = message {
                    self.process_message(message);
                }
            }
            _ = changes.changed() => {}
        }
    }

    /// Drives the loop until nothing is left to do right now: no microtasks,
    /// no in-flight loads and no pending timers. On the virtual clock, time
    /// jumps to the next timer only while no network work is in flight.
    pub async fn run_until_idle(&self) {
        let mut timer_steps = 0usize;
        loop {
            if self.is_closed() {
                return;
            }
            self.drain_ready();
            let in_flight = self.0.event_loop.tasks.count_where(TaskKind::is_network);
            let next = self.0.event_loop.next_deadline();
            let clock = &self.0.event_loop.clock;

            if in_flight > 0 && (clock.is_virtual() || next.is_none()) {
                self.wait_for_activity().await;
                continue;
            }
            let Some(deadline) = next else {
                return;
            };
            if timer_steps >= TIMER_STEP_LIMIT {
                warn!(window = self.0.id, "timer step limit reached, an interval is probably never cleared");
                return;
            }
            if clock.is_virtual() {
                clock.advance_to(deadline);
            } else {
                let now = clock.now_ms();
                if deadline > now {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(deadline - now)) => {}
                        message = self.0.event_loop.recv() => {
                            if let Some(message) = message {
                                self.process_message(message);
                            }
                            continue;
                        }
                    }
                }
            }
            timer_steps += self.run_due_timers().max(1);
        }
    }

    /// Resolves once the async task counter stays at zero: every timer,
    /// load and fetch has settled, including work chained from them.
    pub async fn when_complete(&self) {
        loop {
            self.run_until_idle().await;
            if self.is_closed() {
                return;
            }
            if self.0.event_loop.tasks.count() == 0 {
                // give work started by the last settled task a turn before resolving
                tokio::task::yield_now().await;
                self.drain_ready();
                if self.0.event_loop.tasks.count() == 0 && !self.0.event_loop.has_microtasks() {
                    return;
                }
                continue;
            }
            self.wait_for_activity().await;
        }
    }

    /// Runs the loop until no load that holds back the `load` event is left.
    /// Timers are not fired.
    pub(crate) async fn settle_loads(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            self.drain_ready();
            if self.0.event_loop.tasks.count_where(TaskKind::blocks_load) == 0 {
                return;
            }
            self.wait_for_activity().await;
        }
    }

    /// Processes completions until `done` holds or no network work is left
    /// that could make it hold, e.g. after `abort()`. Timers are not fired.
    pub(crate) async fn drive_until(&self, done: impl Fn() -> bool) {
        loop {
            if self.is_closed() {
                return;
            }
            self.drain_ready();
            if done() || self.0.event_loop.tasks.count_where(TaskKind::is_network) == 0 {
                return;
            }
            self.wait_for_activity().await;
        }
    }

    // --- network -----------------------------------------------------------------------

    /// Runs `future` on the Tokio runtime as a tracked task; `on_complete`
    /// runs on the event loop with its output. Returns `false` when the
    /// window is closed or no runtime is available.
    pub(crate) fn spawn_task<T, F, C>(&self, kind: TaskKind, future: F, on_complete: C) -> bool
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        C: FnOnce(T) -> Result<(), JSError> + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?kind, "no Tokio runtime available, async task dropped");
            return false;
        };
        let task = self.0.event_loop.tasks.start(kind);
        let sender = self.0.event_loop.sender();
        let handle = runtime.spawn(async move {
            let output = future.await;
            let message = LoopMessage::Completed {
                task,
                run: Box::new(move || on_complete(output)),
            };
            if sender.send(message).is_err() {
                debug!("window dropped before its task completed");
            }
        });
        self.0.event_loop.track_load(task, handle);
        true
    }

    /// Loads a subresource; `on_complete` runs on the event loop.
    pub(crate) fn load_resource(
        &self,
        request: ResourceRequest,
        kind: TaskKind,
        on_complete: impl FnOnce(Result<Resource, NetworkError>) -> Result<(), JSError> + Send + 'static,
    ) {
        let loader = self.0.loader.clone();
        let url = request.url.clone();
        debug!(url = %url, ?kind, "resource load queued");
        let completion: Arc<Mutex<Option<_>>> = Arc::new(Mutex::new(Some(on_complete)));
        let fallback = completion.clone();
        let spawned = self.spawn_task(kind, async move { loader.load(request).await }, move |result| {
            match completion.lock().take() {
                Some(on_complete) => on_complete(result),
                None => Ok(()),
            }
        });
        if !spawned && !self.is_closed() {
            self.queue_microtask(move || match fallback.lock().take() {
                Some(on_complete) => on_complete(Err(NetworkError::RequestFailed(format!(
                    "no async runtime to load {url}"
                )))),
                None => Ok(()),
            });
        }
    }

    /// `window.fetch`: relative URLs resolve against the document. The
    /// request is cancelled by `options.signal`, by `abort()`/`close()` on
    /// the window, or by the timeout.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Aborted("the window is closed".into()));
        }
        let document = self.document();
        let url = document
            .resolve_url(url)
            .map_err(|e| NetworkError::InvalidUrl(e.message().to_string()))?;
        if let Some(signal) = &options.signal {
            signal
                .throw_if_aborted()
                .map_err(|reason| NetworkError::Aborted(reason.message().to_string()))?;
        }

        let guard = TaskGuard::new(&self.0.event_loop.tasks, TaskKind::Fetch);
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        let trigger: AbortTrigger = Arc::new(Mutex::new(Some(abort_tx)));
        if let Some(signal) = &options.signal {
            let trigger = trigger.clone();
            signal.add_algorithm(move || {
                if let Some(tx) = trigger.lock().take() {
                    let _ = tx.send(());
                }
            });
        }
        self.0.fetch_aborts.lock().insert(guard.id(), trigger.clone());

        let mut request = ResourceRequest::new(url.clone(), Destination::Fetch)
            .with_referrer(document.base_url())
            .with_method(options.method);
        for (name, value) in &options.headers {
            request = request.with_header(name, value);
        }
        let cookies = self.0.cookies.cookie_string(&url);
        if !cookies.is_empty() {
            request = request.with_header("Cookie", &cookies);
        }
        if let Some(body) = options.body {
            request = request.with_body(body);
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.0.settings.fetch.timeout_ms));
        let loader = self.0.loader.clone();

        debug!(url = %url, method = options.method.as_str(), "fetch");
        let result = tokio::select! {
            _ = abort_rx => Err(NetworkError::Aborted(format!("fetch of {url} was aborted"))),
            outcome = tokio::time::timeout(timeout, loader.load(request)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(format!("{url} after {timeout:?}"))),
            },
        };
        self.0.fetch_aborts.lock().remove(&guard.id());
        let resource = result?;
        for (name, value) in &resource.headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                self.0.cookies.set_cookie_from_header(&resource.url, value);
            }
        }
        Ok(FetchResponse::from_resource(&url, resource))
    }

    // --- teardown ------------------------------------------------------------------------

    /// Cancels timers, loads and fetches. The window stays usable.
    pub fn abort(&self) {
        let timers = self.0.event_loop.clear_all_timers();
        let loads = self.0.event_loop.abort_loads();
        let fetches: Vec<AbortTrigger> = self.0.fetch_aborts.lock().drain().map(|(_, t)| t).collect();
        for trigger in &fetches {
            if let Some(tx) = trigger.lock().take() {
                let _ = tx.send(());
            }
        }
        debug!(window = self.0.id, timers, loads, fetches = fetches.len(), "window aborted");
    }

    /// Aborts everything, destroys the realm and drops window listeners.
    /// Idempotent.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abort();
        self.0.event_loop.clear_microtasks();
        self.0.realm.destroy();
        self.0.listeners.clear();
        debug!(window = self.0.id, "window closed");
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::core::events::AbortController;
    use crate::js_engine::ClosureScriptEngine;

    fn window() -> Window {
        Window::new(BrowserSettings::default())
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn standalone_window_has_a_parsed_document() {
        let window = window();
        let document = window.document();
        assert!(document.body().is_some());
        assert_eq!(document.default_view().map(|w| w.id()), Some(window.id()));
        assert_eq!(window.location().href(), "about:blank");
        assert_eq!(window.inner_width(), 1024);
    }

    #[test]
    fn constructors_belong_to_their_window() {
        let a = window();
        let b = window();
        let array = a.construct("Array", serde_json::json!([1, 2])).unwrap();
        assert_eq!(array.value(), &serde_json::json!([1, 2]));
        assert!(array.instance_of(&a.global_constructor("Array").unwrap()));
        assert!(!array.instance_of(&b.global_constructor("Array").unwrap()));
        assert!(a.global_constructor("Nope").is_none());
        a.close();
        assert_eq!(a.construct("Array", Value::Null), Err(JSError::RealmDestroyed));
    }

    #[test]
    fn microtasks_drain_before_the_next_timer() {
        let window = window();
        let order = log();
        {
            let order = order.clone();
            let inner = window.clone();
            window.set_timeout(
                move || {
                    order.lock().push("timer 1".into());
                    let order = order.clone();
                    inner.queue_microtask(move || {
                        order.lock().push("microtask".into());
                        Ok(())
                    });
                    Ok(())
                },
                5,
            );
        }
        {
            let order = order.clone();
            window.set_timeout(
                move || {
                    order.lock().push("timer 2".into());
                    Ok(())
                },
                5,
            );
        }
        assert_eq!(window.advance_time(4), 0);
        assert_eq!(window.advance_time(1), 2);
        assert_eq!(*order.lock(), vec!["timer 1", "microtask", "timer 2"]);
        assert_eq!(window.pending_tasks(), 0);
    }

    #[test]
    fn intervals_fire_at_each_period_until_cleared() {
        let window = window();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let ticks = ticks.clone();
            let inner = window.clone();
            window.set_interval(
                move || {
                    ticks.lock().push(inner.performance_now());
                    Ok(())
                },
                10,
            )
        };
        window.advance_time(35);
        assert_eq!(*ticks.lock(), vec![10.0, 20.0, 30.0]);
        window.clear_interval(id);
        window.advance_time(100);
        assert_eq!(ticks.lock().len(), 3);
        assert_eq!(window.pending_tasks(), 0);
    }

    #[test]
    fn timeouts_are_clamped_by_settings() {
        let mut settings = BrowserSettings::default();
        settings.timer.max_timeout = Some(50);
        let window = Window::new(settings);
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            window.set_timeout(
                move || {
                    fired.store(true, Ordering::SeqCst);
                    Ok(())
                },
                10_000,
            );
        }
        window.advance_time(50);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn animation_frames_receive_the_frame_time() {
        let window = window();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            window.request_animation_frame(move |now| {
                *seen.lock() = Some(now);
                Ok(())
            });
        }
        let cancelled = window.request_animation_frame(|_| Ok(()));
        window.cancel_animation_frame(cancelled);
        window.advance_time(16);
        assert_eq!(*seen.lock(), Some(16.0));
        assert_eq!(window.pending_tasks(), 0);
    }

    #[test]
    fn timer_errors_reach_the_error_channel() {
        let window = window();
        let caught = log();
        {
            let caught = caught.clone();
            window.add_event_listener(
                "error",
                &EventListener::new(move |event| {
                    let details = event.error_details().unwrap_or_default();
                    caught.lock().push(details.message);
                    Ok(())
                }),
                false,
            );
        }
        window.set_timeout(|| Err(JSError::Execution("bad timer".into())), 0);
        let after = log();
        {
            let after = after.clone();
            window.set_timeout(
                move || {
                    after.lock().push("still runs".into());
                    Ok(())
                },
                0,
            );
        }
        window.advance_time(0);
        assert_eq!(*caught.lock(), vec!["Script execution failed: bad timer"]);
        assert_eq!(*after.lock(), vec!["still runs"]);
        assert_eq!(window.console().messages_at(ConsoleLevel::Error).len(), 1);
    }

    #[test]
    fn evaluation_goes_through_the_engine() {
        let engine = ClosureScriptEngine::new(|window, source| {
            window.document().set_title(source);
            Ok(Value::from(source.len()))
        });
        let window = Window::with_collaborators(
            BrowserSettings::default(),
            Arc::new(StaticResourceLoader::new()),
            Arc::new(engine),
            "https://example.com/",
            "<title>x</title>",
        )
        .unwrap();
        assert_eq!(window.evaluate("hello").unwrap(), Value::from(5));
        assert_eq!(window.document().title(), "hello");
        window.close();
        assert_eq!(window.evaluate("again"), Err(JSError::RealmDestroyed));
    }

    #[test]
    fn disabled_evaluation_is_an_error() {
        let mut settings = BrowserSettings::default();
        settings.disable_javascript_evaluation = true;
        let window = Window::new(settings);
        assert_eq!(window.evaluate("1"), Err(JSError::Disabled));
    }

    #[test]
    fn close_cancels_timers() {
        let window = window();
        window.set_timeout(|| panic!("must not run"), 10);
        window.set_interval(|| panic!("must not run"), 10);
        assert_eq!(window.pending_tasks(), 2);
        window.close();
        assert_eq!(window.pending_tasks(), 0);
        window.advance_time(100);
        assert_eq!(window.set_timeout(|| Ok(()), 1), TimerId(0));
    }

    #[tokio::test]
    async fn fetch_is_tracked_and_abortable() {
        let loader = StaticResourceLoader::new()
            .with_resource("https://example.com/data.json", "application/json", r#"{"ok":true}"#)
            .with_delayed(
                "https://example.com/slow",
                "text/plain",
                "late",
                Duration::from_secs(30),
            );
        let window = Window::with_collaborators(
            BrowserSettings::default(),
            Arc::new(loader),
            Arc::new(NoopScriptEngine),
            "https://example.com/index.html",
            "",
        )
        .unwrap();

        let response = window.fetch("data.json", FetchOptions::default()).await.unwrap();
        assert!(response.ok());
        assert_eq!(response.text(), r#"{"ok":true}"#);
        assert_eq!(window.pending_tasks(), 0);

        let controller = AbortController::new();
        let options = FetchOptions::default().with_signal(&controller.signal());
        let (result, _) = tokio::join!(window.fetch("/slow", options), async {
            tokio::task::yield_now().await;
            controller.abort(None);
        });
        assert!(matches!(result, Err(NetworkError::Aborted(_))));
        assert_eq!(window.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn when_complete_waits_for_chained_timers() {
        let window = window();
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let inner = window.clone();
            window.set_timeout(
                move || {
                    let done = done.clone();
                    inner.set_timeout(
                        move || {
                            done.store(true, Ordering::SeqCst);
                            Ok(())
                        },
                        1_000,
                    );
                    Ok(())
                },
                1_000,
            );
        }
        window.when_complete().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(window.performance_now(), 2_000.0);
    }
}
