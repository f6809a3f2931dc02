use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::{Position, Url};

use super::page::PageShared;
use crate::core::dom::{behavior, parser, serializer, Document, DocumentReadyState, Element};
use crate::core::events::{dispatch_trusted, fire_simple_event, Event, EventInit, EventTarget};
use crate::core::network::{data_url, Destination, Resource, ResourceRequest};
use crate::window::{FrameHost, TaskKind, Window};
use crate::{BrowserError, Result};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

fn navigation_error(url: &Url, reason: impl fmt::Display) -> BrowserError {
    BrowserError::Navigation {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Loads and runs `scripts` one after another as tracked script tasks, then
/// sets `done`. An aborted load ends the chain without running the rest.
fn run_parser_scripts(window: &Window, mut scripts: VecDeque<Element>, done: Arc<AtomicBool>) {
    let document = window.document();
    while let Some(script) = scripts.pop_front() {
        let Some(url) = script
            .get_attribute("src")
            .and_then(|src| document.resolve_url(src.trim()).ok())
        else {
            continue;
        };
        let request = ResourceRequest::new(url.clone(), Destination::Script).with_referrer(document.base_url());
        let owner = window.clone();
        window.load_resource(request, TaskKind::Script, move |result| {
            let outcome = behavior::run_loaded_script(
                &owner,
                &script,
                &url,
                result.map_err(|e| crate::js_engine::JSError::Execution(e.to_string())),
            );
            if let Err(error) = outcome {
                debug!(%error, url = %url, "parser-inserted script failed");
            }
            run_parser_scripts(&owner, scripts, done);
            Ok(())
        });
        return;
    }
    done.store(true, Ordering::Release);
}

pub(crate) struct FrameInner {
    id: u64,
    this: Weak<FrameInner>,
    shared: Arc<PageShared>,
    parent: Option<Weak<FrameInner>>,
    window: RwLock<Option<Window>>,
    /// `<iframe>` elements of the current document and the frames they host.
    children: RwLock<Vec<(Element, BrowserFrame)>>,
    pending_navigation: Mutex<Option<Url>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

/// One navigable: the main document of a page or the content of an
/// `<iframe>`. Owns exactly one window at a time.
#[derive(Clone)]
pub struct BrowserFrame(Arc<FrameInner>);

impl fmt::Debug for BrowserFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserFrame")
            .field("id", &self.0.id)
            .field("url", &self.url())
            .field("children", &self.0.children.read().len())
            .finish()
    }
}

impl PartialEq for BrowserFrame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl BrowserFrame {
    /// A frame on `about:blank`.
    pub(crate) fn new(shared: Arc<PageShared>, parent: Option<Weak<FrameInner>>) -> Result<BrowserFrame> {
        let frame = BrowserFrame(Arc::new_cyclic(|this| FrameInner {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            shared,
            parent,
            window: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            pending_navigation: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }));
        let window = frame.create_window(crate::core::dom::document::ABOUT_BLANK.clone())?;
        parser::parse_document(&window.document(), "", false);
        *frame.0.window.write() = Some(window);
        Ok(frame)
    }

    fn create_window(&self, url: Url) -> Result<Window> {
        let host: Weak<dyn FrameHost> = self.0.this.clone();
        Ok(Window::create(self.0.shared.window_init(host), url)?)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_main_frame(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// `None` once the frame is closed.
    pub fn window(&self) -> Option<Window> {
        self.0.window.read().clone()
    }

    pub fn document(&self) -> Option<Document> {
        self.window().map(|window| window.document())
    }

    pub fn url(&self) -> String {
        self.document()
            .map(|document| document.url())
            .unwrap_or_else(|| "about:blank".to_string())
    }

    pub fn ready_state(&self) -> DocumentReadyState {
        self.document()
            .map(|document| document.ready_state())
            .unwrap_or(DocumentReadyState::Complete)
    }

    pub fn parent_frame(&self) -> Option<BrowserFrame> {
        self.0.parent.as_ref()?.upgrade().map(BrowserFrame)
    }

    pub fn child_frames(&self) -> Vec<BrowserFrame> {
        self.0
            .children
            .read()
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    fn child_for(&self, element: &Element) -> Option<BrowserFrame> {
        self.0
            .children
            .read()
            .iter()
            .find(|(host, _)| host == element)
            .map(|(_, frame)| frame.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BrowserError::Closed(format!("frame {}", self.0.id)));
        }
        Ok(())
    }

    /// Serialized markup of the current document.
    pub fn content(&self) -> String {
        self.document()
            .map(|document| serializer::serialize_children(&document))
            .unwrap_or_default()
    }

    pub fn evaluate(&self, source: &str) -> Result<Value> {
        self.ensure_open()?;
        let window = self
            .window()
            .ok_or_else(|| BrowserError::Closed(format!("frame {}", self.0.id)))?;
        Ok(window.evaluate(source)?)
    }

    // --- navigation -----------------------------------------------------------------

    /// Navigates to `url`, resolved against the current document. Resolves
    /// once the new document is complete; on failure the current document
    /// stays in place.
    pub async fn goto(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let target = match self.document() {
            Some(document) => document.resolve_url(url).map_err(|e| BrowserError::InvalidUrl(e.message().to_string()))?,
            None => Url::parse(url)?,
        };
        self.navigate(target).await
    }

    /// Replaces the document with `html`, keeping the current URL.
    pub async fn set_content(&self, html: &str) -> Result<()> {
        self.ensure_open()?;
        let url = self
            .document()
            .map(|document| document.url_value())
            .unwrap_or_else(|| crate::core::dom::document::ABOUT_BLANK.clone());
        let generation = self.0.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let resource = Resource::new(url, 200, Some("text/html"), html.as_bytes().to_vec());
        self.commit(resource, None, generation).await
    }

    pub(crate) fn navigate(&self, url: Url) -> BoxFuture<'static, Result<()>> {
        let frame = self.clone();
        async move {
            let target = url.clone();
            match AssertUnwindSafe(frame.load(url)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(navigation_error(
                    &target,
                    format!("panic caught: {}", panic_message(panic.as_ref())),
                )),
            }
        }
        .boxed()
    }

    async fn load(&self, url: Url) -> Result<()> {
        self.ensure_open()?;
        let settings = self.0.shared.settings.clone();
        let disabled = if self.is_main_frame() {
            settings.navigation.disable_main_frame_navigation
        } else {
            settings.navigation.disable_child_frame_navigation
        };
        if disabled {
            warn!(frame = self.0.id, url = %url, "navigation is disabled by settings");
            self.0
                .shared
                .console
                .warn(&format!("Navigation to {url} ignored: frame navigation is disabled"));
            return Ok(());
        }

        let generation = self.0.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self.window();
        if let Some(window) = &previous {
            let current = window.document().url_value();
            let same_document = current.scheme() != "about"
                && url.fragment().is_some()
                && url[..Position::AfterQuery] == current[..Position::AfterQuery];
            if same_document {
                window.location().set_hash(url.fragment().unwrap_or_default());
                return Ok(());
            }
        }

        info!(frame = self.0.id, url = %url, "navigating");
        let referrer = previous.as_ref().map(|window| window.document().url_value());
        let resource = self.fetch_document(&url, referrer.as_ref()).await?;
        if self.0.generation.load(Ordering::Acquire) != generation {
            return Err(navigation_error(&url, "superseded by another navigation"));
        }
        self.ensure_open()?;
        self.commit(resource, referrer, generation).await
    }

    async fn fetch_document(&self, url: &Url, referrer: Option<&Url>) -> Result<Resource> {
        let shared = &self.0.shared;
        let settings = &shared.settings;
        match url.scheme() {
            "about" => Ok(Resource::new(url.clone(), 200, Some("text/html"), Vec::new())),
            "data" => {
                if !settings.allow_data_urls {
                    return Err(navigation_error(url, "data: URLs are not allowed"));
                }
                let resource = data_url::load(url, settings.max_data_url_bytes)
                    .map_err(|e| navigation_error(url, e))?;
                let mime = resource.mime_essence().unwrap_or_default();
                if !settings.data_mime_allowed(&mime) {
                    return Err(navigation_error(url, format!("data: URL type '{mime}' is not allowed")));
                }
                Ok(resource)
            }
            _ => {
                let destination = if self.is_main_frame() {
                    Destination::Document
                } else {
                    Destination::Iframe
                };
                let mut request = ResourceRequest::new(url.clone(), destination);
                if let Some(referrer) = referrer {
                    request = request.with_referrer(referrer.clone());
                }
                let cookies = shared.cookies.cookie_string(url);
                if !cookies.is_empty() {
                    request = request.with_header("Cookie", &cookies);
                }
                let timeout = Duration::from_millis(settings.navigation.timeout_ms);
                let resource = match tokio::time::timeout(timeout, shared.loader.load(request)).await {
                    Ok(Ok(resource)) => resource,
                    Ok(Err(error)) => return Err(navigation_error(url, error)),
                    Err(_) => return Err(navigation_error(url, format!("timed out after {timeout:?}"))),
                };
                for (name, value) in &resource.headers {
                    if name.eq_ignore_ascii_case("set-cookie") {
                        shared.cookies.set_cookie_from_header(&resource.url, value);
                    }
                }
                if !resource.is_success() {
                    return Err(navigation_error(url, format!("HTTP status {}", resource.status)));
                }
                Ok(resource)
            }
        }
    }

    /// Swaps in a fresh window for `resource` and runs it to `complete`.
    async fn commit(&self, resource: Resource, referrer: Option<Url>, generation: u64) -> Result<()> {
        let settings = self.0.shared.settings.clone();
        let window = self.create_window(resource.url.clone())?;
        let document = window.document();
        let mime = resource.mime_essence().unwrap_or_else(|| "text/html".to_string());
        document.set_content_type(&mime);
        if let Some(referrer) = &referrer {
            document.set_referrer(referrer.as_str());
        }

        self.unload();
        *self.0.window.write() = Some(window.clone());
        debug!(frame = self.0.id, url = %resource.url, "navigation committed");

        document.set_ready_state(DocumentReadyState::Loading);
        let markup = if mime == "text/plain" {
            format!("<pre>{}</pre>", escape_text(&resource.text()))
        } else {
            resource.text()
        };
        parser::parse_document(&document, &markup, !settings.disable_javascript_evaluation);
        window.perform_microtask_checkpoint();

        // external parser-inserted scripts, in document order
        let scripts: VecDeque<Element> = document.take_deferred_scripts().into();
        if !scripts.is_empty() {
            let done = Arc::new(AtomicBool::new(false));
            run_parser_scripts(&window, scripts, done.clone());
            window.drive_until(|| done.load(Ordering::Acquire)).await;
            if window.is_closed() {
                return Ok(());
            }
        }

        document.set_ready_state(DocumentReadyState::Interactive);
        let loaded = Event::new("DOMContentLoaded", EventInit::bubbling());
        if let Err(error) = dispatch_trusted(&EventTarget::Node(document.as_node().clone()), &loaded) {
            warn!(%error, "could not fire DOMContentLoaded");
        }
        window.perform_microtask_checkpoint();

        window.settle_loads().await;
        if window.is_closed() || self.0.generation.load(Ordering::Acquire) != generation {
            return Ok(());
        }
        document.set_ready_state(DocumentReadyState::Complete);
        window.fire("load");
        window.perform_microtask_checkpoint();
        info!(frame = self.0.id, url = %document.url(), "document complete");
        Ok(())
    }

    /// Fires `unload` on the current window, then tears down child frames
    /// and closes it.
    fn unload(&self) {
        let previous = self.0.window.write().take();
        if let Some(window) = &previous {
            window.fire("unload");
        }
        let children: Vec<BrowserFrame> = self
            .0
            .children
            .write()
            .drain(..)
            .map(|(_, frame)| frame)
            .collect();
        for child in children {
            child.close();
        }
        if let Some(window) = previous {
            window.close();
        }
    }

    // --- completion ---------------------------------------------------------------------

    /// Resolves once this frame's async task counter and those of every
    /// child frame are at zero. Navigations requested by scripts through
    /// `location` are carried out on the way.
    pub fn when_complete(&self) -> BoxFuture<'static, ()> {
        let frame = self.clone();
        async move {
            loop {
                if frame.is_closed() {
                    return;
                }
                let pending = frame.0.pending_navigation.lock().take();
                if let Some(url) = pending {
                    if let Err(error) = frame.navigate(url).await {
                        warn!(frame = frame.0.id, %error, "requested navigation failed");
                        frame.0.shared.console.error(&error.to_string());
                    }
                    continue;
                }
                let Some(window) = frame.window() else {
                    return;
                };
                window.when_complete().await;
                for child in frame.child_frames() {
                    child.when_complete().await;
                }
                let idle = window.pending_tasks() == 0
                    && frame.0.pending_navigation.lock().is_none()
                    && frame.window().is_some_and(|current| current.ptr_eq(&window));
                if idle {
                    return;
                }
            }
        }
        .boxed()
    }

    /// Cancels timers and loads here and in every child frame.
    pub fn abort(&self) {
        self.0.pending_navigation.lock().take();
        if let Some(window) = self.window() {
            window.abort();
        }
        for child in self.child_frames() {
            child.abort();
        }
    }

    /// Tears down the window and every child frame. Idempotent.
    pub(crate) fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.0.generation.fetch_add(1, Ordering::AcqRel);
        self.0.pending_navigation.lock().take();
        self.unload();
        debug!(frame = self.0.id, "frame closed");
    }

    /// This frame followed by its descendants, depth first.
    pub(crate) fn collect_frames(&self, frames: &mut Vec<BrowserFrame>) {
        frames.push(self.clone());
        for child in self.child_frames() {
            child.collect_frames(frames);
        }
    }
}

impl FrameInner {
    fn frame(&self) -> Option<BrowserFrame> {
        self.this.upgrade().map(BrowserFrame)
    }
}

impl FrameHost for FrameInner {
    fn attach_iframe(&self, element: &Element) {
        let Some(frame) = self.frame() else {
            return;
        };
        if frame.is_closed() || frame.child_for(element).is_some() {
            return;
        }
        let child = match BrowserFrame::new(self.shared.clone(), Some(self.this.clone())) {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, "could not create iframe content");
                return;
            }
        };
        debug!(parent = self.id, child = child.id(), "iframe attached");
        self.children.write().push((element.clone(), child));

        let has_src = element
            .get_attribute("src")
            .is_some_and(|src| !src.trim().is_empty());
        if has_src {
            self.navigate_iframe(element);
        } else if let Some(window) = element.node_document().and_then(|doc| doc.default_view()) {
            let target = element.clone();
            window.queue_microtask(move || {
                fire_simple_event(&target, "load");
                Ok(())
            });
        }
    }

    fn navigate_iframe(&self, element: &Element) {
        let Some(child) = self.frame().and_then(|frame| frame.child_for(element)) else {
            return;
        };
        let Some(window) = element.node_document().and_then(|doc| doc.default_view()) else {
            return;
        };
        let src = element.src();
        let url = match Url::parse(&src) {
            Ok(url) => url,
            Err(error) => {
                warn!(%src, %error, "iframe src is not a valid URL");
                return;
            }
        };
        if self.shared.settings.disable_iframe_page_loading {
            window
                .console()
                .warn(&format!("Iframe page loading is disabled, skipped {url}"));
            let target = element.clone();
            window.queue_microtask(move || {
                fire_simple_event(&target, "load");
                Ok(())
            });
            return;
        }
        let target = element.clone();
        let console = window.console().clone();
        window.spawn_task(TaskKind::Navigation, child.navigate(url), move |result| {
            if let Err(error) = result {
                console.warn(&format!("Iframe navigation failed: {error}"));
            }
            fire_simple_event(&target, "load");
            Ok(())
        });
    }

    fn detach_iframe(&self, element: &Element) {
        let removed = {
            let mut children = self.children.write();
            children
                .iter()
                .position(|(host, _)| host == element)
                .map(|index| children.remove(index).1)
        };
        if let Some(child) = removed {
            debug!(parent = self.id, child = child.id(), "iframe detached");
            child.close();
        }
    }

    fn content_window(&self, element: &Element) -> Option<Window> {
        self.frame()?.child_for(element)?.window()
    }

    fn request_navigation(&self, url: Url, replace: bool) {
        debug!(frame = self.id, url = %url, replace, "navigation requested");
        *self.pending_navigation.lock() = Some(url);
    }
}
