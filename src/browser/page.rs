use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::frame::BrowserFrame;
use super::{BrowserContext, ContextInner};
use crate::core::network::ResourceLoader;
use crate::js_engine::ScriptEngine;
use crate::window::{CookieJar, FrameHost, StorageAreas, VirtualConsole, WindowInit};
use crate::{BrowserError, BrowserSettings, Result, Viewport};

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

/// What every frame of a page shares: collaborators, console, viewport,
/// and the context's cookie jar and storage.
pub(crate) struct PageShared {
    pub(crate) settings: Arc<BrowserSettings>,
    pub(crate) loader: Arc<dyn ResourceLoader>,
    pub(crate) engine: Arc<dyn ScriptEngine>,
    pub(crate) console: VirtualConsole,
    pub(crate) cookies: CookieJar,
    pub(crate) local_storage: Arc<StorageAreas>,
    pub(crate) session_storage: Arc<StorageAreas>,
    pub(crate) viewport: RwLock<Viewport>,
}

impl PageShared {
    pub(crate) fn window_init(&self, frame_host: Weak<dyn FrameHost>) -> WindowInit {
        WindowInit {
            settings: self.settings.clone(),
            loader: self.loader.clone(),
            engine: self.engine.clone(),
            console: self.console.clone(),
            cookies: self.cookies.clone(),
            local_storage: self.local_storage.clone(),
            session_storage: self.session_storage.clone(),
            viewport: *self.viewport.read(),
            frame_host: Some(frame_host),
        }
    }
}

pub(crate) struct PageInner {
    id: u64,
    shared: Arc<PageShared>,
    main_frame: BrowserFrame,
    context: Arc<ContextInner>,
    closed: AtomicBool,
}

/// A tab: one main frame plus the frames its iframes create.
#[derive(Clone)]
pub struct BrowserPage(Arc<PageInner>);

impl fmt::Debug for BrowserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPage")
            .field("id", &self.0.id)
            .field("url", &self.url())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for BrowserPage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl BrowserPage {
    pub(crate) fn new(shared: PageShared, context: Arc<ContextInner>) -> Result<BrowserPage> {
        let shared = Arc::new(shared);
        let main_frame = BrowserFrame::new(shared.clone(), None)?;
        let page = BrowserPage(Arc::new(PageInner {
            id: NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed),
            shared,
            main_frame,
            context,
            closed: AtomicBool::new(false),
        }));
        debug!(page = page.0.id, "page opened");
        Ok(page)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BrowserError::Closed(format!("page {}", self.0.id)));
        }
        Ok(())
    }

    /// The context this page was opened in. Pages keep their context alive.
    pub fn context(&self) -> BrowserContext {
        BrowserContext(self.0.context.clone())
    }

    pub(crate) fn downgrade(&self) -> WeakBrowserPage {
        WeakBrowserPage(Arc::downgrade(&self.0))
    }

    pub fn main_frame(&self) -> &BrowserFrame {
        &self.0.main_frame
    }

    /// The main frame and every nested frame, depth first.
    pub fn frames(&self) -> Vec<BrowserFrame> {
        let mut frames = Vec::new();
        self.0.main_frame.collect_frames(&mut frames);
        frames
    }

    /// Console shared by every frame of the page.
    pub fn console(&self) -> &VirtualConsole {
        &self.0.shared.console
    }

    pub fn url(&self) -> String {
        self.0.main_frame.url()
    }

    pub fn viewport(&self) -> Viewport {
        *self.0.shared.viewport.read()
    }

    /// Applies to every frame; windows whose size changed fire `resize`.
    pub fn set_viewport(&self, viewport: Viewport) {
        *self.0.shared.viewport.write() = viewport;
        for frame in self.frames() {
            if let Some(window) = frame.window() {
                window.set_viewport(viewport);
            }
        }
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        self.0.main_frame.goto(url).await
    }

    pub async fn set_content(&self, html: &str) -> Result<()> {
        self.ensure_open()?;
        self.0.main_frame.set_content(html).await
    }

    pub fn content(&self) -> String {
        self.0.main_frame.content()
    }

    pub fn evaluate(&self, source: &str) -> Result<Value> {
        self.ensure_open()?;
        self.0.main_frame.evaluate(source)
    }

    pub async fn when_complete(&self) {
        if self.is_closed() {
            return;
        }
        self.0.main_frame.when_complete().await;
    }

    /// Cancels loads and timers in every frame; the page stays usable.
    pub fn abort(&self) {
        self.0.main_frame.abort();
    }

    /// Destroys the frame tree and leaves the context. Closing the last page
    /// of a context closes the context.
    pub fn close(&self) {
        if !self.close_frames() {
            return;
        }
        self.context().page_closed(self.0.id);
    }

    /// Returns `false` when the page was already closed.
    pub(crate) fn close_frames(&self) -> bool {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.0.main_frame.close();
        self.0.shared.session_storage.clear();
        debug!(page = self.0.id, "page closed");
        true
    }
}

/// Back-reference from a context to one of its pages.
#[derive(Clone)]
pub(crate) struct WeakBrowserPage(Weak<PageInner>);

impl WeakBrowserPage {
    pub(crate) fn upgrade(&self) -> Option<BrowserPage> {
        self.0.upgrade().map(BrowserPage)
    }
}
