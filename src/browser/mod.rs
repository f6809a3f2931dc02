//! Browser → Context → Page → Frame.
//!
//! A [`Browser`] holds contexts; a [`BrowserContext`] holds pages sharing one
//! cookie jar and `localStorage`; a [`BrowserPage`] has one main
//! [`BrowserFrame`] plus a frame per nested `<iframe>`.

mod frame;
mod page;

pub use frame::BrowserFrame;
pub use page::BrowserPage;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info};

use self::page::{PageShared, WeakBrowserPage};
use crate::core::network::{ResourceLoader, StaticResourceLoader};
use crate::js_engine::{NoopScriptEngine, ScriptEngine};
use crate::window::{CookieJar, Storage, StorageAreas, VirtualConsole};
use crate::{BrowserError, BrowserSettings, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct BrowserInner {
    settings: Arc<BrowserSettings>,
    loader: Arc<dyn ResourceLoader>,
    engine: Arc<dyn ScriptEngine>,
    contexts: RwLock<Vec<BrowserContext>>,
    default_context: RwLock<Option<BrowserContext>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Browser(Arc<BrowserInner>);

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Browser")
            .field("contexts", &self.0.contexts.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Browser {
    /// Loads over HTTP when the `http` feature is enabled, otherwise from
    /// an empty in-memory loader. Scripts evaluate to `null`.
    pub fn new(settings: BrowserSettings) -> Result<Browser> {
        #[cfg(feature = "http")]
        let loader: Arc<dyn ResourceLoader> =
            Arc::new(crate::core::network::HttpResourceLoader::new(&settings)?);
        #[cfg(not(feature = "http"))]
        let loader: Arc<dyn ResourceLoader> = Arc::new(StaticResourceLoader::new());
        Ok(Self::with_collaborators(settings, loader, Arc::new(NoopScriptEngine)))
    }

    /// A browser with no network: every load goes to an empty in-memory
    /// loader, so only `about:blank`, `data:` URLs and `set_content` work.
    pub fn offline(settings: BrowserSettings) -> Browser {
        Self::with_collaborators(
            settings,
            Arc::new(StaticResourceLoader::new()),
            Arc::new(NoopScriptEngine),
        )
    }

    pub fn with_collaborators(
        settings: BrowserSettings,
        loader: Arc<dyn ResourceLoader>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Browser {
        info!(engine = engine.name(), "browser started");
        Browser(Arc::new(BrowserInner {
            settings: Arc::new(settings),
            loader,
            engine,
            contexts: RwLock::new(Vec::new()),
            default_context: RwLock::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.0.settings
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BrowserError::Closed("browser".into()));
        }
        Ok(())
    }

    fn create_context(&self, incognito: bool) -> BrowserContext {
        let context = BrowserContext(Arc::new(ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            incognito,
            browser: Arc::downgrade(&self.0),
            settings: self.0.settings.clone(),
            loader: self.0.loader.clone(),
            engine: self.0.engine.clone(),
            cookies: CookieJar::new(),
            local_storage: Arc::new(StorageAreas::default()),
            pages: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }));
        self.0.contexts.write().push(context.clone());
        debug!(context = context.id(), incognito, "context created");
        context
    }

    /// The shared, non-incognito context. A new one is created when the
    /// previous default context was closed.
    pub fn default_context(&self) -> Result<BrowserContext> {
        self.ensure_open()?;
        let mut current = self.0.default_context.write();
        if let Some(context) = current.as_ref().filter(|context| !context.is_closed()) {
            return Ok(context.clone());
        }
        let context = self.create_context(false);
        *current = Some(context.clone());
        Ok(context)
    }

    pub fn new_incognito_context(&self) -> Result<BrowserContext> {
        self.ensure_open()?;
        Ok(self.create_context(true))
    }

    /// Opens a page in the default context.
    pub fn new_page(&self) -> Result<BrowserPage> {
        self.default_context()?.new_page()
    }

    pub fn contexts(&self) -> Vec<BrowserContext> {
        self.0.contexts.read().clone()
    }

    /// Closes every context and page.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let contexts: Vec<BrowserContext> = self.0.contexts.write().drain(..).collect();
        for context in contexts {
            context.close();
        }
        self.0.default_context.write().take();
        info!("browser closed");
    }
}

pub(crate) struct ContextInner {
    id: u64,
    incognito: bool,
    browser: Weak<BrowserInner>,
    settings: Arc<BrowserSettings>,
    loader: Arc<dyn ResourceLoader>,
    engine: Arc<dyn ScriptEngine>,
    cookies: CookieJar,
    local_storage: Arc<StorageAreas>,
    /// Pages hold their context; the context only tracks them.
    pages: RwLock<Vec<WeakBrowserPage>>,
    closed: AtomicBool,
}

/// A set of pages sharing cookies and `localStorage`.
#[derive(Clone)]
pub struct BrowserContext(pub(crate) Arc<ContextInner>);

impl fmt::Debug for BrowserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserContext")
            .field("id", &self.0.id)
            .field("incognito", &self.0.incognito)
            .field("pages", &self.pages().len())
            .finish()
    }
}

impl PartialEq for BrowserContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl BrowserContext {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_incognito(&self) -> bool {
        self.0.incognito
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.0.cookies
    }

    /// `localStorage` of `origin` (e.g. `https://example.com`).
    pub fn local_storage(&self, origin: &str) -> Storage {
        self.0.local_storage.for_origin(origin)
    }

    pub fn new_page(&self) -> Result<BrowserPage> {
        if self.is_closed() {
            return Err(BrowserError::Closed(format!("context {}", self.0.id)));
        }
        let shared = PageShared {
            settings: self.0.settings.clone(),
            loader: self.0.loader.clone(),
            engine: self.0.engine.clone(),
            console: VirtualConsole::new(),
            cookies: self.0.cookies.clone(),
            local_storage: self.0.local_storage.clone(),
            session_storage: Arc::new(StorageAreas::default()),
            viewport: RwLock::new(self.0.settings.viewport),
        };
        let page = BrowserPage::new(shared, self.0.clone())?;
        self.0.pages.write().push(page.downgrade());
        Ok(page)
    }

    /// Open pages that are still referenced.
    pub fn pages(&self) -> Vec<BrowserPage> {
        self.0
            .pages
            .read()
            .iter()
            .filter_map(WeakBrowserPage::upgrade)
            .filter(|page| !page.is_closed())
            .collect()
    }

    pub(crate) fn page_closed(&self, page_id: u64) {
        let empty = {
            let mut pages = self.0.pages.write();
            pages.retain(|page| {
                page.upgrade()
                    .is_some_and(|page| page.id() != page_id && !page.is_closed())
            });
            pages.is_empty()
        };
        if empty {
            self.close();
        }
    }

    /// Closes every page and leaves the browser. Cookies and storage of
    /// the context are dropped.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pages: Vec<BrowserPage> = self
            .0
            .pages
            .write()
            .drain(..)
            .filter_map(|page| page.upgrade())
            .collect();
        for page in &pages {
            page.close_frames();
        }
        self.0.cookies.clear();
        self.0.local_storage.clear();
        if let Some(browser) = self.0.browser.upgrade() {
            browser.contexts.write().retain(|context| context.id() != self.0.id);
        }
        debug!(context = self.0.id, pages = pages.len(), "context closed");
    }
}
