use std::fmt;
use std::sync::{Arc, Weak};

use super::{AbortSignal, AddEventListenerOptions, Event, EventListener, EventListenerRegistry};
use crate::core::dom::{Node, Result, WeakNode};
use crate::window::{WeakWindow, Window};

/// Target without a node or window behind it (`new EventTarget()`).
#[derive(Debug, Default)]
pub struct StandaloneTarget {
    listeners: EventListenerRegistry,
}

/// Anything events can be dispatched to.
#[derive(Clone)]
pub enum EventTarget {
    Node(Node),
    Window(Window),
    AbortSignal(AbortSignal),
    Standalone(Arc<StandaloneTarget>),
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EventTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EventTarget::Node(a), EventTarget::Node(b)) => a == b,
            (EventTarget::Window(a), EventTarget::Window(b)) => a.ptr_eq(b),
            (EventTarget::AbortSignal(a), EventTarget::AbortSignal(b)) => a.ptr_eq(b),
            (EventTarget::Standalone(a), EventTarget::Standalone(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTarget::Node(node) => write!(f, "EventTarget({node:?})"),
            EventTarget::Window(window) => write!(f, "EventTarget({window:?})"),
            EventTarget::AbortSignal(signal) => write!(f, "EventTarget({signal:?})"),
            EventTarget::Standalone(target) => write!(f, "EventTarget({:p})", Arc::as_ptr(target)),
        }
    }
}

impl From<Node> for EventTarget {
    fn from(node: Node) -> Self {
        EventTarget::Node(node)
    }
}

impl From<Window> for EventTarget {
    fn from(window: Window) -> Self {
        EventTarget::Window(window)
    }
}

impl From<AbortSignal> for EventTarget {
    fn from(signal: AbortSignal) -> Self {
        EventTarget::AbortSignal(signal)
    }
}

impl EventTarget {
    /// A fresh standalone target.
    pub fn new() -> Self {
        EventTarget::Standalone(Arc::new(StandaloneTarget::default()))
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            EventTarget::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<&Window> {
        match self {
            EventTarget::Window(window) => Some(window),
            _ => None,
        }
    }

    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&EventListenerRegistry) -> R) -> R {
        match self {
            EventTarget::Node(node) => f(&node.0.listeners),
            EventTarget::Window(window) => f(window.listeners()),
            EventTarget::AbortSignal(signal) => f(signal.listeners()),
            EventTarget::Standalone(target) => f(&target.listeners),
        }
    }

    /// Window whose error channel receives listener failures.
    pub(crate) fn owning_window(&self) -> Option<Window> {
        match self {
            EventTarget::Node(node) => node.node_document().and_then(|doc| doc.default_view()),
            EventTarget::Window(window) => Some(window.clone()),
            _ => None,
        }
    }

    /// Scroll-blocking events on the window, document or body default to passive.
    fn default_passive(&self, event_type: &str) -> bool {
        if !matches!(event_type, "touchstart" | "touchmove" | "wheel" | "mousewheel") {
            return false;
        }
        match self {
            EventTarget::Window(_) => true,
            EventTarget::Node(node) => {
                if node.as_document().is_some() {
                    return true;
                }
                let Some(document) = node.node_document() else {
                    return false;
                };
                let is_root = document.document_element().is_some_and(|e| e.as_node() == node);
                let is_body = document.body().is_some_and(|e| e.as_node() == node);
                is_root || is_body
            }
            _ => false,
        }
    }

    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: &EventListener,
        options: impl Into<AddEventListenerOptions>,
    ) {
        let options = options.into();
        if options.signal.as_ref().is_some_and(|s| s.aborted()) {
            return;
        }
        let passive = options
            .passive
            .unwrap_or_else(|| self.default_passive(event_type));
        let added = self.with_registry(|registry| {
            registry.add(event_type, listener, options.capture, options.once, passive)
        });
        if !added {
            return;
        }
        if let Some(signal) = options.signal {
            let target = self.downgrade();
            let event_type = event_type.to_string();
            let listener = listener.clone();
            let capture = options.capture;
            signal.add_algorithm(move || {
                if let Some(target) = target.upgrade() {
                    target.remove_event_listener(&event_type, &listener, capture);
                }
            });
        }
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &EventListener, capture: bool) {
        self.with_registry(|registry| registry.remove(event_type, listener, capture));
    }

    /// `dispatchEvent`: untrusted dispatch. Returns `false` when a listener
    /// canceled the event.
    pub fn dispatch_event(&self, event: &Event) -> Result<bool> {
        super::dispatch::dispatch(self, event, false)
    }

    pub fn downgrade(&self) -> WeakEventTarget {
        match self {
            EventTarget::Node(node) => WeakEventTarget::Node(node.downgrade()),
            EventTarget::Window(window) => WeakEventTarget::Window(window.downgrade()),
            EventTarget::AbortSignal(signal) => WeakEventTarget::AbortSignal(signal.downgrade()),
            EventTarget::Standalone(target) => WeakEventTarget::Standalone(Arc::downgrade(target)),
        }
    }
}

/// Non-owning form of [`EventTarget`], held by abort algorithms.
#[derive(Clone)]
pub enum WeakEventTarget {
    Node(WeakNode),
    Window(WeakWindow),
    AbortSignal(super::abort::WeakAbortSignal),
    Standalone(Weak<StandaloneTarget>),
}

impl WeakEventTarget {
    pub fn upgrade(&self) -> Option<EventTarget> {
        match self {
            WeakEventTarget::Node(node) => node.upgrade().map(EventTarget::Node),
            WeakEventTarget::Window(window) => window.upgrade().map(EventTarget::Window),
            WeakEventTarget::AbortSignal(signal) => signal.upgrade().map(EventTarget::AbortSignal),
            WeakEventTarget::Standalone(target) => target.upgrade().map(EventTarget::Standalone),
        }
    }
}
