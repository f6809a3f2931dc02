//! DOM events: the `Event` object, listener registration and the dispatch
//! algorithm shared by nodes, windows, abort signals and standalone targets.

mod abort;
mod dispatch;
mod target;

pub use abort::{AbortController, AbortSignal};
pub(crate) use dispatch::{dispatch_trusted, fire_simple_event};
pub use target::{EventTarget, StandaloneTarget, WeakEventTarget};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dom::{DomError, Result};
use crate::js_engine::JSError;

static TIME_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the first event of the process was created.
fn high_resolution_now() -> f64 {
    TIME_ORIGIN.elapsed().as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPhase {
    None = 0,
    Capturing = 1,
    AtTarget = 2,
    Bubbling = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInit {
    pub bubbles: bool,
    pub cancelable: bool,
    pub composed: bool,
}

impl EventInit {
    pub fn bubbling() -> Self {
        Self {
            bubbles: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEventInit {
    pub message: String,
    pub filename: String,
    pub lineno: u32,
    pub colno: u32,
    /// Display form of the thrown value, when there was one.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
    Other(u16),
}

impl MouseButton {
    /// Value of `MouseEvent.button`.
    pub fn as_u16(self) -> u16 {
        match self {
            MouseButton::Left => 0,
            MouseButton::Middle => 1,
            MouseButton::Right => 2,
            MouseButton::Other(n) => n,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MouseEventInit {
    pub client_x: f64,
    pub client_y: f64,
    pub button: MouseButton,
    pub modifiers: KeyModifiers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEventInit {
    pub key: String,
    pub code: String,
    pub repeat: bool,
    pub modifiers: KeyModifiers,
}

#[derive(Debug, Clone)]
enum EventPayload {
    Plain,
    Custom(Value),
    Error(ErrorEventInit),
    Focus,
    Mouse(MouseEventInit),
    Keyboard(KeyboardEventInit),
}

impl EventPayload {
    fn interface(&self) -> &'static str {
        match self {
            EventPayload::Plain => "Event",
            EventPayload::Custom(_) => "CustomEvent",
            EventPayload::Error(_) => "ErrorEvent",
            EventPayload::Focus => "FocusEvent",
            EventPayload::Mouse(_) => "MouseEvent",
            EventPayload::Keyboard(_) => "KeyboardEvent",
        }
    }
}

struct EventState {
    event_type: String,
    init: EventInit,
    payload: EventPayload,
    initialized: bool,
    dispatching: bool,
    stop_propagation: bool,
    stop_immediate: bool,
    canceled: bool,
    in_passive_listener: bool,
    is_trusted: bool,
    phase: EventPhase,
    target: Option<EventTarget>,
    current_target: Option<EventTarget>,
    related_target: Option<EventTarget>,
    path: Vec<EventTarget>,
}

struct EventInner {
    time_stamp: f64,
    state: Mutex<EventState>,
}

/// A DOM event. Clones share state; the dispatcher mutates the phase and
/// targets in place while listeners observe them.
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct(state.payload.interface())
            .field("type", &state.event_type)
            .field("phase", &state.phase)
            .field("bubbles", &state.init.bubbles)
            .field("canceled", &state.canceled)
            .finish()
    }
}

impl Event {
    fn build(event_type: &str, init: EventInit, payload: EventPayload, initialized: bool) -> Self {
        Event(Arc::new(EventInner {
            time_stamp: high_resolution_now(),
            state: Mutex::new(EventState {
                event_type: event_type.to_string(),
                init,
                payload,
                initialized,
                dispatching: false,
                stop_propagation: false,
                stop_immediate: false,
                canceled: false,
                in_passive_listener: false,
                is_trusted: false,
                phase: EventPhase::None,
                target: None,
                current_target: None,
                related_target: None,
                path: Vec::new(),
            }),
        }))
    }

    pub fn new(event_type: &str, init: EventInit) -> Self {
        Self::build(event_type, init, EventPayload::Plain, true)
    }

    /// `new CustomEvent(type, { detail })`.
    pub fn custom(event_type: &str, init: EventInit, detail: Value) -> Self {
        Self::build(event_type, init, EventPayload::Custom(detail), true)
    }

    /// An `error` `ErrorEvent` as fired for uncaught script errors.
    pub fn error(details: ErrorEventInit) -> Self {
        Self::build(
            "error",
            EventInit {
                bubbles: false,
                cancelable: true,
                composed: false,
            },
            EventPayload::Error(details),
            true,
        )
    }

    pub fn focus(event_type: &str, init: EventInit, related_target: Option<EventTarget>) -> Self {
        let event = Self::build(event_type, init, EventPayload::Focus, true);
        event.0.state.lock().related_target = related_target;
        event
    }

    pub fn mouse(event_type: &str, init: EventInit, mouse: MouseEventInit) -> Self {
        Self::build(event_type, init, EventPayload::Mouse(mouse), true)
    }

    pub fn keyboard(event_type: &str, init: EventInit, keyboard: KeyboardEventInit) -> Self {
        Self::build(event_type, init, EventPayload::Keyboard(keyboard), true)
    }

    /// `document.createEvent(interface)`: an uninitialized event that must
    /// go through [`Event::init_event`] before it can be dispatched.
    pub fn create_legacy(interface: &str) -> Result<Event> {
        let payload = match interface.to_ascii_lowercase().as_str() {
            "event" | "events" | "htmlevents" => EventPayload::Plain,
            "customevent" => EventPayload::Custom(Value::Null),
            "focusevent" => EventPayload::Focus,
            "mouseevent" | "mouseevents" => EventPayload::Mouse(MouseEventInit::default()),
            "keyboardevent" => EventPayload::Keyboard(KeyboardEventInit::default()),
            _ => {
                return Err(DomError::NotSupported(format!(
                    "the '{interface}' event interface is not supported"
                )))
            }
        };
        Ok(Self::build("", EventInit::default(), payload, false))
    }

    /// `initEvent`. Ignored while the event is being dispatched.
    pub fn init_event(&self, event_type: &str, bubbles: bool, cancelable: bool) {
        let mut state = self.0.state.lock();
        if state.dispatching {
            return;
        }
        state.initialized = true;
        state.stop_propagation = false;
        state.stop_immediate = false;
        state.canceled = false;
        state.is_trusted = false;
        state.target = None;
        state.event_type = event_type.to_string();
        state.init.bubbles = bubbles;
        state.init.cancelable = cancelable;
    }

    /// `initCustomEvent`.
    pub fn init_custom_event(&self, event_type: &str, bubbles: bool, cancelable: bool, detail: Value) {
        if self.0.state.lock().dispatching {
            return;
        }
        self.init_event(event_type, bubbles, cancelable);
        let mut state = self.0.state.lock();
        if let EventPayload::Custom(current) = &mut state.payload {
            *current = detail;
        }
    }

    pub fn event_type(&self) -> String {
        self.0.state.lock().event_type.clone()
    }

    pub fn interface(&self) -> &'static str {
        self.0.state.lock().payload.interface()
    }

    pub fn bubbles(&self) -> bool {
        self.0.state.lock().init.bubbles
    }

    pub fn cancelable(&self) -> bool {
        self.0.state.lock().init.cancelable
    }

    pub fn composed(&self) -> bool {
        self.0.state.lock().init.composed
    }

    pub fn is_trusted(&self) -> bool {
        self.0.state.lock().is_trusted
    }

    pub fn time_stamp(&self) -> f64 {
        self.0.time_stamp
    }

    pub fn target(&self) -> Option<EventTarget> {
        self.0.state.lock().target.clone()
    }

    /// Legacy alias of [`Event::target`].
    pub fn src_element(&self) -> Option<EventTarget> {
        self.target()
    }

    pub fn current_target(&self) -> Option<EventTarget> {
        self.0.state.lock().current_target.clone()
    }

    pub fn related_target(&self) -> Option<EventTarget> {
        self.0.state.lock().related_target.clone()
    }

    pub fn event_phase(&self) -> EventPhase {
        self.0.state.lock().phase
    }

    /// Targets the event travels through, innermost first. Empty outside dispatch.
    pub fn composed_path(&self) -> Vec<EventTarget> {
        self.0.state.lock().path.clone()
    }

    pub fn stop_propagation(&self) {
        self.0.state.lock().stop_propagation = true;
    }

    pub fn stop_immediate_propagation(&self) {
        let mut state = self.0.state.lock();
        state.stop_propagation = true;
        state.stop_immediate = true;
    }

    pub fn cancel_bubble(&self) -> bool {
        self.0.state.lock().stop_propagation
    }

    /// Setting `cancelBubble` to `false` has no effect.
    pub fn set_cancel_bubble(&self, value: bool) {
        if value {
            self.stop_propagation();
        }
    }

    /// Only cancelable events outside passive listeners can be canceled.
    pub fn prevent_default(&self) {
        let mut state = self.0.state.lock();
        if state.init.cancelable && !state.in_passive_listener {
            state.canceled = true;
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.0.state.lock().canceled
    }

    pub fn return_value(&self) -> bool {
        !self.default_prevented()
    }

    pub fn set_return_value(&self, value: bool) {
        if !value {
            self.prevent_default();
        }
    }

    /// `CustomEvent.detail`.
    pub fn detail(&self) -> Option<Value> {
        match &self.0.state.lock().payload {
            EventPayload::Custom(detail) => Some(detail.clone()),
            _ => None,
        }
    }

    /// `ErrorEvent` fields.
    pub fn error_details(&self) -> Option<ErrorEventInit> {
        match &self.0.state.lock().payload {
            EventPayload::Error(details) => Some(details.clone()),
            _ => None,
        }
    }

    pub fn mouse_details(&self) -> Option<MouseEventInit> {
        match &self.0.state.lock().payload {
            EventPayload::Mouse(mouse) => Some(mouse.clone()),
            _ => None,
        }
    }

    pub fn keyboard_details(&self) -> Option<KeyboardEventInit> {
        match &self.0.state.lock().payload {
            EventPayload::Keyboard(keyboard) => Some(keyboard.clone()),
            _ => None,
        }
    }
}

type ListenerFn = dyn Fn(&Event) -> std::result::Result<(), JSError> + Send + Sync;

/// A callback registered with `addEventListener`. Two listeners are the same
/// listener only when they are clones of one another.
#[derive(Clone)]
pub struct EventListener(Arc<ListenerFn>);

impl EventListener {
    pub fn new(
        callback: impl Fn(&Event) -> std::result::Result<(), JSError> + Send + Sync + 'static,
    ) -> Self {
        EventListener(Arc::new(callback))
    }

    pub(crate) fn call(&self, event: &Event) -> std::result::Result<(), JSError> {
        (self.0)(event)
    }
}

impl PartialEq for EventListener {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventListener({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddEventListenerOptions {
    pub capture: bool,
    pub once: bool,
    /// `None` applies the default, which is passive only for scroll-blocking
    /// events on the window, document or body.
    pub passive: Option<bool>,
    pub signal: Option<AbortSignal>,
}

impl AddEventListenerOptions {
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Self::default()
        }
    }

    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    pub fn with_signal(mut self, signal: &AbortSignal) -> Self {
        self.signal = Some(signal.clone());
        self
    }
}

impl From<bool> for AddEventListenerOptions {
    fn from(capture: bool) -> Self {
        Self {
            capture,
            ..Self::default()
        }
    }
}

pub(crate) struct RegisteredListener {
    event_type: String,
    listener: EventListener,
    capture: bool,
    once: bool,
    passive: bool,
    removed: AtomicBool,
}

impl RegisteredListener {
    fn matches(&self, event_type: &str, listener: &EventListener, capture: bool) -> bool {
        self.event_type == event_type && &self.listener == listener && self.capture == capture
    }
}

/// Ordered listener list of one event target.
#[derive(Default)]
pub struct EventListenerRegistry {
    entries: RwLock<Vec<Arc<RegisteredListener>>>,
}

impl fmt::Debug for EventListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListenerRegistry")
            .field("len", &self.entries.read().len())
            .finish()
    }
}

impl EventListenerRegistry {
    /// Returns `false` for a duplicate (type, listener, capture) triple.
    fn add(&self, event_type: &str, listener: &EventListener, capture: bool, once: bool, passive: bool) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.matches(event_type, listener, capture)) {
            return false;
        }
        entries.push(Arc::new(RegisteredListener {
            event_type: event_type.to_string(),
            listener: listener.clone(),
            capture,
            once,
            passive,
            removed: AtomicBool::new(false),
        }));
        true
    }

    fn remove(&self, event_type: &str, listener: &EventListener, capture: bool) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|e| e.matches(event_type, listener, capture)) {
            Some(index) => {
                entries.remove(index).removed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn remove_registration(&self, registration: &Arc<RegisteredListener>) {
        registration.removed.store(true, Ordering::Release);
        self.entries.write().retain(|e| !Arc::ptr_eq(e, registration));
    }

    fn snapshot(&self, event_type: &str) -> Vec<Arc<RegisteredListener>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn has_listeners(&self, event_type: &str) -> bool {
        self.entries.read().iter().any(|e| e.event_type == event_type)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        for entry in self.entries.write().drain(..) {
            entry.removed.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_events_need_initialization() {
        let event = Event::create_legacy("HTMLEvents").unwrap();
        let target = EventTarget::new();
        assert_eq!(
            target.dispatch_event(&event).unwrap_err().name(),
            "InvalidStateError"
        );
        event.init_event("ping", true, true);
        assert!(target.dispatch_event(&event).unwrap());
        assert_eq!(
            Event::create_legacy("TouchEvent").unwrap_err().name(),
            "NotSupportedError"
        );
    }

    #[test]
    fn prevent_default_requires_cancelable() {
        let plain = Event::new("x", EventInit::default());
        plain.prevent_default();
        assert!(!plain.default_prevented());

        let cancelable = Event::new(
            "x",
            EventInit {
                cancelable: true,
                ..EventInit::default()
            },
        );
        cancelable.set_return_value(false);
        assert!(cancelable.default_prevented());
        assert!(!cancelable.return_value());
    }

    #[test]
    fn custom_event_detail_can_be_reinitialized() {
        let event = Event::create_legacy("CustomEvent").unwrap();
        assert_eq!(event.interface(), "CustomEvent");
        event.init_custom_event("data", false, false, serde_json::json!({ "n": 1 }));
        assert_eq!(event.detail(), Some(serde_json::json!({ "n": 1 })));
        assert_eq!(event.event_type(), "data");
    }

    #[test]
    fn duplicate_registrations_are_ignored() {
        let registry = EventListenerRegistry::default();
        let listener = EventListener::new(|_| Ok(()));
        assert!(registry.add("a", &listener, false, false, false));
        assert!(!registry.add("a", &listener, false, false, false));
        assert!(registry.add("a", &listener, true, false, false));
        assert!(registry.add("a", &EventListener::new(|_| Ok(())), false, false, false));
        assert_eq!(registry.len(), 3);
        assert!(registry.remove("a", &listener, true));
        assert!(!registry.remove("a", &listener, true));
    }
}
