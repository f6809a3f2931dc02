use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{dispatch_trusted, AddEventListenerOptions, Event, EventInit, EventListener, EventListenerRegistry, EventTarget};
use crate::core::dom::{DomError, Result};
use crate::window::Window;

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

type AbortAlgorithm = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<DomError>,
}

struct SignalInner {
    id: u64,
    state: Mutex<SignalState>,
    algorithms: Mutex<Vec<AbortAlgorithm>>,
    listeners: EventListenerRegistry,
}

/// `AbortSignal`. Aborting runs the registered abort algorithms (listener
/// removal, fetch cancellation) before the `abort` event fires.
#[derive(Clone)]
pub struct AbortSignal(Arc<SignalInner>);

#[derive(Clone)]
pub struct WeakAbortSignal(Weak<SignalInner>);

impl WeakAbortSignal {
    pub fn upgrade(&self) -> Option<AbortSignal> {
        self.0.upgrade().map(AbortSignal)
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("AbortSignal")
            .field("id", &self.0.id)
            .field("aborted", &state.aborted)
            .finish()
    }
}

impl AbortSignal {
    fn new() -> Self {
        AbortSignal(Arc::new(SignalInner {
            id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SignalState::default()),
            algorithms: Mutex::new(Vec::new()),
            listeners: EventListenerRegistry::default(),
        }))
    }

    /// `AbortSignal.abort(reason)`: a signal that is already aborted.
    pub fn abort(reason: Option<DomError>) -> Self {
        let signal = Self::new();
        {
            let mut state = signal.0.state.lock();
            state.aborted = true;
            state.reason = Some(reason.unwrap_or_else(default_reason));
        }
        signal
    }

    /// `AbortSignal.timeout(ms)`: aborts with a `TimeoutError` once the
    /// window's clock has advanced by `ms`.
    pub fn timeout(window: &Window, ms: u64) -> Self {
        let signal = Self::new();
        let weak = signal.downgrade();
        window.set_timeout(
            move || {
                if let Some(signal) = weak.upgrade() {
                    signal.signal_abort(Some(DomError::Timeout(format!(
                        "signal timed out after {ms}ms"
                    ))));
                }
                Ok(())
            },
            ms,
        );
        signal
    }

    pub fn aborted(&self) -> bool {
        self.0.state.lock().aborted
    }

    pub fn reason(&self) -> Option<DomError> {
        self.0.state.lock().reason.clone()
    }

    /// `throwIfAborted`.
    pub fn throw_if_aborted(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    pub fn ptr_eq(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakAbortSignal {
        WeakAbortSignal(Arc::downgrade(&self.0))
    }

    pub(crate) fn listeners(&self) -> &EventListenerRegistry {
        &self.0.listeners
    }

    /// Registers work to run when the signal aborts. Dropped if it already has.
    pub(crate) fn add_algorithm(&self, algorithm: impl FnOnce() + Send + 'static) {
        if self.aborted() {
            return;
        }
        self.0.algorithms.lock().push(Box::new(algorithm));
    }

    pub(crate) fn signal_abort(&self, reason: Option<DomError>) {
        {
            let mut state = self.0.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.reason = Some(reason.unwrap_or_else(default_reason));
        }
        debug!(signal = self.0.id, "abort signal fired");
        let algorithms = std::mem::take(&mut *self.0.algorithms.lock());
        for algorithm in algorithms {
            algorithm();
        }
        let event = Event::new("abort", EventInit::default());
        if let Err(err) = dispatch_trusted(&self.as_event_target(), &event) {
            warn!(error = %err, "could not fire abort event");
        }
    }

    pub fn as_event_target(&self) -> EventTarget {
        EventTarget::AbortSignal(self.clone())
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
}

fn default_reason() -> DomError {
    DomError::Abort("signal is aborted without reason".into())
}

/// `AbortController`.
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal; `None` uses an `AbortError`. Later calls do nothing.
    pub fn abort(&self, reason: Option<DomError>) {
        self.signal.signal_abort(reason);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::core::dom::Document;

    #[test]
    fn abort_removes_signal_bound_listeners() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let controller = AbortController::new();
        let calls = Arc::new(Mutex::new(0));
        let listener = {
            let calls = calls.clone();
            EventListener::new(move |_| {
                *calls.lock() += 1;
                Ok(())
            })
        };
        div.add_event_listener(
            "click",
            &listener,
            AddEventListenerOptions::default().with_signal(&controller.signal()),
        );
        div.click();
        assert_eq!(*calls.lock(), 1);

        controller.abort(None);
        assert!(controller.signal().aborted());
        assert_eq!(controller.signal().reason().map(|r| r.name()), Some("AbortError"));
        div.click();
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn abort_event_fires_once() {
        let controller = AbortController::new();
        let fired = Arc::new(Mutex::new(0));
        let listener = {
            let fired = fired.clone();
            EventListener::new(move |event| {
                assert!(event.is_trusted());
                *fired.lock() += 1;
                Ok(())
            })
        };
        controller.signal().add_event_listener("abort", &listener, false);
        controller.abort(Some(DomError::Abort("stop".into())));
        controller.abort(None);
        assert_eq!(*fired.lock(), 1);
        assert_eq!(
            controller.signal().throw_if_aborted(),
            Err(DomError::Abort("stop".into()))
        );
    }

    #[test]
    fn pre_aborted_signal_rejects_listener_registration() {
        let signal = AbortSignal::abort(None);
        assert!(signal.aborted());
        let target = EventTarget::new();
        target.add_event_listener(
            "x",
            &EventListener::new(|_| Ok(())),
            AddEventListenerOptions::default().with_signal(&signal),
        );
        target.with_registry(|registry| assert!(registry.is_empty()));
    }
}
