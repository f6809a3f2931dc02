use std::sync::atomic::Ordering;

use tracing::{error, trace, warn};

use super::{Event, EventInit, EventPhase, EventTarget};
use crate::core::dom::{DomError, Node, Result};

/// Parent of `item` in the propagation path. Shadow roots hand over to their
/// host only for composed events; documents hand over to their window for
/// everything but `load`.
fn parent_in_path(item: &EventTarget, event_type: &str, composed: bool) -> Option<EventTarget> {
    let EventTarget::Node(node) = item else {
        return None;
    };
    if let Some(parent) = node.parent_node() {
        return Some(EventTarget::Node(parent));
    }
    if let Some(host) = node.shadow_host() {
        return composed.then(|| EventTarget::Node(host.as_node().clone()));
    }
    if let Some(document) = node.as_document() {
        if event_type != "load" {
            return document.default_view().map(EventTarget::Window);
        }
    }
    None
}

/// Retargets `target` against `item`: while the target lives in a shadow
/// tree that does not contain `item`, it is replaced by that tree's host.
fn retarget(target: &EventTarget, item: &EventTarget) -> EventTarget {
    let EventTarget::Node(node) = target else {
        return target.clone();
    };
    let mut node: Node = node.clone();
    loop {
        let root = node.get_root_node(false);
        if !root.is_shadow_root() {
            break;
        }
        if let EventTarget::Node(item_node) = item {
            if root.is_host_including_inclusive_ancestor_of(item_node) {
                break;
            }
        }
        match root.shadow_host() {
            Some(host) => node = host.as_node().clone(),
            None => break,
        }
    }
    EventTarget::Node(node)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Capture,
    Bubble,
}

pub(crate) fn dispatch(target: &EventTarget, event: &Event, trusted: bool) -> Result<bool> {
    let (event_type, bubbles, composed) = {
        let mut state = event.0.state.lock();
        if state.dispatching {
            return Err(DomError::InvalidState("the event is already being dispatched".into()));
        }
        if !state.initialized {
            return Err(DomError::InvalidState("the event was not initialized".into()));
        }
        state.dispatching = true;
        state.is_trusted = trusted;
        state.target = Some(target.clone());
        (state.event_type.clone(), state.init.bubbles, state.init.composed)
    };

    let mut path = vec![target.clone()];
    while let Some(parent) = parent_in_path(path.last().unwrap_or(target), &event_type, composed) {
        path.push(parent);
    }
    trace!(event_type = %event_type, depth = path.len(), "dispatching event");

    let entries: Vec<(EventTarget, EventTarget)> = path
        .iter()
        .map(|item| (item.clone(), retarget(target, item)))
        .collect();
    event.0.state.lock().path = path;

    for (item, adjusted) in entries.iter().rev() {
        let phase = if item == adjusted {
            EventPhase::AtTarget
        } else {
            EventPhase::Capturing
        };
        invoke(item, adjusted, event, &event_type, phase, Pass::Capture);
    }
    for (item, adjusted) in &entries {
        let phase = if item == adjusted {
            EventPhase::AtTarget
        } else if bubbles {
            EventPhase::Bubbling
        } else {
            continue;
        };
        invoke(item, adjusted, event, &event_type, phase, Pass::Bubble);
    }

    let mut state = event.0.state.lock();
    state.dispatching = false;
    state.phase = EventPhase::None;
    state.current_target = None;
    state.path.clear();
    Ok(!state.canceled)
}

fn invoke(
    item: &EventTarget,
    adjusted_target: &EventTarget,
    event: &Event,
    event_type: &str,
    phase: EventPhase,
    pass: Pass,
) {
    {
        let mut state = event.0.state.lock();
        if state.stop_propagation {
            return;
        }
        state.target = Some(adjusted_target.clone());
        state.current_target = Some(item.clone());
        state.phase = phase;
    }
    let listeners = item.with_registry(|registry| registry.snapshot(event_type));
    for registration in listeners {
        if registration.removed.load(Ordering::Acquire) {
            continue;
        }
        if registration.capture != (pass == Pass::Capture) {
            continue;
        }
        if registration.once {
            item.with_registry(|registry| registry.remove_registration(&registration));
        }
        event.0.state.lock().in_passive_listener = registration.passive;
        let outcome = registration.listener.call(event);
        event.0.state.lock().in_passive_listener = false;
        if let Err(err) = outcome {
            match item.owning_window() {
                Some(window) => window.report_error(&err),
                None => error!(event_type, error = %err, "uncaught error in event listener"),
            }
        }
        if event.0.state.lock().stop_immediate {
            break;
        }
    }
}

/// Dispatch on behalf of the user agent (`isTrusted` is set).
pub(crate) fn dispatch_trusted(target: &EventTarget, event: &Event) -> Result<bool> {
    dispatch(target, event, true)
}

/// Fires a trusted, non-bubbling, non-cancelable event of `event_type` at `node`.
pub(crate) fn fire_simple_event(node: &Node, event_type: &str) {
    let event = Event::new(event_type, EventInit::default());
    if let Err(err) = dispatch_trusted(&EventTarget::Node(node.clone()), &event) {
        warn!(event_type, error = %err, "could not fire event");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::core::dom::{Document, ShadowRootMode};
    use crate::core::events::{AddEventListenerOptions, EventListener};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> EventListener {
        let log = log.clone();
        let label = label.to_string();
        EventListener::new(move |event| {
            log.lock().push(format!("{label}:{:?}", event.event_phase()));
            Ok(())
        })
    }

    #[test]
    fn capture_target_bubble_order() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<div><span></span></div>").unwrap();
        let div = body.query_selector("div").unwrap().unwrap();
        let span = body.query_selector("span").unwrap().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        div.add_event_listener("click", &recorder(&log, "div-capture"), true);
        div.add_event_listener("click", &recorder(&log, "div-bubble"), false);
        span.add_event_listener("click", &recorder(&log, "span-bubble"), false);
        span.add_event_listener("click", &recorder(&log, "span-capture"), true);
        doc.add_event_listener("click", &recorder(&log, "doc-capture"), true);

        let event = Event::new("click", EventInit::bubbling());
        assert!(span.dispatch_event(&event).unwrap());
        assert_eq!(
            *log.lock(),
            vec![
                "doc-capture:Capturing",
                "div-capture:Capturing",
                "span-capture:AtTarget",
                "span-bubble:AtTarget",
                "div-bubble:Bubbling",
            ]
        );
        assert_eq!(event.event_phase(), EventPhase::None);
        assert!(event.composed_path().is_empty());
    }

    #[test]
    fn stop_propagation_finishes_current_node() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<div><span></span></div>").unwrap();
        let div = body.query_selector("div").unwrap().unwrap();
        let span = body.query_selector("span").unwrap().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let stopper = {
            let log = log.clone();
            EventListener::new(move |event| {
                log.lock().push("stop".to_string());
                event.stop_propagation();
                Ok(())
            })
        };
        span.add_event_listener("click", &stopper, false);
        span.add_event_listener("click", &recorder(&log, "span-second"), false);
        div.add_event_listener("click", &recorder(&log, "div"), false);

        span.dispatch_event(&Event::new("click", EventInit::bubbling())).unwrap();
        assert_eq!(*log.lock(), vec!["stop", "span-second:AtTarget"]);
    }

    #[test]
    fn stop_immediate_propagation_skips_remaining_listeners() {
        let target = EventTarget::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let stopper = EventListener::new(|event| {
            event.stop_immediate_propagation();
            Ok(())
        });
        target.add_event_listener("x", &stopper, false);
        target.add_event_listener("x", &recorder(&log, "never"), false);
        target.dispatch_event(&Event::new("x", EventInit::default())).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn stopped_event_stays_stopped_until_reinitialized() {
        let target = EventTarget::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let event = Event::new("x", EventInit::default());
        event.stop_propagation();
        target.add_event_listener("x", &recorder(&log, "listener"), false);

        target.dispatch_event(&event).unwrap();
        target.dispatch_event(&event).unwrap();
        assert!(log.lock().is_empty());

        event.init_event("x", false, false);
        target.dispatch_event(&event).unwrap();
        assert_eq!(*log.lock(), vec!["listener:AtTarget"]);
    }

    #[test]
    fn failing_listener_does_not_stop_siblings() {
        let target = EventTarget::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = EventListener::new(|_| Err(crate::js_engine::JSError::Execution("boom".into())));
        target.add_event_listener("x", &failing, false);
        target.add_event_listener("x", &recorder(&log, "after"), false);
        target.dispatch_event(&Event::new("x", EventInit::default())).unwrap();
        assert_eq!(*log.lock(), vec!["after:AtTarget"]);
    }

    #[test]
    fn redispatch_during_dispatch_is_rejected() {
        let target = EventTarget::new();
        let event = Event::new("x", EventInit::default());
        let seen = Arc::new(Mutex::new(None));
        let listener = {
            let target = target.clone();
            let seen = seen.clone();
            EventListener::new(move |event| {
                *seen.lock() = Some(target.dispatch_event(event).unwrap_err().name());
                Ok(())
            })
        };
        target.add_event_listener("x", &listener, false);
        target.dispatch_event(&event).unwrap();
        assert_eq!(*seen.lock(), Some("InvalidStateError"));
        // reusable once the first dispatch finished
        assert!(target.dispatch_event(&event).is_ok());
    }

    #[test]
    fn once_and_passive_options() {
        let target = EventTarget::new();
        let count = Arc::new(Mutex::new(0));
        let listener = {
            let count = count.clone();
            EventListener::new(move |event| {
                *count.lock() += 1;
                event.prevent_default();
                Ok(())
            })
        };
        target.add_event_listener(
            "x",
            &listener,
            AddEventListenerOptions {
                once: true,
                passive: Some(true),
                ..AddEventListenerOptions::default()
            },
        );
        let cancelable = EventInit {
            cancelable: true,
            ..EventInit::default()
        };
        assert!(target.dispatch_event(&Event::new("x", cancelable)).unwrap());
        assert!(target.dispatch_event(&Event::new("x", cancelable)).unwrap());
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn shadow_boundary_respects_composed_flag() {
        let doc = Document::new();
        let host = doc.create_element("div").unwrap();
        doc.body().unwrap().append_child(&host).unwrap();
        let shadow = host.attach_shadow(ShadowRootMode::Open).unwrap();
        let inner = doc.create_element("span").unwrap();
        shadow.append_child(&inner).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = seen.clone();
            EventListener::new(move |event| {
                let target = event.target().and_then(|t| t.as_node().map(|n| n.node_name()));
                seen.lock().push(target.unwrap_or_default());
                Ok(())
            })
        };
        doc.body().unwrap().add_event_listener("ping", &listener, false);

        inner
            .dispatch_event(&Event::new("ping", EventInit::bubbling()))
            .unwrap();
        assert!(seen.lock().is_empty());

        let composed = EventInit {
            bubbles: true,
            composed: true,
            ..EventInit::default()
        };
        inner.dispatch_event(&Event::new("ping", composed)).unwrap();
        assert_eq!(*seen.lock(), vec!["DIV"]);
    }
}
