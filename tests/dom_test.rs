use std::sync::Arc;

use headless_dom::core::dom::{Document, Node};
use headless_dom::core::events::{
    AbortController, AddEventListenerOptions, Event, EventInit, EventListener, EventTarget,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn recorder() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Arc<Mutex<Vec<String>>>, entry: &'static str) -> EventListener {
    let log = log.clone();
    EventListener::new(move |_| {
        log.lock().push(entry.to_string());
        Ok(())
    })
}

#[test]
fn test_live_collection_follows_append_and_remove() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    let divs = doc.get_elements_by_tag_name("div");
    assert_eq!(divs.length(), 0);

    let div = doc.create_element("div").unwrap();
    body.append_child(&div).unwrap();
    assert_eq!(divs.length(), 1);
    assert_eq!(divs.item(0), Some(div.clone()));

    body.remove_child(&div).unwrap();
    assert_eq!(divs.length(), 0);
}

#[test]
fn test_inner_html_round_trip() {
    let doc = Document::new();
    let el = doc.create_element("div").unwrap();
    el.set_inner_html("<span>Test</span>").unwrap();
    assert_eq!(el.inner_html(), "<span>Test</span>");
    assert_eq!(el.child_element_count(), 1);
}

#[test]
fn test_bubbling_click_reaches_ancestor_once() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    body.set_inner_html("<div><span>leaf</span></div>").unwrap();
    let div = doc.query_selector("div").unwrap().unwrap();
    let span = doc.query_selector("span").unwrap().unwrap();

    let seen: Arc<Mutex<Vec<(Option<EventTarget>, Option<EventTarget>)>>> = Arc::default();
    {
        let seen = seen.clone();
        div.add_event_listener(
            "click",
            &EventListener::new(move |event| {
                seen.lock().push((event.target(), event.current_target()));
                Ok(())
            }),
            false,
        );
    }

    let click = Event::new("click", EventInit::bubbling());
    assert!(span.dispatch_event(&click).unwrap());

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Some(span.as_node().as_event_target()));
    assert_eq!(seen[0].1, Some(div.as_node().as_event_target()));
    // currentTarget is cleared once dispatch is over
    assert_eq!(click.current_target(), None);
}

#[test]
fn test_abort_removes_signal_listeners() {
    let controller = AbortController::new();
    let signal = controller.signal();
    let target = EventTarget::new();
    let log = recorder();

    target.add_event_listener(
        "ping",
        &record(&log, "ping"),
        AddEventListenerOptions::default().with_signal(&signal),
    );
    signal.add_event_listener("abort", &record(&log, "abort"), false);

    target
        .dispatch_event(&Event::new("ping", EventInit::default()))
        .unwrap();
    controller.abort(None);
    assert!(signal.aborted());
    assert_eq!(signal.reason().map(|reason| reason.name()), Some("AbortError"));

    target
        .dispatch_event(&Event::new("ping", EventInit::default()))
        .unwrap();
    assert_eq!(*log.lock(), vec!["ping", "abort"]);
}

#[test]
fn test_capture_target_bubble_order() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    body.set_inner_html("<div><span></span></div>").unwrap();
    let div = doc.query_selector("div").unwrap().unwrap();
    let span = doc.query_selector("span").unwrap().unwrap();
    let log = recorder();

    doc.add_event_listener("tap", &record(&log, "document capture"), true);
    body.add_event_listener("tap", &record(&log, "body capture"), true);
    div.add_event_listener("tap", &record(&log, "div capture"), true);
    span.add_event_listener("tap", &record(&log, "span"), false);
    div.add_event_listener("tap", &record(&log, "div bubble"), false);
    body.add_event_listener("tap", &record(&log, "body bubble"), false);
    doc.add_event_listener("tap", &record(&log, "document bubble"), false);

    span.dispatch_event(&Event::new("tap", EventInit::bubbling()))
        .unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "document capture",
            "body capture",
            "div capture",
            "span",
            "div bubble",
            "body bubble",
            "document bubble",
        ]
    );
}

#[test]
fn test_stop_propagation_keeps_same_node_listeners() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    body.set_inner_html("<div><span></span></div>").unwrap();
    let span = doc.query_selector("span").unwrap().unwrap();
    let log = recorder();

    {
        let log = log.clone();
        span.add_event_listener(
            "tap",
            &EventListener::new(move |event| {
                log.lock().push("span first".into());
                event.stop_propagation();
                Ok(())
            }),
            false,
        );
    }
    span.add_event_listener("tap", &record(&log, "span second"), false);
    body.add_event_listener("tap", &record(&log, "body bubble"), false);

    span.dispatch_event(&Event::new("tap", EventInit::bubbling()))
        .unwrap();
    assert_eq!(*log.lock(), vec!["span first", "span second"]);
}

#[test]
fn test_redispatching_an_event_fails() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    let event = Event::new("again", EventInit::default());
    {
        let inner = event.clone();
        let target = body.clone();
        body.add_event_listener(
            "again",
            &EventListener::new(move |_| {
                let error = target.dispatch_event(&inner).unwrap_err();
                assert_eq!(error.name(), "InvalidStateError");
                Ok(())
            }),
            false,
        );
    }
    body.dispatch_event(&event).unwrap();
}

#[test]
fn test_deep_clone_is_independent() {
    let doc = Document::new();
    let body = doc.body().unwrap();
    body.set_inner_html(r#"<ul class="list"><li data-x="1">one</li><li>two</li></ul>"#)
        .unwrap();
    let list = doc.query_selector("ul").unwrap().unwrap();

    let copy = list.clone_node(true).unwrap().as_element().unwrap();
    assert_eq!(copy.outer_html(), list.outer_html());

    copy.set_attribute("class", "changed").unwrap();
    copy.first_element_child().unwrap().remove();
    assert_eq!(list.class_name(), "list");
    assert_eq!(list.child_element_count(), 2);
    assert_eq!(copy.child_element_count(), 1);
}

#[test]
fn test_insertion_cycles_are_rejected() {
    let doc = Document::new();
    let outer = doc.create_element("div").unwrap();
    let inner = doc.create_element("div").unwrap();
    outer.append_child(&inner).unwrap();
    let error = inner.append_child(&outer).unwrap_err();
    assert_eq!(error.name(), "HierarchyRequestError");

    let second_root = doc.create_element("html").unwrap();
    let error = doc.append_child(&second_root).unwrap_err();
    assert_eq!(error.name(), "HierarchyRequestError");
}

#[derive(Debug, Clone)]
enum TreeOp {
    Append { parent: usize, child: usize },
    InsertBefore { parent: usize, child: usize, reference: usize },
    Remove { node: usize },
}

fn tree_op(nodes: usize) -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        (0..nodes, 0..nodes).prop_map(|(parent, child)| TreeOp::Append { parent, child }),
        (0..nodes, 0..nodes, 0..nodes).prop_map(|(parent, child, reference)| TreeOp::InsertBefore {
            parent,
            child,
            reference,
        }),
        (0..nodes).prop_map(|node| TreeOp::Remove { node }),
    ]
}

fn assert_tree_consistent(nodes: &[Node]) {
    for node in nodes {
        let children = node.children_snapshot();
        for (index, child) in children.iter().enumerate() {
            assert_eq!(child.parent_node().as_ref(), Some(node));
            assert!(!children[index + 1..].contains(child), "child listed twice");
        }
        if let Some(parent) = node.parent_node() {
            let count = parent
                .children_snapshot()
                .iter()
                .filter(|c| *c == node)
                .count();
            assert_eq!(count, 1);
        }
    }
}

proptest! {
    #[test]
    fn test_parent_pointers_match_structure(ops in prop::collection::vec(tree_op(8), 1..40)) {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let mut nodes: Vec<Node> = (0..8)
            .map(|_| doc.create_element("div").unwrap().as_node().clone())
            .collect();
        nodes.push(body.as_node().clone());

        for op in ops {
            // rejected mutations must leave the tree untouched
            let _ = match op {
                TreeOp::Append { parent, child } => nodes[parent].append_child(&nodes[child]).map(|_| ()),
                TreeOp::InsertBefore { parent, child, reference } => nodes[parent]
                    .insert_before(&nodes[child], Some(&nodes[reference]))
                    .map(|_| ()),
                TreeOp::Remove { node } => {
                    nodes[node].remove();
                    Ok(())
                }
            };
            assert_tree_consistent(&nodes);
        }
    }
}
