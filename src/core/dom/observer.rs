//! Mutation observers.
//!
//! Nodes keep their registrations; records are queued per observer and
//! delivered in one microtask per observer per turn of the owning window's
//! event loop. Without a window, records stay queued until `take_records`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use html5ever::QualName;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use super::node::{Node, WeakNode};
use super::{namespace_option, DomError, Result};
use crate::js_engine::JSError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationType {
    ChildList,
    Attributes,
    CharacterData,
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub record_type: MutationType,
    pub target: Node,
    pub added_nodes: Vec<Node>,
    pub removed_nodes: Vec<Node>,
    pub previous_sibling: Option<Node>,
    pub next_sibling: Option<Node>,
    pub attribute_name: Option<String>,
    pub attribute_namespace: Option<String>,
    pub old_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MutationObserverInit {
    pub child_list: bool,
    pub attributes: Option<bool>,
    pub character_data: Option<bool>,
    pub subtree: bool,
    pub attribute_old_value: Option<bool>,
    pub character_data_old_value: Option<bool>,
    pub attribute_filter: Option<Vec<String>>,
}

impl MutationObserverInit {
    /// Applies the implied flags and rejects contradictory options.
    fn normalized(mut self) -> Result<Self> {
        if self.attributes.is_none()
            && (self.attribute_old_value.is_some() || self.attribute_filter.is_some())
        {
            self.attributes = Some(true);
        }
        if self.character_data.is_none() && self.character_data_old_value.is_some() {
            self.character_data = Some(true);
        }
        let attributes = self.attributes.unwrap_or(false);
        let character_data = self.character_data.unwrap_or(false);
        if !self.child_list && !attributes && !character_data {
            return Err(DomError::Type(
                "one of childList, attributes or characterData must be true".into(),
            ));
        }
        if self.attribute_old_value == Some(true) && !attributes {
            return Err(DomError::Type("attributeOldValue requires attributes".into()));
        }
        if self.attribute_filter.is_some() && !attributes {
            return Err(DomError::Type("attributeFilter requires attributes".into()));
        }
        if self.character_data_old_value == Some(true) && !character_data {
            return Err(DomError::Type("characterDataOldValue requires characterData".into()));
        }
        Ok(self)
    }
}

pub type MutationCallback =
    Arc<dyn Fn(&[MutationRecord], &MutationObserver) -> std::result::Result<(), JSError> + Send + Sync>;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ObserverInner {
    id: u64,
    callback: MutationCallback,
    queue: Mutex<Vec<MutationRecord>>,
    targets: Mutex<Vec<WeakNode>>,
    scheduled: AtomicBool,
}

#[derive(Clone)]
pub struct MutationObserver(Arc<ObserverInner>);

impl PartialEq for MutationObserver {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("id", &self.0.id)
            .field("pending", &self.0.queue.lock().len())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredObserver {
    observer: MutationObserver,
    options: MutationObserverInit,
}

impl MutationObserver {
    pub fn new(
        callback: impl Fn(&[MutationRecord], &MutationObserver) -> std::result::Result<(), JSError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self(Arc::new(ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
            queue: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            scheduled: AtomicBool::new(false),
        }))
    }

    /// Observing the same target again replaces the earlier options.
    pub fn observe(&self, target: &Node, options: MutationObserverInit) -> Result<()> {
        let options = options.normalized()?;
        {
            let mut registrations = target.0.observers.mutation.lock();
            match registrations.iter_mut().find(|r| r.observer == *self) {
                Some(existing) => existing.options = options,
                None => registrations.push(RegisteredObserver {
                    observer: self.clone(),
                    options,
                }),
            }
        }
        let mut targets = self.0.targets.lock();
        if !targets.iter().any(|t| t.upgrade().as_ref() == Some(target)) {
            targets.push(target.downgrade());
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        let targets = std::mem::take(&mut *self.0.targets.lock());
        for target in targets.iter().filter_map(WeakNode::upgrade) {
            target
                .0
                .observers
                .mutation
                .lock()
                .retain(|r| r.observer != *self);
        }
        self.0.queue.lock().clear();
    }

    pub fn take_records(&self) -> Vec<MutationRecord> {
        std::mem::take(&mut *self.0.queue.lock())
    }

    fn enqueue(&self, record: MutationRecord, target: &Node) {
        self.0.queue.lock().push(record);
        if self.0.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let window = target.node_document().and_then(|doc| doc.default_view());
        match window {
            Some(window) => {
                let observer = self.clone();
                window.queue_microtask(move || {
                    observer.deliver();
                    Ok(())
                });
            }
            None => self.0.scheduled.store(false, Ordering::Release),
        }
    }

    /// Invokes the callback with everything queued so far.
    pub(crate) fn deliver(&self) {
        self.0.scheduled.store(false, Ordering::Release);
        let records = self.take_records();
        if records.is_empty() {
            return;
        }
        trace!(observer = self.0.id, count = records.len(), "delivering mutation records");
        if let Err(err) = (self.0.callback)(&records, self) {
            let window = records
                .first()
                .and_then(|r| r.target.node_document())
                .and_then(|doc| doc.default_view());
            match window {
                Some(window) => window.report_error(&err),
                None => error!(error = %err, "mutation observer callback failed"),
            }
        }
    }
}

enum RecordKind<'a> {
    ChildList,
    Attribute(&'a QualName),
    CharacterData,
}

/// Finds interested observers among `target`'s inclusive ancestors and
/// returns each with whether it asked for the old value.
fn interested_observers(target: &Node, kind: &RecordKind<'_>) -> Vec<(MutationObserver, bool)> {
    let mut interested: Vec<(MutationObserver, bool)> = Vec::new();
    for node in target.inclusive_ancestors() {
        let registrations = node.0.observers.mutation.lock().clone();
        for registration in registrations {
            let options = &registration.options;
            if node != *target && !options.subtree {
                continue;
            }
            let (wanted, old_value) = match kind {
                RecordKind::ChildList => (options.child_list, false),
                RecordKind::Attribute(name) => {
                    let filtered_out = options.attribute_filter.as_ref().is_some_and(|filter| {
                        !name.ns.is_empty() || !filter.iter().any(|f| *f == *name.local)
                    });
                    (
                        options.attributes.unwrap_or(false) && !filtered_out,
                        options.attribute_old_value.unwrap_or(false),
                    )
                }
                RecordKind::CharacterData => (
                    options.character_data.unwrap_or(false),
                    options.character_data_old_value.unwrap_or(false),
                ),
            };
            if !wanted {
                continue;
            }
            match interested.iter_mut().find(|(o, _)| *o == registration.observer) {
                Some((_, existing)) => *existing |= old_value,
                None => interested.push((registration.observer.clone(), old_value)),
            }
        }
    }
    interested
}

fn has_any_registration(target: &Node) -> bool {
    target
        .inclusive_ancestors()
        .any(|node| !node.0.observers.mutation.lock().is_empty())
}

pub(crate) fn queue_tree_record(
    target: &Node,
    added: Vec<Node>,
    removed: Vec<Node>,
    previous_sibling: Option<Node>,
    next_sibling: Option<Node>,
) {
    if (added.is_empty() && removed.is_empty()) || !has_any_registration(target) {
        return;
    }
    for (observer, _) in interested_observers(target, &RecordKind::ChildList) {
        let record = MutationRecord {
            record_type: MutationType::ChildList,
            target: target.clone(),
            added_nodes: added.clone(),
            removed_nodes: removed.clone(),
            previous_sibling: previous_sibling.clone(),
            next_sibling: next_sibling.clone(),
            attribute_name: None,
            attribute_namespace: None,
            old_value: None,
        };
        observer.enqueue(record, target);
    }
}

pub(crate) fn queue_attribute_record(target: &Node, name: &QualName, old_value: Option<String>) {
    if !has_any_registration(target) {
        return;
    }
    for (observer, wants_old) in interested_observers(target, &RecordKind::Attribute(name)) {
        let record = MutationRecord {
            record_type: MutationType::Attributes,
            target: target.clone(),
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            previous_sibling: None,
            next_sibling: None,
            attribute_name: Some(name.local.to_string()),
            attribute_namespace: namespace_option(&name.ns),
            old_value: if wants_old { old_value.clone() } else { None },
        };
        observer.enqueue(record, target);
    }
}

pub(crate) fn queue_character_data_record(target: &Node, old_value: &str) {
    if !has_any_registration(target) {
        return;
    }
    for (observer, wants_old) in interested_observers(target, &RecordKind::CharacterData) {
        let record = MutationRecord {
            record_type: MutationType::CharacterData,
            target: target.clone(),
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            previous_sibling: None,
            next_sibling: None,
            attribute_name: None,
            attribute_namespace: None,
            old_value: wants_old.then(|| old_value.to_string()),
        };
        observer.enqueue(record, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::Document;

    fn observer() -> MutationObserver {
        MutationObserver::new(|_, _| Ok(()))
    }

    #[test]
    fn options_require_a_record_type() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let err = observer().observe(&div, MutationObserverInit::default()).unwrap_err();
        assert_eq!(err.name(), "TypeError");
        let implied = MutationObserverInit {
            attribute_old_value: Some(true),
            ..Default::default()
        };
        assert!(observer().observe(&div, implied).is_ok());
    }

    #[test]
    fn records_are_queued_per_observer() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let observer = observer();
        observer
            .observe(
                &div,
                MutationObserverInit {
                    child_list: true,
                    attributes: Some(true),
                    attribute_old_value: Some(true),
                    attribute_filter: Some(vec!["title".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        div.set_attribute("title", "a").unwrap();
        div.set_attribute("title", "b").unwrap();
        div.set_attribute("class", "ignored").unwrap();
        div.append_child(&doc.create_text_node("x")).unwrap();

        let records = observer.take_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].old_value, None);
        assert_eq!(records[1].old_value.as_deref(), Some("a"));
        assert_eq!(records[2].record_type, MutationType::ChildList);
        assert_eq!(records[2].added_nodes.len(), 1);
    }

    #[test]
    fn subtree_and_character_data() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let text = doc.create_text_node("a");
        div.append_child(&text).unwrap();
        let observer = observer();
        observer
            .observe(
                &div,
                MutationObserverInit {
                    character_data_old_value: Some(true),
                    subtree: true,
                    ..Default::default()
                },
            )
            .unwrap();
        text.set_data("b");
        let records = observer.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].old_value.as_deref(), Some("a"));

        observer.disconnect();
        text.set_data("c");
        assert!(observer.take_records().is_empty());
    }

    #[test]
    fn inner_html_replacement_is_one_record() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("<b>1</b><i>2</i>").unwrap();
        let observer = observer();
        observer
            .observe(&div, MutationObserverInit { child_list: true, ..Default::default() })
            .unwrap();
        div.set_inner_html("<p>3</p>").unwrap();
        let records = observer.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].removed_nodes.len(), 2);
        assert_eq!(records[0].added_nodes.len(), 1);
    }
}
