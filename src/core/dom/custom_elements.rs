//! Custom element registry and lifecycle reactions.
//!
//! Reactions run synchronously at the mutation choke points, after the tree
//! or attribute update is complete and with no node locks held. Callback
//! errors are reported to the owning window and never escape the mutation.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use html5ever::{namespace_url, ns, QualName};
use parking_lot::RwLock;
use tracing::{debug, error};

use super::document::Document;
use super::element::Element;
use super::node::WeakNode;
use super::{DomError, Result};
use crate::js_engine::JSError;

pub type ElementCallback = Arc<dyn Fn(&Element) -> std::result::Result<(), JSError> + Send + Sync>;
pub type AttributeChangedCallback = Arc<
    dyn Fn(&Element, &str, Option<&str>, Option<&str>) -> std::result::Result<(), JSError>
        + Send
        + Sync,
>;

/// Lifecycle hooks of a custom element definition. Every hook is optional.
#[derive(Clone, Default)]
pub struct CustomElementCallbacks {
    /// Runs when an element is created for, or upgraded to, the definition.
    pub constructor: Option<ElementCallback>,
    pub connected: Option<ElementCallback>,
    pub disconnected: Option<ElementCallback>,
    pub adopted: Option<ElementCallback>,
    pub attribute_changed: Option<AttributeChangedCallback>,
    pub observed_attributes: Vec<String>,
}

impl fmt::Debug for CustomElementCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomElementCallbacks")
            .field("observed_attributes", &self.observed_attributes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct CustomElementDefinition {
    pub name: String,
    pub callbacks: CustomElementCallbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CustomElementStatus {
    #[default]
    Uncustomized,
    Undefined,
    Custom,
    Failed,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CustomElementState {
    pub(crate) status: CustomElementStatus,
    pub(crate) definition: Option<Arc<CustomElementDefinition>>,
}

const RESERVED_NAMES: &[&str] = &[
    "annotation-xml",
    "color-profile",
    "font-face",
    "font-face-src",
    "font-face-uri",
    "font-face-format",
    "font-face-name",
    "missing-glyph",
];

fn is_pcen_char(c: char) -> bool {
    matches!(c,
        '-' | '.' | '0'..='9' | '_' | 'a'..='z' | '\u{B7}'
        | '\u{C0}'..='\u{D6}' | '\u{D8}'..='\u{F6}' | '\u{F8}'..='\u{37D}'
        | '\u{37F}'..='\u{1FFF}' | '\u{200C}'..='\u{200D}' | '\u{203F}'..='\u{2040}'
        | '\u{2070}'..='\u{218F}' | '\u{2C00}'..='\u{2FEF}' | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}' | '\u{FDF0}'..='\u{FFFD}' | '\u{10000}'..='\u{EFFFF}')
}

pub fn is_valid_custom_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_lower = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    starts_lower
        && name.contains('-')
        && name.chars().all(is_pcen_char)
        && !RESERVED_NAMES.contains(&name)
}

struct RegistryInner {
    definitions: DashMap<String, Arc<CustomElementDefinition>>,
    document: RwLock<WeakNode>,
}

/// `customElements`: the definitions visible to one document.
#[derive(Clone)]
pub struct CustomElementRegistry(Arc<RegistryInner>);

impl Default for CustomElementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CustomElementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.definitions.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("CustomElementRegistry").field("defined", &names).finish()
    }
}

impl CustomElementRegistry {
    pub fn new() -> Self {
        Self(Arc::new(RegistryInner {
            definitions: DashMap::new(),
            document: RwLock::new(WeakNode::default()),
        }))
    }

    pub(crate) fn bind_document(&self, document: &Document) {
        *self.0.document.write() = document.downgrade();
    }

    /// Registers `name` and upgrades every matching element already in the
    /// bound document, in shadow-including tree order.
    pub fn define(&self, name: &str, callbacks: CustomElementCallbacks) -> Result<()> {
        if !is_valid_custom_element_name(name) {
            return Err(DomError::Syntax(format!(
                "'{name}' is not a valid custom element name"
            )));
        }
        if self.0.definitions.contains_key(name) {
            return Err(DomError::NotSupported(format!(
                "'{name}' has already been defined"
            )));
        }
        let definition = Arc::new(CustomElementDefinition {
            name: name.to_string(),
            callbacks,
        });
        self.0.definitions.insert(name.to_string(), definition.clone());
        debug!(name, "defined custom element");

        let document = self.0.document.read().upgrade();
        if let Some(document) = document {
            let candidates: Vec<Element> = document
                .shadow_including_inclusive_descendants()
                .into_iter()
                .filter_map(|node| node.as_element())
                .filter(|element| element.is_html() && &*element.name().local == name)
                .collect();
            for element in candidates {
                upgrade(&element, &definition);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CustomElementDefinition>> {
        self.0.definitions.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.0.definitions.contains_key(name)
    }

    /// Upgrades `root`'s shadow-including inclusive descendants that match a
    /// definition and are not custom yet.
    pub fn upgrade(&self, root: &super::Node) {
        for node in root.shadow_including_inclusive_descendants() {
            if let Some(element) = node.as_element() {
                if let Some(definition) = self.lookup(element.name()) {
                    upgrade(&element, &definition);
                }
            }
        }
    }

    pub(crate) fn lookup(&self, name: &QualName) -> Option<Arc<CustomElementDefinition>> {
        if name.ns != ns!(html) {
            return None;
        }
        self.get(&name.local)
    }
}

fn state_of(element: &Element) -> CustomElementState {
    element.element_data(|data| data.custom.clone()).unwrap_or_default()
}

fn definition_if_custom(element: &Element) -> Option<Arc<CustomElementDefinition>> {
    let state = state_of(element);
    match state.status {
        CustomElementStatus::Custom => state.definition,
        _ => None,
    }
}

fn report(element: &Element, callback: &str, error: JSError) {
    let window = element.node_document().and_then(|doc| doc.default_view());
    match window {
        Some(window) => window.report_error(&error),
        None => error!(callback, %error, "custom element callback failed"),
    }
}

/// Called for freshly created elements: marks valid custom names as
/// undefined, or upgrades them synchronously when a definition exists.
pub(crate) fn initialize_element(element: &Element, registry: Option<&CustomElementRegistry>) {
    let name = element.name();
    if name.ns != ns!(html) || !is_valid_custom_element_name(&name.local) {
        return;
    }
    element.element_data_mut(|data| data.custom.status = CustomElementStatus::Undefined);
    if let Some(definition) = registry.and_then(|r| r.lookup(name)) {
        upgrade(element, &definition);
    }
}

pub(crate) fn upgrade(element: &Element, definition: &Arc<CustomElementDefinition>) {
    let status = state_of(element).status;
    if matches!(status, CustomElementStatus::Custom | CustomElementStatus::Failed) {
        return;
    }
    element.element_data_mut(|data| {
        data.custom.definition = Some(definition.clone());
    });
    if let Some(constructor) = &definition.callbacks.constructor {
        if let Err(error) = constructor(element) {
            element.element_data_mut(|data| {
                data.custom.status = CustomElementStatus::Failed;
                data.custom.definition = None;
            });
            report(element, "constructor", error);
            return;
        }
    }
    element.element_data_mut(|data| data.custom.status = CustomElementStatus::Custom);

    if let Some(callback) = &definition.callbacks.attribute_changed {
        for attr in element.attributes() {
            if attr.namespace_uri().is_some() {
                continue;
            }
            let local = attr.local_name();
            if definition.callbacks.observed_attributes.contains(&local) {
                if let Err(error) = callback(element, &local, None, Some(&attr.value())) {
                    report(element, "attributeChangedCallback", error);
                }
            }
        }
    }
    if element.is_connected() {
        enqueue_connected(element);
    }
}

fn try_upgrade(element: &Element) {
    let state = state_of(element);
    if state.status != CustomElementStatus::Undefined {
        return;
    }
    let registry = element
        .node_document()
        .and_then(|doc| doc.custom_element_registry());
    if let Some(definition) = registry.and_then(|r| r.lookup(element.name())) {
        upgrade(element, &definition);
    }
}

pub(crate) fn enqueue_connected(element: &Element) {
    let Some(definition) = definition_if_custom(element) else {
        try_upgrade(element);
        return;
    };
    if let Some(callback) = &definition.callbacks.connected {
        if let Err(error) = callback(element) {
            report(element, "connectedCallback", error);
        }
    }
}

pub(crate) fn enqueue_disconnected(element: &Element) {
    let Some(definition) = definition_if_custom(element) else {
        return;
    };
    if let Some(callback) = &definition.callbacks.disconnected {
        if let Err(error) = callback(element) {
            report(element, "disconnectedCallback", error);
        }
    }
}

pub(crate) fn enqueue_adopted(element: &Element) {
    let Some(definition) = definition_if_custom(element) else {
        return;
    };
    if let Some(callback) = &definition.callbacks.adopted {
        if let Err(error) = callback(element) {
            report(element, "adoptedCallback", error);
        }
    }
}

pub(crate) fn enqueue_attribute_changed(
    element: &Element,
    name: &QualName,
    old: Option<&str>,
    new: Option<&str>,
) {
    let Some(definition) = definition_if_custom(element) else {
        return;
    };
    let Some(callback) = &definition.callbacks.attribute_changed else {
        return;
    };
    if name.ns != ns!() || !definition.callbacks.observed_attributes.iter().any(|a| *a == *name.local) {
        return;
    }
    if let Err(error) = callback(element, &name.local, old, new) {
        report(element, "attributeChangedCallback", error);
    }
}

impl Element {
    pub fn custom_element_status(&self) -> CustomElementStatus {
        state_of(self).status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn custom_element_names() {
        assert!(is_valid_custom_element_name("my-element"));
        assert!(is_valid_custom_element_name("x-\u{E9}"));
        assert!(!is_valid_custom_element_name("div"));
        assert!(!is_valid_custom_element_name("My-element"));
        assert!(!is_valid_custom_element_name("font-face"));
        assert!(!is_valid_custom_element_name("-x"));
    }

    fn recording_callbacks(log: &Arc<Mutex<Vec<String>>>) -> CustomElementCallbacks {
        let (c, d, a) = (log.clone(), log.clone(), log.clone());
        CustomElementCallbacks {
            connected: Some(Arc::new(move |_| {
                c.lock().push("connected".into());
                Ok(())
            })),
            disconnected: Some(Arc::new(move |_| {
                d.lock().push("disconnected".into());
                Ok(())
            })),
            attribute_changed: Some(Arc::new(move |_, name, old, new| {
                a.lock().push(format!("{name}:{old:?}->{new:?}"));
                Ok(())
            })),
            observed_attributes: vec!["state".into()],
            ..Default::default()
        }
    }

    #[test]
    fn define_upgrades_existing_elements() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<x-widget state=on></x-widget>").unwrap();
        let widget = body.first_element_child().unwrap();
        assert_eq!(widget.custom_element_status(), CustomElementStatus::Undefined);

        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = doc.custom_element_registry().unwrap();
        registry.define("x-widget", recording_callbacks(&log)).unwrap();
        assert_eq!(widget.custom_element_status(), CustomElementStatus::Custom);
        assert_eq!(*log.lock(), vec!["state:None->Some(\"on\")", "connected"]);

        widget.set_attribute("ignored", "1").unwrap();
        widget.set_attribute("state", "off").unwrap();
        widget.remove();
        assert_eq!(
            log.lock()[2..].to_vec(),
            vec!["state:Some(\"on\")->Some(\"off\")".to_string(), "disconnected".to_string()]
        );
        assert_eq!(
            registry.define("x-widget", CustomElementCallbacks::default()).unwrap_err().name(),
            "NotSupportedError"
        );
    }

    #[test]
    fn failing_constructor_marks_element_failed() {
        let doc = Document::new();
        let registry = doc.custom_element_registry().unwrap();
        registry
            .define(
                "x-broken",
                CustomElementCallbacks {
                    constructor: Some(Arc::new(|_| Err(JSError::Execution("boom".into())))),
                    ..Default::default()
                },
            )
            .unwrap();
        let element = doc.create_element("x-broken").unwrap();
        assert_eq!(element.custom_element_status(), CustomElementStatus::Failed);
    }
}
