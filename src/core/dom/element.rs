use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use html5ever::{namespace_url, ns, LocalName, Namespace, QualName};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::attributes::{Attr, AttributeList};
use super::behavior::{self, ElementBehavior, ScriptState};
use super::collection::{invalidate_collections, CollectionScope, HtmlCollection};
use super::custom_elements::{self, CustomElementState};
use super::document::Document;
use super::forms::FormState;
use super::node::{FragmentData, Node, NodeData, NodeType};
use super::token_list::{DomStringMap, DomTokenList};
use super::{
    attribute_name, is_html_namespace, mutation, namespace_option, observer, parser,
    qualified_name_string, serializer, split_tokens, validate_and_extract, validate_name, DomError,
    Result,
};
use crate::core::css::selector::{self, SelectorList};
use crate::core::css::{CssStyleDeclaration, DeclarationBlock};
use crate::core::events::{Event, EventInit};

pub(crate) struct ElementData {
    pub(crate) attributes: AttributeList,
    pub(crate) behavior: &'static dyn ElementBehavior,
    pub(crate) shadow_root: Option<Node>,
    pub(crate) template_content: Option<Node>,
    pub(crate) custom: CustomElementState,
    pub(crate) form: FormState,
    pub(crate) script: ScriptState,
    pub(crate) style_cache: Option<Arc<DeclarationBlock>>,
}

impl ElementData {
    pub(crate) fn new(behavior: &'static dyn ElementBehavior) -> Self {
        Self {
            attributes: AttributeList::default(),
            behavior,
            shadow_root: None,
            template_content: None,
            custom: CustomElementState::default(),
            form: FormState::default(),
            script: ScriptState::default(),
            style_cache: None,
        }
    }
}

/// Element view over a [`Node`]. Derefs to the node for tree operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element(pub(crate) Node);

impl Deref for Element {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl From<Element> for Node {
    fn from(element: Element) -> Node {
        element.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowRootMode {
    Open,
    Closed,
}

/// A shadow root: a document fragment attached to a host element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShadowRoot(pub(crate) Node);

impl Deref for ShadowRoot {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl ShadowRoot {
    pub fn host(&self) -> Option<Element> {
        self.0.shadow_host()
    }

    pub fn mode(&self) -> ShadowRootMode {
        match &*self.0 .0.data.read() {
            NodeData::DocumentFragment(FragmentData { mode: Some(mode), .. }) => *mode,
            _ => ShadowRootMode::Open,
        }
    }

    pub fn inner_html(&self) -> String {
        serializer::serialize_children(&self.0)
    }

    pub fn set_inner_html(&self, html: &str) -> Result<()> {
        let host = self
            .host()
            .ok_or_else(|| DomError::InvalidState("shadow root has no host".into()))?;
        let fragment = parser::parse_fragment(&host, html)?;
        mutation::replace_all(Some(&fragment), &self.0);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    BeforeBegin,
    AfterBegin,
    BeforeEnd,
    AfterEnd,
}

impl FromStr for InsertPosition {
    type Err = DomError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "beforebegin" => Ok(InsertPosition::BeforeBegin),
            "afterbegin" => Ok(InsertPosition::AfterBegin),
            "beforeend" => Ok(InsertPosition::BeforeEnd),
            "afterend" => Ok(InsertPosition::AfterEnd),
            other => Err(DomError::Syntax(format!("'{other}' is not a valid insert position"))),
        }
    }
}

const SHADOW_HOST_NAMES: &[&str] = &[
    "article", "aside", "blockquote", "body", "div", "footer", "h1", "h2", "h3", "h4", "h5", "h6",
    "header", "main", "nav", "p", "section", "span",
];

impl Element {
    pub fn as_node(&self) -> &Node {
        &self.0
    }

    pub(crate) fn name(&self) -> &QualName {
        // elements are always created with a name
        self.0 .0.name.as_ref().unwrap_or(&*behavior::UNNAMED)
    }

    pub(crate) fn behavior(&self) -> &'static dyn ElementBehavior {
        self.0
            .element_data(|data| data.behavior)
            .unwrap_or_else(behavior::generic)
    }

    pub(crate) fn is_html(&self) -> bool {
        is_html_namespace(self.name())
    }

    /// HTML element whose node document is an HTML document.
    pub(crate) fn is_html_in_html_document(&self) -> bool {
        self.is_html() && self.node_document().is_some_and(|doc| doc.is_html())
    }

    pub(crate) fn has_local_name(&self, local: &str) -> bool {
        self.is_html() && &*self.name().local == local
    }

    pub fn local_name(&self) -> String {
        self.name().local.to_string()
    }

    pub fn namespace_uri(&self) -> Option<String> {
        namespace_option(&self.name().ns)
    }

    pub fn prefix(&self) -> Option<String> {
        self.name().prefix.as_ref().map(|p| p.to_string())
    }

    pub fn tag_name(&self) -> String {
        let qualified = qualified_name_string(self.name());
        if self.is_html_in_html_document() {
            qualified.to_ascii_uppercase()
        } else {
            qualified
        }
    }

    fn normalize_attribute_name(&self, name: &str) -> String {
        if self.is_html_in_html_document() {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }

    pub fn id(&self) -> String {
        self.get_attribute("id").unwrap_or_default()
    }

    pub fn set_id(&self, id: &str) {
        self.set_attribute_unchecked("id", id);
    }

    pub fn class_name(&self) -> String {
        self.get_attribute("class").unwrap_or_default()
    }

    pub fn set_class_name(&self, value: &str) {
        self.set_attribute_unchecked("class", value);
    }

    pub fn class_list(&self) -> DomTokenList {
        DomTokenList::new(self, "class", None)
    }

    /// `relList` for `a`, `area`, `link` and `form`; other elements get `None`.
    pub fn rel_list(&self) -> Option<DomTokenList> {
        let supported = if self.has_local_name("link") {
            Some(behavior::LINK_REL_TOKENS)
        } else if self.has_local_name("a") || self.has_local_name("area") || self.has_local_name("form") {
            Some(behavior::ANCHOR_REL_TOKENS)
        } else {
            None
        };
        supported.map(|tokens| DomTokenList::new(self, "rel", Some(tokens)))
    }

    pub fn dataset(&self) -> DomStringMap {
        DomStringMap::new(self)
    }

    pub fn style(&self) -> CssStyleDeclaration {
        CssStyleDeclaration::for_element(self)
    }

    pub fn hidden(&self) -> bool {
        self.has_attribute("hidden")
    }

    pub fn set_hidden(&self, hidden: bool) {
        if hidden {
            self.set_attribute_unchecked("hidden", "");
        } else {
            self.remove_attribute("hidden");
        }
    }

    pub fn title(&self) -> String {
        self.get_attribute("title").unwrap_or_default()
    }

    pub fn set_title(&self, title: &str) {
        self.set_attribute_unchecked("title", title);
    }

    pub fn lang(&self) -> String {
        self.get_attribute("lang").unwrap_or_default()
    }

    pub fn set_lang(&self, lang: &str) {
        self.set_attribute_unchecked("lang", lang);
    }

    pub fn tab_index(&self) -> i32 {
        self.get_attribute("tabindex")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(-1)
    }

    pub fn set_tab_index(&self, index: i32) {
        self.set_attribute_unchecked("tabindex", &index.to_string());
    }

    pub fn inner_text(&self) -> String {
        self.descendant_text()
    }

    pub fn set_inner_text(&self, text: &str) {
        self.set_text_content(text);
    }

    // --- attributes -------------------------------------------------------

    pub fn has_attributes(&self) -> bool {
        self.0.element_data(|data| !data.attributes.is_empty()).unwrap_or(false)
    }

    pub fn attributes(&self) -> Vec<Attr> {
        self.0.element_data(|data| data.attributes.to_vec()).unwrap_or_default()
    }

    pub fn get_attribute_names(&self) -> Vec<String> {
        self.attributes().iter().map(Attr::name).collect()
    }

    pub fn get_attribute_node(&self, name: &str) -> Option<Attr> {
        let name = self.normalize_attribute_name(name);
        self.0.element_data(|data| data.attributes.find_by_name(&name)).flatten()
    }

    pub fn get_attribute_node_ns(&self, namespace: Option<&str>, local_name: &str) -> Option<Attr> {
        let namespace = Namespace::from(namespace.unwrap_or(""));
        let local = LocalName::from(local_name);
        self.0.element_data(|data| data.attributes.find_ns(&namespace, &local)).flatten()
    }

    pub fn get_attribute(&self, name: &str) -> Option<String> {
        self.get_attribute_node(name).map(|attr| attr.value())
    }

    pub fn get_attribute_ns(&self, namespace: Option<&str>, local_name: &str) -> Option<String> {
        self.get_attribute_node_ns(namespace, local_name).map(|attr| attr.value())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute_node(name).is_some()
    }

    pub fn has_attribute_ns(&self, namespace: Option<&str>, local_name: &str) -> bool {
        self.get_attribute_node_ns(namespace, local_name).is_some()
    }

    /// Fails with `InvalidCharacterError` before touching the element when the
    /// name is not a valid XML name.
    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        validate_name(name)?;
        self.set_attribute_unchecked(name, value);
        Ok(())
    }

    pub(crate) fn set_attribute_unchecked(&self, name: &str, value: &str) {
        let name = self.normalize_attribute_name(name);
        match self.0.element_data(|data| data.attributes.find_by_name(&name)).flatten() {
            Some(attr) => self.change_attribute(&attr, value),
            None => self.append_attribute(Attr::new(attribute_name(&name), value)),
        }
    }

    pub fn set_attribute_ns(&self, namespace: Option<&str>, qualified_name: &str, value: &str) -> Result<()> {
        let name = validate_and_extract(namespace, qualified_name)?;
        self.set_attribute_qualified(name, value);
        Ok(())
    }

    /// Sets an attribute by its full name; used by the parser and cloning.
    pub(crate) fn set_attribute_qualified(&self, name: QualName, value: &str) {
        let existing = self
            .0
            .element_data(|data| data.attributes.find_qualified(&name))
            .flatten();
        match existing {
            Some(attr) => self.change_attribute(&attr, value),
            None => self.append_attribute(Attr::new(name, value)),
        }
    }

    pub fn remove_attribute(&self, name: &str) {
        if let Some(attr) = self.get_attribute_node(name) {
            self.remove_attribute_instance(&attr);
        }
    }

    pub fn remove_attribute_ns(&self, namespace: Option<&str>, local_name: &str) {
        if let Some(attr) = self.get_attribute_node_ns(namespace, local_name) {
            self.remove_attribute_instance(&attr);
        }
    }

    pub fn toggle_attribute(&self, name: &str, force: Option<bool>) -> Result<bool> {
        validate_name(name)?;
        let present = self.has_attribute(name);
        match (present, force) {
            (false, None | Some(true)) => {
                self.set_attribute_unchecked(name, "");
                Ok(true)
            }
            (true, None | Some(false)) => {
                self.remove_attribute(name);
                Ok(false)
            }
            (present, _) => Ok(present),
        }
    }

    pub fn set_attribute_node(&self, attr: &Attr) -> Result<Option<Attr>> {
        if let Some(owner) = attr.owner_element() {
            if &owner != self {
                return Err(DomError::InUseAttribute(format!(
                    "attribute '{}' is owned by another element",
                    attr.name()
                )));
            }
        }
        let name = attr.qual_name();
        let existing = self
            .0
            .element_data(|data| data.attributes.find_qualified(&name))
            .flatten();
        match existing {
            Some(old) if &old == attr => Ok(Some(old)),
            Some(old) => {
                let old_value = old.value();
                observer::queue_attribute_record(&self.0, &name, Some(old_value.clone()));
                self.0.element_data_mut(|data| {
                    if let Some(index) = data.attributes.position(&old) {
                        data.attributes.replace_at(index, attr.clone());
                    }
                });
                old.set_owner(None);
                attr.set_owner(Some(self));
                self.attribute_changed(&name, Some(old_value), Some(attr.value()));
                Ok(Some(old))
            }
            None => {
                self.append_attribute(attr.clone());
                Ok(None)
            }
        }
    }

    pub fn remove_attribute_node(&self, attr: &Attr) -> Result<Attr> {
        let present = self
            .0
            .element_data(|data| data.attributes.position(attr).is_some())
            .unwrap_or(false);
        if !present {
            return Err(DomError::NotFound(format!(
                "attribute '{}' does not belong to this element",
                attr.name()
            )));
        }
        self.remove_attribute_instance(attr);
        Ok(attr.clone())
    }

    fn append_attribute(&self, attr: Attr) {
        let name = attr.qual_name();
        let value = attr.value();
        observer::queue_attribute_record(&self.0, &name, None);
        attr.set_owner(Some(self));
        self.0.element_data_mut(|data| data.attributes.push(attr));
        self.attribute_changed(&name, None, Some(value));
    }

    pub(crate) fn change_attribute(&self, attr: &Attr, value: &str) {
        let name = attr.qual_name();
        let old = attr.value();
        observer::queue_attribute_record(&self.0, &name, Some(old.clone()));
        attr.replace_value(value);
        self.attribute_changed(&name, Some(old), Some(value.to_string()));
    }

    fn remove_attribute_instance(&self, attr: &Attr) {
        let name = attr.qual_name();
        let old = attr.value();
        observer::queue_attribute_record(&self.0, &name, Some(old.clone()));
        self.0.element_data_mut(|data| {
            if let Some(index) = data.attributes.position(attr) {
                data.attributes.remove_at(index);
            }
        });
        attr.set_owner(None);
        self.attribute_changed(&name, Some(old), None);
    }

    /// Single choke point for attribute side effects. Runs after the
    /// attribute list is updated and with no locks held.
    fn attribute_changed(&self, name: &QualName, old: Option<String>, new: Option<String>) {
        if name.ns == ns!() && &*name.local == "style" {
            self.0.element_data_mut(|data| data.style_cache = None);
        }
        invalidate_collections(&self.0);
        self.behavior()
            .attribute_changed(self, name, old.as_deref(), new.as_deref());
        custom_elements::enqueue_attribute_changed(self, name, old.as_deref(), new.as_deref());
    }

    // --- tree helpers -----------------------------------------------------

    pub fn children(&self) -> HtmlCollection {
        HtmlCollection::new(&self.0, CollectionScope::Children, |_| true)
    }

    pub fn child_element_count(&self) -> usize {
        self.children_snapshot().iter().filter(|n| n.is_element()).count()
    }

    pub fn first_element_child(&self) -> Option<Element> {
        self.children_snapshot().into_iter().find_map(|n| n.as_element())
    }

    pub fn last_element_child(&self) -> Option<Element> {
        self.children_snapshot().into_iter().rev().find_map(|n| n.as_element())
    }

    pub fn previous_element_sibling(&self) -> Option<Element> {
        let mut sibling = self.previous_sibling();
        while let Some(node) = sibling {
            if let Some(element) = node.as_element() {
                return Some(element);
            }
            sibling = node.previous_sibling();
        }
        None
    }

    pub fn next_element_sibling(&self) -> Option<Element> {
        let mut sibling = self.next_sibling();
        while let Some(node) = sibling {
            if let Some(element) = node.as_element() {
                return Some(element);
            }
            sibling = node.next_sibling();
        }
        None
    }

    pub fn matches(&self, selectors: &str) -> Result<bool> {
        let list = selector::parse_cached(selectors)?;
        Ok(list.matches(self, Some(self)))
    }

    pub fn closest(&self, selectors: &str) -> Result<Option<Element>> {
        let list = selector::parse_cached(selectors)?;
        Ok(self
            .inclusive_ancestors()
            .filter_map(|node| node.as_element())
            .find(|element| list.matches(element, Some(self))))
    }

    // --- markup -----------------------------------------------------------

    /// Node that receives parsed children: template content for `<template>`.
    fn markup_target(&self) -> Node {
        self.template_content().unwrap_or_else(|| self.0.clone())
    }

    pub fn inner_html(&self) -> String {
        serializer::serialize_children_of_element(self)
    }

    pub fn set_inner_html(&self, html: &str) -> Result<()> {
        let fragment = parser::parse_fragment(self, html)?;
        mutation::replace_all(Some(&fragment), &self.markup_target());
        Ok(())
    }

    pub fn outer_html(&self) -> String {
        serializer::serialize_node(&self.0)
    }

    pub fn set_outer_html(&self, html: &str) -> Result<()> {
        let Some(parent) = self.parent_node() else {
            return Ok(());
        };
        if parent.node_type() == NodeType::Document {
            return Err(DomError::NoModificationAllowed(
                "cannot replace the document element through outerHTML".into(),
            ));
        }
        let context = match parent.as_element() {
            Some(element) => element,
            None => self.fragment_context()?,
        };
        let fragment = parser::parse_fragment(&context, html)?;
        mutation::replace(&self.0, &fragment, &parent).map(|_| ())
    }

    fn fragment_context(&self) -> Result<Element> {
        let document = self
            .node_document()
            .ok_or_else(|| DomError::InvalidState("element has no document".into()))?;
        document.create_element("body")
    }

    pub fn insert_adjacent_html(&self, position: &str, html: &str) -> Result<()> {
        let position: InsertPosition = position.parse()?;
        let context = match position {
            InsertPosition::BeforeBegin | InsertPosition::AfterEnd => {
                match self.parent_node() {
                    None => {
                        return Err(DomError::NoModificationAllowed(
                            "element has no parent".into(),
                        ))
                    }
                    Some(parent) if parent.node_type() == NodeType::Document => {
                        return Err(DomError::NoModificationAllowed(
                            "cannot insert next to the document element".into(),
                        ))
                    }
                    Some(parent) => match parent.as_element() {
                        Some(element) => element,
                        None => self.fragment_context()?,
                    },
                }
            }
            InsertPosition::AfterBegin | InsertPosition::BeforeEnd => self.clone(),
        };
        let fragment = parser::parse_fragment(&context, html)?;
        self.insert_adjacent(position, &fragment).map(|_| ())
    }

    pub fn insert_adjacent_element(&self, position: &str, element: &Element) -> Result<Option<Element>> {
        let position: InsertPosition = position.parse()?;
        Ok(self
            .insert_adjacent(position, &element.0)?
            .and_then(|node| node.as_element()))
    }

    pub fn insert_adjacent_text(&self, position: &str, text: &str) -> Result<()> {
        let position: InsertPosition = position.parse()?;
        let document = self
            .node_document()
            .ok_or_else(|| DomError::InvalidState("element has no document".into()))?;
        let node = document.create_text_node(text);
        self.insert_adjacent(position, &node).map(|_| ())
    }

    fn insert_adjacent(&self, position: InsertPosition, node: &Node) -> Result<Option<Node>> {
        match position {
            InsertPosition::BeforeBegin => match self.parent_node() {
                Some(parent) => mutation::pre_insert(node, &parent, Some(&self.0)).map(Some),
                None => Ok(None),
            },
            InsertPosition::AfterBegin => {
                let first = self.first_child();
                mutation::pre_insert(node, &self.0, first.as_ref()).map(Some)
            }
            InsertPosition::BeforeEnd => mutation::pre_insert(node, &self.0, None).map(Some),
            InsertPosition::AfterEnd => match self.parent_node() {
                Some(parent) => {
                    let next = self.next_sibling();
                    mutation::pre_insert(node, &parent, next.as_ref()).map(Some)
                }
                None => Ok(None),
            },
        }
    }

    // --- shadow DOM and templates -----------------------------------------

    pub fn attach_shadow(&self, mode: ShadowRootMode) -> Result<ShadowRoot> {
        let local = self.local_name();
        let allowed = self.is_html()
            && (SHADOW_HOST_NAMES.contains(&local.as_str())
                || custom_elements::is_valid_custom_element_name(&local));
        if !allowed {
            return Err(DomError::NotSupported(format!(
                "<{local}> cannot host a shadow root"
            )));
        }
        if self.0.element_data(|data| data.shadow_root.is_some()).unwrap_or(false) {
            return Err(DomError::NotSupported("element already hosts a shadow root".into()));
        }
        let document = self
            .node_document()
            .ok_or_else(|| DomError::InvalidState("element has no document".into()))?;
        let shadow = Node::new_raw(
            NodeType::DocumentFragment,
            None,
            NodeData::DocumentFragment(FragmentData {
                host: Some(Arc::downgrade(&self.0 .0)),
                mode: Some(mode),
            }),
            Arc::downgrade(&document.0 .0),
        );
        shadow.set_connected(self.is_connected());
        self.0.element_data_mut(|data| data.shadow_root = Some(shadow.clone()));
        debug!(host = ?self.0, ?mode, "attached shadow root");
        Ok(ShadowRoot(shadow))
    }

    /// Open shadow root only; closed roots are hidden from this accessor.
    pub fn shadow_root(&self) -> Option<ShadowRoot> {
        let shadow = self.0.element_data(|data| data.shadow_root.clone()).flatten()?;
        let root = ShadowRoot(shadow);
        (root.mode() == ShadowRootMode::Open).then_some(root)
    }

    pub(crate) fn any_shadow_root(&self) -> Option<ShadowRoot> {
        self.0
            .element_data(|data| data.shadow_root.clone())
            .flatten()
            .map(ShadowRoot)
    }

    /// `template.content`; `None` for non-template elements.
    pub fn template_content(&self) -> Option<Node> {
        self.0.element_data(|data| data.template_content.clone()).flatten()
    }

    pub(crate) fn clone_element_shell(&self, document: &Document) -> Element {
        let copy = document.create_element_with_name(self.name().clone(), false);
        for attr in self.attributes() {
            copy.append_attribute(Attr::new(attr.qual_name(), attr.value()));
        }
        self.behavior().cloned(self, &copy);
        copy
    }

    // --- interaction ------------------------------------------------------

    pub fn focus(&self) {
        if let Some(document) = self.node_document() {
            document.focus_element(self);
        }
    }

    pub fn blur(&self) {
        if let Some(document) = self.node_document() {
            document.blur_element(self);
        }
    }

    /// Dispatches a synthetic `click`. Disabled form controls ignore it.
    pub fn click(&self) -> bool {
        if self.is_disabled() {
            return false;
        }
        let event = Event::new(
            "click",
            EventInit {
                bubbles: true,
                cancelable: true,
                composed: true,
            },
        );
        self.dispatch_event(&event).unwrap_or(false)
    }
}

impl Node {
    fn selector_scope(&self) -> Option<Element> {
        self.as_element()
            .or_else(|| self.as_document().and_then(|doc| doc.document_element()))
    }

    fn select_all(&self, list: &SelectorList) -> Vec<Element> {
        let scope = self.selector_scope();
        self.descendant_elements()
            .filter(|element| list.matches(element, scope.as_ref()))
            .collect()
    }

    /// First matching descendant element in tree order.
    pub fn query_selector(&self, selectors: &str) -> Result<Option<Element>> {
        let list = selector::parse_cached(selectors)?;
        let scope = self.selector_scope();
        Ok(self
            .descendant_elements()
            .find(|element| list.matches(element, scope.as_ref())))
    }

    /// Static snapshot of every matching descendant.
    pub fn query_selector_all(&self, selectors: &str) -> Result<super::NodeList> {
        let list = selector::parse_cached(selectors)?;
        let nodes = self.select_all(&list).into_iter().map(|e| e.0).collect();
        Ok(super::NodeList::from_static(nodes))
    }

    pub fn get_elements_by_tag_name(&self, qualified_name: &str) -> HtmlCollection {
        let qualified = qualified_name.to_string();
        let lowered = qualified_name.to_ascii_lowercase();
        HtmlCollection::new(self, CollectionScope::Descendants, move |element| {
            if qualified == "*" {
                return true;
            }
            let name = qualified_name_string(element.name());
            if element.is_html_in_html_document() {
                name == lowered
            } else {
                name == qualified
            }
        })
    }

    pub fn get_elements_by_tag_name_ns(&self, namespace: Option<&str>, local_name: &str) -> HtmlCollection {
        let namespace = namespace.map(str::to_string);
        let local = local_name.to_string();
        HtmlCollection::new(self, CollectionScope::Descendants, move |element| {
            let ns_matches = match namespace.as_deref() {
                Some("*") => true,
                Some(ns) => element.namespace_uri().as_deref() == Some(ns),
                None => element.namespace_uri().is_none(),
            };
            ns_matches && (local == "*" || element.local_name() == local)
        })
    }

    pub fn get_elements_by_class_name(&self, class_names: &str) -> HtmlCollection {
        let wanted: Vec<String> = split_tokens(class_names).map(str::to_string).collect();
        HtmlCollection::new(self, CollectionScope::Descendants, move |element| {
            if wanted.is_empty() {
                return false;
            }
            let classes = element.class_name();
            let have: Vec<&str> = split_tokens(&classes).collect();
            wanted.iter().all(|w| have.contains(&w.as_str()))
        })
    }

    pub(crate) fn find_element_by_id(&self, id: &str) -> Option<Element> {
        if id.is_empty() {
            return None;
        }
        self.descendant_elements()
            .find(|element| element.get_attribute("id").as_deref() == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn html_names_are_case_normalized() {
        let doc = Document::new();
        let div = doc.create_element("DIV").unwrap();
        assert_eq!(div.local_name(), "div");
        assert_eq!(div.tag_name(), "DIV");
        div.set_attribute("Data-Foo", "1").unwrap();
        assert_eq!(div.get_attribute_names(), vec!["data-foo".to_string()]);
        assert_eq!(div.get_attribute("DATA-FOO").as_deref(), Some("1"));
    }

    #[test]
    fn invalid_attribute_names_leave_element_untouched() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let err = div.set_attribute("bad name", "x").unwrap_err();
        assert_eq!(err.name(), "InvalidCharacterError");
        assert!(!div.has_attributes());
    }

    #[test]
    fn toggle_attribute_honors_force() {
        let doc = Document::new();
        let input = doc.create_element("input").unwrap();
        assert!(input.toggle_attribute("disabled", None).unwrap());
        assert!(input.toggle_attribute("disabled", Some(true)).unwrap());
        assert!(!input.toggle_attribute("disabled", None).unwrap());
        assert!(!input.toggle_attribute("disabled", Some(false)).unwrap());
    }

    #[test]
    fn attr_nodes_cannot_be_shared() {
        let doc = Document::new();
        let a = doc.create_element("div").unwrap();
        let b = doc.create_element("div").unwrap();
        a.set_attribute("title", "x").unwrap();
        let attr = a.get_attribute_node("title").unwrap();
        assert_eq!(b.set_attribute_node(&attr).unwrap_err().name(), "InUseAttributeError");
        a.remove_attribute_node(&attr).unwrap();
        assert!(attr.owner_element().is_none());
        assert!(b.set_attribute_node(&attr).unwrap().is_none());
        assert_eq!(b.get_attribute("title").as_deref(), Some("x"));
    }

    #[test]
    fn attr_value_writes_through_to_owner() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_attribute("id", "a").unwrap();
        div.get_attribute_node("id").unwrap().set_value("b");
        assert_eq!(div.id(), "b");
    }

    #[test]
    fn insert_adjacent_positions() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let target = doc.create_element("p").unwrap();
        body.append_child(&target).unwrap();
        target.insert_adjacent_html("beforebegin", "<i>1</i>").unwrap();
        target.insert_adjacent_html("afterbegin", "<b>2</b>").unwrap();
        target.insert_adjacent_text("beforeend", "3").unwrap();
        target.insert_adjacent_html("afterend", "<u>4</u>").unwrap();
        assert_eq!(body.inner_html(), "<i>1</i><p><b>2</b>3</p><u>4</u>");
        assert_eq!(
            target.insert_adjacent_html("middle", "x").unwrap_err().name(),
            "SyntaxError"
        );
    }

    #[test]
    fn outer_html_replaces_element() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<div id=a></div>").unwrap();
        let div = doc.get_element_by_id("a").unwrap();
        div.set_outer_html("<span>x</span><span>y</span>").unwrap();
        assert_eq!(body.inner_html(), "<span>x</span><span>y</span>");
        assert!(div.parent_node().is_none());
    }

    #[test]
    fn shadow_roots_respect_host_rules_and_mode() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let root = div.attach_shadow(ShadowRootMode::Closed).unwrap();
        assert!(div.shadow_root().is_none());
        assert_eq!(root.host(), Some(div.clone()));
        assert_eq!(div.attach_shadow(ShadowRootMode::Open).unwrap_err().name(), "NotSupportedError");
        let img = doc.create_element("img").unwrap();
        assert!(img.attach_shadow(ShadowRootMode::Open).is_err());
    }

    #[test]
    fn closest_walks_inclusive_ancestors() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<section class=s><div><p id=p></p></div></section>").unwrap();
        let p = doc.get_element_by_id("p").unwrap();
        assert_eq!(p.closest("section").unwrap().unwrap().class_name(), "s");
        assert_eq!(p.closest("p").unwrap(), Some(p.clone()));
        assert!(p.closest("table").unwrap().is_none());
    }

    #[test]
    fn template_content_holds_parsed_children() {
        let doc = Document::new();
        let template = doc.create_element("template").unwrap();
        template.set_inner_html("<b>x</b>").unwrap();
        assert!(!template.has_child_nodes());
        assert_eq!(template.template_content().unwrap().child_count(), 1);
        assert_eq!(template.inner_html(), "<b>x</b>");
    }
}
