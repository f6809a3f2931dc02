use std::ops::Deref;
use std::sync::Arc;

use html5ever::{namespace_url, ns, LocalName, QualName};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::attributes::Attr;
use super::behavior;
use super::collection::{CollectionScope, HtmlCollection};
use super::custom_elements::{self, CustomElementRegistry};
use super::element::{Element, ElementData};
use super::node::{FragmentData, Node, NodeData, NodeType, WeakNode};
use super::traversal::{NodeFilter, TreeWalker};
use super::write_stream::{self, WriteStream};
use super::{
    html_name, mutation, parser, split_tokens, validate_and_extract, validate_name, DomError,
    Result,
};
use crate::core::events::{fire_simple_event, Event, EventInit, EventTarget};
use crate::window::{Location, WeakWindow, Window};

pub(crate) static ABOUT_BLANK: Lazy<Url> =
    Lazy::new(|| Url::parse("about:blank").expect("about:blank is a valid URL"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentReadyState {
    Loading,
    Interactive,
    Complete,
}

impl DocumentReadyState {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentReadyState::Loading => "loading",
            DocumentReadyState::Interactive => "interactive",
            DocumentReadyState::Complete => "complete",
        }
    }
}

#[derive(Default)]
pub(crate) struct FocusState {
    pub(crate) active: Option<WeakNode>,
    /// Element a focus operation is currently moving to; guards reentrant
    /// focus calls from blur/focusout listeners.
    pub(crate) next_active: Option<WeakNode>,
}

#[derive(Default)]
pub(crate) struct ParserState {
    pub(crate) active: bool,
    pub(crate) pending_write: String,
    /// Live while a stream opened by `open()` has not been closed.
    pub(crate) stream: Option<WriteStream>,
    pub(crate) deferred_scripts: Vec<Element>,
}

pub(crate) struct DocumentData {
    pub(crate) is_html: bool,
    pub(crate) content_type: String,
    pub(crate) url: Url,
    pub(crate) referrer: String,
    pub(crate) quirks_mode: bool,
    pub(crate) ready_state: DocumentReadyState,
    pub(crate) window: Option<WeakWindow>,
    pub(crate) registry: Option<CustomElementRegistry>,
    pub(crate) focus: FocusState,
    pub(crate) parser: ParserState,
}

impl DocumentData {
    fn new(is_html: bool, url: Url) -> Self {
        Self {
            is_html,
            content_type: if is_html { "text/html" } else { "application/xml" }.to_string(),
            url,
            referrer: String::new(),
            quirks_mode: false,
            ready_state: DocumentReadyState::Complete,
            window: None,
            registry: None,
            focus: FocusState::default(),
            parser: ParserState::default(),
        }
    }
}

/// The tree root. Derefs to [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document(pub(crate) Node);

impl Deref for Document {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl From<Document> for Node {
    fn from(document: Document) -> Node {
        document.0
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

const FOCUSABLE_NAMES: &[&str] = &["button", "iframe", "input", "select", "summary", "textarea"];

impl Document {
    /// Empty document with no children.
    pub(crate) fn new_empty(is_html: bool, url: Url) -> Document {
        Document(Node::new_raw(
            NodeType::Document,
            None,
            NodeData::Document(Box::new(DocumentData::new(is_html, url))),
            std::sync::Weak::new(),
        ))
    }

    /// Connected, childless document with its own registry; the window that
    /// owns it fills it through the parser.
    pub(crate) fn for_window(url: Url) -> Document {
        let document = Self::new_empty(true, url);
        document.0.set_connected(true);
        document.install_registry(CustomElementRegistry::new());
        document
    }

    /// A standalone HTML document (`<!DOCTYPE html><html><head></head><body></body></html>`)
    /// with its own custom element registry.
    pub fn new() -> Document {
        Self::with_skeleton(ABOUT_BLANK.clone(), None, true)
    }

    pub fn new_with_url(url: &str) -> Result<Document> {
        let url = Url::parse(url).map_err(|e| DomError::Syntax(format!("invalid URL '{url}': {e}")))?;
        Ok(Self::with_skeleton(url, None, true))
    }

    /// `DOMImplementation.createHTMLDocument`.
    pub fn create_html_document(title: Option<&str>) -> Document {
        Self::with_skeleton(ABOUT_BLANK.clone(), title, false)
    }

    fn with_skeleton(url: Url, title: Option<&str>, with_registry: bool) -> Document {
        let document = Self::new_empty(true, url);
        document.0.set_connected(true);
        if with_registry {
            document.install_registry(CustomElementRegistry::new());
        }
        let doctype = document.create_document_type("html", "", "");
        mutation::append_unchecked(&document, &doctype);
        let html = document.create_element_with_name(html_name("html"), false);
        let head = document.create_element_with_name(html_name("head"), false);
        let body = document.create_element_with_name(html_name("body"), false);
        mutation::append_unchecked(&document, &html);
        mutation::append_unchecked(&html, &head);
        if let Some(title) = title {
            let element = document.create_element_with_name(html_name("title"), false);
            mutation::append_unchecked(&element, &document.create_text_node(title));
            mutation::append_unchecked(&head, &element);
        }
        mutation::append_unchecked(&html, &body);
        document
    }

    /// Fresh document sharing this one's type and URL, used by `cloneNode`.
    pub(crate) fn clone_shell(&self) -> Document {
        let (is_html, url, content_type) = self
            .document_data(|d| (d.is_html, d.url.clone(), d.content_type.clone()))
            .unwrap_or((true, ABOUT_BLANK.clone(), "text/html".into()));
        let copy = Self::new_empty(is_html, url);
        copy.document_data_mut(|d| d.content_type = content_type);
        copy.0.set_connected(true);
        copy
    }

    pub(crate) fn install_registry(&self, registry: CustomElementRegistry) {
        registry.bind_document(self);
        self.document_data_mut(|d| d.registry = Some(registry));
    }

    pub fn as_node(&self) -> &Node {
        &self.0
    }

    pub fn is_html(&self) -> bool {
        self.document_data(|d| d.is_html).unwrap_or(true)
    }

    pub fn content_type(&self) -> String {
        self.document_data(|d| d.content_type.clone()).unwrap_or_default()
    }

    pub(crate) fn set_content_type(&self, content_type: &str) {
        let is_html = content_type.eq_ignore_ascii_case("text/html");
        self.document_data_mut(|d| {
            d.content_type = content_type.to_string();
            d.is_html = is_html;
        });
    }

    pub fn character_set(&self) -> &'static str {
        "UTF-8"
    }

    pub fn compat_mode(&self) -> &'static str {
        if self.document_data(|d| d.quirks_mode).unwrap_or(false) {
            "BackCompat"
        } else {
            "CSS1Compat"
        }
    }

    pub(crate) fn set_quirks_mode(&self, quirks: bool) {
        self.document_data_mut(|d| d.quirks_mode = quirks);
    }

    // --- factories ----------------------------------------------------------

    pub fn create_element(&self, local_name: &str) -> Result<Element> {
        validate_name(local_name)?;
        let local = if self.is_html() {
            local_name.to_ascii_lowercase()
        } else {
            local_name.to_string()
        };
        let namespace = if self.is_html() || self.content_type() == "application/xhtml+xml" {
            ns!(html)
        } else {
            ns!()
        };
        let name = QualName::new(None, namespace, LocalName::from(local));
        Ok(self.create_element_with_name(name, true))
    }

    pub fn create_element_ns(&self, namespace: Option<&str>, qualified_name: &str) -> Result<Element> {
        let name = validate_and_extract(namespace, qualified_name)?;
        Ok(self.create_element_with_name(name, true))
    }

    /// Creates an element without name validation. `synchronous_custom`
    /// runs a matching custom element definition right away; the parser and
    /// cloning leave such elements undefined until they are connected.
    pub(crate) fn create_element_with_name(&self, name: QualName, synchronous_custom: bool) -> Element {
        let behavior = behavior::behavior_for(&name);
        let is_template = name.ns == ns!(html) && &*name.local == "template";
        let element = Element(Node::new_raw(
            NodeType::Element,
            Some(name),
            NodeData::Element(ElementData::new(behavior)),
            Arc::downgrade(&self.0 .0),
        ));
        if is_template {
            let content = self.create_document_fragment();
            element.element_data_mut(|data| data.template_content = Some(content));
        }
        let registry = if synchronous_custom {
            self.custom_element_registry()
        } else {
            None
        };
        custom_elements::initialize_element(&element, registry.as_ref());
        element
    }

    pub fn create_text_node(&self, data: &str) -> Node {
        self.leaf(NodeType::Text, NodeData::Text(data.to_string()))
    }

    pub fn create_comment(&self, data: &str) -> Node {
        self.leaf(NodeType::Comment, NodeData::Comment(data.to_string()))
    }

    pub fn create_cdata_section(&self, data: &str) -> Result<Node> {
        if self.is_html() {
            return Err(DomError::NotSupported(
                "CDATA sections are not allowed in HTML documents".into(),
            ));
        }
        if data.contains("]]>") {
            return Err(DomError::InvalidCharacter("CDATA data cannot contain ']]>'".into()));
        }
        Ok(self.create_cdata_section_unchecked(data))
    }

    pub(crate) fn create_cdata_section_unchecked(&self, data: &str) -> Node {
        self.leaf(NodeType::CDataSection, NodeData::CDataSection(data.to_string()))
    }

    pub fn create_processing_instruction(&self, target: &str, data: &str) -> Result<Node> {
        validate_name(target)?;
        if data.contains("?>") {
            return Err(DomError::InvalidCharacter(
                "processing instruction data cannot contain '?>'".into(),
            ));
        }
        Ok(self.create_processing_instruction_unchecked(target, data))
    }

    pub(crate) fn create_processing_instruction_unchecked(&self, target: &str, data: &str) -> Node {
        self.leaf(
            NodeType::ProcessingInstruction,
            NodeData::ProcessingInstruction {
                target: target.to_string(),
                data: data.to_string(),
            },
        )
    }

    pub fn create_document_type(&self, name: &str, public_id: &str, system_id: &str) -> Node {
        self.leaf(
            NodeType::DocumentType,
            NodeData::DocumentType {
                name: name.to_string(),
                public_id: public_id.to_string(),
                system_id: system_id.to_string(),
            },
        )
    }

    pub fn create_document_fragment(&self) -> Node {
        self.leaf(
            NodeType::DocumentFragment,
            NodeData::DocumentFragment(FragmentData { host: None, mode: None }),
        )
    }

    pub fn create_attribute(&self, local_name: &str) -> Result<Attr> {
        validate_name(local_name)?;
        let local = if self.is_html() {
            local_name.to_ascii_lowercase()
        } else {
            local_name.to_string()
        };
        Ok(Attr::new(super::attribute_name(&local), ""))
    }

    pub fn create_attribute_ns(&self, namespace: Option<&str>, qualified_name: &str) -> Result<Attr> {
        Ok(Attr::new(validate_and_extract(namespace, qualified_name)?, ""))
    }

    /// `createEvent`: an event of the named legacy interface, to be set up by the caller.
    pub fn create_event(&self, interface: &str) -> Result<Event> {
        Event::create_legacy(interface)
    }

    pub fn create_tree_walker(&self, root: &Node, what_to_show: u32, filter: Option<NodeFilter>) -> TreeWalker {
        TreeWalker::new(root, what_to_show, filter)
    }

    fn leaf(&self, node_type: NodeType, data: NodeData) -> Node {
        Node::new_raw(node_type, None, data, Arc::downgrade(&self.0 .0))
    }

    pub fn import_node(&self, node: &Node, deep: bool) -> Result<Node> {
        if node.node_type() == NodeType::Document || node.is_shadow_root() {
            return Err(DomError::NotSupported("documents and shadow roots cannot be imported".into()));
        }
        node.clone_into(Some(self), deep)
    }

    pub fn adopt_node(&self, node: &Node) -> Result<Node> {
        if node.node_type() == NodeType::Document {
            return Err(DomError::NotSupported("documents cannot be adopted".into()));
        }
        if node.is_shadow_root() {
            return Err(DomError::HierarchyRequest("shadow roots cannot be adopted".into()));
        }
        mutation::adopt(node, self);
        Ok(node.clone())
    }

    // --- tree accessors ------------------------------------------------------

    pub fn document_element(&self) -> Option<Element> {
        self.children_snapshot().into_iter().find_map(|n| n.as_element())
    }

    pub fn doctype(&self) -> Option<Node> {
        self.children_snapshot()
            .into_iter()
            .find(|n| n.node_type() == NodeType::DocumentType)
    }

    fn html_child(&self, names: &[&str]) -> Option<Element> {
        let root = self.document_element().filter(|e| e.has_local_name("html"))?;
        root.children_snapshot()
            .into_iter()
            .filter_map(|n| n.as_element())
            .find(|e| names.iter().any(|name| e.has_local_name(name)))
    }

    pub fn head(&self) -> Option<Element> {
        self.html_child(&["head"])
    }

    pub fn body(&self) -> Option<Element> {
        self.html_child(&["body", "frameset"])
    }

    pub fn title(&self) -> String {
        let title = self
            .descendant_elements()
            .find(|e| e.has_local_name("title"))
            .map(|e| e.child_text_content())
            .unwrap_or_default();
        split_tokens(&title).collect::<Vec<_>>().join(" ")
    }

    pub fn set_title(&self, title: &str) {
        if let Some(element) = self.descendant_elements().find(|e| e.has_local_name("title")) {
            element.set_text_content(title);
            return;
        }
        let Some(head) = self.head() else {
            return;
        };
        let element = self.create_element_with_name(html_name("title"), true);
        element.set_text_content(title);
        mutation::append_unchecked(&head, &element);
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<Element> {
        self.find_element_by_id(id)
    }

    pub fn get_elements_by_name(&self, name: &str) -> HtmlCollection {
        let name = name.to_string();
        HtmlCollection::new(self, CollectionScope::Descendants, move |element| {
            element.get_attribute("name").as_deref() == Some(name.as_str())
        })
    }

    pub fn forms(&self) -> HtmlCollection {
        HtmlCollection::new(self, CollectionScope::Descendants, |e| e.has_local_name("form"))
    }

    pub fn images(&self) -> HtmlCollection {
        HtmlCollection::new(self, CollectionScope::Descendants, |e| e.has_local_name("img"))
    }

    pub fn scripts(&self) -> HtmlCollection {
        HtmlCollection::new(self, CollectionScope::Descendants, |e| e.has_local_name("script"))
    }

    pub fn links(&self) -> HtmlCollection {
        HtmlCollection::new(self, CollectionScope::Descendants, |e| {
            (e.has_local_name("a") || e.has_local_name("area")) && e.has_attribute("href")
        })
    }

    // --- URL, window, registry ---------------------------------------------------

    pub fn url(&self) -> String {
        self.document_data(|d| d.url.to_string()).unwrap_or_default()
    }

    pub(crate) fn url_value(&self) -> Url {
        self.document_data(|d| d.url.clone())
            .unwrap_or_else(|| ABOUT_BLANK.clone())
    }

    pub(crate) fn set_url(&self, url: Url) {
        self.document_data_mut(|d| d.url = url);
    }

    pub fn referrer(&self) -> String {
        self.document_data(|d| d.referrer.clone()).unwrap_or_default()
    }

    pub(crate) fn set_referrer(&self, referrer: &str) {
        self.document_data_mut(|d| d.referrer = referrer.to_string());
    }

    /// Document base URL: the first `<base href>` resolved against the
    /// document URL, or the URL itself.
    pub fn base_url(&self) -> Url {
        let url = self.url_value();
        let base = self
            .descendant_elements()
            .find(|e| e.has_local_name("base") && e.has_attribute("href"))
            .and_then(|e| e.get_attribute("href"));
        match base.and_then(|href| url.join(href.trim()).ok()) {
            Some(base) => base,
            None => url,
        }
    }

    pub fn resolve_url(&self, value: &str) -> Result<Url> {
        self.base_url()
            .join(value)
            .map_err(|e| DomError::Syntax(format!("cannot resolve URL '{value}': {e}")))
    }

    pub fn default_view(&self) -> Option<Window> {
        self.document_data(|d| d.window.clone())
            .flatten()
            .and_then(|weak| weak.upgrade())
    }

    pub(crate) fn attach_window(&self, window: &Window) {
        self.document_data_mut(|d| d.window = Some(window.downgrade()));
    }

    pub fn custom_element_registry(&self) -> Option<CustomElementRegistry> {
        self.document_data(|d| d.registry.clone()).flatten()
    }

    pub fn location(&self) -> Option<Location> {
        self.default_view().map(|window| window.location())
    }

    pub fn cookie(&self) -> String {
        match self.default_view() {
            Some(window) => window.cookie_jar().cookie_string(&self.url_value()),
            None => String::new(),
        }
    }

    pub fn set_cookie(&self, cookie: &str) {
        if let Some(window) = self.default_view() {
            window.cookie_jar().set_cookie(&self.url_value(), cookie);
        }
    }

    pub fn visibility_state(&self) -> &'static str {
        "visible"
    }

    pub fn hidden(&self) -> bool {
        false
    }

    // --- readiness -----------------------------------------------------------

    pub fn ready_state(&self) -> DocumentReadyState {
        self.document_data(|d| d.ready_state)
            .unwrap_or(DocumentReadyState::Complete)
    }

    /// Updates the state and fires `readystatechange` when it changed.
    pub(crate) fn set_ready_state(&self, state: DocumentReadyState) {
        let changed = self
            .document_data_mut(|d| std::mem::replace(&mut d.ready_state, state) != state)
            .unwrap_or(false);
        if changed {
            debug!(url = %self.url(), state = state.as_str(), "document ready state");
            fire_simple_event(self, "readystatechange");
        }
    }

    // --- focus ---------------------------------------------------------------

    /// `activeElement`: the focused element, or the body when nothing is.
    pub fn active_element(&self) -> Option<Element> {
        self.focused_element().or_else(|| self.body())
    }

    fn focused_element(&self) -> Option<Element> {
        self.document_data(|d| d.focus.active.clone())
            .flatten()
            .and_then(|weak| weak.upgrade())
            .and_then(|node| node.as_element())
    }

    pub fn has_focus(&self) -> bool {
        self.focused_element().is_some()
    }

    fn is_focusable(element: &Element) -> bool {
        if !element.is_connected() || element.is_disabled() {
            return false;
        }
        if element.has_attribute("tabindex") || element.has_attribute("contenteditable") {
            return true;
        }
        if (element.has_local_name("a") || element.has_local_name("area")) && element.has_attribute("href") {
            return true;
        }
        if element.has_local_name("input")
            && element
                .get_attribute("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("hidden"))
        {
            return false;
        }
        element.is_html() && FOCUSABLE_NAMES.contains(&&*element.name().local)
    }

    fn fire_focus_event(target: &Element, event_type: &str, bubbles: bool, related: Option<&Element>) {
        let event = Event::focus(
            event_type,
            EventInit {
                bubbles,
                cancelable: false,
                composed: true,
            },
            related.map(|e| EventTarget::Node(e.as_node().clone())),
        );
        if let Err(error) = target.dispatch_event(&event) {
            warn!(%error, event_type, "focus event dispatch failed");
        }
    }

    /// Moves focus to `element`: the previous element's `blur`/`focusout`
    /// complete before `focus`/`focusin` fire on the new one. A listener
    /// that moves focus elsewhere in between wins.
    pub(crate) fn focus_element(&self, element: &Element) {
        if !Self::is_focusable(element) {
            return;
        }
        let previous = self.focused_element();
        if previous.as_ref() == Some(element) {
            return;
        }
        let target = element.downgrade();
        let reentrant = self
            .document_data_mut(|d| {
                let pending = d.focus.next_active.as_ref().and_then(WeakNode::upgrade);
                if pending.as_ref() == Some(element.as_node()) {
                    true
                } else {
                    d.focus.next_active = Some(target.clone());
                    false
                }
            })
            .unwrap_or(true);
        if reentrant {
            return;
        }

        if let Some(previous) = &previous {
            Self::fire_focus_event(previous, "blur", false, Some(element));
            Self::fire_focus_event(previous, "focusout", true, Some(element));
        }

        let still_ours = self
            .document_data_mut(|d| {
                let ours = d.focus.next_active.as_ref().and_then(WeakNode::upgrade).as_ref()
                    == Some(element.as_node());
                if ours {
                    d.focus.active = Some(target.clone());
                    d.focus.next_active = None;
                }
                ours
            })
            .unwrap_or(false);
        if !still_ours || !element.is_connected() {
            return;
        }
        Self::fire_focus_event(element, "focus", false, previous.as_ref());
        Self::fire_focus_event(element, "focusin", true, previous.as_ref());
    }

    pub(crate) fn blur_element(&self, element: &Element) {
        if self.focused_element().as_ref() != Some(element) {
            return;
        }
        self.document_data_mut(|d| d.focus.active = None);
        Self::fire_focus_event(element, "blur", false, None);
        Self::fire_focus_event(element, "focusout", true, None);
    }

    /// Removing the focused element (or an ancestor) unfocuses it silently.
    pub(crate) fn focus_fixup_for_removal(&self, removed: &Node) {
        let Some(active) = self
            .document_data(|d| d.focus.active.clone())
            .flatten()
            .and_then(|weak| weak.upgrade())
        else {
            return;
        };
        if removed.is_host_including_inclusive_ancestor_of(&active) {
            self.document_data_mut(|d| d.focus.active = None);
        }
    }

    // --- parser integration and document.write ----------------------------------

    pub(crate) fn is_parsing(&self) -> bool {
        self.document_data(|d| d.parser.active).unwrap_or(false)
    }

    pub(crate) fn set_parsing(&self, active: bool) {
        self.document_data_mut(|d| d.parser.active = active);
    }

    pub(crate) fn take_pending_write(&self) -> String {
        self.document_data_mut(|d| std::mem::take(&mut d.parser.pending_write))
            .unwrap_or_default()
    }

    pub(crate) fn push_pending_parser_script(&self, script: Element) {
        self.document_data_mut(|d| d.parser.deferred_scripts.push(script));
    }

    pub(crate) fn take_deferred_scripts(&self) -> Vec<Element> {
        self.document_data_mut(|d| std::mem::take(&mut d.parser.deferred_scripts))
            .unwrap_or_default()
    }

    /// `document.write`.
    ///
    /// While the parser runs a script, the markup is inserted right after
    /// that script's end tag. Once the document has finished loading, the
    /// first write re-opens it: the tree and document listeners are cleared
    /// and each write up to `close()` is parsed at the stream's insertion
    /// point, running written scripts as they are inserted.
    pub fn write(&self, markup: &str) -> Result<()> {
        if !self.is_html() {
            return Err(DomError::InvalidState("document.write requires an HTML document".into()));
        }
        if self.is_parsing() {
            self.document_data_mut(|d| d.parser.pending_write.push_str(markup));
            return Ok(());
        }
        if self.has_open_stream() {
            return self.feed_stream(markup, false);
        }
        if self.ready_state() == DocumentReadyState::Complete {
            self.open()?;
            return self.feed_stream(markup, false);
        }
        // loading without an active parser, e.g. from a timer before load
        let target: Node = match self.body() {
            Some(body) => body.0,
            None => self.0.clone(),
        };
        let context = match target.as_element() {
            Some(element) => element,
            None => self.create_element_with_name(html_name("body"), false),
        };
        let fragment = parser::parse_fragment(&context, markup)?;
        mutation::pre_insert(&fragment, &target, None).map(|_| ())
    }

    pub fn writeln(&self, markup: &str) -> Result<()> {
        self.write(&format!("{markup}\n"))
    }

    fn has_open_stream(&self) -> bool {
        self.document_data(|d| d.parser.stream.is_some()).unwrap_or(false)
    }

    fn feed_stream(&self, markup: &str, flush: bool) -> Result<()> {
        let Some((ready, insertion)) = self
            .document_data_mut(|d| {
                d.parser.stream.as_mut().map(|stream| {
                    stream.push(markup);
                    (stream.take_ready(flush), stream.insertion())
                })
            })
            .flatten()
        else {
            return Ok(());
        };
        if ready.is_empty() {
            return Ok(());
        }
        let Some(target) = insertion.or_else(|| self.body().map(|body| body.0)) else {
            return Ok(());
        };
        let next = write_stream::insert_markup(target, &ready)?;
        self.document_data_mut(|d| {
            if let Some(stream) = d.parser.stream.as_mut() {
                stream.set_insertion(&next);
            }
        });
        Ok(())
    }

    /// `document.open`: a no-op while the parser is active.
    pub fn open(&self) -> Result<()> {
        if !self.is_html() {
            return Err(DomError::InvalidState("document.open requires an HTML document".into()));
        }
        if self.is_parsing() {
            return Ok(());
        }
        debug!(url = %self.url(), "document re-opened");
        mutation::replace_all(None, self);
        self.0 .0.listeners.clear();
        // html, head and body for the written markup to land in
        parser::parse_document(self, "", false);
        let body = self.body();
        self.document_data_mut(|d| {
            d.parser.stream = Some(WriteStream::new(body.as_ref().map(|body| body.as_node())));
            d.focus = FocusState::default();
        });
        self.set_ready_state(DocumentReadyState::Loading);
        Ok(())
    }

    /// `document.close`: parses whatever the stream still holds and ends it.
    pub fn close(&self) -> Result<()> {
        if !self.is_html() {
            return Err(DomError::InvalidState("document.close requires an HTML document".into()));
        }
        if !self.has_open_stream() {
            return Ok(());
        }
        let flushed = self.feed_stream("", true);
        self.document_data_mut(|d| d.parser.stream = None);
        self.set_ready_state(DocumentReadyState::Complete);
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_document_has_html_skeleton() {
        let doc = Document::new();
        assert_eq!(doc.doctype().unwrap().node_name(), "html");
        assert_eq!(doc.document_element().unwrap().tag_name(), "HTML");
        assert!(doc.head().is_some());
        assert!(doc.body().unwrap().is_connected());
        assert_eq!(doc.active_element(), doc.body());
    }

    #[test]
    fn title_is_read_from_title_element() {
        let doc = Document::create_html_document(Some("  Hello \n world "));
        assert_eq!(doc.title(), "Hello world");
        doc.set_title("Next");
        assert_eq!(doc.title(), "Next");
    }

    #[test]
    fn factories_validate_input() {
        let doc = Document::new();
        assert_eq!(doc.create_element("1x").unwrap_err().name(), "InvalidCharacterError");
        assert_eq!(doc.create_cdata_section("x").unwrap_err().name(), "NotSupportedError");
        assert!(doc.create_processing_instruction("xml-stylesheet", "a?>").is_err());
        let svg = doc
            .create_element_ns(Some(crate::core::dom::SVG_NAMESPACE), "svg:rect")
            .unwrap();
        assert_eq!(svg.tag_name(), "svg:rect");
    }

    #[test]
    fn import_and_adopt_move_between_documents() {
        let a = Document::new();
        let b = Document::new();
        let div = a.create_element("div").unwrap();
        a.body().unwrap().append_child(&div).unwrap();

        let imported = b.import_node(&div, true).unwrap();
        assert_eq!(imported.owner_document(), Some(b.clone()));
        assert_eq!(div.owner_document(), Some(a.clone()));

        b.adopt_node(&div).unwrap();
        assert!(div.parent_node().is_none());
        assert_eq!(div.owner_document(), Some(b.clone()));
        assert_eq!(b.adopt_node(&a).unwrap_err().name(), "NotSupportedError");
    }

    #[test]
    fn focus_moves_between_elements() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<input id=a><input id=b><div id=c></div>").unwrap();
        let a = doc.get_element_by_id("a").unwrap();
        let b = doc.get_element_by_id("b").unwrap();
        let c = doc.get_element_by_id("c").unwrap();
        a.focus();
        assert_eq!(doc.active_element(), Some(a.clone()));
        c.focus();
        assert_eq!(doc.active_element(), Some(a.clone()));
        b.focus();
        assert_eq!(doc.active_element(), Some(b.clone()));
        b.remove();
        assert!(!doc.has_focus());
        assert_eq!(doc.active_element(), Some(body));
    }

    #[test]
    fn write_after_load_reopens_document() {
        let doc = Document::new();
        let listener = crate::core::events::EventListener::new(|_| Ok(()));
        doc.add_event_listener("custom", &listener, false);
        doc.write("<p id=a>one</p>").unwrap();
        assert_eq!(doc.ready_state(), DocumentReadyState::Loading);
        assert!(doc.get_element_by_id("a").is_some());
        doc.write("<p id=b>two</p>").unwrap();
        doc.close().unwrap();
        assert_eq!(doc.ready_state(), DocumentReadyState::Complete);
        assert_eq!(doc.body().unwrap().inner_html(), "<p id=\"a\">one</p><p id=\"b\">two</p>");
        assert!(!doc.0 .0.listeners.has_listeners("custom"));
    }

    #[test]
    fn later_writes_keep_nodes_from_earlier_writes() {
        let doc = Document::new();
        doc.write("<div id=a data-x=1>").unwrap();
        let first = doc.get_element_by_id("a").unwrap();
        doc.write("<span id=b>inside</span>").unwrap();
        doc.write("</div><p id=c>after</p>").unwrap();
        assert!(first.is_connected());
        assert_eq!(doc.get_element_by_id("a"), Some(first.clone()));
        assert_eq!(first.get_attribute("data-x").as_deref(), Some("1"));
        assert_eq!(doc.get_element_by_id("b").unwrap().parent_element(), Some(first.clone()));
        assert_eq!(first.next_element_sibling(), doc.get_element_by_id("c"));
        doc.close().unwrap();
        assert_eq!(doc.get_element_by_id("a"), Some(first));
    }

    #[test]
    fn tag_split_across_writes_is_parsed_once_complete() {
        let doc = Document::new();
        doc.write("<p id=sp").unwrap();
        assert!(doc.get_element_by_id("sp").is_none());
        doc.write("lit>x</p>").unwrap();
        assert_eq!(doc.get_element_by_id("split").unwrap().text_content().as_deref(), Some("x"));
        doc.write("<p>tail").unwrap();
        doc.close().unwrap();
        assert_eq!(doc.body().unwrap().inner_html(), "<p id=\"split\">x</p><p>tail</p>");
    }

    #[test]
    fn base_element_changes_url_resolution() {
        let doc = Document::new_with_url("https://example.com/a/b.html").unwrap();
        let head = doc.head().unwrap();
        let base = doc.create_element("base").unwrap();
        base.set_attribute("href", "/static/").unwrap();
        head.append_child(&base).unwrap();
        assert_eq!(doc.resolve_url("x.js").unwrap().as_str(), "https://example.com/static/x.js");
    }
}
