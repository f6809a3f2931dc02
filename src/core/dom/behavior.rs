//! Per-tag element behaviors.
//!
//! Structural node kinds are a closed enum; what varies by tag name lives in a
//! static table of [`ElementBehavior`] implementations. The attribute and tree
//! mutation choke points call into the element's behavior after the core
//! update has been applied.

use std::collections::HashMap;

use html5ever::{namespace_url, ns, LocalName, QualName};
use once_cell::sync::Lazy;
use tracing::{debug, warn};
use url::Url;

use super::element::Element;
use super::forms;
use super::node::Node;
use crate::core::events::fire_simple_event;
use crate::core::network::{Destination, ResourceRequest};
use crate::js_engine::JSError;
use crate::window::TaskKind;

pub(crate) static UNNAMED: Lazy<QualName> =
    Lazy::new(|| QualName::new(None, ns!(), LocalName::from("")));

pub(crate) const LINK_REL_TOKENS: &[&str] = &[
    "alternate", "dns-prefetch", "icon", "manifest", "modulepreload", "next", "pingback",
    "preconnect", "prefetch", "preload", "search", "stylesheet",
];

pub(crate) const ANCHOR_REL_TOKENS: &[&str] = &["noopener", "noreferrer", "opener"];

/// Hooks run by the tree and attribute choke points. Every hook has a no-op
/// default so a behavior only overrides what its tag cares about.
pub(crate) trait ElementBehavior: Send + Sync {
    fn attribute_changed(&self, _element: &Element, _name: &QualName, _old: Option<&str>, _new: Option<&str>) {}

    /// After the element (or an ancestor) was inserted into a new parent.
    fn inserted(&self, _element: &Element) {}

    fn removed(&self, _element: &Element, _old_parent: &Node) {}

    fn children_changed(&self, _element: &Element) {}

    fn connected(&self, _element: &Element) {}

    fn disconnected(&self, _element: &Element) {}

    /// Copies per-tag state that is not stored in attributes.
    fn cloned(&self, _source: &Element, _copy: &Element) {}

    fn is_form_associated(&self) -> bool {
        false
    }
}

struct GenericBehavior;

impl ElementBehavior for GenericBehavior {}

static GENERIC: GenericBehavior = GenericBehavior;
static SCRIPT: ScriptBehavior = ScriptBehavior;
static LINK: LinkBehavior = LinkBehavior;
static MEDIA: MediaBehavior = MediaBehavior;
static IFRAME: IFrameBehavior = IFrameBehavior;

static BEHAVIORS: Lazy<HashMap<&'static str, &'static dyn ElementBehavior>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, &'static dyn ElementBehavior> = HashMap::new();
    table.insert("script", &SCRIPT);
    table.insert("link", &LINK);
    for name in ["img", "audio", "video", "source"] {
        table.insert(name, &MEDIA);
    }
    table.insert("iframe", &IFRAME);
    table.insert("option", &forms::OPTION);
    table.insert("optgroup", &forms::OPTGROUP);
    table.insert("select", &forms::SELECT);
    table.insert("form", &forms::FORM);
    for name in ["input", "button", "textarea", "fieldset", "output", "object"] {
        table.insert(name, &forms::FORM_CONTROL);
    }
    table
});

pub(crate) fn generic() -> &'static dyn ElementBehavior {
    &GENERIC
}

/// Behavior for an element name; non-HTML elements get the generic one.
pub(crate) fn behavior_for(name: &QualName) -> &'static dyn ElementBehavior {
    if name.ns != ns!(html) {
        return &GENERIC;
    }
    BEHAVIORS.get(&*name.local).copied().unwrap_or(&GENERIC)
}

fn is_plain_attribute(name: &QualName, local: &str) -> bool {
    name.ns == ns!() && &*name.local == local
}

/// Resolves an attribute URL against the element's document.
fn resolve_attribute_url(element: &Element, attribute: &str) -> Option<Url> {
    let value = element.get_attribute(attribute)?;
    let document = element.node_document()?;
    match document.resolve_url(value.trim()) {
        Ok(url) => Some(url),
        Err(error) => {
            debug!(%error, value = %value, "unresolvable resource URL");
            None
        }
    }
}

/// Hands a resource load to the window and fires `load` or `error` on the
/// element once the completion is processed by the event loop.
fn load_element_resource(element: &Element, url: Url, destination: Destination) {
    let Some(document) = element.node_document() else {
        return;
    };
    let Some(window) = document.default_view() else {
        return;
    };
    let request = ResourceRequest::new(url, destination).with_referrer(document.base_url());
    let target = element.clone();
    window.load_resource(request, TaskKind::ResourceLoad, move |result| {
        match result {
            Ok(resource) if resource.is_success() => fire_simple_event(&target, "load"),
            Ok(resource) => {
                debug!(url = %resource.url, status = resource.status, "resource load failed");
                fire_simple_event(&target, "error");
            }
            Err(error) => {
                debug!(%error, "resource load failed");
                fire_simple_event(&target, "error");
            }
        }
        Ok(())
    });
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScriptState {
    pub(crate) parser_inserted: bool,
    pub(crate) already_started: bool,
}

struct ScriptBehavior;

impl ElementBehavior for ScriptBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, old: Option<&str>, new: Option<&str>) {
        if is_plain_attribute(name, "src") && old.is_none() && new.is_some() && element.is_connected() {
            prepare_script(element, false);
        }
    }

    fn children_changed(&self, element: &Element) {
        if element.is_connected() {
            prepare_script(element, false);
        }
    }

    fn connected(&self, element: &Element) {
        prepare_script(element, false);
    }

    fn cloned(&self, source: &Element, copy: &Element) {
        let started = source
            .element_data(|data| data.script.already_started)
            .unwrap_or(false);
        copy.element_data_mut(|data| data.script.already_started = started);
    }
}

pub(crate) fn is_javascript_type(element: &Element) -> bool {
    match element.get_attribute("type") {
        None => true,
        Some(kind) => {
            let kind = kind.trim().to_ascii_lowercase();
            kind.is_empty()
                || kind == "module"
                || matches!(
                    kind.as_str(),
                    "text/javascript"
                        | "application/javascript"
                        | "application/ecmascript"
                        | "text/ecmascript"
                        | "application/x-javascript"
                        | "text/jscript"
                )
        }
    }
}

/// The "prepare the script element" steps. `from_parser` is set when the
/// parser hands over a script it just closed.
pub(crate) fn prepare_script(element: &Element, from_parser: bool) {
    let state = element.element_data(|data| data.script).unwrap_or_default();
    if state.already_started || (state.parser_inserted && !from_parser) {
        return;
    }
    let has_src = element.has_attribute("src");
    if !has_src && element.child_text_content().is_empty() {
        return;
    }
    if !element.is_connected() || !is_javascript_type(element) {
        return;
    }
    let Some(document) = element.node_document() else {
        return;
    };
    let Some(window) = document.default_view() else {
        return;
    };
    element.element_data_mut(|data| data.script.already_started = true);

    let settings = window.settings();
    if settings.disable_javascript_evaluation {
        debug!("script evaluation disabled, skipping <script>");
        return;
    }

    if !has_src {
        let source = element.child_text_content();
        let filename = document.url();
        if let Err(error) = window.run_script(&source, &filename) {
            debug!(%error, "inline script failed");
        }
        return;
    }

    let Some(url) = resolve_attribute_url(element, "src") else {
        fire_simple_event(element, "error");
        return;
    };
    if settings.disable_javascript_file_loading {
        window
            .console()
            .warn(&format!("JavaScript file loading is disabled, skipped {url}"));
        fire_simple_event(element, "error");
        return;
    }
    if from_parser {
        document.push_pending_parser_script(element.clone());
        return;
    }
    load_and_run_script(element, url);
}

pub(crate) fn load_and_run_script(element: &Element, url: Url) {
    let Some(document) = element.node_document() else {
        return;
    };
    let Some(window) = document.default_view() else {
        return;
    };
    let request = ResourceRequest::new(url.clone(), Destination::Script).with_referrer(document.base_url());
    let target = element.clone();
    let owner = window.clone();
    window.load_resource(request, TaskKind::Script, move |result| {
        // script errors were already reported by the realm
        if let Err(error) = run_loaded_script(&owner, &target, &url, result.map_err(|e| JSError::Execution(e.to_string()))) {
            debug!(%error, url = %url, "script failed");
        }
        Ok(())
    });
}

/// Evaluates a fetched script body and fires the element's `load`/`error`.
pub(crate) fn run_loaded_script(
    window: &crate::window::Window,
    element: &Element,
    url: &Url,
    result: Result<crate::core::network::Resource, JSError>,
) -> Result<(), JSError> {
    match result {
        Ok(resource) if resource.is_success() => {
            let outcome = window.run_script(&resource.text(), url.as_str());
            fire_simple_event(element, "load");
            outcome.map(|_| ())
        }
        Ok(resource) => {
            warn!(url = %url, status = resource.status, "script load failed");
            window
                .console()
                .error(&format!("Failed to load script \"{url}\" (status {})", resource.status));
            fire_simple_event(element, "error");
            Ok(())
        }
        Err(error) => {
            warn!(url = %url, %error, "script load failed");
            window
                .console()
                .error(&format!("Failed to load script \"{url}\": {error}"));
            fire_simple_event(element, "error");
            Ok(())
        }
    }
}

struct LinkBehavior;

impl LinkBehavior {
    fn maybe_load(&self, element: &Element) {
        if !element.is_connected() {
            return;
        }
        let is_stylesheet = element
            .rel_list()
            .is_some_and(|rel| rel.contains("stylesheet"));
        if !is_stylesheet {
            return;
        }
        let Some(window) = element.node_document().and_then(|doc| doc.default_view()) else {
            return;
        };
        if window.settings().disable_css_file_loading {
            debug!("CSS file loading disabled");
            return;
        }
        if let Some(url) = resolve_attribute_url(element, "href") {
            load_element_resource(element, url, Destination::Style);
        }
    }
}

impl ElementBehavior for LinkBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, _old: Option<&str>, new: Option<&str>) {
        if (is_plain_attribute(name, "href") || is_plain_attribute(name, "rel")) && new.is_some() {
            self.maybe_load(element);
        }
    }

    fn connected(&self, element: &Element) {
        self.maybe_load(element);
    }
}

struct MediaBehavior;

impl ElementBehavior for MediaBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, old: Option<&str>, new: Option<&str>) {
        if !is_plain_attribute(name, "src") || new.is_none() || old == new {
            return;
        }
        if let Some(url) = resolve_attribute_url(element, "src") {
            let destination = if element.has_local_name("img") {
                Destination::Image
            } else {
                Destination::Media
            };
            load_element_resource(element, url, destination);
        }
    }
}

struct IFrameBehavior;

impl ElementBehavior for IFrameBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, _old: Option<&str>, new: Option<&str>) {
        if is_plain_attribute(name, "src") && new.is_some() && element.is_connected() {
            if let Some(host) = frame_host_of(element) {
                host.navigate_iframe(element);
            }
        }
    }

    fn connected(&self, element: &Element) {
        if let Some(host) = frame_host_of(element) {
            host.attach_iframe(element);
        }
    }

    fn disconnected(&self, element: &Element) {
        if let Some(host) = frame_host_of(element) {
            host.detach_iframe(element);
        }
    }
}

fn frame_host_of(element: &Element) -> Option<std::sync::Arc<dyn crate::window::FrameHost>> {
    element
        .node_document()
        .and_then(|doc| doc.default_view())
        .and_then(|window| window.frame_host())
}

impl Element {
    /// Resolved `href` for links and anchors, or the raw value if it does not parse.
    pub fn href(&self) -> String {
        let Some(raw) = self.get_attribute("href") else {
            return String::new();
        };
        match self.node_document().map(|doc| doc.resolve_url(raw.trim())) {
            Some(Ok(url)) => url.to_string(),
            _ => raw,
        }
    }

    /// Resolved `src` attribute.
    pub fn src(&self) -> String {
        let Some(raw) = self.get_attribute("src") else {
            return String::new();
        };
        match self.node_document().map(|doc| doc.resolve_url(raw.trim())) {
            Some(Ok(url)) => url.to_string(),
            _ => raw,
        }
    }

    /// Window of the frame an `<iframe>` hosts.
    pub fn content_window(&self) -> Option<crate::window::Window> {
        if !self.has_local_name("iframe") {
            return None;
        }
        frame_host_of(self).and_then(|host| host.content_window(self))
    }

    pub fn content_document(&self) -> Option<super::Document> {
        self.content_window().map(|window| window.document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::{html_name, Document};

    #[test]
    fn table_lookup_is_namespace_aware() {
        let script = behavior_for(&html_name("script"));
        assert!(std::ptr::eq(
            script as *const dyn ElementBehavior as *const u8,
            &SCRIPT as *const ScriptBehavior as *const u8
        ));
        let svg_script = QualName::new(None, ns!(svg), LocalName::from("script"));
        assert!(std::ptr::eq(
            behavior_for(&svg_script) as *const dyn ElementBehavior as *const u8,
            &GENERIC as *const GenericBehavior as *const u8
        ));
    }

    #[test]
    fn script_types() {
        let doc = Document::new();
        let script = doc.create_element("script").unwrap();
        assert!(is_javascript_type(&script));
        script.set_attribute("type", "module").unwrap();
        assert!(is_javascript_type(&script));
        script.set_attribute("type", "text/template").unwrap();
        assert!(!is_javascript_type(&script));
    }

    #[test]
    fn rel_list_is_limited_to_link_like_elements() {
        let doc = Document::new();
        let link = doc.create_element("link").unwrap();
        link.set_attribute("rel", "stylesheet preload").unwrap();
        let rel = link.rel_list().unwrap();
        assert!(rel.contains("stylesheet"));
        assert!(rel.supports("preload").unwrap());
        assert!(doc.create_element("div").unwrap().rel_list().is_none());
    }

    #[test]
    fn href_resolves_against_document_url() {
        let doc = Document::new_with_url("https://example.com/dir/page.html").unwrap();
        let a = doc.create_element("a").unwrap();
        a.set_attribute("href", "../other.html").unwrap();
        assert_eq!(a.href(), "https://example.com/other.html");
    }
}
