//! HTML parsing through html5ever.
//!
//! The tree sink builds nodes with the same mutation primitives user code
//! goes through. Document parsing drives the tokenizer directly so it can
//! stop at every parser-inserted `</script>`, run the script and splice
//! `document.write` output back into the input stream.

use std::borrow::Cow;

use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tokenizer::{BufferQueue, Tokenizer, TokenizerOpts, TokenizerResult};
use html5ever::tree_builder::{
    ElementFlags, NextParserState, NodeOrText as HtmlNodeOrText, QuirksMode, TreeBuilder,
    TreeBuilderOpts, TreeSink,
};
use html5ever::{namespace_url, ns, Attribute, ExpandedName, ParseOpts, QualName};
use tracing::{debug, trace};

use super::behavior::{self, UNNAMED};
use super::document::Document;
use super::node::{Node, NodeType};
use super::{mutation, DomError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptMode {
    /// Parser-inserted scripts suspend the parser and run.
    Execute,
    /// Scripts are marked already started and never run.
    Inert,
}

struct DomSink {
    document: Document,
    scripts: ScriptMode,
}

impl DomSink {
    fn new(document: Document, scripts: ScriptMode) -> Self {
        Self { document, scripts }
    }

    fn append_text(&self, parent: &Node, text: &str) {
        if let Some(last) = parent.last_child() {
            if last.node_type() == NodeType::Text {
                last.append_data(text);
                return;
            }
        }
        let node = self.document.create_text_node(text);
        mutation::append_unchecked(parent, &node);
    }

    fn insert_text_before(&self, parent: &Node, sibling: &Node, text: &str) {
        if let Some(previous) = sibling.previous_sibling() {
            if previous.node_type() == NodeType::Text {
                previous.append_data(text);
                return;
            }
        }
        let node = self.document.create_text_node(text);
        mutation::insert_unchecked(parent, &node, Some(sibling));
    }
}

impl TreeSink for DomSink {
    type Handle = Node;
    type Output = ();

    fn finish(self) {}

    fn parse_error(&mut self, msg: Cow<'static, str>) {
        trace!(%msg, "html parse error");
    }

    fn get_document(&mut self) -> Node {
        self.document.0.clone()
    }

    fn elem_name<'a>(&'a self, target: &'a Node) -> ExpandedName<'a> {
        target.qual_name().unwrap_or(&*UNNAMED).expanded()
    }

    fn create_element(&mut self, name: QualName, attrs: Vec<Attribute>, _flags: ElementFlags) -> Node {
        let is_script = name.ns == ns!(html) && &*name.local == "script";
        let element = self.document.create_element_with_name(name, false);
        if is_script {
            let inert = self.scripts == ScriptMode::Inert;
            element.element_data_mut(|data| {
                data.script.parser_inserted = true;
                data.script.already_started = inert;
            });
        }
        for attr in attrs {
            element.set_attribute_qualified(attr.name, &attr.value);
        }
        element.0
    }

    fn create_comment(&mut self, text: StrTendril) -> Node {
        self.document.create_comment(&text)
    }

    fn create_pi(&mut self, target: StrTendril, data: StrTendril) -> Node {
        self.document.create_processing_instruction_unchecked(&target, &data)
    }

    fn append(&mut self, parent: &Node, child: HtmlNodeOrText<Node>) {
        match child {
            HtmlNodeOrText::AppendNode(node) => mutation::append_unchecked(parent, &node),
            HtmlNodeOrText::AppendText(text) => self.append_text(parent, &text),
        }
    }

    fn append_based_on_parent_node(
        &mut self,
        element: &Node,
        prev_element: &Node,
        child: HtmlNodeOrText<Node>,
    ) {
        if element.parent_node().is_some() {
            self.append_before_sibling(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(&mut self, name: StrTendril, public_id: StrTendril, system_id: StrTendril) {
        let doctype = self.document.create_document_type(&name, &public_id, &system_id);
        mutation::append_unchecked(&self.document, &doctype);
    }

    fn mark_script_already_started(&mut self, node: &Node) {
        node.element_data_mut(|data| data.script.already_started = true);
    }

    fn get_template_contents(&mut self, target: &Node) -> Node {
        target
            .as_element()
            .and_then(|element| element.template_content())
            .unwrap_or_else(|| target.clone())
    }

    fn same_node(&self, x: &Node, y: &Node) -> bool {
        x == y
    }

    fn set_quirks_mode(&mut self, mode: QuirksMode) {
        self.document.set_quirks_mode(mode == QuirksMode::Quirks);
    }

    fn append_before_sibling(&mut self, sibling: &Node, new_node: HtmlNodeOrText<Node>) {
        let Some(parent) = sibling.parent_node() else {
            return;
        };
        match new_node {
            HtmlNodeOrText::AppendNode(node) => mutation::insert_unchecked(&parent, &node, Some(sibling)),
            HtmlNodeOrText::AppendText(text) => self.insert_text_before(&parent, sibling, &text),
        }
    }

    fn add_attrs_if_missing(&mut self, target: &Node, attrs: Vec<Attribute>) {
        let Some(element) = target.as_element() else {
            return;
        };
        for attr in attrs {
            let present = element
                .element_data(|data| data.attributes.find_qualified(&attr.name).is_some())
                .unwrap_or(false);
            if !present {
                element.set_attribute_qualified(attr.name, &attr.value);
            }
        }
    }

    fn remove_from_parent(&mut self, target: &Node) {
        target.remove();
    }

    fn reparent_children(&mut self, node: &Node, new_parent: &Node) {
        for child in node.children_snapshot() {
            mutation::append_unchecked(new_parent, &child);
        }
    }

    fn complete_script(&mut self, node: &Node) -> NextParserState {
        match self.scripts {
            ScriptMode::Execute if node.is_element() => NextParserState::Suspend,
            _ => NextParserState::Continue,
        }
    }
}

/// Parses `markup` into `document`, which is expected to be empty.
///
/// With `run_scripts`, inline parser-inserted scripts run as their end tag
/// is reached and external ones are queued on the document for the loader
/// to run once parsing finishes.
pub(crate) fn parse_document(document: &Document, markup: &str, run_scripts: bool) {
    let mode = if run_scripts { ScriptMode::Execute } else { ScriptMode::Inert };
    let sink = DomSink::new(document.clone(), mode);
    let builder = TreeBuilder::new(sink, TreeBuilderOpts::default());
    let mut tokenizer = Tokenizer::new(builder, TokenizerOpts::default());
    let mut input = BufferQueue::new();
    input.push_back(StrTendril::from(markup));

    let was_parsing = document.is_parsing();
    document.set_parsing(true);
    loop {
        match tokenizer.feed(&mut input) {
            TokenizerResult::Done => break,
            TokenizerResult::Script(node) => {
                if let Some(script) = node.as_element() {
                    behavior::prepare_script(&script, true);
                }
                let written = document.take_pending_write();
                if !written.is_empty() {
                    debug!(bytes = written.len(), "document.write output spliced into parser input");
                    input.push_front(StrTendril::from(written));
                }
            }
        }
    }
    tokenizer.end();
    document.set_parsing(was_parsing);
}

/// The fragment parsing algorithm: parses `markup` as if it were the content
/// of `context` and returns a fragment owned by the context's document.
pub(crate) fn parse_fragment(context: &super::Element, markup: &str) -> Result<Node> {
    let document = context
        .node_document()
        .ok_or_else(|| DomError::InvalidState("context element has no document".into()))?;
    let scratch = Document::new_empty(document.is_html(), document.url_value());
    let sink = DomSink::new(scratch.clone(), ScriptMode::Inert);
    html5ever::parse_fragment(sink, ParseOpts::default(), context.name().clone(), Vec::new())
        .one(markup);

    let fragment = document.create_document_fragment();
    if let Some(root) = scratch.document_element() {
        for child in root.children_snapshot() {
            mutation::append_unchecked(&fragment, &child);
        }
    }
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fragment_nodes_belong_to_context_document() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let fragment = parse_fragment(&div, "<p>a</p>text<!--c-->").unwrap();
        assert_eq!(fragment.child_count(), 3);
        for child in fragment.children_snapshot() {
            assert_eq!(child.owner_document(), Some(doc.clone()));
        }
    }

    #[test]
    fn fragment_scripts_never_run() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let fragment = parse_fragment(&div, "<script>x()</script>").unwrap();
        let script = fragment.first_child().unwrap();
        assert!(script.element_data(|d| d.script.already_started).unwrap());
    }

    #[test]
    fn table_context_parses_rows() {
        let doc = Document::new();
        let tbody = doc.create_element("tbody").unwrap();
        tbody.set_inner_html("<tr><td>1</td></tr>").unwrap();
        assert_eq!(tbody.inner_html(), "<tr><td>1</td></tr>");
    }

    #[test]
    fn document_parse_builds_full_tree() {
        let doc = Document::new_empty(true, crate::core::dom::document::ABOUT_BLANK.clone());
        doc.set_connected(true);
        parse_document(&doc, "<!DOCTYPE html><title>t</title><p>x", false);
        assert_eq!(doc.title(), "t");
        assert_eq!(doc.body().unwrap().inner_html(), "<p>x</p>");
        assert_eq!(doc.compat_mode(), "CSS1Compat");
    }

    #[test]
    fn missing_doctype_is_quirks() {
        let doc = Document::new_empty(true, crate::core::dom::document::ABOUT_BLANK.clone());
        parse_document(&doc, "<p>x", false);
        assert_eq!(doc.compat_mode(), "BackCompat");
    }
}
