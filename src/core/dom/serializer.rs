//! HTML fragment serialization on top of html5ever's serializer.

use std::io;

use html5ever::serialize::{self, Serialize, SerializeOpts, Serializer, TraversalScope};
use html5ever::QualName;
use tracing::warn;

use super::element::Element;
use super::node::{Node, NodeData};

enum SerializeOp {
    Open(Node),
    Close(QualName),
}

struct SerializableNode<'a>(&'a Node);

/// Children to walk for `node`: template elements serialize their content.
fn serialized_children(node: &Node) -> Vec<Node> {
    match node.as_element().and_then(|element| element.template_content()) {
        Some(content) => content.children_snapshot(),
        None => node.children_snapshot(),
    }
}

impl<'a> Serialize for SerializableNode<'a> {
    fn serialize<S: Serializer>(&self, serializer: &mut S, traversal_scope: TraversalScope) -> io::Result<()> {
        let mut ops: Vec<SerializeOp> = match traversal_scope {
            TraversalScope::IncludeNode => vec![SerializeOp::Open(self.0.clone())],
            TraversalScope::ChildrenOnly(_) => serialized_children(self.0)
                .into_iter()
                .rev()
                .map(SerializeOp::Open)
                .collect(),
        };

        while let Some(op) = ops.pop() {
            let node = match op {
                SerializeOp::Close(name) => {
                    serializer.end_elem(name)?;
                    continue;
                }
                SerializeOp::Open(node) => node,
            };

            if let Some(element) = node.as_element() {
                let name = element.name().clone();
                let attributes: Vec<(QualName, String)> = element
                    .element_data(|data| {
                        data.attributes
                            .iter()
                            .map(|attr| (attr.qual_name(), attr.value()))
                            .collect()
                    })
                    .unwrap_or_default();
                serializer.start_elem(
                    name.clone(),
                    attributes.iter().map(|(name, value)| (name, value.as_str())),
                )?;
                ops.push(SerializeOp::Close(name));
                ops.extend(serialized_children(&node).into_iter().rev().map(SerializeOp::Open));
                continue;
            }

            match &*node.0.data.read() {
                NodeData::Text(text) | NodeData::CDataSection(text) => serializer.write_text(text)?,
                NodeData::Comment(text) => serializer.write_comment(text)?,
                NodeData::ProcessingInstruction { target, data } => {
                    serializer.write_processing_instruction(target, data)?
                }
                NodeData::DocumentType { name, .. } => serializer.write_doctype(name)?,
                NodeData::Document(_) | NodeData::DocumentFragment(_) => {
                    ops.extend(node.children_snapshot().into_iter().rev().map(SerializeOp::Open));
                }
                NodeData::Element(_) => {}
            };
        }
        Ok(())
    }
}

fn to_string(node: &Node, traversal_scope: TraversalScope) -> String {
    let mut bytes = Vec::new();
    let opts = SerializeOpts {
        traversal_scope,
        ..Default::default()
    };
    if let Err(e) = serialize::serialize(&mut bytes, &SerializableNode(node), opts) {
        warn!(error = %e, "html serialization failed");
        return String::new();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Serializes the children of an arbitrary node (document, fragment, shadow root).
pub(crate) fn serialize_children(node: &Node) -> String {
    match node.as_element() {
        Some(element) => serialize_children_of_element(&element),
        None => to_string(node, TraversalScope::ChildrenOnly(None)),
    }
}

/// `innerHTML`: the element's name is passed along so raw text content of
/// `script` and `style` is written unescaped.
pub(crate) fn serialize_children_of_element(element: &Element) -> String {
    to_string(element, TraversalScope::ChildrenOnly(Some(element.name().clone())))
}

/// `outerHTML` of an element, or the children of a document or fragment.
pub(crate) fn serialize_node(node: &Node) -> String {
    to_string(node, TraversalScope::IncludeNode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::Document;
    use pretty_assertions::assert_eq;

    #[test]
    fn escapes_text_and_attributes() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_attribute("title", "a\"b&c").unwrap();
        div.append_child(&doc.create_text_node("<x> & y")).unwrap();
        assert_eq!(
            serialize_node(&div),
            "<div title=\"a&quot;b&amp;c\">&lt;x&gt; &amp; y</div>"
        );
    }

    #[test]
    fn script_text_is_raw() {
        let doc = Document::new();
        let script = doc.create_element("script").unwrap();
        script.set_text_content("if (a < b) {}");
        assert_eq!(serialize_children_of_element(&script), "if (a < b) {}");
    }

    #[test]
    fn void_elements_have_no_end_tag() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("<br><img src=\"a.png\"><!--c-->").unwrap();
        assert_eq!(div.inner_html(), "<br><img src=\"a.png\"><!--c-->");
    }

    #[test]
    fn template_serializes_its_content() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("<template><b>x</b></template>").unwrap();
        let template = div.first_element_child().unwrap();
        assert!(!template.has_child_nodes());
        assert_eq!(div.inner_html(), "<template><b>x</b></template>");
    }

    #[test]
    fn document_serializes_doctype() {
        let doc = Document::new();
        assert!(serialize_node(&doc).starts_with("<!DOCTYPE html><html>"));
    }
}
