//! Tree mutation algorithms: pre-insertion validity, insert, remove, replace.
//!
//! Every structural change funnels through [`insert`] and [`remove`] so that
//! mutation records, live collection invalidation, connectedness, focus and
//! element insertion/removal steps stay in one place. No lock is held while
//! behavior hooks or custom element reactions run.

use std::sync::{Arc, Weak};

use tracing::trace;

use super::collection::invalidate_collections;
use super::custom_elements;
use super::document::Document;
use super::element::Element;
use super::node::{Node, NodeType};
use super::observer;
use super::{DomError, Result};

fn is_valid_parent(parent: &Node) -> bool {
    matches!(
        parent.node_type(),
        NodeType::Document | NodeType::DocumentFragment | NodeType::Element
    )
}

fn is_insertable(node: &Node) -> bool {
    matches!(
        node.node_type(),
        NodeType::DocumentFragment
            | NodeType::DocumentType
            | NodeType::Element
            | NodeType::Text
            | NodeType::CDataSection
            | NodeType::ProcessingInstruction
            | NodeType::Comment
    )
}

fn hierarchy(message: impl Into<String>) -> DomError {
    DomError::HierarchyRequest(message.into())
}

fn element_children(node: &Node) -> Vec<Node> {
    node.children_snapshot()
        .into_iter()
        .filter(|child| child.is_element())
        .collect()
}

fn has_child_of_type(node: &Node, node_type: NodeType, except: Option<&Node>) -> bool {
    node.children_snapshot()
        .iter()
        .any(|child| child.node_type() == node_type && Some(child) != except)
}

fn doctype_follows(child: &Node) -> bool {
    let mut sibling = child.next_sibling();
    while let Some(node) = sibling {
        if node.node_type() == NodeType::DocumentType {
            return true;
        }
        sibling = node.next_sibling();
    }
    false
}

fn element_precedes(child: &Node) -> bool {
    let mut sibling = child.previous_sibling();
    while let Some(node) = sibling {
        if node.is_element() {
            return true;
        }
        sibling = node.previous_sibling();
    }
    false
}

fn check_common(node: &Node, parent: &Node) -> Result<()> {
    if !is_valid_parent(parent) {
        return Err(hierarchy(format!("{} cannot have children", parent.node_name())));
    }
    if node.is_host_including_inclusive_ancestor_of(parent) {
        return Err(hierarchy("the new child is an ancestor of the parent"));
    }
    Ok(())
}

fn check_node_kind(node: &Node, parent: &Node) -> Result<()> {
    if !is_insertable(node) {
        return Err(hierarchy(format!("{} cannot be inserted", node.node_name())));
    }
    let parent_is_document = parent.node_type() == NodeType::Document;
    if node.node_type() == NodeType::Text && parent_is_document {
        return Err(hierarchy("text cannot be a child of a document"));
    }
    if node.node_type() == NodeType::DocumentType && !parent_is_document {
        return Err(hierarchy("doctype must be a child of a document"));
    }
    Ok(())
}

pub(crate) fn ensure_pre_insertion_validity(
    node: &Node,
    parent: &Node,
    child: Option<&Node>,
) -> Result<()> {
    check_common(node, parent)?;
    if let Some(child) = child {
        if child.parent_node().as_ref() != Some(parent) {
            return Err(DomError::NotFound(
                "the reference child is not a child of this node".into(),
            ));
        }
    }
    check_node_kind(node, parent)?;
    if parent.node_type() != NodeType::Document {
        return Ok(());
    }
    match node.node_type() {
        NodeType::DocumentFragment => {
            let elements = element_children(node).len();
            if elements > 1 || has_child_of_type(node, NodeType::Text, None) {
                return Err(hierarchy("a document can only have one element child"));
            }
            if elements == 1
                && (!element_children(parent).is_empty()
                    || child.is_some_and(|c| c.node_type() == NodeType::DocumentType)
                    || child.is_some_and(doctype_follows))
            {
                return Err(hierarchy("a document can only have one element child"));
            }
        }
        NodeType::Element => {
            if !element_children(parent).is_empty()
                || child.is_some_and(|c| c.node_type() == NodeType::DocumentType)
                || child.is_some_and(doctype_follows)
            {
                return Err(hierarchy("a document can only have one element child"));
            }
        }
        NodeType::DocumentType => {
            let misplaced = match child {
                Some(child) => element_precedes(child),
                None => !element_children(parent).is_empty(),
            };
            if has_child_of_type(parent, NodeType::DocumentType, None) || misplaced {
                return Err(hierarchy("a document can only have one doctype before its element"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn ensure_replace_validity(child: &Node, node: &Node, parent: &Node) -> Result<()> {
    check_common(node, parent)?;
    if child.parent_node().as_ref() != Some(parent) {
        return Err(DomError::NotFound("the child to replace is not a child of this node".into()));
    }
    check_node_kind(node, parent)?;
    if parent.node_type() != NodeType::Document {
        return Ok(());
    }
    let other_element = element_children(parent).iter().any(|e| e != child);
    match node.node_type() {
        NodeType::DocumentFragment => {
            let elements = element_children(node).len();
            if elements > 1 || has_child_of_type(node, NodeType::Text, None) {
                return Err(hierarchy("a document can only have one element child"));
            }
            if elements == 1 && (other_element || doctype_follows(child)) {
                return Err(hierarchy("a document can only have one element child"));
            }
        }
        NodeType::Element => {
            if other_element || doctype_follows(child) {
                return Err(hierarchy("a document can only have one element child"));
            }
        }
        NodeType::DocumentType => {
            if has_child_of_type(parent, NodeType::DocumentType, Some(child)) || element_precedes(child) {
                return Err(hierarchy("a document can only have one doctype before its element"));
            }
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn pre_insert(node: &Node, parent: &Node, child: Option<&Node>) -> Result<Node> {
    ensure_pre_insertion_validity(node, parent, child)?;
    let mut reference = child.cloned();
    if reference.as_ref() == Some(node) {
        reference = node.next_sibling();
    }
    insert(node, parent, reference.as_ref(), false);
    Ok(node.clone())
}

pub(crate) fn pre_remove(child: &Node, parent: &Node) -> Result<Node> {
    if child.parent_node().as_ref() != Some(parent) {
        return Err(DomError::NotFound("the node to remove is not a child of this node".into()));
    }
    remove(child, false);
    Ok(child.clone())
}

pub(crate) fn replace(child: &Node, node: &Node, parent: &Node) -> Result<Node> {
    ensure_replace_validity(child, node, parent)?;
    let mut reference = child.next_sibling();
    if reference.as_ref() == Some(node) {
        reference = node.next_sibling();
    }
    let previous = child.previous_sibling();
    let added = nodes_to_insert(node);
    let mut removed = Vec::new();
    if child.parent_node().is_some() && child != node {
        remove(child, true);
        removed.push(child.clone());
    }
    if child == node {
        return Ok(child.clone());
    }
    insert(node, parent, reference.as_ref(), true);
    observer::queue_tree_record(parent, added, removed, previous, reference);
    Ok(child.clone())
}

/// Replaces every child of `parent` with `node`, emitting one mutation record.
pub(crate) fn replace_all(node: Option<&Node>, parent: &Node) {
    let removed = parent.children_snapshot();
    let added = node.map(nodes_to_insert).unwrap_or_default();
    for child in &removed {
        remove(child, true);
    }
    if let Some(node) = node {
        insert(node, parent, None, true);
    }
    if !added.is_empty() || !removed.is_empty() {
        observer::queue_tree_record(parent, added, removed, None, None);
    }
}

fn nodes_to_insert(node: &Node) -> Vec<Node> {
    if node.node_type() == NodeType::DocumentFragment {
        node.children_snapshot()
    } else {
        vec![node.clone()]
    }
}

/// Moves `node` into `document` if it belongs to another one.
pub(crate) fn adopt(node: &Node, document: &Document) {
    if node.parent_node().is_some() {
        remove(node, false);
    }
    if node.node_document().as_ref() == Some(document) {
        return;
    }
    let mut adopted = Vec::new();
    for descendant in node.shadow_including_inclusive_descendants() {
        descendant.set_owner_document(document);
        if let Some(content) = descendant.as_element().and_then(|e| e.template_content()) {
            for inner in content.inclusive_descendants() {
                inner.set_owner_document(document);
            }
        }
        if let Some(element) = descendant.as_element() {
            adopted.push(element);
        }
    }
    for element in adopted {
        custom_elements::enqueue_adopted(&element);
    }
}

/// Structural append without validity checks, used by the parser and cloning.
pub(crate) fn append_unchecked(parent: &Node, child: &Node) {
    insert(child, parent, None, false);
}

pub(crate) fn insert_unchecked(parent: &Node, child: &Node, before: Option<&Node>) {
    insert(child, parent, before, false);
}

pub(crate) fn insert(node: &Node, parent: &Node, child: Option<&Node>, suppress_observers: bool) {
    let nodes = nodes_to_insert(node);
    if nodes.is_empty() {
        return;
    }
    if node.node_type() == NodeType::DocumentFragment {
        for fragment_child in &nodes {
            remove(fragment_child, true);
        }
        observer::queue_tree_record(node, Vec::new(), nodes.clone(), None, None);
    }
    if let Some(document) = parent.node_document() {
        for inserted in &nodes {
            adopt(inserted, &document);
        }
    } else {
        for inserted in &nodes {
            if inserted.parent_node().is_some() {
                remove(inserted, false);
            }
        }
    }

    let previous_sibling = {
        let mut tree = parent.0.tree.write();
        let index = child
            .and_then(|c| tree.children.iter().position(|existing| existing == c))
            .unwrap_or(tree.children.len());
        let previous = index.checked_sub(1).and_then(|i| tree.children.get(i).cloned());
        for (offset, inserted) in nodes.iter().enumerate() {
            tree.children.insert(index + offset, inserted.clone());
        }
        previous
    };
    let parent_weak: Weak<_> = Arc::downgrade(&parent.0);
    for inserted in &nodes {
        inserted.0.tree.write().parent = parent_weak.clone();
    }
    trace!(parent = ?parent, count = nodes.len(), "inserted nodes");

    if !suppress_observers {
        observer::queue_tree_record(parent, nodes.clone(), Vec::new(), previous_sibling, child.cloned());
    }
    invalidate_collections(parent);

    let mut connected = Vec::new();
    if parent.is_connected() {
        for inserted in &nodes {
            for descendant in inserted.shadow_including_inclusive_descendants() {
                descendant.set_connected(true);
                if let Some(element) = descendant.as_element() {
                    connected.push(element);
                }
            }
        }
    }

    for inserted in &nodes {
        for element in inserted.inclusive_descendants().into_iter().filter_map(|n| n.as_element()) {
            element.behavior().inserted(&element);
        }
    }
    if let Some(parent_element) = parent.as_element() {
        parent_element.behavior().children_changed(&parent_element);
    }

    for element in connected {
        if !element.is_connected() {
            continue;
        }
        element.behavior().connected(&element);
        custom_elements::enqueue_connected(&element);
    }
}

pub(crate) fn remove(node: &Node, suppress_observers: bool) {
    let Some(parent) = node.parent_node() else {
        return;
    };
    if let Some(document) = node.node_document() {
        document.focus_fixup_for_removal(node);
    }
    let (previous, next) = {
        let mut tree = parent.0.tree.write();
        let Some(index) = tree.children.iter().position(|c| c == node) else {
            return;
        };
        let previous = index.checked_sub(1).and_then(|i| tree.children.get(i).cloned());
        let next = tree.children.get(index + 1).cloned();
        tree.children.remove(index);
        (previous, next)
    };
    node.0.tree.write().parent = Weak::new();
    trace!(parent = ?parent, node = ?node, "removed node");

    if !suppress_observers {
        observer::queue_tree_record(&parent, Vec::new(), vec![node.clone()], previous, next);
    }
    invalidate_collections(&parent);

    let mut disconnected: Vec<Element> = Vec::new();
    if node.is_connected() {
        for descendant in node.shadow_including_inclusive_descendants() {
            descendant.set_connected(false);
            if let Some(element) = descendant.as_element() {
                disconnected.push(element);
            }
        }
    }

    if let Some(element) = node.as_element() {
        element.behavior().removed(&element, &parent);
    }
    if let Some(parent_element) = parent.as_element() {
        parent_element.behavior().children_changed(&parent_element);
    }

    for element in disconnected.iter().rev() {
        element.behavior().disconnected(element);
        custom_elements::enqueue_disconnected(element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserting_an_ancestor_is_a_hierarchy_error() {
        let doc = Document::new();
        let outer = doc.create_element("div").unwrap();
        let inner = doc.create_element("div").unwrap();
        outer.append_child(&inner).unwrap();
        let err = inner.append_child(&outer).unwrap_err();
        assert_eq!(err.name(), "HierarchyRequestError");
        let err = outer.append_child(&outer).unwrap_err();
        assert_eq!(err.name(), "HierarchyRequestError");
    }

    #[test]
    fn unknown_reference_child_is_not_found() {
        let doc = Document::new();
        let parent = doc.create_element("div").unwrap();
        let stray = doc.create_element("span").unwrap();
        let node = doc.create_element("b").unwrap();
        let err = parent.insert_before(&node, Some(&stray)).unwrap_err();
        assert_eq!(err.name(), "NotFoundError");
    }

    #[test]
    fn document_accepts_a_single_element_child() {
        let doc = Document::new();
        assert!(doc.document_element().is_some());
        let extra = doc.create_element("html").unwrap();
        assert_eq!(doc.append_child(&extra).unwrap_err().name(), "HierarchyRequestError");
        let text = doc.create_text_node("x");
        assert_eq!(doc.append_child(&text).unwrap_err().name(), "HierarchyRequestError");
    }

    #[test]
    fn inserting_a_fragment_moves_its_children() {
        let doc = Document::new();
        let parent = doc.create_element("ul").unwrap();
        let fragment = doc.create_document_fragment();
        for _ in 0..3 {
            fragment.append_child(&doc.create_element("li").unwrap()).unwrap();
        }
        parent.append_child(&fragment).unwrap();
        assert_eq!(parent.child_count(), 3);
        assert!(!fragment.has_child_nodes());
    }

    #[test]
    fn appending_an_attached_node_moves_it() {
        let doc = Document::new();
        let a = doc.create_element("div").unwrap();
        let b = doc.create_element("div").unwrap();
        let child = doc.create_element("span").unwrap();
        a.append_child(&child).unwrap();
        b.append_child(&child).unwrap();
        assert!(!a.has_child_nodes());
        assert_eq!(child.parent_node(), Some(b.0.clone()));
    }

    #[test]
    fn insert_before_itself_is_a_no_op_move() {
        let doc = Document::new();
        let parent = doc.create_element("div").unwrap();
        let first = doc.create_element("a").unwrap();
        let second = doc.create_element("b").unwrap();
        parent.append(vec![(&first).into(), (&second).into()]).unwrap();
        parent.insert_before(&first, Some(&first)).unwrap();
        let names: Vec<_> = parent.children_snapshot().iter().map(|n| n.node_name()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn removal_disconnects_subtree() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let div = doc.create_element("div").unwrap();
        let span = doc.create_element("span").unwrap();
        div.append_child(&span).unwrap();
        body.append_child(&div).unwrap();
        assert!(span.is_connected());
        div.remove();
        assert!(!span.is_connected());
        assert!(!div.is_connected());
    }
}
