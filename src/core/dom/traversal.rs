use std::sync::Arc;

use parking_lot::Mutex;

use super::node::Node;

pub const SHOW_ALL: u32 = 0xFFFF_FFFF;
pub const SHOW_ELEMENT: u32 = 0x1;
pub const SHOW_ATTRIBUTE: u32 = 0x2;
pub const SHOW_TEXT: u32 = 0x4;
pub const SHOW_CDATA_SECTION: u32 = 0x8;
pub const SHOW_PROCESSING_INSTRUCTION: u32 = 0x40;
pub const SHOW_COMMENT: u32 = 0x80;
pub const SHOW_DOCUMENT: u32 = 0x100;
pub const SHOW_DOCUMENT_TYPE: u32 = 0x200;
pub const SHOW_DOCUMENT_FRAGMENT: u32 = 0x400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilterResult {
    Accept,
    Reject,
    Skip,
}

pub type NodeFilter = Arc<dyn Fn(&Node) -> NodeFilterResult + Send + Sync>;

/// `TreeWalker`: a cursor over the subtree of `root` showing only the node
/// kinds in `what_to_show` that the filter accepts. Rejecting a node also
/// hides its descendants, skipping only hides the node itself.
pub struct TreeWalker {
    root: Node,
    what_to_show: u32,
    filter: Option<NodeFilter>,
    current: Mutex<Node>,
}

impl std::fmt::Debug for TreeWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWalker")
            .field("root", &self.root)
            .field("what_to_show", &format_args!("{:#x}", self.what_to_show))
            .field("current", &*self.current.lock())
            .finish()
    }
}

impl TreeWalker {
    pub(crate) fn new(root: &Node, what_to_show: u32, filter: Option<NodeFilter>) -> Self {
        Self {
            root: root.clone(),
            what_to_show,
            filter,
            current: Mutex::new(root.clone()),
        }
    }

    pub fn root(&self) -> Node {
        self.root.clone()
    }

    pub fn what_to_show(&self) -> u32 {
        self.what_to_show
    }

    pub fn current_node(&self) -> Node {
        self.current.lock().clone()
    }

    pub fn set_current_node(&self, node: &Node) {
        *self.current.lock() = node.clone();
    }

    fn accept(&self, node: &Node) -> NodeFilterResult {
        let bit = 1u32 << (node.node_type().as_u16() - 1);
        if self.what_to_show & bit == 0 {
            return NodeFilterResult::Skip;
        }
        match &self.filter {
            Some(filter) => filter(node),
            None => NodeFilterResult::Accept,
        }
    }

    fn advance(&self, node: Node) -> Option<Node> {
        self.set_current_node(&node);
        Some(node)
    }

    pub fn parent_node(&self) -> Option<Node> {
        let mut node = self.current_node();
        while node != self.root {
            node = node.parent_node()?;
            if self.accept(&node) == NodeFilterResult::Accept {
                return self.advance(node);
            }
        }
        None
    }

    fn traverse_children(&self, first: bool) -> Option<Node> {
        let start = |n: &Node| if first { n.first_child() } else { n.last_child() };
        let step = |n: &Node| if first { n.next_sibling() } else { n.previous_sibling() };
        let current = self.current_node();
        let mut node = start(&current)?;
        loop {
            match self.accept(&node) {
                NodeFilterResult::Accept => return self.advance(node),
                NodeFilterResult::Skip => {
                    if let Some(child) = start(&node) {
                        node = child;
                        continue;
                    }
                }
                NodeFilterResult::Reject => {}
            }
            loop {
                if let Some(sibling) = step(&node) {
                    node = sibling;
                    break;
                }
                let parent = node.parent_node()?;
                if parent == self.root || parent == current {
                    return None;
                }
                node = parent;
            }
        }
    }

    pub fn first_child(&self) -> Option<Node> {
        self.traverse_children(true)
    }

    pub fn last_child(&self) -> Option<Node> {
        self.traverse_children(false)
    }

    fn traverse_siblings(&self, next: bool) -> Option<Node> {
        let step = |n: &Node| if next { n.next_sibling() } else { n.previous_sibling() };
        let first = |n: &Node| if next { n.first_child() } else { n.last_child() };
        let mut node = self.current_node();
        if node == self.root {
            return None;
        }
        loop {
            let mut sibling = step(&node);
            while let Some(candidate) = sibling {
                node = candidate;
                let result = self.accept(&node);
                if result == NodeFilterResult::Accept {
                    return self.advance(node);
                }
                sibling = first(&node);
                if result == NodeFilterResult::Reject || sibling.is_none() {
                    sibling = step(&node);
                }
            }
            node = node.parent_node()?;
            if node == self.root || self.accept(&node) == NodeFilterResult::Accept {
                return None;
            }
        }
    }

    pub fn next_sibling(&self) -> Option<Node> {
        self.traverse_siblings(true)
    }

    pub fn previous_sibling(&self) -> Option<Node> {
        self.traverse_siblings(false)
    }

    pub fn previous_node(&self) -> Option<Node> {
        let mut node = self.current_node();
        while node != self.root {
            let mut sibling = node.previous_sibling();
            while let Some(candidate) = sibling {
                node = candidate;
                let mut result = self.accept(&node);
                while result != NodeFilterResult::Reject {
                    let Some(last) = node.last_child() else {
                        break;
                    };
                    node = last;
                    result = self.accept(&node);
                }
                if result == NodeFilterResult::Accept {
                    return self.advance(node);
                }
                sibling = node.previous_sibling();
            }
            if node == self.root {
                return None;
            }
            node = node.parent_node()?;
            if self.accept(&node) == NodeFilterResult::Accept {
                return self.advance(node);
            }
        }
        None
    }

    pub fn next_node(&self) -> Option<Node> {
        let mut node = self.current_node();
        let mut result = NodeFilterResult::Accept;
        loop {
            while result != NodeFilterResult::Reject {
                let Some(child) = node.first_child() else {
                    break;
                };
                node = child;
                result = self.accept(&node);
                if result == NodeFilterResult::Accept {
                    return self.advance(node);
                }
            }
            let mut following = None;
            let mut temp = Some(node.clone());
            while let Some(current) = temp {
                if current == self.root {
                    return None;
                }
                if let Some(sibling) = current.next_sibling() {
                    following = Some(sibling);
                    break;
                }
                temp = current.parent_node();
            }
            node = following?;
            result = self.accept(&node);
            if result == NodeFilterResult::Accept {
                return self.advance(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::{Document, NodeType};

    fn names(walker: &TreeWalker, step: impl Fn(&TreeWalker) -> Option<Node>) -> Vec<String> {
        std::iter::from_fn(|| step(walker)).map(|n| n.node_name()).collect()
    }

    #[test]
    fn walks_elements_in_tree_order() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("<p>a<b>b</b></p><i>c</i>").unwrap();
        let walker = doc.create_tree_walker(&div, SHOW_ELEMENT, None);
        assert_eq!(names(&walker, TreeWalker::next_node), vec!["P", "B", "I"]);
        assert_eq!(names(&walker, TreeWalker::previous_node), vec!["B", "P", "DIV"]);
    }

    #[test]
    fn reject_hides_subtree_and_skip_does_not() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("<p><b></b></p><i></i>").unwrap();
        let reject_p: NodeFilter = Arc::new(|n: &Node| {
            if n.node_name() == "P" { NodeFilterResult::Reject } else { NodeFilterResult::Accept }
        });
        let walker = doc.create_tree_walker(&div, SHOW_ELEMENT, Some(reject_p));
        assert_eq!(names(&walker, TreeWalker::next_node), vec!["I"]);

        let skip_p: NodeFilter = Arc::new(|n: &Node| {
            if n.node_name() == "P" { NodeFilterResult::Skip } else { NodeFilterResult::Accept }
        });
        let walker = doc.create_tree_walker(&div, SHOW_ELEMENT, Some(skip_p));
        assert_eq!(walker.first_child().map(|n| n.node_name()).as_deref(), Some("B"));
        assert_eq!(walker.next_sibling().map(|n| n.node_name()).as_deref(), Some("I"));
        assert_eq!(walker.parent_node().map(|n| n.node_name()).as_deref(), Some("DIV"));
        assert!(walker.parent_node().is_none());
    }

    #[test]
    fn text_mask_only_shows_text() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_inner_html("x<b>y</b><!--z-->").unwrap();
        let walker = doc.create_tree_walker(&div, SHOW_TEXT, None);
        let found: Vec<NodeType> = std::iter::from_fn(|| walker.next_node()).map(|n| n.node_type()).collect();
        assert_eq!(found, vec![NodeType::Text, NodeType::Text]);
    }
}
