use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use html5ever::QualName;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::collection::{LiveCollectionState, NodeList};
use super::document::{Document, DocumentData};
use super::element::{Element, ElementData, ShadowRoot, ShadowRootMode};
use super::observer::{self, RegisteredObserver};
use super::{mutation, qualified_name_string, DomError, Result};
use crate::core::events::{
    AddEventListenerOptions, Event, EventListener, EventListenerRegistry, EventTarget,
};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Element = 1,
    Attribute = 2,
    Text = 3,
    CDataSection = 4,
    ProcessingInstruction = 7,
    Comment = 8,
    Document = 9,
    DocumentType = 10,
    DocumentFragment = 11,
}

impl NodeType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(NodeType::Element),
            2 => Some(NodeType::Attribute),
            3 => Some(NodeType::Text),
            4 => Some(NodeType::CDataSection),
            7 => Some(NodeType::ProcessingInstruction),
            8 => Some(NodeType::Comment),
            9 => Some(NodeType::Document),
            10 => Some(NodeType::DocumentType),
            11 => Some(NodeType::DocumentFragment),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_character_data(self) -> bool {
        matches!(
            self,
            NodeType::Text | NodeType::CDataSection | NodeType::Comment | NodeType::ProcessingInstruction
        )
    }
}

pub const DOCUMENT_POSITION_DISCONNECTED: u16 = 0x01;
pub const DOCUMENT_POSITION_PRECEDING: u16 = 0x02;
pub const DOCUMENT_POSITION_FOLLOWING: u16 = 0x04;
pub const DOCUMENT_POSITION_CONTAINS: u16 = 0x08;
pub const DOCUMENT_POSITION_CONTAINED_BY: u16 = 0x10;
pub const DOCUMENT_POSITION_IMPLEMENTATION_SPECIFIC: u16 = 0x20;

pub(crate) struct TreeLinks {
    pub(crate) parent: Weak<NodeInner>,
    pub(crate) children: SmallVec<[Node; 4]>,
}

pub(crate) struct FragmentData {
    pub(crate) host: Option<Weak<NodeInner>>,
    pub(crate) mode: Option<ShadowRootMode>,
}

pub(crate) enum NodeData {
    Element(ElementData),
    Text(String),
    CDataSection(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
    DocumentType { name: String, public_id: String, system_id: String },
    Document(Box<DocumentData>),
    DocumentFragment(FragmentData),
}

#[derive(Default)]
pub(crate) struct NodeObservers {
    pub(crate) collections: Mutex<Vec<Weak<LiveCollectionState>>>,
    pub(crate) mutation: Mutex<Vec<RegisteredObserver>>,
}

pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) node_type: NodeType,
    pub(crate) name: Option<QualName>,
    pub(crate) owner_document: RwLock<Weak<NodeInner>>,
    pub(crate) tree: RwLock<TreeLinks>,
    pub(crate) data: RwLock<NodeData>,
    pub(crate) listeners: EventListenerRegistry,
    pub(crate) observers: NodeObservers,
    pub(crate) connected: AtomicBool,
}

/// Shared handle to a node. Clones refer to the same node; equality is identity.
#[derive(Clone)]
pub struct Node(pub(crate) Arc<NodeInner>);

#[derive(Clone, Default)]
pub struct WeakNode(pub(crate) Weak<NodeInner>);

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }
}

impl fmt::Debug for WeakNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(node) => write!(f, "WeakNode({node:?})"),
            None => f.write_str("WeakNode(<dropped>)"),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node(#{} {})", self.0.id.0, self.node_name())
    }
}

/// Argument accepted by the variadic mutation helpers (`append`, `before`, ...).
#[derive(Debug, Clone)]
pub enum NodeOrText {
    Node(Node),
    Text(String),
}

impl From<Node> for NodeOrText {
    fn from(node: Node) -> Self {
        NodeOrText::Node(node)
    }
}

impl From<&Node> for NodeOrText {
    fn from(node: &Node) -> Self {
        NodeOrText::Node(node.clone())
    }
}

impl From<Element> for NodeOrText {
    fn from(element: Element) -> Self {
        NodeOrText::Node(element.0)
    }
}

impl From<&Element> for NodeOrText {
    fn from(element: &Element) -> Self {
        NodeOrText::Node(element.0.clone())
    }
}

impl From<&str> for NodeOrText {
    fn from(text: &str) -> Self {
        NodeOrText::Text(text.to_string())
    }
}

impl From<String> for NodeOrText {
    fn from(text: String) -> Self {
        NodeOrText::Text(text)
    }
}

impl Node {
    pub(crate) fn new_raw(
        node_type: NodeType,
        name: Option<QualName>,
        data: NodeData,
        owner: Weak<NodeInner>,
    ) -> Node {
        Node(Arc::new(NodeInner {
            id: NodeId::next(),
            node_type,
            name,
            owner_document: RwLock::new(owner),
            tree: RwLock::new(TreeLinks {
                parent: Weak::new(),
                children: SmallVec::new(),
            }),
            data: RwLock::new(data),
            listeners: EventListenerRegistry::default(),
            observers: NodeObservers::default(),
            connected: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    pub fn node_type(&self) -> NodeType {
        self.0.node_type
    }

    pub(crate) fn qual_name(&self) -> Option<&QualName> {
        self.0.name.as_ref()
    }

    pub fn node_name(&self) -> String {
        match self.0.node_type {
            NodeType::Element => match self.as_element() {
                Some(element) => element.tag_name(),
                None => String::new(),
            },
            NodeType::Attribute => String::new(),
            NodeType::Text => "#text".into(),
            NodeType::CDataSection => "#cdata-section".into(),
            NodeType::Comment => "#comment".into(),
            NodeType::Document => "#document".into(),
            NodeType::DocumentFragment => "#document-fragment".into(),
            NodeType::DocumentType | NodeType::ProcessingInstruction => match &*self.0.data.read() {
                NodeData::DocumentType { name, .. } => name.clone(),
                NodeData::ProcessingInstruction { target, .. } => target.clone(),
                _ => String::new(),
            },
        }
    }

    pub fn node_value(&self) -> Option<String> {
        self.data()
    }

    pub fn set_node_value(&self, value: &str) {
        if self.0.node_type.is_character_data() {
            self.set_data(value);
        }
    }

    pub fn is_element(&self) -> bool {
        self.0.node_type == NodeType::Element
    }

    pub fn as_element(&self) -> Option<Element> {
        self.is_element().then(|| Element(self.clone()))
    }

    pub fn as_document(&self) -> Option<Document> {
        (self.0.node_type == NodeType::Document).then(|| Document(self.clone()))
    }

    pub fn as_shadow_root(&self) -> Option<ShadowRoot> {
        self.is_shadow_root().then(|| ShadowRoot(self.clone()))
    }

    pub fn is_shadow_root(&self) -> bool {
        matches!(&*self.0.data.read(), NodeData::DocumentFragment(FragmentData { host: Some(_), .. }))
    }

    pub(crate) fn shadow_host(&self) -> Option<Element> {
        match &*self.0.data.read() {
            NodeData::DocumentFragment(FragmentData { host: Some(host), .. }) => {
                host.upgrade().map(|inner| Element(Node(inner)))
            }
            _ => None,
        }
    }

    pub(crate) fn element_data<R>(&self, f: impl FnOnce(&ElementData) -> R) -> Option<R> {
        match &*self.0.data.read() {
            NodeData::Element(data) => Some(f(data)),
            _ => None,
        }
    }

    pub(crate) fn element_data_mut<R>(&self, f: impl FnOnce(&mut ElementData) -> R) -> Option<R> {
        match &mut *self.0.data.write() {
            NodeData::Element(data) => Some(f(data)),
            _ => None,
        }
    }

    pub(crate) fn document_data<R>(&self, f: impl FnOnce(&DocumentData) -> R) -> Option<R> {
        match &*self.0.data.read() {
            NodeData::Document(data) => Some(f(data)),
            _ => None,
        }
    }

    pub(crate) fn document_data_mut<R>(&self, f: impl FnOnce(&mut DocumentData) -> R) -> Option<R> {
        match &mut *self.0.data.write() {
            NodeData::Document(data) => Some(f(data)),
            _ => None,
        }
    }

    /// `ownerDocument`: `None` for documents themselves.
    pub fn owner_document(&self) -> Option<Document> {
        if self.0.node_type == NodeType::Document {
            return None;
        }
        self.0.owner_document.read().upgrade().map(|inner| Document(Node(inner)))
    }

    /// The node document, which for a document is itself.
    pub(crate) fn node_document(&self) -> Option<Document> {
        if self.0.node_type == NodeType::Document {
            return Some(Document(self.clone()));
        }
        self.owner_document()
    }

    pub(crate) fn set_owner_document(&self, document: &Document) {
        *self.0.owner_document.write() = Arc::downgrade(&document.0 .0);
    }

    pub fn parent_node(&self) -> Option<Node> {
        self.0.tree.read().parent.upgrade().map(Node)
    }

    pub fn parent_element(&self) -> Option<Element> {
        self.parent_node().and_then(|parent| parent.as_element())
    }

    /// Live list of this node's children.
    pub fn child_nodes(&self) -> NodeList {
        NodeList::live_children(self)
    }

    /// Point-in-time copy of the children.
    pub fn children_snapshot(&self) -> Vec<Node> {
        self.0.tree.read().children.iter().cloned().collect()
    }

    pub(crate) fn child_count(&self) -> usize {
        self.0.tree.read().children.len()
    }

    pub(crate) fn child_at(&self, index: usize) -> Option<Node> {
        self.0.tree.read().children.get(index).cloned()
    }

    pub fn has_child_nodes(&self) -> bool {
        !self.0.tree.read().children.is_empty()
    }

    pub fn first_child(&self) -> Option<Node> {
        self.0.tree.read().children.first().cloned()
    }

    pub fn last_child(&self) -> Option<Node> {
        self.0.tree.read().children.last().cloned()
    }

    /// Position among the parent's children.
    pub(crate) fn index(&self) -> Option<usize> {
        let parent = self.parent_node()?;
        let tree = parent.0.tree.read();
        tree.children.iter().position(|child| child == self)
    }

    pub fn previous_sibling(&self) -> Option<Node> {
        let parent = self.parent_node()?;
        let tree = parent.0.tree.read();
        let index = tree.children.iter().position(|child| child == self)?;
        index.checked_sub(1).and_then(|i| tree.children.get(i).cloned())
    }

    pub fn next_sibling(&self) -> Option<Node> {
        let parent = self.parent_node()?;
        let tree = parent.0.tree.read();
        let index = tree.children.iter().position(|child| child == self)?;
        tree.children.get(index + 1).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.0.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn ancestors(&self) -> impl Iterator<Item = Node> {
        std::iter::successors(self.parent_node(), |node| node.parent_node())
    }

    pub(crate) fn inclusive_ancestors(&self) -> impl Iterator<Item = Node> {
        std::iter::successors(Some(self.clone()), |node| node.parent_node())
    }

    /// Descendants in tree order, excluding `self`.
    pub(crate) fn descendants(&self) -> Vec<Node> {
        let mut out = Vec::new();
        let mut stack: Vec<Node> = self.children_snapshot().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children_snapshot().into_iter().rev());
            out.push(node);
        }
        out
    }

    pub(crate) fn inclusive_descendants(&self) -> Vec<Node> {
        let mut out = vec![self.clone()];
        out.extend(self.descendants());
        out
    }

    /// Tree order walk that also enters attached shadow roots.
    pub(crate) fn shadow_including_inclusive_descendants(&self) -> Vec<Node> {
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            stack.extend(node.children_snapshot().into_iter().rev());
            if let Some(shadow) = node.element_data(|data| data.shadow_root.clone()).flatten() {
                stack.push(shadow);
            }
            out.push(node);
        }
        out
    }

    pub(crate) fn descendant_elements(&self) -> impl Iterator<Item = Element> {
        self.descendants().into_iter().filter_map(|node| node.as_element())
    }

    /// Inclusive ancestor test.
    pub fn contains(&self, other: &Node) -> bool {
        other.inclusive_ancestors().any(|node| &node == self)
    }

    pub(crate) fn is_host_including_inclusive_ancestor_of(&self, other: &Node) -> bool {
        let mut current = Some(other.clone());
        while let Some(node) = current {
            if &node == self {
                return true;
            }
            current = node
                .parent_node()
                .or_else(|| node.shadow_host().map(|host| host.0));
        }
        false
    }

    pub fn get_root_node(&self, composed: bool) -> Node {
        let mut root = self.inclusive_ancestors().last().unwrap_or_else(|| self.clone());
        if composed {
            while let Some(host) = root.shadow_host() {
                root = host.0.inclusive_ancestors().last().unwrap_or(host.0);
            }
        }
        root
    }

    pub fn is_same_node(&self, other: &Node) -> bool {
        self == other
    }

    pub fn is_equal_node(&self, other: &Node) -> bool {
        if self.node_type() != other.node_type() {
            return false;
        }
        let same_payload = match (&*self.0.data.read(), &*other.0.data.read()) {
            (NodeData::Element(a), NodeData::Element(b)) => {
                self.0.name == other.0.name
                    && a.attributes.len() == b.attributes.len()
                    && a.attributes.iter().all(|attr| {
                        b.attributes
                            .find_qualified(&attr.qual_name())
                            .is_some_and(|other| other.value() == attr.value())
                    })
            }
            (NodeData::Text(a), NodeData::Text(b))
            | (NodeData::CDataSection(a), NodeData::CDataSection(b))
            | (NodeData::Comment(a), NodeData::Comment(b)) => a == b,
            (
                NodeData::ProcessingInstruction { target: ta, data: da },
                NodeData::ProcessingInstruction { target: tb, data: db },
            ) => ta == tb && da == db,
            (
                NodeData::DocumentType { name: na, public_id: pa, system_id: sa },
                NodeData::DocumentType { name: nb, public_id: pb, system_id: sb },
            ) => na == nb && pa == pb && sa == sb,
            (NodeData::Document(_), NodeData::Document(_)) => true,
            (NodeData::DocumentFragment(_), NodeData::DocumentFragment(_)) => true,
            _ => false,
        };
        if !same_payload {
            return false;
        }
        let ours = self.children_snapshot();
        let theirs = other.children_snapshot();
        ours.len() == theirs.len() && ours.iter().zip(theirs.iter()).all(|(a, b)| a.is_equal_node(b))
    }

    pub fn compare_document_position(&self, other: &Node) -> u16 {
        if self == other {
            return 0;
        }
        let mut ours: Vec<Node> = self.inclusive_ancestors().collect();
        let mut theirs: Vec<Node> = other.inclusive_ancestors().collect();
        ours.reverse();
        theirs.reverse();
        if ours.first() != theirs.first() {
            let direction = if self.id() < other.id() {
                DOCUMENT_POSITION_FOLLOWING
            } else {
                DOCUMENT_POSITION_PRECEDING
            };
            return DOCUMENT_POSITION_DISCONNECTED
                | DOCUMENT_POSITION_IMPLEMENTATION_SPECIFIC
                | direction;
        }
        if theirs.len() < ours.len() && ours[theirs.len() - 1] == *other {
            return DOCUMENT_POSITION_CONTAINS | DOCUMENT_POSITION_PRECEDING;
        }
        if ours.len() < theirs.len() && theirs[ours.len() - 1] == *self {
            return DOCUMENT_POSITION_CONTAINED_BY | DOCUMENT_POSITION_FOLLOWING;
        }
        let shared = ours
            .iter()
            .zip(theirs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let parent = &ours[shared - 1];
        let children = parent.0.tree.read();
        let ours_index = children.children.iter().position(|c| *c == ours[shared]);
        let theirs_index = children.children.iter().position(|c| *c == theirs[shared]);
        if theirs_index < ours_index {
            DOCUMENT_POSITION_PRECEDING
        } else {
            DOCUMENT_POSITION_FOLLOWING
        }
    }

    /// Orders two nodes of the same tree by tree order.
    pub(crate) fn tree_order(&self, other: &Node) -> CmpOrdering {
        let position = self.compare_document_position(other);
        if position == 0 {
            CmpOrdering::Equal
        } else if position & DOCUMENT_POSITION_FOLLOWING != 0 {
            CmpOrdering::Less
        } else {
            CmpOrdering::Greater
        }
    }

    pub fn text_content(&self) -> Option<String> {
        match self.0.node_type {
            NodeType::Document | NodeType::DocumentType | NodeType::Attribute => None,
            NodeType::Element | NodeType::DocumentFragment => Some(self.descendant_text()),
            _ => self.data(),
        }
    }

    pub(crate) fn descendant_text(&self) -> String {
        let mut text = String::new();
        for node in self.descendants() {
            if let NodeData::Text(data) | NodeData::CDataSection(data) = &*node.0.data.read() {
                text.push_str(data);
            }
        }
        text
    }

    /// Child text nodes only, as `<option>` and `<script>` read them.
    pub(crate) fn child_text_content(&self) -> String {
        let mut text = String::new();
        for child in self.children_snapshot() {
            if let NodeData::Text(data) | NodeData::CDataSection(data) = &*child.0.data.read() {
                text.push_str(data);
            }
        }
        text
    }

    pub fn set_text_content(&self, text: &str) {
        match self.0.node_type {
            NodeType::Element | NodeType::DocumentFragment => {
                let replacement = if text.is_empty() {
                    None
                } else {
                    self.node_document().map(|doc| doc.create_text_node(text))
                };
                mutation::replace_all(replacement.as_ref(), self);
            }
            node_type if node_type.is_character_data() => self.set_data(text),
            _ => {}
        }
    }

    pub fn normalize(&self) {
        for node in self.descendants() {
            if node.node_type() != NodeType::Text {
                continue;
            }
            if node.parent_node().is_none() {
                continue;
            }
            let length = node.length();
            if length == 0 {
                node.remove();
                continue;
            }
            let mut merged = String::new();
            let mut sibling = node.next_sibling();
            while let Some(next) = sibling {
                if next.node_type() != NodeType::Text {
                    break;
                }
                merged.push_str(&next.data().unwrap_or_default());
                sibling = next.next_sibling();
                next.remove();
            }
            if !merged.is_empty() {
                node.append_data(&merged);
            }
        }
    }

    pub fn clone_node(&self, deep: bool) -> Result<Node> {
        if self.is_shadow_root() {
            return Err(DomError::NotSupported("shadow roots cannot be cloned".into()));
        }
        self.clone_into(self.node_document().as_ref(), deep)
    }

    pub(crate) fn clone_into(&self, document: Option<&Document>, deep: bool) -> Result<Node> {
        let copy = match self.0.node_type {
            NodeType::Document => {
                let source = Document(self.clone());
                source.clone_shell().0
            }
            _ => {
                let document = document
                    .ok_or_else(|| DomError::InvalidState("node has no document".into()))?;
                self.clone_leaf(document)?
            }
        };
        if deep {
            let target_doc = copy.node_document();
            for child in self.children_snapshot() {
                let child_copy = child.clone_into(target_doc.as_ref(), true)?;
                mutation::append_unchecked(&copy, &child_copy);
            }
            if let (Some(source), Some(dest)) = (self.as_element(), copy.as_element()) {
                if let (Some(from), Some(to)) = (source.template_content(), dest.template_content()) {
                    for child in from.children_snapshot() {
                        let child_copy = child.clone_into(target_doc.as_ref(), true)?;
                        mutation::append_unchecked(&to, &child_copy);
                    }
                }
            }
        }
        Ok(copy)
    }

    fn clone_leaf(&self, document: &Document) -> Result<Node> {
        let leaf = match &*self.0.data.read() {
            NodeData::Element(_) => None,
            NodeData::Text(data) => Some(document.create_text_node(data)),
            NodeData::CDataSection(data) => Some(document.create_cdata_section_unchecked(data)),
            NodeData::Comment(data) => Some(document.create_comment(data)),
            NodeData::ProcessingInstruction { target, data } => {
                Some(document.create_processing_instruction_unchecked(target, data))
            }
            NodeData::DocumentType { name, public_id, system_id } => {
                Some(document.create_document_type(name, public_id, system_id))
            }
            NodeData::DocumentFragment(_) => Some(document.create_document_fragment()),
            NodeData::Document(_) => None,
        };
        match leaf {
            Some(node) => Ok(node),
            None => {
                let source = self
                    .as_element()
                    .ok_or_else(|| DomError::NotSupported("cannot clone this node".into()))?;
                Ok(source.clone_element_shell(document).0)
            }
        }
    }

    pub fn append_child(&self, child: &Node) -> Result<Node> {
        mutation::pre_insert(child, self, None)
    }

    pub fn insert_before(&self, node: &Node, child: Option<&Node>) -> Result<Node> {
        mutation::pre_insert(node, self, child)
    }

    pub fn remove_child(&self, child: &Node) -> Result<Node> {
        mutation::pre_remove(child, self)
    }

    pub fn replace_child(&self, node: &Node, child: &Node) -> Result<Node> {
        mutation::replace(child, node, self)
    }

    /// ChildNode `remove()`: detaches the node, a no-op without a parent.
    pub fn remove(&self) {
        if self.parent_node().is_some() {
            mutation::remove(self, false);
        }
    }

    fn convert_into_node(&self, nodes: Vec<NodeOrText>) -> Result<Node> {
        let document = self
            .node_document()
            .ok_or_else(|| DomError::InvalidState("node has no document".into()))?;
        let mut converted: Vec<Node> = nodes
            .into_iter()
            .map(|item| match item {
                NodeOrText::Node(node) => node,
                NodeOrText::Text(text) => document.create_text_node(&text),
            })
            .collect();
        if converted.len() == 1 {
            return Ok(converted.remove(0));
        }
        let fragment = document.create_document_fragment();
        for node in converted {
            fragment.append_child(&node)?;
        }
        Ok(fragment)
    }

    pub fn prepend(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let node = self.convert_into_node(nodes)?;
        let first = self.first_child();
        mutation::pre_insert(&node, self, first.as_ref()).map(|_| ())
    }

    pub fn append(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let node = self.convert_into_node(nodes)?;
        mutation::pre_insert(&node, self, None).map(|_| ())
    }

    pub fn replace_children(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let node = self.convert_into_node(nodes)?;
        mutation::ensure_pre_insertion_validity(&node, self, None)?;
        mutation::replace_all(Some(&node), self);
        Ok(())
    }

    fn excluded_sibling(
        &self,
        nodes: &[NodeOrText],
        start: Option<Node>,
        forward: bool,
    ) -> Option<Node> {
        let mut candidate = start;
        while let Some(node) = candidate {
            let excluded = nodes
                .iter()
                .any(|item| matches!(item, NodeOrText::Node(n) if *n == node));
            if !excluded {
                return Some(node);
            }
            candidate = if forward { node.next_sibling() } else { node.previous_sibling() };
        }
        None
    }

    pub fn before(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let Some(parent) = self.parent_node() else {
            return Ok(());
        };
        let viable_previous = self.excluded_sibling(&nodes, self.previous_sibling(), false);
        let node = self.convert_into_node(nodes)?;
        let reference = match viable_previous {
            Some(previous) => previous.next_sibling(),
            None => parent.first_child(),
        };
        mutation::pre_insert(&node, &parent, reference.as_ref()).map(|_| ())
    }

    pub fn after(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let Some(parent) = self.parent_node() else {
            return Ok(());
        };
        let viable_next = self.excluded_sibling(&nodes, self.next_sibling(), true);
        let node = self.convert_into_node(nodes)?;
        mutation::pre_insert(&node, &parent, viable_next.as_ref()).map(|_| ())
    }

    pub fn replace_with(&self, nodes: Vec<NodeOrText>) -> Result<()> {
        let Some(parent) = self.parent_node() else {
            return Ok(());
        };
        let viable_next = self.excluded_sibling(&nodes, self.next_sibling(), true);
        let node = self.convert_into_node(nodes)?;
        if self.parent_node().as_ref() == Some(&parent) {
            mutation::replace(self, &node, &parent).map(|_| ())
        } else {
            mutation::pre_insert(&node, &parent, viable_next.as_ref()).map(|_| ())
        }
    }

    /// CharacterData payload; `None` for other node kinds.
    pub fn data(&self) -> Option<String> {
        match &*self.0.data.read() {
            NodeData::Text(data) | NodeData::CDataSection(data) | NodeData::Comment(data) => {
                Some(data.clone())
            }
            NodeData::ProcessingInstruction { data, .. } => Some(data.clone()),
            _ => None,
        }
    }

    /// Length in UTF-16 code units for character data, child count otherwise.
    pub fn length(&self) -> usize {
        match self.data() {
            Some(data) => data.encode_utf16().count(),
            None if self.0.node_type == NodeType::DocumentType => 0,
            None => self.child_count(),
        }
    }

    pub fn set_data(&self, value: &str) {
        let length = self.length();
        // replacing the full range can never be out of bounds
        let _ = self.replace_data(0, length, value);
    }

    pub fn append_data(&self, value: &str) {
        let length = self.length();
        let _ = self.replace_data(length, 0, value);
    }

    pub fn insert_data(&self, offset: usize, value: &str) -> Result<()> {
        self.replace_data(offset, 0, value)
    }

    pub fn delete_data(&self, offset: usize, count: usize) -> Result<()> {
        self.replace_data(offset, count, "")
    }

    pub fn substring_data(&self, offset: usize, count: usize) -> Result<String> {
        let units: Vec<u16> = self.data().unwrap_or_default().encode_utf16().collect();
        if offset > units.len() {
            return Err(DomError::IndexSize(format!("offset {offset} exceeds length {}", units.len())));
        }
        let end = offset.saturating_add(count).min(units.len());
        Ok(String::from_utf16_lossy(&units[offset..end]))
    }

    pub fn replace_data(&self, offset: usize, count: usize, value: &str) -> Result<()> {
        let old = match self.data() {
            Some(old) => old,
            None => return Ok(()),
        };
        let units: Vec<u16> = old.encode_utf16().collect();
        if offset > units.len() {
            return Err(DomError::IndexSize(format!("offset {offset} exceeds length {}", units.len())));
        }
        let end = offset.saturating_add(count).min(units.len());
        let mut replaced: Vec<u16> = Vec::with_capacity(units.len() + value.len());
        replaced.extend_from_slice(&units[..offset]);
        replaced.extend(value.encode_utf16());
        replaced.extend_from_slice(&units[end..]);
        let new_data = String::from_utf16_lossy(&replaced);

        observer::queue_character_data_record(self, &old);
        match &mut *self.0.data.write() {
            NodeData::Text(data) | NodeData::CDataSection(data) | NodeData::Comment(data) => {
                *data = new_data;
            }
            NodeData::ProcessingInstruction { data, .. } => *data = new_data,
            _ => {}
        }
        if let Some(parent) = self.parent_element() {
            parent.behavior().children_changed(&parent);
        }
        Ok(())
    }

    pub fn split_text(&self, offset: usize) -> Result<Node> {
        if self.0.node_type != NodeType::Text {
            return Err(DomError::NotSupported("splitText requires a text node".into()));
        }
        let length = self.length();
        if offset > length {
            return Err(DomError::IndexSize(format!("offset {offset} exceeds length {length}")));
        }
        let tail = self.substring_data(offset, length - offset)?;
        let document = self
            .node_document()
            .ok_or_else(|| DomError::InvalidState("node has no document".into()))?;
        let new_node = document.create_text_node(&tail);
        if let Some(parent) = self.parent_node() {
            let next = self.next_sibling();
            mutation::pre_insert(&new_node, &parent, next.as_ref())?;
        }
        self.replace_data(offset, length - offset, "")?;
        Ok(new_node)
    }

    pub(crate) fn qualified_name(&self) -> Option<String> {
        self.0.name.as_ref().map(qualified_name_string)
    }

    pub fn as_event_target(&self) -> EventTarget {
        EventTarget::Node(self.clone())
    }

    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: &EventListener,
        options: impl Into<AddEventListenerOptions>,
    ) {
        self.as_event_target()
            .add_event_listener(event_type, listener, options.into());
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &EventListener, capture: bool) {
        self.as_event_target()
            .remove_event_listener(event_type, listener, capture);
    }

    /// Returns `false` when a listener cancelled the event.
    pub fn dispatch_event(&self, event: &Event) -> Result<bool> {
        self.as_event_target().dispatch_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_values_match_dom_constants() {
        assert_eq!(NodeType::Element.as_u16(), 1);
        assert_eq!(NodeType::Text.as_u16(), 3);
        assert_eq!(NodeType::DocumentFragment.as_u16(), 11);
        assert_eq!(NodeType::from_u16(9), Some(NodeType::Document));
        assert_eq!(NodeType::from_u16(5), None);
    }

    #[test]
    fn compare_document_position_reports_containment() {
        let doc = Document::new();
        let outer = doc.create_element("div").unwrap();
        let inner = doc.create_element("span").unwrap();
        outer.append_child(&inner).unwrap();
        assert_eq!(
            outer.compare_document_position(&inner),
            DOCUMENT_POSITION_CONTAINED_BY | DOCUMENT_POSITION_FOLLOWING
        );
        assert_eq!(
            inner.compare_document_position(&outer),
            DOCUMENT_POSITION_CONTAINS | DOCUMENT_POSITION_PRECEDING
        );
        let stray = doc.create_element("p").unwrap();
        assert_ne!(outer.compare_document_position(&stray) & DOCUMENT_POSITION_DISCONNECTED, 0);
    }

    #[test]
    fn character_data_edits_use_utf16_offsets() {
        let doc = Document::new();
        let text = doc.create_text_node("a\u{1F600}b");
        assert_eq!(text.length(), 4);
        text.insert_data(3, "X").unwrap();
        assert_eq!(text.data().as_deref(), Some("a\u{1F600}Xb"));
        assert!(text.delete_data(9, 1).is_err());
    }

    #[test]
    fn split_text_inserts_tail_after_original() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let text = doc.create_text_node("hello world");
        div.append_child(&text).unwrap();
        let tail = text.split_text(5).unwrap();
        assert_eq!(text.data().as_deref(), Some("hello"));
        assert_eq!(tail.data().as_deref(), Some(" world"));
        assert_eq!(text.next_sibling(), Some(tail));
    }

    #[test]
    fn normalize_merges_adjacent_text() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.append(vec!["a".into(), "b".into(), "".into(), "c".into()]).unwrap();
        div.normalize();
        assert_eq!(div.child_count(), 1);
        assert_eq!(div.text_content().as_deref(), Some("abc"));
    }

    #[test]
    fn deep_clone_is_equal_but_distinct() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        div.set_attribute("class", "a").unwrap();
        div.append(vec!["text".into()]).unwrap();
        let copy = div.clone_node(true).unwrap();
        assert!(copy.is_equal_node(&div));
        assert!(!copy.is_same_node(&div));
        assert!(copy.parent_node().is_none());
    }
}
