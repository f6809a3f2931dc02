use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::element::Element;
use super::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionScope {
    Children,
    Descendants,
}

pub(crate) type CollectionFilter = Box<dyn Fn(&Node) -> bool + Send + Sync>;

/// Backing state of a live collection. The root keeps a weak reference to it
/// and bumps `epoch` on every change in its subtree; the item list is rebuilt
/// lazily on the next read.
pub(crate) struct LiveCollectionState {
    root: Node,
    scope: CollectionScope,
    filter: CollectionFilter,
    epoch: AtomicU64,
    cache: Mutex<Option<(u64, Arc<Vec<Node>>)>>,
}

impl LiveCollectionState {
    fn register(root: &Node, scope: CollectionScope, filter: CollectionFilter) -> Arc<Self> {
        let state = Arc::new(Self {
            root: root.clone(),
            scope,
            filter,
            epoch: AtomicU64::new(0),
            cache: Mutex::new(None),
        });
        root.0
            .observers
            .collections
            .lock()
            .push(Arc::downgrade(&state));
        state
    }

    pub(crate) fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn compute(&self) -> Vec<Node> {
        match self.scope {
            CollectionScope::Children => self
                .root
                .children_snapshot()
                .into_iter()
                .filter(|node| (self.filter)(node))
                .collect(),
            CollectionScope::Descendants => self
                .root
                .descendants()
                .into_iter()
                .filter(|node| (self.filter)(node))
                .collect(),
        }
    }

    fn items(&self) -> Arc<Vec<Node>> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Some((cached_epoch, items)) = &*self.cache.lock() {
            if *cached_epoch == epoch {
                return items.clone();
            }
        }
        // The filter may read attributes, so compute without holding the cache lock.
        let items = Arc::new(self.compute());
        let mut cache = self.cache.lock();
        if self.epoch.load(Ordering::Acquire) == epoch {
            *cache = Some((epoch, items.clone()));
        }
        items
    }
}

impl Drop for LiveCollectionState {
    fn drop(&mut self) {
        self.root
            .0
            .observers
            .collections
            .lock()
            .retain(|weak| weak.strong_count() > 0);
    }
}

/// Marks every live collection rooted at `node` or one of its ancestors stale.
pub(crate) fn invalidate_collections(node: &Node) {
    for ancestor in node.inclusive_ancestors() {
        // Upgraded handles are dropped after the lock is released, since the
        // last one going away re-enters the list from `Drop`.
        let live: Vec<Arc<LiveCollectionState>> = {
            let mut collections = ancestor.0.observers.collections.lock();
            collections.retain(|weak| weak.strong_count() > 0);
            collections.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        for state in live {
            state.invalidate();
        }
    }
}

#[derive(Clone)]
enum NodeListKind {
    Live(Arc<LiveCollectionState>),
    Static(Arc<Vec<Node>>),
}

/// `NodeList`: live for `childNodes`, a snapshot for `querySelectorAll`.
#[derive(Clone)]
pub struct NodeList(NodeListKind);

impl NodeList {
    pub(crate) fn live_children(root: &Node) -> Self {
        NodeList(NodeListKind::Live(LiveCollectionState::register(
            root,
            CollectionScope::Children,
            Box::new(|_| true),
        )))
    }

    pub(crate) fn from_static(nodes: Vec<Node>) -> Self {
        NodeList(NodeListKind::Static(Arc::new(nodes)))
    }

    fn items(&self) -> Arc<Vec<Node>> {
        match &self.0 {
            NodeListKind::Live(state) => state.items(),
            NodeListKind::Static(items) => items.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.0, NodeListKind::Live(_))
    }

    pub fn length(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn item(&self, index: usize) -> Option<Node> {
        self.items().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.items().as_ref().clone()
    }

    pub fn iter(&self) -> std::vec::IntoIter<Node> {
        self.to_vec().into_iter()
    }
}

impl fmt::Debug for NodeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items().iter()).finish()
    }
}

impl IntoIterator for &NodeList {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Live, filtered element collection (`children`, `getElementsBy*`, `form.elements`).
#[derive(Clone)]
pub struct HtmlCollection(Arc<LiveCollectionState>);

impl HtmlCollection {
    pub(crate) fn new(
        root: &Node,
        scope: CollectionScope,
        filter: impl Fn(&Element) -> bool + Send + Sync + 'static,
    ) -> Self {
        HtmlCollection(LiveCollectionState::register(
            root,
            scope,
            Box::new(move |node| node.as_element().is_some_and(|element| filter(&element))),
        ))
    }

    pub fn length(&self) -> usize {
        self.0.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn item(&self, index: usize) -> Option<Element> {
        self.0.items().get(index).and_then(|node| node.as_element())
    }

    /// First element whose `id` or `name` attribute equals `name`.
    pub fn named_item(&self, name: &str) -> Option<Element> {
        if name.is_empty() {
            return None;
        }
        self.iter().find(|element| {
            element.get_attribute("id").as_deref() == Some(name)
                || element.get_attribute("name").as_deref() == Some(name)
        })
    }

    pub fn to_vec(&self) -> Vec<Element> {
        self.0.items().iter().filter_map(|node| node.as_element()).collect()
    }

    pub fn iter(&self) -> std::vec::IntoIter<Element> {
        self.to_vec().into_iter()
    }
}

impl fmt::Debug for HtmlCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.items().iter()).finish()
    }
}

impl IntoIterator for &HtmlCollection {
    type Item = Element;
    type IntoIter = std::vec::IntoIter<Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::dom::Document;

    #[test]
    fn child_nodes_tracks_mutations() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let list = div.child_nodes();
        assert_eq!(list.length(), 0);
        let span = doc.create_element("span").unwrap();
        div.append_child(&span).unwrap();
        assert_eq!(list.length(), 1);
        assert_eq!(list.item(0), Some(span.0.clone()));
        span.remove();
        assert!(list.is_empty());
    }

    #[test]
    fn collections_register_and_release_weakly() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        {
            let _a = div.child_nodes();
            let _b = div.children();
            assert_eq!(div.0 .0.observers.collections.lock().len(), 2);
        }
        assert_eq!(div.0 .0.observers.collections.lock().len(), 0);
    }

    #[test]
    fn class_collection_follows_attribute_changes() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let hits = doc.get_elements_by_class_name("hit");
        let div = doc.create_element("div").unwrap();
        body.append_child(&div).unwrap();
        assert_eq!(hits.length(), 0);
        div.set_attribute("class", "a hit").unwrap();
        assert_eq!(hits.length(), 1);
        div.class_list().remove(&["hit"]).unwrap();
        assert_eq!(hits.length(), 0);
    }
}
