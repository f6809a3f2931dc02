use std::fmt;
use std::sync::{Arc, Weak};

use html5ever::{namespace_url, ns, LocalName, Namespace, QualName};
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::element::Element;
use super::node::{Node, NodeInner, NodeType};
use super::{namespace_option, qualified_name_string};

/// An attribute node. It stays a live view of its owner element's value.
#[derive(Clone)]
pub struct Attr(pub(crate) Arc<AttrInner>);

pub(crate) struct AttrInner {
    name: QualName,
    value: RwLock<String>,
    owner: RwLock<Weak<NodeInner>>,
}

impl PartialEq for Attr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Attr {}

impl fmt::Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attr({}={:?})", self.name(), self.value())
    }
}

impl Attr {
    pub(crate) fn new(name: QualName, value: impl Into<String>) -> Attr {
        Attr(Arc::new(AttrInner {
            name,
            value: RwLock::new(value.into()),
            owner: RwLock::new(Weak::new()),
        }))
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::Attribute
    }

    /// Qualified name, `prefix:local` when prefixed.
    pub fn name(&self) -> String {
        qualified_name_string(&self.0.name)
    }

    pub fn local_name(&self) -> String {
        self.0.name.local.to_string()
    }

    pub fn namespace_uri(&self) -> Option<String> {
        namespace_option(&self.0.name.ns)
    }

    pub fn prefix(&self) -> Option<String> {
        self.0.name.prefix.as_ref().map(|p| p.to_string())
    }

    pub fn specified(&self) -> bool {
        true
    }

    pub fn value(&self) -> String {
        self.0.value.read().clone()
    }

    /// Writes through the owner element so change steps and observers run.
    pub fn set_value(&self, value: &str) {
        match self.owner_element() {
            Some(owner) => owner.change_attribute(self, value),
            None => *self.0.value.write() = value.to_string(),
        }
    }

    pub fn owner_element(&self) -> Option<Element> {
        self.0.owner.read().upgrade().map(|inner| Element(Node(inner)))
    }

    pub(crate) fn qual_name(&self) -> QualName {
        self.0.name.clone()
    }

    pub(crate) fn qual_name_ref(&self) -> &QualName {
        &self.0.name
    }

    pub(crate) fn set_owner(&self, owner: Option<&Element>) {
        *self.0.owner.write() = match owner {
            Some(element) => Arc::downgrade(&element.0 .0),
            None => Weak::new(),
        };
    }

    pub(crate) fn replace_value(&self, value: &str) -> String {
        std::mem::replace(&mut *self.0.value.write(), value.to_string())
    }

    pub(crate) fn matches_qualified(&self, qualified: &str) -> bool {
        match &self.0.name.prefix {
            Some(prefix) => qualified
                .split_once(':')
                .is_some_and(|(p, l)| p == &**prefix && l == &*self.0.name.local),
            None => qualified == &*self.0.name.local,
        }
    }
}

/// Ordered attribute storage. Attribute counts are small, so lookups are linear.
#[derive(Default)]
pub(crate) struct AttributeList {
    attrs: SmallVec<[Attr; 4]>,
}

impl AttributeList {
    pub(crate) fn len(&self) -> usize {
        self.attrs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    pub(crate) fn to_vec(&self) -> Vec<Attr> {
        self.attrs.to_vec()
    }

    pub(crate) fn find_by_name(&self, qualified: &str) -> Option<Attr> {
        self.attrs.iter().find(|a| a.matches_qualified(qualified)).cloned()
    }

    pub(crate) fn find_qualified(&self, name: &QualName) -> Option<Attr> {
        self.find_ns(&name.ns, &name.local)
    }

    pub(crate) fn find_ns(&self, namespace: &Namespace, local: &LocalName) -> Option<Attr> {
        self.attrs
            .iter()
            .find(|a| a.0.name.ns == *namespace && a.0.name.local == *local)
            .cloned()
    }

    /// Value of a non-namespaced attribute by local name.
    pub(crate) fn value_of(&self, local: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|a| a.0.name.ns == ns!() && &*a.0.name.local == local)
            .map(|a| a.value())
    }

    pub(crate) fn position(&self, attr: &Attr) -> Option<usize> {
        self.attrs.iter().position(|a| a == attr)
    }

    pub(crate) fn push(&mut self, attr: Attr) {
        self.attrs.push(attr);
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Attr {
        self.attrs.remove(index)
    }

    pub(crate) fn replace_at(&mut self, index: usize, attr: Attr) -> Attr {
        std::mem::replace(&mut self.attrs[index], attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::attribute_name;

    #[test]
    fn qualified_match_respects_prefix() {
        let plain = Attr::new(attribute_name("href"), "/a");
        assert!(plain.matches_qualified("href"));
        assert!(!plain.matches_qualified("xlink:href"));

        let prefixed = Attr::new(
            QualName::new(
                Some("xlink".into()),
                Namespace::from("http://www.w3.org/1999/xlink"),
                LocalName::from("href"),
            ),
            "#b",
        );
        assert!(prefixed.matches_qualified("xlink:href"));
        assert_eq!(prefixed.name(), "xlink:href");
        assert_eq!(prefixed.local_name(), "href");
    }

    #[test]
    fn detached_attr_holds_its_own_value() {
        let attr = Attr::new(attribute_name("title"), "a");
        attr.set_value("b");
        assert_eq!(attr.value(), "b");
        assert!(attr.owner_element().is_none());
    }
}
