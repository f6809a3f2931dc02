pub mod attributes;
pub mod behavior;
pub mod collection;
pub mod custom_elements;
pub mod document;
pub mod element;
pub mod forms;
pub mod mutation;
pub mod node;
pub mod observer;
pub mod parser;
pub mod serializer;
pub mod token_list;
pub mod traversal;
pub(crate) mod write_stream;

pub use attributes::Attr;
pub use collection::{HtmlCollection, NodeList};
pub use custom_elements::{CustomElementCallbacks, CustomElementRegistry};
pub use document::{Document, DocumentReadyState};
pub use element::{Element, InsertPosition, ShadowRoot, ShadowRootMode};
pub use node::{Node, NodeId, NodeOrText, NodeType, WeakNode};
pub use observer::{MutationCallback, MutationObserver, MutationObserverInit, MutationRecord, MutationType};
pub use token_list::{DomStringMap, DomTokenList};
pub use traversal::{NodeFilter, NodeFilterResult, TreeWalker};

use html5ever::{namespace_url, ns, LocalName, Namespace, Prefix, QualName};
use thiserror::Error;

/// DOM exception taxonomy. Each variant maps onto the `DOMException` name
/// scripts observe through [`DomError::name`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomError {
    #[error("HierarchyRequestError: {0}")]
    HierarchyRequest(String),
    #[error("InvalidCharacterError: {0}")]
    InvalidCharacter(String),
    #[error("InvalidStateError: {0}")]
    InvalidState(String),
    #[error("NotFoundError: {0}")]
    NotFound(String),
    #[error("NamespaceError: {0}")]
    Namespace(String),
    #[error("SecurityError: {0}")]
    Security(String),
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("NotSupportedError: {0}")]
    NotSupported(String),
    #[error("IndexSizeError: {0}")]
    IndexSize(String),
    #[error("InUseAttributeError: {0}")]
    InUseAttribute(String),
    #[error("NoModificationAllowedError: {0}")]
    NoModificationAllowed(String),
    #[error("AbortError: {0}")]
    Abort(String),
    #[error("TimeoutError: {0}")]
    Timeout(String),
}

impl DomError {
    pub fn name(&self) -> &'static str {
        match self {
            DomError::HierarchyRequest(_) => "HierarchyRequestError",
            DomError::InvalidCharacter(_) => "InvalidCharacterError",
            DomError::InvalidState(_) => "InvalidStateError",
            DomError::NotFound(_) => "NotFoundError",
            DomError::Namespace(_) => "NamespaceError",
            DomError::Security(_) => "SecurityError",
            DomError::Syntax(_) => "SyntaxError",
            DomError::Type(_) => "TypeError",
            DomError::NotSupported(_) => "NotSupportedError",
            DomError::IndexSize(_) => "IndexSizeError",
            DomError::InUseAttribute(_) => "InUseAttributeError",
            DomError::NoModificationAllowed(_) => "NoModificationAllowedError",
            DomError::Abort(_) => "AbortError",
            DomError::Timeout(_) => "TimeoutError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DomError::HierarchyRequest(m)
            | DomError::InvalidCharacter(m)
            | DomError::InvalidState(m)
            | DomError::NotFound(m)
            | DomError::Namespace(m)
            | DomError::Security(m)
            | DomError::Syntax(m)
            | DomError::Type(m)
            | DomError::NotSupported(m)
            | DomError::IndexSize(m)
            | DomError::InUseAttribute(m)
            | DomError::NoModificationAllowed(m)
            | DomError::Abort(m)
            | DomError::Timeout(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, DomError>;

pub const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";
pub const SVG_NAMESPACE: &str = "http://www.w3.org/2000/svg";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

/// Factory for documents and doctypes that are not tied to a window.
#[derive(Debug, Clone, Default)]
pub struct DOMImplementation;

impl DOMImplementation {
    pub fn new() -> Self {
        Self
    }

    /// Kept for compatibility; modern DOM always answers `true`.
    pub fn has_feature(&self) -> bool {
        true
    }

    pub fn create_document_type(
        &self,
        owner: &Document,
        qualified_name: &str,
        public_id: &str,
        system_id: &str,
    ) -> Result<Node> {
        validate_qualified_name(qualified_name)?;
        Ok(owner.create_document_type(qualified_name, public_id, system_id))
    }

    pub fn create_html_document(&self, title: Option<&str>) -> Document {
        Document::create_html_document(title)
    }
}

pub(crate) fn is_name_start_char(c: char) -> bool {
    matches!(c,
        ':' | 'A'..='Z' | '_' | 'a'..='z'
        | '\u{C0}'..='\u{D6}' | '\u{D8}'..='\u{F6}' | '\u{F8}'..='\u{2FF}'
        | '\u{370}'..='\u{37D}' | '\u{37F}'..='\u{1FFF}' | '\u{200C}'..='\u{200D}'
        | '\u{2070}'..='\u{218F}' | '\u{2C00}'..='\u{2FEF}' | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}' | '\u{FDF0}'..='\u{FFFD}' | '\u{10000}'..='\u{EFFFF}')
}

pub(crate) fn is_name_char(c: char) -> bool {
    is_name_start_char(c)
        || matches!(c, '-' | '.' | '0'..='9' | '\u{B7}' | '\u{300}'..='\u{36F}' | '\u{203F}'..='\u{2040}')
}

/// XML `Name` production, which createElement and setAttribute validate against.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_name_start_char(first) && chars.all(is_name_char) => Ok(()),
        _ => Err(DomError::InvalidCharacter(format!(
            "'{name}' is not a valid name"
        ))),
    }
}

pub(crate) fn validate_qualified_name(name: &str) -> Result<()> {
    validate_name(name)?;
    let mut parts = name.split(':');
    let (first, second, rest) = (parts.next(), parts.next(), parts.next());
    if rest.is_some() || first == Some("") || second == Some("") {
        return Err(DomError::InvalidCharacter(format!(
            "'{name}' is not a valid qualified name"
        )));
    }
    Ok(())
}

/// Splits and checks a namespaced qualified name against the namespace rules
/// shared by createElementNS and setAttributeNS.
pub(crate) fn validate_and_extract(namespace: Option<&str>, qualified_name: &str) -> Result<QualName> {
    validate_qualified_name(qualified_name)?;
    let namespace = namespace.filter(|ns| !ns.is_empty());
    let (prefix, local) = match qualified_name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qualified_name),
    };
    if prefix.is_some() && namespace.is_none() {
        return Err(DomError::Namespace("a prefix requires a namespace".into()));
    }
    if prefix == Some("xml") && namespace != Some(XML_NAMESPACE) {
        return Err(DomError::Namespace("the xml prefix is reserved".into()));
    }
    let is_xmlns = qualified_name == "xmlns" || prefix == Some("xmlns");
    if is_xmlns != (namespace == Some(XMLNS_NAMESPACE)) {
        return Err(DomError::Namespace("xmlns must be used with the XMLNS namespace".into()));
    }
    Ok(QualName::new(
        prefix.map(Prefix::from),
        namespace.map(Namespace::from).unwrap_or_else(|| ns!()),
        LocalName::from(local),
    ))
}

pub(crate) fn html_name(local: &str) -> QualName {
    QualName::new(None, ns!(html), LocalName::from(local))
}

pub(crate) fn attribute_name(local: &str) -> QualName {
    QualName::new(None, ns!(), LocalName::from(local))
}

pub(crate) fn qualified_name_string(name: &QualName) -> String {
    match &name.prefix {
        Some(prefix) => format!("{}:{}", prefix, name.local),
        None => name.local.to_string(),
    }
}

pub(crate) fn namespace_option(ns: &Namespace) -> Option<String> {
    if ns.is_empty() {
        None
    } else {
        Some(ns.to_string())
    }
}

pub(crate) fn is_html_namespace(name: &QualName) -> bool {
    name.ns == ns!(html)
}

/// ASCII whitespace as the DOM defines it for token splitting.
pub(crate) fn is_ascii_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\u{C}' | '\r')
}

pub(crate) fn split_tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(is_ascii_whitespace).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_xml_production() {
        assert!(validate_name("div").is_ok());
        assert!(validate_name("my-element").is_ok());
        assert!(validate_name("x:y").is_ok());
        assert_eq!(
            validate_name("1abc").unwrap_err().name(),
            "InvalidCharacterError"
        );
        assert!(validate_name("").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn qualified_names_reject_bad_prefixes() {
        assert!(validate_and_extract(Some(SVG_NAMESPACE), "svg:rect").is_ok());
        assert_eq!(
            validate_and_extract(None, "svg:rect").unwrap_err().name(),
            "NamespaceError"
        );
        assert!(validate_and_extract(Some(SVG_NAMESPACE), "xmlns").is_err());
        assert!(validate_and_extract(Some(XMLNS_NAMESPACE), "xmlns:foo").is_ok());
        assert!(validate_qualified_name("a:b:c").is_err());
    }

    #[test]
    fn token_splitting_ignores_runs_of_whitespace() {
        let tokens: Vec<_> = split_tokens("  a\tb \n c ").collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }
}
