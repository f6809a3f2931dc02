pub mod selector;

pub use selector::{SelectorList, parse_cached};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::dom::{DomError, Element};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Unsupported pseudo-class: {0}")]
    UnsupportedPseudoClass(String),
}

impl From<SelectorError> for DomError {
    fn from(err: SelectorError) -> Self {
        DomError::Syntax(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub value: String,
    pub important: bool,
}

/// Ordered declarations parsed from a `style` attribute. Later duplicates
/// replace earlier ones in place, matching how the CSSOM dedupes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationBlock {
    declarations: Vec<Declaration>,
}

/// Splits on `;` outside quotes and parentheses.
fn split_declarations(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut escaped = false;
    for (index, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ';') if depth == 0 => {
                parts.push(&input[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("/*") {
        out.push_str(&rest[..open]);
        match rest[open + 2..].find("*/") {
            Some(close) => rest = &rest[open + 2 + close + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn normalize_property(name: &str) -> String {
    let name = name.trim();
    if name.starts_with("--") {
        name.to_string()
    } else {
        name.to_ascii_lowercase()
    }
}

/// `backgroundColor` → `background-color`, `cssFloat` → `float`.
pub fn camel_to_kebab(property: &str) -> String {
    if property == "cssFloat" {
        return "float".to_string();
    }
    let mut out = String::with_capacity(property.len() + 4);
    for c in property.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    if out.starts_with("webkit-") || out.starts_with("moz-") || out.starts_with("ms-") {
        out.insert(0, '-');
    }
    out
}

impl DeclarationBlock {
    pub fn parse(input: &str) -> Self {
        let mut block = Self::default();
        let cleaned = strip_comments(input);
        for part in split_declarations(&cleaned) {
            let Some((name, value)) = part.split_once(':') else {
                continue;
            };
            let name = normalize_property(name);
            if name.is_empty() {
                continue;
            }
            let mut value = value.trim();
            let mut important = false;
            if let Some(index) = value.to_ascii_lowercase().rfind("!important") {
                if value[index + "!important".len()..].trim().is_empty() {
                    important = true;
                    value = value[..index].trim_end();
                }
            }
            if value.is_empty() {
                continue;
            }
            block.set(&name, value, important);
        }
        block
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        let name = normalize_property(name);
        self.declarations.iter().find(|d| d.name == name)
    }

    pub fn item(&self, index: usize) -> Option<&Declaration> {
        self.declarations.get(index)
    }

    pub fn set(&mut self, name: &str, value: &str, important: bool) {
        let name = normalize_property(name);
        let declaration = Declaration {
            name: name.clone(),
            value: value.trim().to_string(),
            important,
        };
        match self.declarations.iter_mut().find(|d| d.name == name) {
            Some(existing) => *existing = declaration,
            None => self.declarations.push(declaration),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Declaration> {
        let name = normalize_property(name);
        let index = self.declarations.iter().position(|d| d.name == name)?;
        Some(self.declarations.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter()
    }
}

impl fmt::Display for DeclarationBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, declaration) in self.declarations.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}: {}", declaration.name, declaration.value)?;
            if declaration.important {
                f.write_str(" !important")?;
            }
            f.write_str(";")?;
        }
        Ok(())
    }
}

/// `element.style`: a view over the element's `style` attribute.
///
/// Reads go through a parsed block cached on the element and dropped
/// whenever the attribute changes. Writes serialize the updated block back
/// into the attribute, so both sides always agree.
#[derive(Clone)]
pub struct CssStyleDeclaration {
    element: Element,
}

impl fmt::Debug for CssStyleDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CssStyleDeclaration").field(&self.css_text()).finish()
    }
}

impl CssStyleDeclaration {
    pub(crate) fn for_element(element: &Element) -> Self {
        Self {
            element: element.clone(),
        }
    }

    fn block(&self) -> Arc<DeclarationBlock> {
        if let Some(Some(cached)) = self.element.element_data(|data| data.style_cache.clone()) {
            return cached;
        }
        let text = self.element.get_attribute("style").unwrap_or_default();
        let block = Arc::new(DeclarationBlock::parse(&text));
        self.element
            .element_data_mut(|data| data.style_cache = Some(block.clone()));
        block
    }

    fn update(&self, change: impl FnOnce(&mut DeclarationBlock)) {
        let mut block = (*self.block()).clone();
        change(&mut block);
        self.element
            .set_attribute_unchecked("style", &block.to_string());
    }

    pub fn length(&self) -> usize {
        self.block().len()
    }

    pub fn item(&self, index: usize) -> Option<String> {
        self.block().item(index).map(|d| d.name.clone())
    }

    pub fn css_text(&self) -> String {
        self.block().to_string()
    }

    pub fn set_css_text(&self, text: &str) {
        let block = DeclarationBlock::parse(text);
        self.element
            .set_attribute_unchecked("style", &block.to_string());
    }

    pub fn get_property_value(&self, property: &str) -> String {
        self.block()
            .get(property)
            .map(|d| d.value.clone())
            .unwrap_or_default()
    }

    pub fn get_property_priority(&self, property: &str) -> String {
        match self.block().get(property) {
            Some(d) if d.important => "important".to_string(),
            _ => String::new(),
        }
    }

    /// An empty value removes the property; an unknown priority is ignored.
    pub fn set_property(&self, property: &str, value: &str, priority: &str) {
        if value.trim().is_empty() {
            self.remove_property(property);
            return;
        }
        let important = match priority.to_ascii_lowercase().as_str() {
            "" => false,
            "important" => true,
            _ => return,
        };
        self.update(|block| block.set(property, value, important));
    }

    /// Returns the removed value, or an empty string.
    pub fn remove_property(&self, property: &str) -> String {
        if self.block().get(property).is_none() {
            return String::new();
        }
        let mut removed = String::new();
        self.update(|block| {
            if let Some(declaration) = block.remove(property) {
                removed = declaration.value;
            }
        });
        removed
    }

    /// Camel-cased property access (`style.backgroundColor`).
    pub fn get(&self, camel_property: &str) -> String {
        self.get_property_value(&camel_to_kebab(camel_property))
    }

    pub fn set(&self, camel_property: &str, value: &str) {
        self.set_property(&camel_to_kebab(camel_property), value, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::Document;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_declarations_with_priority_and_comments() {
        let block = DeclarationBlock::parse(
            "color: red; /* note */ background: url('a;b.png') !important; COLOR: blue; bad",
        );
        assert_eq!(block.len(), 2);
        assert_eq!(block.get("color").unwrap().value, "blue");
        assert!(block.get("background").unwrap().important);
        assert_eq!(
            block.to_string(),
            "color: blue; background: url('a;b.png') !important;"
        );
    }

    #[test]
    fn style_and_attribute_stay_in_sync() {
        let doc = Document::new();
        let div = doc.create_element("div").unwrap();
        let style = div.style();
        style.set("backgroundColor", "red");
        assert_eq!(div.get_attribute("style").as_deref(), Some("background-color: red;"));

        div.set_attribute("style", "margin: 0; color: green").unwrap();
        assert_eq!(style.get("color"), "green");
        assert_eq!(style.length(), 2);

        assert_eq!(style.remove_property("margin"), "0");
        assert_eq!(div.get_attribute("style").as_deref(), Some("color: green;"));
        style.set_property("color", "", "");
        assert_eq!(style.length(), 0);
    }

    #[test]
    fn camel_case_conversion() {
        assert_eq!(camel_to_kebab("borderTopWidth"), "border-top-width");
        assert_eq!(camel_to_kebab("cssFloat"), "float");
        assert_eq!(camel_to_kebab("webkitTransform"), "-webkit-transform");
    }
}
