use std::fmt;

use super::element::Element;
use super::{split_tokens, DomError, Result};

/// `DOMTokenList` view over a whitespace separated attribute.
///
/// Holds no state of its own: every read parses the attribute and every
/// write serializes back through `set_attribute`, so the list and the
/// attribute cannot drift apart.
#[derive(Clone)]
pub struct DomTokenList {
    element: Element,
    attribute: &'static str,
    supported: Option<&'static [&'static str]>,
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(DomError::Syntax("the token must not be empty".into()));
    }
    if token.chars().any(super::is_ascii_whitespace) {
        return Err(DomError::InvalidCharacter(format!(
            "the token '{token}' contains whitespace"
        )));
    }
    Ok(())
}

impl DomTokenList {
    pub(crate) fn new(
        element: &Element,
        attribute: &'static str,
        supported: Option<&'static [&'static str]>,
    ) -> Self {
        Self {
            element: element.clone(),
            attribute,
            supported,
        }
    }

    fn tokens(&self) -> Vec<String> {
        let value = self.element.get_attribute(self.attribute).unwrap_or_default();
        let mut tokens: Vec<String> = Vec::new();
        for token in split_tokens(&value) {
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        tokens
    }

    fn write(&self, tokens: &[String]) {
        // the update steps skip creating an absent attribute for an empty set
        if tokens.is_empty() && !self.element.has_attribute(self.attribute) {
            return;
        }
        self.element
            .set_attribute_unchecked(self.attribute, &tokens.join(" "));
    }

    pub fn length(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn item(&self, index: usize) -> Option<String> {
        self.tokens().get(index).cloned()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens().iter().any(|t| t == token)
    }

    pub fn add(&self, tokens: &[&str]) -> Result<()> {
        for token in tokens {
            validate_token(token)?;
        }
        let mut current = self.tokens();
        for token in tokens {
            if !current.iter().any(|t| t == token) {
                current.push(token.to_string());
            }
        }
        self.write(&current);
        Ok(())
    }

    pub fn remove(&self, tokens: &[&str]) -> Result<()> {
        for token in tokens {
            validate_token(token)?;
        }
        let mut current = self.tokens();
        current.retain(|t| !tokens.contains(&t.as_str()));
        self.write(&current);
        Ok(())
    }

    /// Returns whether the token is present afterwards.
    pub fn toggle(&self, token: &str, force: Option<bool>) -> Result<bool> {
        validate_token(token)?;
        let present = self.contains(token);
        match (present, force) {
            (true, None | Some(false)) => {
                self.remove(&[token])?;
                Ok(false)
            }
            (false, None | Some(true)) => {
                self.add(&[token])?;
                Ok(true)
            }
            (present, _) => Ok(present),
        }
    }

    pub fn replace(&self, token: &str, new_token: &str) -> Result<bool> {
        validate_token(token)?;
        validate_token(new_token)?;
        let current = self.tokens();
        if !current.iter().any(|t| t == token) {
            return Ok(false);
        }
        let mut replaced: Vec<String> = Vec::with_capacity(current.len());
        for existing in current {
            let next = if existing == token { new_token.to_string() } else { existing };
            if !replaced.contains(&next) {
                replaced.push(next);
            }
        }
        self.write(&replaced);
        Ok(true)
    }

    /// Fails with `TypeError` for lists without supported tokens (`classList`).
    pub fn supports(&self, token: &str) -> Result<bool> {
        match self.supported {
            Some(supported) => Ok(supported.contains(&token.to_ascii_lowercase().as_str())),
            None => Err(DomError::Type(format!(
                "'{}' attribute has no supported tokens",
                self.attribute
            ))),
        }
    }

    pub fn value(&self) -> String {
        self.element.get_attribute(self.attribute).unwrap_or_default()
    }

    pub fn set_value(&self, value: &str) {
        self.element.set_attribute_unchecked(self.attribute, value);
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.tokens()
    }
}

impl fmt::Debug for DomTokenList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tokens()).finish()
    }
}

/// `dataset`: camelCase view of the element's `data-*` attributes.
#[derive(Clone)]
pub struct DomStringMap {
    element: Element,
}

fn attribute_to_property(name: &str) -> Option<String> {
    let rest = name.strip_prefix("data-")?;
    let mut out = String::with_capacity(rest.len());
    let mut upper_next = false;
    for c in rest.chars() {
        if c == '-' {
            if upper_next {
                out.push('-');
            }
            upper_next = true;
            continue;
        }
        if upper_next {
            if c.is_ascii_lowercase() {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push('-');
                out.push(c);
            }
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    if upper_next {
        out.push('-');
    }
    Some(out)
}

fn property_to_attribute(property: &str) -> Result<String> {
    let mut chars = property.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' && chars.peek().is_some_and(|n| n.is_ascii_lowercase()) {
            return Err(DomError::Syntax(format!(
                "'{property}' is not a valid dataset property"
            )));
        }
    }
    let mut name = String::from("data-");
    for c in property.chars() {
        if c.is_ascii_uppercase() {
            name.push('-');
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    Ok(name)
}

impl DomStringMap {
    pub(crate) fn new(element: &Element) -> Self {
        Self {
            element: element.clone(),
        }
    }

    pub fn get(&self, property: &str) -> Option<String> {
        let name = property_to_attribute(property).ok()?;
        self.element.get_attribute(&name)
    }

    pub fn set(&self, property: &str, value: &str) -> Result<()> {
        let name = property_to_attribute(property)?;
        self.element.set_attribute(&name, value)
    }

    pub fn remove(&self, property: &str) {
        if let Ok(name) = property_to_attribute(property) {
            self.element.remove_attribute(&name);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.element
            .get_attribute_names()
            .iter()
            .filter_map(|name| attribute_to_property(name))
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect()
    }
}

impl fmt::Debug for DomStringMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}
