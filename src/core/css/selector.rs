//! Selector parsing and matching for `querySelector`, `matches` and `closest`.
//!
//! A complex selector is stored subject-first: the rightmost compound comes
//! first and each entry carries the combinator linking it to the compound on
//! its left, so matching walks outward from the candidate element.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::trace;

use super::SelectorError;
use crate::core::dom::custom_elements::CustomElementStatus;
use crate::core::dom::{DomError, Element, NodeType};

pub type Result<T> = std::result::Result<T, SelectorError>;

const CACHE_LIMIT: usize = 512;

static PARSED: Lazy<DashMap<String, Arc<SelectorList>>> = Lazy::new(DashMap::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combinator {
    Descendant,
    Child,
    NextSibling,
    SubsequentSibling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeOperator {
    Exists,
    Equal,
    Includes,
    DashMatch,
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeSelector {
    pub name: String,
    pub operator: AttributeOperator,
    pub value: String,
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NthPattern {
    pub a: i32,
    pub b: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PseudoClass {
    Root,
    Scope,
    Empty,
    FirstChild,
    LastChild,
    OnlyChild,
    FirstOfType,
    LastOfType,
    OnlyOfType,
    NthChild(NthPattern),
    NthLastChild(NthPattern),
    NthOfType(NthPattern),
    NthLastOfType(NthPattern),
    Not(SelectorList),
    Is(SelectorList),
    Link,
    AnyLink,
    Visited,
    Hover,
    Active,
    Focus,
    FocusWithin,
    Target,
    Enabled,
    Disabled,
    Checked,
    Required,
    Optional,
    Defined,
    Lang(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompoundSelector {
    pub element_name: Option<String>,
    pub id: Option<String>,
    pub classes: SmallVec<[String; 4]>,
    pub attributes: SmallVec<[AttributeSelector; 2]>,
    pub pseudo_classes: SmallVec<[PseudoClass; 2]>,
    pub pseudo_element: Option<String>,
}

impl CompoundSelector {
    fn is_empty(&self) -> bool {
        self.element_name.is_none()
            && self.id.is_none()
            && self.classes.is_empty()
            && self.attributes.is_empty()
            && self.pseudo_classes.is_empty()
            && self.pseudo_element.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComplexSelector {
    /// Subject compound first; `Some(c)` links an entry to the one after it.
    pub compounds: Vec<(CompoundSelector, Option<Combinator>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectorList {
    pub selectors: SmallVec<[ComplexSelector; 2]>,
}

impl SelectorList {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = SelectorParser::new(input);
        let list = parser.parse_list()?;
        parser.skip_whitespace();
        if !parser.is_at_end() {
            return Err(SelectorError::Parse(format!(
                "unexpected '{}' in '{input}'",
                parser.current.unwrap_or_default()
            )));
        }
        Ok(list)
    }

    /// Whether `element` matches any selector in the list. `scope` is the
    /// element `:scope` refers to.
    pub fn matches(&self, element: &Element, scope: Option<&Element>) -> bool {
        let cx = MatchContext { scope };
        self.selectors
            .iter()
            .any(|selector| cx.matches_complex(&selector.compounds, element))
    }
}

/// Parses through a process-wide cache keyed by selector text.
pub fn parse_cached(input: &str) -> std::result::Result<Arc<SelectorList>, DomError> {
    if let Some(cached) = PARSED.get(input) {
        return Ok(cached.clone());
    }
    let list = Arc::new(SelectorList::parse(input)?);
    if PARSED.len() >= CACHE_LIMIT {
        trace!("selector cache full, clearing");
        PARSED.clear();
    }
    PARSED.insert(input.to_string(), list.clone());
    Ok(list)
}

impl NthPattern {
    pub fn new(a: i32, b: i32) -> Self {
        Self { a, b }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let lowered = compact.to_ascii_lowercase();
        let invalid = || SelectorError::Parse(format!("invalid nth pattern '{input}'"));
        match lowered.as_str() {
            "odd" => return Ok(Self::new(2, 1)),
            "even" => return Ok(Self::new(2, 0)),
            "" => return Err(invalid()),
            _ => {}
        }
        let Some(n_pos) = lowered.find('n') else {
            return lowered.parse().map(|b| Self::new(0, b)).map_err(|_| invalid());
        };
        let a = match &lowered[..n_pos] {
            "" | "+" => 1,
            "-" => -1,
            a_str => a_str.parse().map_err(|_| invalid())?,
        };
        let b = match &lowered[n_pos + 1..] {
            "" => 0,
            b_str if b_str.starts_with('+') || b_str.starts_with('-') => {
                b_str.trim_start_matches('+').parse().map_err(|_| invalid())?
            }
            _ => return Err(invalid()),
        };
        Ok(Self::new(a, b))
    }

    /// `position` is 1-based.
    pub fn matches(&self, position: i32) -> bool {
        if self.a == 0 {
            return position == self.b;
        }
        let diff = position - self.b;
        diff % self.a == 0 && diff / self.a >= 0
    }
}

struct SelectorParser<'a> {
    input: &'a str,
    position: usize,
    current: Option<char>,
}

impl<'a> SelectorParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            position: 0,
            current: input.chars().next(),
        }
    }

    fn parse_list(&mut self) -> Result<SelectorList> {
        let mut selectors = SmallVec::new();
        loop {
            self.skip_whitespace();
            selectors.push(self.parse_complex_selector()?);
            self.skip_whitespace();
            if !self.consume_char(',') {
                break;
            }
        }
        Ok(SelectorList { selectors })
    }

    fn parse_complex_selector(&mut self) -> Result<ComplexSelector> {
        let mut compounds = vec![self.parse_compound_selector()?];
        let mut combinators: Vec<Combinator> = Vec::new();
        while let Some(combinator) = self.parse_combinator() {
            combinators.push(combinator);
            compounds.push(self.parse_compound_selector()?);
        }

        let mut ordered = Vec::with_capacity(compounds.len());
        let mut links = combinators.into_iter().rev();
        for compound in compounds.into_iter().rev() {
            ordered.push((compound, links.next()));
        }
        Ok(ComplexSelector { compounds: ordered })
    }

    fn parse_compound_selector(&mut self) -> Result<CompoundSelector> {
        let mut selector = CompoundSelector::default();

        match self.current {
            Some('*') => {
                self.advance();
                selector.element_name = Some("*".to_string());
            }
            Some(c) if is_name_start(c) => selector.element_name = Some(self.parse_name()?),
            _ => {}
        }

        loop {
            match self.current {
                Some('#') => {
                    self.advance();
                    selector.id = Some(self.parse_name()?);
                }
                Some('.') => {
                    self.advance();
                    selector.classes.push(self.parse_name()?);
                }
                Some('[') => selector.attributes.push(self.parse_attribute()?),
                Some(':') => {
                    self.advance();
                    if self.consume_char(':') {
                        selector.pseudo_element = Some(self.parse_name()?.to_ascii_lowercase());
                    } else {
                        let pseudo = self.parse_pseudo_class()?;
                        match pseudo {
                            Pseudo::Class(class) => selector.pseudo_classes.push(class),
                            Pseudo::LegacyElement(name) => selector.pseudo_element = Some(name),
                        }
                    }
                }
                _ => break,
            }
        }

        if selector.is_empty() {
            return Err(SelectorError::Parse(format!(
                "expected a selector at offset {} of '{}'",
                self.position, self.input
            )));
        }
        Ok(selector)
    }

    fn parse_combinator(&mut self) -> Option<Combinator> {
        let had_whitespace = self.skip_whitespace();
        let combinator = match self.current {
            Some('>') => Combinator::Child,
            Some('+') => Combinator::NextSibling,
            Some('~') => Combinator::SubsequentSibling,
            None | Some(',') | Some(')') => return None,
            Some(_) if had_whitespace => return Some(Combinator::Descendant),
            Some(_) => return None,
        };
        self.advance();
        self.skip_whitespace();
        Some(combinator)
    }

    fn parse_attribute(&mut self) -> Result<AttributeSelector> {
        self.expect_char('[')?;
        self.skip_whitespace();
        let name = self.parse_name()?;
        self.skip_whitespace();

        if self.consume_char(']') {
            return Ok(AttributeSelector {
                name,
                operator: AttributeOperator::Exists,
                value: String::new(),
                case_insensitive: false,
            });
        }

        let operator = match self.current {
            Some('=') => AttributeOperator::Equal,
            Some('~') => AttributeOperator::Includes,
            Some('|') => AttributeOperator::DashMatch,
            Some('^') => AttributeOperator::Prefix,
            Some('$') => AttributeOperator::Suffix,
            Some('*') => AttributeOperator::Substring,
            _ => return Err(SelectorError::Parse("expected attribute operator".to_string())),
        };
        self.advance();
        if operator != AttributeOperator::Equal {
            self.expect_char('=')?;
        }
        self.skip_whitespace();

        let value = match self.current {
            Some('"') | Some('\'') => self.parse_string()?,
            _ => self.parse_name()?,
        };
        self.skip_whitespace();

        let case_insensitive = match self.current {
            Some('i') | Some('I') => {
                self.advance();
                self.skip_whitespace();
                true
            }
            Some('s') | Some('S') => {
                self.advance();
                self.skip_whitespace();
                false
            }
            _ => false,
        };
        self.expect_char(']')?;

        Ok(AttributeSelector {
            name,
            operator,
            value,
            case_insensitive,
        })
    }

    fn parse_pseudo_class(&mut self) -> Result<Pseudo> {
        let name = self.parse_name()?.to_ascii_lowercase();
        let class = match name.as_str() {
            "root" => PseudoClass::Root,
            "scope" => PseudoClass::Scope,
            "empty" => PseudoClass::Empty,
            "first-child" => PseudoClass::FirstChild,
            "last-child" => PseudoClass::LastChild,
            "only-child" => PseudoClass::OnlyChild,
            "first-of-type" => PseudoClass::FirstOfType,
            "last-of-type" => PseudoClass::LastOfType,
            "only-of-type" => PseudoClass::OnlyOfType,
            "link" => PseudoClass::Link,
            "any-link" => PseudoClass::AnyLink,
            "visited" => PseudoClass::Visited,
            "hover" => PseudoClass::Hover,
            "active" => PseudoClass::Active,
            "focus" => PseudoClass::Focus,
            "focus-within" => PseudoClass::FocusWithin,
            "target" => PseudoClass::Target,
            "enabled" => PseudoClass::Enabled,
            "disabled" => PseudoClass::Disabled,
            "checked" => PseudoClass::Checked,
            "required" => PseudoClass::Required,
            "optional" => PseudoClass::Optional,
            "defined" => PseudoClass::Defined,
            "before" | "after" | "first-line" | "first-letter" => {
                return Ok(Pseudo::LegacyElement(name));
            }
            "nth-child" => PseudoClass::NthChild(self.parse_nth_argument()?),
            "nth-last-child" => PseudoClass::NthLastChild(self.parse_nth_argument()?),
            "nth-of-type" => PseudoClass::NthOfType(self.parse_nth_argument()?),
            "nth-last-of-type" => PseudoClass::NthLastOfType(self.parse_nth_argument()?),
            "not" | "is" | "matches" | "where" => {
                self.expect_char('(')?;
                let list = self.parse_list()?;
                self.skip_whitespace();
                self.expect_char(')')?;
                if name == "not" {
                    PseudoClass::Not(list)
                } else {
                    PseudoClass::Is(list)
                }
            }
            "lang" => {
                self.expect_char('(')?;
                self.skip_whitespace();
                let lang = match self.current {
                    Some('"') | Some('\'') => self.parse_string()?,
                    _ => self.parse_name()?,
                };
                self.skip_whitespace();
                self.expect_char(')')?;
                PseudoClass::Lang(lang.to_ascii_lowercase())
            }
            _ => return Err(SelectorError::UnsupportedPseudoClass(name)),
        };
        Ok(Pseudo::Class(class))
    }

    fn parse_nth_argument(&mut self) -> Result<NthPattern> {
        self.expect_char('(')?;
        let start = self.position;
        while !matches!(self.current, Some(')') | None) {
            self.advance();
        }
        let pattern = NthPattern::parse(&self.input[start..self.position])?;
        self.expect_char(')')?;
        Ok(pattern)
    }

    fn parse_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.current {
            if c == '\\' {
                self.advance();
                if let Some(escaped) = self.current {
                    name.push(escaped);
                    self.advance();
                }
            } else if is_name_char(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if name.is_empty() {
            Err(SelectorError::Parse(format!(
                "expected a name at offset {} of '{}'",
                self.position, self.input
            )))
        } else {
            Ok(name)
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        let quote = self
            .current
            .ok_or_else(|| SelectorError::Parse("expected string".to_string()))?;
        self.advance();

        let mut string = String::new();
        while let Some(c) = self.current {
            if c == quote {
                self.advance();
                return Ok(string);
            }
            if c == '\\' {
                self.advance();
                if let Some(escaped) = self.current {
                    string.push(escaped);
                    self.advance();
                }
            } else {
                string.push(c);
                self.advance();
            }
        }
        Err(SelectorError::Parse("unterminated string".to_string()))
    }

    fn advance(&mut self) {
        if let Some(c) = self.current {
            self.position += c.len_utf8();
            self.current = self.input[self.position..].chars().next();
        }
    }

    fn is_at_end(&self) -> bool {
        self.current.is_none()
    }

    /// Returns whether any whitespace was consumed.
    fn skip_whitespace(&mut self) -> bool {
        let start = self.position;
        while matches!(self.current, Some(c) if c.is_ascii_whitespace()) {
            self.advance();
        }
        self.position != start
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.current == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<()> {
        if self.consume_char(expected) {
            Ok(())
        } else {
            Err(SelectorError::Parse(format!(
                "expected '{expected}' at offset {} of '{}'",
                self.position, self.input
            )))
        }
    }
}

enum Pseudo {
    Class(PseudoClass),
    LegacyElement(String),
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '-' || !c.is_ascii()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

struct MatchContext<'a> {
    scope: Option<&'a Element>,
}

impl<'a> MatchContext<'a> {
    fn matches_complex(&self, compounds: &[(CompoundSelector, Option<Combinator>)], element: &Element) -> bool {
        let Some(((compound, combinator), rest)) = compounds.split_first() else {
            return true;
        };
        if !self.matches_compound(compound, element) {
            return false;
        }
        let Some(combinator) = combinator else {
            return true;
        };
        match combinator {
            Combinator::Child => element
                .parent_element()
                .is_some_and(|parent| self.matches_complex(rest, &parent)),
            Combinator::Descendant => {
                let mut ancestor = element.parent_element();
                while let Some(candidate) = ancestor {
                    if self.matches_complex(rest, &candidate) {
                        return true;
                    }
                    ancestor = candidate.parent_element();
                }
                false
            }
            Combinator::NextSibling => element
                .previous_element_sibling()
                .is_some_and(|sibling| self.matches_complex(rest, &sibling)),
            Combinator::SubsequentSibling => {
                let mut sibling = element.previous_element_sibling();
                while let Some(candidate) = sibling {
                    if self.matches_complex(rest, &candidate) {
                        return true;
                    }
                    sibling = candidate.previous_element_sibling();
                }
                false
            }
        }
    }

    fn matches_compound(&self, selector: &CompoundSelector, element: &Element) -> bool {
        // pseudo-elements never match a real element
        if selector.pseudo_element.is_some() {
            return false;
        }
        let html = element.is_html_in_html_document();

        if let Some(name) = selector.element_name.as_deref() {
            if name != "*" {
                let local = element.local_name();
                let matched = if html { local == name.to_ascii_lowercase() } else { local == name };
                if !matched {
                    return false;
                }
            }
        }

        if let Some(id) = selector.id.as_deref() {
            if element.get_attribute("id").as_deref() != Some(id) {
                return false;
            }
        }

        if !selector.classes.is_empty() {
            let class_attr = element.class_name();
            let classes: Vec<&str> = class_attr.split_ascii_whitespace().collect();
            if !selector.classes.iter().all(|class| classes.contains(&class.as_str())) {
                return false;
            }
        }

        selector
            .attributes
            .iter()
            .all(|attribute| matches_attribute(attribute, element, html))
            && selector
                .pseudo_classes
                .iter()
                .all(|pseudo| self.matches_pseudo_class(pseudo, element))
    }

    fn matches_pseudo_class(&self, pseudo: &PseudoClass, element: &Element) -> bool {
        match pseudo {
            PseudoClass::Root => element
                .parent_node()
                .is_some_and(|parent| parent.node_type() == NodeType::Document),
            PseudoClass::Scope => match self.scope {
                Some(scope) => scope == element,
                None => self.matches_pseudo_class(&PseudoClass::Root, element),
            },
            PseudoClass::Empty => element.children_snapshot().iter().all(|child| match child.node_type() {
                NodeType::Comment | NodeType::ProcessingInstruction => true,
                NodeType::Text | NodeType::CDataSection => child.length() == 0,
                _ => false,
            }),
            PseudoClass::FirstChild => element.previous_element_sibling().is_none(),
            PseudoClass::LastChild => element.next_element_sibling().is_none(),
            PseudoClass::OnlyChild => {
                element.previous_element_sibling().is_none() && element.next_element_sibling().is_none()
            }
            PseudoClass::FirstOfType => position_among(element, false, true) == 1,
            PseudoClass::LastOfType => position_among(element, true, true) == 1,
            PseudoClass::OnlyOfType => {
                position_among(element, false, true) == 1 && position_among(element, true, true) == 1
            }
            PseudoClass::NthChild(pattern) => pattern.matches(position_among(element, false, false)),
            PseudoClass::NthLastChild(pattern) => pattern.matches(position_among(element, true, false)),
            PseudoClass::NthOfType(pattern) => pattern.matches(position_among(element, false, true)),
            PseudoClass::NthLastOfType(pattern) => pattern.matches(position_among(element, true, true)),
            PseudoClass::Not(list) => !list
                .selectors
                .iter()
                .any(|selector| self.matches_complex(&selector.compounds, element)),
            PseudoClass::Is(list) => list
                .selectors
                .iter()
                .any(|selector| self.matches_complex(&selector.compounds, element)),
            PseudoClass::Link | PseudoClass::AnyLink => {
                matches!(element.local_name().as_str(), "a" | "area" | "link")
                    && element.is_html()
                    && element.has_attribute("href")
            }
            PseudoClass::Visited | PseudoClass::Hover | PseudoClass::Active => false,
            PseudoClass::Focus => is_focused(element),
            PseudoClass::FocusWithin => element
                .owner_document()
                .and_then(|document| document.active_element())
                .is_some_and(|active| element.contains(&active)),
            PseudoClass::Target => {
                let id = element.id();
                !id.is_empty()
                    && element
                        .owner_document()
                        .is_some_and(|document| document.url_value().fragment() == Some(id.as_str()))
            }
            PseudoClass::Enabled => is_form_control(element) && !element.is_disabled(),
            PseudoClass::Disabled => is_form_control(element) && element.is_disabled(),
            PseudoClass::Checked => match element.local_name().as_str() {
                "input" => {
                    let kind = element.get_attribute("type").unwrap_or_default().to_ascii_lowercase();
                    (kind == "checkbox" || kind == "radio") && element.checked()
                }
                "option" => element.selected(),
                _ => false,
            },
            PseudoClass::Required => {
                is_required_capable(element) && element.has_attribute("required")
            }
            PseudoClass::Optional => {
                is_required_capable(element) && !element.has_attribute("required")
            }
            PseudoClass::Defined => matches!(
                element.custom_element_status(),
                CustomElementStatus::Uncustomized | CustomElementStatus::Custom
            ),
            PseudoClass::Lang(lang) => {
                let declared = element
                    .inclusive_ancestors()
                    .filter_map(|node| node.as_element())
                    .find_map(|ancestor| ancestor.get_attribute("lang"));
                declared.is_some_and(|declared| {
                    let declared = declared.to_ascii_lowercase();
                    declared == *lang || declared.starts_with(&format!("{lang}-"))
                })
            }
        }
    }
}

fn matches_attribute(selector: &AttributeSelector, element: &Element, html: bool) -> bool {
    let name = if html { selector.name.to_ascii_lowercase() } else { selector.name.clone() };
    let Some(actual) = element.get_attribute(&name) else {
        return false;
    };
    let (actual, expected) = if selector.case_insensitive {
        (actual.to_lowercase(), selector.value.to_lowercase())
    } else {
        (actual, selector.value.clone())
    };
    match selector.operator {
        AttributeOperator::Exists => true,
        AttributeOperator::Equal => actual == expected,
        AttributeOperator::Includes => {
            !expected.is_empty() && actual.split_ascii_whitespace().any(|token| token == expected)
        }
        AttributeOperator::DashMatch => actual == expected || actual.starts_with(&format!("{expected}-")),
        AttributeOperator::Prefix => !expected.is_empty() && actual.starts_with(&expected),
        AttributeOperator::Suffix => !expected.is_empty() && actual.ends_with(&expected),
        AttributeOperator::Substring => !expected.is_empty() && actual.contains(&expected),
    }
}

/// 1-based position among element siblings, counted from the end when
/// `from_end`, only counting same-named siblings when `of_type`.
fn position_among(element: &Element, from_end: bool, of_type: bool) -> i32 {
    let local = element.local_name();
    let mut position = 1;
    let mut sibling = if from_end { element.next_element_sibling() } else { element.previous_element_sibling() };
    while let Some(candidate) = sibling {
        if !of_type || candidate.local_name() == local {
            position += 1;
        }
        sibling = if from_end { candidate.next_element_sibling() } else { candidate.previous_element_sibling() };
    }
    position
}

fn is_focused(element: &Element) -> bool {
    element
        .owner_document()
        .and_then(|document| document.active_element())
        .is_some_and(|active| active == *element)
}

fn is_form_control(element: &Element) -> bool {
    element.is_html()
        && matches!(
            element.local_name().as_str(),
            "button" | "input" | "select" | "textarea" | "optgroup" | "option" | "fieldset"
        )
}

fn is_required_capable(element: &Element) -> bool {
    element.is_html() && matches!(element.local_name().as_str(), "input" | "select" | "textarea")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dom::Document;

    fn fixture() -> (Document, Element) {
        let doc = Document::new();
        let root = doc.create_element("div").unwrap();
        root.set_inner_html(
            "<ul id=\"list\"><li class=\"a\">1</li><li class=\"a b\" data-x=\"en-US\">2</li><li>3</li></ul>\
             <p lang=\"en\"><span>x</span></p><input type=\"checkbox\" checked>",
        )
        .unwrap();
        doc.body().unwrap().append_child(&root).unwrap();
        (doc, root)
    }

    fn count(root: &Element, selector: &str) -> usize {
        root.query_selector_all(selector).unwrap().length()
    }

    #[test]
    fn combinators_match_right_to_left() {
        let (_doc, root) = fixture();
        assert_eq!(count(&root, "ul > li"), 3);
        assert_eq!(count(&root, "div li.a"), 2);
        assert_eq!(count(&root, "li.a + li"), 2);
        assert_eq!(count(&root, "li.b ~ li"), 1);
        assert_eq!(count(&root, "ul>li:not(.a)"), 1);
        assert_eq!(count(&root, "p span, #list"), 2);
    }

    #[test]
    fn structural_pseudo_classes() {
        let (_doc, root) = fixture();
        assert_eq!(root.query_selector("li:nth-child(2)").unwrap().unwrap().text_content().as_deref(), Some("2"));
        assert_eq!(count(&root, "li:nth-child(odd)"), 2);
        assert_eq!(count(&root, "li:nth-child(-n+2)"), 2);
        assert_eq!(count(&root, "li:last-child"), 1);
        assert_eq!(count(&root, "span:only-child"), 1);
        assert_eq!(count(&root, ":checked"), 1);
        assert_eq!(count(&root, "span:lang(en)"), 1);
    }

    #[test]
    fn attribute_operators() {
        let (_doc, root) = fixture();
        assert_eq!(count(&root, "[data-x]"), 1);
        assert_eq!(count(&root, "[data-x|=en]"), 1);
        assert_eq!(count(&root, "[data-x^='en']"), 1);
        assert_eq!(count(&root, "[data-x$=us i]"), 1);
        assert_eq!(count(&root, "[class~=b]"), 1);
    }

    #[test]
    fn scope_and_closest() {
        let (doc, root) = fixture();
        assert_eq!(count(&root, ":scope > ul"), 1);
        let span = doc.query_selector("span").unwrap().unwrap();
        assert_eq!(span.closest("p").unwrap().unwrap().local_name(), "p");
        assert!(span.closest("ul").unwrap().is_none());
        assert!(doc.query_selector(":root").unwrap().unwrap().has_local_name("html"));
    }

    #[test]
    fn invalid_selectors_are_syntax_errors() {
        let (doc, _) = fixture();
        for bad in ["", "div >", "[x", "::", "a:unknown", "div $"] {
            let err = doc.query_selector(bad).unwrap_err();
            assert_eq!(err.name(), "SyntaxError", "{bad}");
        }
    }

    #[test]
    fn nth_patterns_parse() {
        assert_eq!(NthPattern::parse("2n+1").unwrap(), NthPattern::new(2, 1));
        assert_eq!(NthPattern::parse(" -n + 3 ").unwrap(), NthPattern::new(-1, 3));
        assert_eq!(NthPattern::parse("5").unwrap(), NthPattern::new(0, 5));
        assert!(NthPattern::parse("n2").is_err());
        assert!(NthPattern::new(-1, 3).matches(3));
        assert!(!NthPattern::new(-1, 3).matches(4));
    }
}
