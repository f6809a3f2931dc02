//! The script-created parser behind `document.open()`, `write()` and `close()`.
//!
//! Each write parses only the markup it completes and inserts the result at
//! the stream's insertion point, so nodes from earlier writes stay where they
//! are. A tag cut by a write boundary, or a raw-text element whose end tag has
//! not arrived yet, waits for the next write. Elements a write leaves open
//! become the insertion point of the next one.

use super::behavior::ScriptState;
use super::node::{Node, WeakNode};
use super::{mutation, parser, Result};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title", "xmp", "noscript"];

#[derive(Debug, Default)]
pub(crate) struct WriteStream {
    pending: String,
    insertion: Option<WeakNode>,
}

impl WriteStream {
    pub(crate) fn new(insertion: Option<&Node>) -> Self {
        WriteStream { pending: String::new(), insertion: insertion.map(Node::downgrade) }
    }

    pub(crate) fn push(&mut self, markup: &str) {
        self.pending.push_str(markup);
    }

    /// Removes and returns the complete prefix of the pending markup, or all
    /// of it when `flush` is set.
    pub(crate) fn take_ready(&mut self, flush: bool) -> String {
        let complete = if flush { self.pending.len() } else { scan(&self.pending).1 };
        self.pending.drain(..complete).collect()
    }

    pub(crate) fn insertion(&self) -> Option<Node> {
        self.insertion.as_ref().and_then(WeakNode::upgrade)
    }

    pub(crate) fn set_insertion(&mut self, node: &Node) {
        self.insertion = Some(node.downgrade());
    }
}

#[derive(Debug, PartialEq)]
enum Tag {
    Open { name: String, closed: bool },
    Close(String),
}

#[derive(Debug)]
struct ScannedTag {
    tag: Tag,
    start: usize,
    end: usize,
}

/// Start and end tags of `markup` outside comments and raw text, and the
/// length of the prefix that can be parsed without seeing more input.
fn scan(markup: &str) -> (Vec<ScannedTag>, usize) {
    let mut tags = Vec::new();
    let mut pos = 0;
    while let Some(offset) = markup[pos..].find('<') {
        let start = pos + offset;
        let rest = &markup[start..];
        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => {
                    pos = start + end + 3;
                    continue;
                }
                None => return (tags, start),
            }
        }
        let Some(next) = rest[1..].chars().next() else {
            return (tags, start);
        };
        if !(next.is_ascii_alphabetic() || matches!(next, '/' | '!' | '?')) {
            // a bare `<` is text
            pos = start + 1;
            continue;
        }
        let Some(close) = tag_end(rest) else {
            return (tags, start);
        };
        let end = start + close + 1;
        let body = &markup[start + 1..end - 1];
        if let Some(name) = body.strip_prefix('/') {
            tags.push(ScannedTag { tag: Tag::Close(tag_name(name)), start, end });
        } else if next.is_ascii_alphabetic() {
            let name = tag_name(body);
            let self_closing = body.trim_end().ends_with('/');
            if RAW_TEXT_ELEMENTS.contains(&name.as_str()) && !self_closing {
                let Some(text_len) = markup[end..].to_ascii_lowercase().find(&format!("</{name}"))
                else {
                    return (tags, start);
                };
                let end_tag = end + text_len;
                let Some(end_tag_len) = tag_end(&markup[end_tag..]) else {
                    return (tags, start);
                };
                pos = end_tag + end_tag_len + 1;
                tags.push(ScannedTag { tag: Tag::Open { name, closed: true }, start, end: pos });
                continue;
            }
            let closed = self_closing || VOID_ELEMENTS.contains(&name.as_str());
            tags.push(ScannedTag { tag: Tag::Open { name, closed }, start, end });
        }
        pos = end;
    }
    (tags, markup.len())
}

/// Offset of the `>` ending the tag that starts `tag`, skipping quoted
/// attribute values.
fn tag_end(tag: &str) -> Option<usize> {
    let mut quote = None;
    for (index, c) in tag.char_indices().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '>' => return Some(index),
            None => {}
        }
    }
    None
}

fn tag_name(body: &str) -> String {
    body.split(|c: char| c.is_ascii_whitespace() || c == '/' || c == '>')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Parses `markup` and inserts it at `insertion`, returning the insertion
/// point for the markup that follows.
pub(crate) fn insert_markup(insertion: Node, markup: &str) -> Result<Node> {
    let (tags, _) = scan(markup);
    let mut target = insertion;
    let mut open: Vec<String> = Vec::new();
    let mut segment_start = 0;
    for scanned in &tags {
        match &scanned.tag {
            Tag::Open { name, closed } => {
                if !closed {
                    open.push(name.clone());
                }
            }
            Tag::Close(name) => {
                if let Some(index) = open.iter().rposition(|n| n == name) {
                    open.truncate(index);
                    continue;
                }
                // ends an element left open by an earlier write
                let Some(parent) = open_ancestor(&target, name).and_then(|n| n.parent_node())
                else {
                    continue;
                };
                insert_segment(&target, &markup[segment_start..scanned.start])?;
                open.clear();
                segment_start = scanned.end;
                target = parent;
            }
        }
    }
    let inserted = insert_segment(&target, &markup[segment_start..])?;
    Ok(descend(&inserted, &open).unwrap_or(target))
}

/// The closest inclusive ancestor of `node` named `name`, below `<body>`.
fn open_ancestor(node: &Node, name: &str) -> Option<Node> {
    let mut current = Some(node.clone());
    while let Some(node) = current {
        let element = node.as_element()?;
        if element.has_local_name("body") || element.has_local_name("html") {
            return None;
        }
        if element.local_name() == name {
            return Some(node);
        }
        current = node.parent_node();
    }
    None
}

/// Follows the last element children of `nodes` while they match the still
/// open tag names.
fn descend(nodes: &[Node], open: &[String]) -> Option<Node> {
    let mut candidates = nodes.to_vec();
    let mut deepest = None;
    for name in open {
        let Some(element) = candidates.iter().rev().find_map(Node::as_element) else {
            break;
        };
        if element.local_name() != *name {
            break;
        }
        candidates = element.as_node().children_snapshot();
        deepest = Some(element.as_node().clone());
    }
    deepest
}

fn insert_segment(target: &Node, markup: &str) -> Result<Vec<Node>> {
    let Some(context) = target.as_element() else {
        return Ok(Vec::new());
    };
    if markup.is_empty() {
        return Ok(Vec::new());
    }
    let fragment = parser::parse_fragment(&context, markup)?;
    let nodes = fragment.children_snapshot();
    for node in &nodes {
        arm_scripts(node);
    }
    mutation::pre_insert(&fragment, target, None)?;
    Ok(nodes)
}

/// Fragment parsing marks scripts as already started; written scripts run
/// when they are inserted.
fn arm_scripts(node: &Node) {
    if let Some(element) = node.as_element() {
        if element.has_local_name("script") {
            element.element_data_mut(|data| data.script = ScriptState::default());
        }
    }
    for child in node.children_snapshot() {
        arm_scripts(&child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn incomplete_tags_are_held_back() {
        assert_eq!(scan("<p>one</p><di").1, "<p>one</p>".len());
        assert_eq!(scan("<p title=\"a>b").1, 0);
        assert_eq!(scan("<!-- open").1, 0);
        assert_eq!(scan("a < b").1, "a < b".len());
    }

    #[test]
    fn raw_text_waits_for_its_end_tag() {
        assert_eq!(scan("<p>x</p><script>if (a <b) {").1, "<p>x</p>".len());
        let (tags, complete) = scan("<script>a</p></script><br>");
        assert_eq!(complete, "<script>a</p></script><br>".len());
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag, Tag::Open { name: "script".into(), closed: true });
        assert_eq!(tags[1].tag, Tag::Open { name: "br".into(), closed: true });
    }

    #[test]
    fn end_tags_are_named_in_lowercase() {
        let (tags, _) = scan("<DIV class=x></Div >");
        assert_eq!(tags[0].tag, Tag::Open { name: "div".into(), closed: false });
        assert_eq!(tags[1].tag, Tag::Close("div".into()));
    }
}
