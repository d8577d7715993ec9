//! Tolerant markup parser for served page templates
//!
//! Backend templates are HTML mixed with Handlebars expressions, which show up
//! in places no HTML parser accepts (inside attribute lists, as attribute names
//! such as `{{/if}}`). Every `{{ ... }}` expression is swapped for an opaque
//! placeholder before tokenizing and swapped back when serializing.
//!
//! Nodes live in a single arena and refer to each other by index. Parsed nodes
//! remember their source text, so a document that was not edited serializes
//! back to exactly the input.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Template expressions, longest form first. Stray placeholder delimiters in
/// the input are masked too, so they come back verbatim.
static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{\{.*?\}\}\}|\{\{.*?\}\}|[\x{E000}\x{E001}]").expect("valid expression regex")
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{E000}([0-9]+)\u{E001}").expect("valid placeholder regex"));

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

pub type NodeId = usize;

/// The document root is always the first node in the arena
pub const ROOT: NodeId = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    tag: String,
    attrs: Vec<(String, Option<String>)>,
    self_closing: bool,
    start_raw: Option<String>,
    end_raw: Option<String>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            self_closing: false,
            start_raw: None,
            end_raw: None,
        }
    }

    /// Lowercased tag name
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attrs(&self) -> &[(String, Option<String>)] {
        &self.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_deref().unwrap_or(""))
    }

    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    /// Set or add an attribute. The start tag is rebuilt on output.
    pub fn set_attr(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.attrs.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
        self.start_raw = None;
    }

    fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.tag.as_str())
    }

    fn write_start(&self, out: &mut String) {
        if let Some(raw) = &self.start_raw {
            out.push_str(raw);
            return;
        }
        out.push('<');
        out.push_str(&self.tag);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            if let Some(value) = value {
                out.push_str("=\"");
                out.push_str(&value.replace('"', "&quot;"));
                out.push('"');
            }
        }
        out.push_str(if self.self_closing { " />" } else { ">" });
    }

    fn write_end(&self, out: &mut String) {
        if let Some(raw) = &self.end_raw {
            out.push_str(raw);
        } else if self.start_raw.is_none() && !self.self_closing && !self.is_void() {
            out.push_str("</");
            out.push_str(&self.tag);
            out.push('>');
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Root,
    Element(Element),
    Text(String),
    /// Full source text including the `<!--` `-->` delimiters
    Comment(String),
    /// Doctype or processing instruction, full source text
    Declaration(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    expressions: Vec<String>,
}

struct StartTag {
    element: Element,
    end: usize,
}

fn is_space(b: u8) -> bool {
    b.is_ascii_whitespace()
}

fn skip_space(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && is_space(bytes[i]) {
        i += 1;
    }
    i
}

/// Parse `<tag attr=value ...>` starting at the `<`. None when the tag never closes.
fn parse_start_tag(src: &str, start: usize) -> Option<StartTag> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && !is_space(bytes[i]) && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let mut element = Element::new(&src[start + 1..i]);

    loop {
        i = skip_space(bytes, i);
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'>' => {
                i += 1;
                break;
            }
            b'/' if bytes.get(i + 1) == Some(&b'>') => {
                element.self_closing = true;
                i += 2;
                break;
            }
            _ => {}
        }

        // A '/' not closing the tag is template debris and belongs to the name
        let name_start = i;
        while i < bytes.len() {
            let b = bytes[i];
            if is_space(b) || b == b'=' || b == b'>' || (b == b'/' && bytes.get(i + 1) == Some(&b'>')) {
                break;
            }
            i += 1;
        }
        if i == name_start {
            // Stray '=' with no name
            i += 1;
            continue;
        }
        let name = src[name_start..i].to_string();

        let after_name = skip_space(bytes, i);
        if bytes.get(after_name) != Some(&b'=') {
            element.attrs.push((name, None));
            continue;
        }
        i = skip_space(bytes, after_name + 1);
        let value = match bytes.get(i) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                let close = src[i + 1..].find(quote as char)? + i + 1;
                let value = src[i + 1..close].to_string();
                i = close + 1;
                value
            }
            Some(_) => {
                let value_start = i;
                while i < bytes.len() && !is_space(bytes[i]) && bytes[i] != b'>' {
                    i += 1;
                }
                src[value_start..i].to_string()
            }
            None => return None,
        };
        element.attrs.push((name, Some(value)));
    }

    element.start_raw = Some(src[start..i].to_string());
    Some(StartTag { element, end: i })
}

/// Position just past `</name ...>` starting at the `<`, with the lowercased name
fn parse_end_tag(src: &str, start: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    let name_start = start + 2;
    let mut i = name_start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-' || bytes[i] == b':') {
        i += 1;
    }
    if i == name_start {
        return None;
    }
    let close = src[i..].find('>')? + i;
    Some((src[name_start..i].to_ascii_lowercase(), close + 1))
}

fn starts_tag(bytes: &[u8], i: usize) -> bool {
    bytes.get(i + 1).is_some_and(u8::is_ascii_alphabetic)
}

impl Document {
    fn empty() -> Self {
        Self {
            nodes: vec![Node {
                data: NodeData::Root,
                parent: None,
                children: Vec::new(),
            }],
            expressions: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Self {
        let mut doc = Self::empty();

        let mut masked = String::with_capacity(input.len());
        let mut last = 0;
        for found in EXPRESSION.find_iter(input) {
            masked.push_str(&input[last..found.start()]);
            masked.push('\u{E000}');
            masked.push_str(&doc.expressions.len().to_string());
            masked.push('\u{E001}');
            doc.expressions.push(found.as_str().to_string());
            last = found.end();
        }
        masked.push_str(&input[last..]);

        doc.build(&masked);
        doc
    }

    fn build(&mut self, src: &str) {
        let bytes = src.as_bytes();
        let mut stack = vec![ROOT];
        let mut i = 0;

        while i < bytes.len() {
            let parent = *stack.last().unwrap_or(&ROOT);

            if bytes[i] != b'<' {
                let end = src[i..].find('<').map_or(src.len(), |offset| i + offset);
                self.push_text(parent, &src[i..end]);
                i = end;
                continue;
            }

            if src[i..].starts_with("<!--") {
                let end = src[i + 4..].find("-->").map_or(src.len(), |offset| i + 4 + offset + 3);
                self.push_node(parent, NodeData::Comment(src[i..end].to_string()));
                i = end;
                continue;
            }

            if src[i..].starts_with("<!") || src[i..].starts_with("<?") {
                let end = src[i..].find('>').map_or(src.len(), |offset| i + offset + 1);
                self.push_node(parent, NodeData::Declaration(src[i..end].to_string()));
                i = end;
                continue;
            }

            if src[i..].starts_with("</") {
                let closed = parse_end_tag(src, i).and_then(|(name, end)| {
                    let depth = stack.iter().rposition(|id| {
                        *id != ROOT && self.element(*id).is_some_and(|e| e.tag == name)
                    })?;
                    Some((depth, end))
                });
                match closed {
                    Some((depth, end)) => {
                        let id = stack[depth];
                        if let NodeData::Element(element) = &mut self.nodes[id].data {
                            element.end_raw = Some(src[i..end].to_string());
                        }
                        stack.truncate(depth);
                        i = end;
                    }
                    None => {
                        // Unmatched end tag stays in the output as text
                        let end = src[i + 1..].find('<').map_or(src.len(), |offset| i + 1 + offset);
                        self.push_text(parent, &src[i..end]);
                        i = end;
                    }
                }
                continue;
            }

            if !starts_tag(bytes, i) {
                let end = src[i + 1..].find('<').map_or(src.len(), |offset| i + 1 + offset);
                self.push_text(parent, &src[i..end]);
                i = end;
                continue;
            }

            let Some(tag) = parse_start_tag(src, i) else {
                self.push_text(parent, &src[i..]);
                break;
            };
            let StartTag { element, end } = tag;
            let name = element.tag.clone();
            let leaf = element.self_closing || element.is_void();
            let id = self.push_node(parent, NodeData::Element(element));
            i = end;

            if leaf {
                continue;
            }
            if RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
                let closing = format!("</{name}");
                let lower = src[i..].to_ascii_lowercase();
                let content_end = lower.find(&closing).map_or(src.len(), |offset| i + offset);
                if content_end > i {
                    self.push_text(id, &src[i..content_end]);
                }
                i = content_end;
                if let Some((_, end)) = parse_end_tag(src, content_end) {
                    if let NodeData::Element(element) = &mut self.nodes[id].data {
                        element.end_raw = Some(src[content_end..end].to_string());
                    }
                    i = end;
                }
                continue;
            }
            stack.push(id);
        }
    }

    fn push_node(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            data,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    fn push_text(&mut self, parent: NodeId, text: &str) {
        if let Some(&last) = self.nodes[parent].children.last() {
            if let NodeData::Text(existing) = &mut self.nodes[last].data {
                existing.push_str(text);
                return;
            }
        }
        self.push_node(parent, NodeData::Text(text.to_string()));
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id].data
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes.get(id)?.data {
            NodeData::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(id)?.data {
            NodeData::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Detach every child of `id`
    pub fn clear_children(&mut self, id: NodeId) {
        for child in std::mem::take(&mut self.nodes[id].children) {
            self.nodes[child].parent = None;
        }
    }

    /// Move `child` to the end of `parent`'s children
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(old) = self.nodes[child].parent.take() {
            self.nodes[old].children.retain(|id| *id != child);
        }
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Create a detached element
    pub fn create_element(&mut self, element: Element) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            data: NodeData::Element(element),
            parent: None,
            children: Vec::new(),
        });
        id
    }

    /// Deep-copy `node` from `other` into this arena, detached.
    /// The copy carries `other`'s template expressions as literal text.
    pub fn import(&mut self, other: &Document, node: NodeId) -> NodeId {
        let data = match &other.nodes[node].data {
            NodeData::Root => NodeData::Root,
            NodeData::Element(element) => NodeData::Element(Element {
                tag: element.tag.clone(),
                attrs: element
                    .attrs
                    .iter()
                    .map(|(key, value)| (other.restore(key), value.as_deref().map(|v| other.restore(v))))
                    .collect(),
                self_closing: element.self_closing,
                start_raw: element.start_raw.as_deref().map(|raw| other.restore(raw)),
                end_raw: element.end_raw.clone(),
            }),
            NodeData::Text(text) => NodeData::Text(other.restore(text)),
            NodeData::Comment(text) => NodeData::Comment(other.restore(text)),
            NodeData::Declaration(text) => NodeData::Declaration(other.restore(text)),
        };
        let id = self.nodes.len();
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        for child in &other.nodes[node].children {
            let copy = self.import(other, *child);
            self.append_child(id, copy);
        }
        id
    }

    /// Append copies of all top-level nodes of `fragment` under `parent`
    pub fn append_fragment(&mut self, parent: NodeId, fragment: &Document) {
        for child in fragment.children(ROOT).to_vec() {
            let copy = self.import(fragment, child);
            self.append_child(parent, copy);
        }
    }

    /// Elements below `from` named `tag` whose attributes contain every
    /// `(name, needle)` pair as a substring, in document order.
    /// Direct children of `from` are at depth 1.
    pub fn search(
        &self,
        from: NodeId,
        tag: &str,
        attrs: &[(&str, &str)],
        limit: Option<usize>,
        max_depth: Option<usize>,
    ) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut pending: Vec<(NodeId, usize)> =
            self.nodes[from].children.iter().rev().map(|id| (*id, 1)).collect();

        while let Some((id, depth)) = pending.pop() {
            if max_depth.is_some_and(|max| depth > max) {
                continue;
            }
            if let Some(element) = self.element(id) {
                let matches = element.tag.eq_ignore_ascii_case(tag)
                    && attrs.iter().all(|(name, needle)| {
                        element.attr(name).is_some_and(|value| value.contains(needle))
                    });
                if matches {
                    found.push(id);
                    if limit.is_some_and(|limit| found.len() >= limit) {
                        break;
                    }
                }
            }
            pending.extend(self.nodes[id].children.iter().rev().map(|child| (*child, depth + 1)));
        }
        found
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        match &node.data {
            NodeData::Root => {
                for child in &node.children {
                    self.write_node(*child, out);
                }
            }
            NodeData::Element(element) => {
                element.write_start(out);
                for child in &node.children {
                    self.write_node(*child, out);
                }
                element.write_end(out);
            }
            NodeData::Text(text) | NodeData::Comment(text) | NodeData::Declaration(text) => {
                out.push_str(text)
            }
        }
    }

    fn restore(&self, masked: &str) -> String {
        PLACEHOLDER
            .replace_all(masked, |caps: &regex::Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| self.expressions.get(index))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Serialize one node and its subtree
    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        self.restore(&out)
    }

    /// Serialize the children of one node
    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in &self.nodes[id].children {
            self.write_node(*child, &mut out);
        }
        self.restore(&out)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.outer_html(ROOT))
    }
}
