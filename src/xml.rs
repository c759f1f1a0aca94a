//! Mutable XML tree for the server directory document.
//!
//! The tree keeps every node kind the directory can carry (CDATA sections,
//! comments, processing instructions, the XML declaration) so that a parse
//! followed by a serialize reproduces the document structurally, including
//! elements and attributes this crate knows nothing about.

use crate::error::{ProxyError, Result};
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

/// A single node in the document tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    /// Character data, stored unescaped.
    Text(String),
    /// Character data whose entity references could not be resolved, kept
    /// exactly as it appeared in the source.
    RawText(String),
    /// A `<![CDATA[...]]>` section.
    CData(String),
    Comment(String),
    /// Processing instruction body, without the `<?` `?>` delimiters.
    ProcessingInstruction(String),
    /// XML declaration body, e.g. `xml version="1.0" encoding="UTF-8"`.
    Declaration(String),
    DocType(String),
}

impl Node {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }
}

/// An attribute in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// An element with owned attributes and children.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
    /// Written as `<name/>` while it has no children.
    self_closing: bool,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: true,
        }
    }

    /// Looks up an attribute value by name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Replaces the value of an attribute that is already present.
    ///
    /// Returns `false` (and adds nothing) if the attribute does not exist.
    pub fn set_existing_attribute(&mut self, name: &str, value: &str) -> bool {
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => {
                attr.value = value.to_string();
                true
            }
            None => false,
        }
    }

    /// Iterates over child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    /// Iterates mutably over child elements.
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(Node::as_element_mut)
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenated text and CDATA content of all descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    /// Replaces all children with a single text node.
    pub fn set_text(&mut self, value: &str) {
        self.children.clear();
        if !value.is_empty() {
            self.children.push(Node::Text(value.to_string()));
        }
    }

    /// Content of the first CDATA section directly under this element.
    pub fn cdata(&self) -> Option<&str> {
        self.children.iter().find_map(|n| match n {
            Node::CData(data) => Some(data.as_str()),
            _ => None,
        })
    }

    /// Mutable access to the first CDATA section directly under this element.
    pub fn cdata_mut(&mut self) -> Option<&mut String> {
        self.children.iter_mut().find_map(|n| match n {
            Node::CData(data) => Some(data),
            _ => None,
        })
    }

    pub fn append_child(&mut self, node: Node) {
        self.children.push(node);
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.name);
            out.push_str("=\"");
            out.push_str(&escape_attribute(&attr.value));
            out.push('"');
        }

        if self.children.is_empty() && self.self_closing {
            out.push_str("/>");
            return;
        }

        out.push('>');
        write_nodes(&self.children, out);
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) | Node::RawText(t) | Node::CData(t) => out.push_str(t),
            Node::Element(e) => collect_text(&e.children, out),
            _ => {}
        }
    }
}

/// Deep-clones the element at `index` and appends the copy to the same
/// sibling list. The original is left untouched; the returned reference
/// points at the copy.
pub fn duplicate_as_sibling(siblings: &mut Vec<Node>, index: usize) -> Option<&mut Element> {
    let copy = siblings.get(index)?.as_element()?.clone();
    siblings.push(Node::Element(copy));
    siblings.last_mut().and_then(Node::as_element_mut)
}

/// A parsed directory document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    /// Top-level nodes: declaration, comments, whitespace and the root element.
    pub nodes: Vec<Node>,
}

impl Document {
    /// The document element.
    pub fn root(&self) -> Option<&Element> {
        self.nodes.iter().find_map(Node::as_element)
    }

    /// All elements with the given name, in document order.
    pub fn elements_named<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        fn walk<'a>(nodes: &'a [Node], name: &str, out: &mut Vec<&'a Element>) {
            for node in nodes {
                if let Node::Element(e) = node {
                    if e.name == name {
                        out.push(e);
                    }
                    walk(&e.children, name, out);
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.nodes, name, &mut out);
        out
    }

    /// Renders the document back to XML bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        write_nodes(&self.nodes, &mut out);
        out.into_bytes()
    }
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Element(e) => e.write_to(out),
            Node::Text(t) => out.push_str(&partial_escape(t)),
            Node::RawText(t) => out.push_str(t),
            Node::CData(data) => {
                // `]]>` cannot appear inside a section; split it across two.
                out.push_str("<![CDATA[");
                out.push_str(&data.replace("]]>", "]]]]><![CDATA[>"));
                out.push_str("]]>");
            }
            Node::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            Node::ProcessingInstruction(pi) | Node::Declaration(pi) => {
                out.push_str("<?");
                out.push_str(pi);
                out.push_str("?>");
            }
            Node::DocType(d) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(d);
                out.push('>');
            }
        }
    }
}

/// Escapes an attribute value. Literal whitespace other than a space would
/// be normalized away by the reading parser, so it is written as character
/// references.
fn escape_attribute(value: &str) -> String {
    let escaped = escape(value);
    if !escaped.contains(['\t', '\n', '\r']) {
        return escaped.into_owned();
    }

    let mut out = String::with_capacity(escaped.len() + 8);
    for ch in escaped.chars() {
        match ch {
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Parses a directory document.
///
/// Recoverable oddities are logged as warnings and parsing continues.
/// Malformed markup, unbalanced tags, truncated input and invalid UTF-8
/// abort with [`ProxyError::XmlParse`].
pub fn parse(bytes: &[u8]) -> Result<Document> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    // Open elements, innermost last.
    let mut stack: Vec<Element> = Vec::new();
    let mut top: Vec<Node> = Vec::new();
    let mut roots = 0usize;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event()
            .map_err(|e| ProxyError::xml_parse(position, e.to_string()))?;

        let node = match event {
            Event::Start(start) => {
                let mut element = element_from(&start, position)?;
                element.self_closing = false;
                stack.push(element);
                continue;
            }
            Event::Empty(start) => Node::Element(element_from(&start, position)?),
            Event::End(end) => {
                let name = utf8(end.name().as_ref(), position)?;
                let element = match stack.pop() {
                    Some(element) if element.name == name => element,
                    Some(element) => {
                        return Err(ProxyError::xml_parse(
                            position,
                            format!("expected </{}>, found </{}>", element.name, name),
                        ))
                    }
                    None => {
                        return Err(ProxyError::xml_parse(
                            position,
                            format!("unmatched closing tag </{}>", name),
                        ))
                    }
                };
                Node::Element(element)
            }
            Event::Text(text) => match text.unescape() {
                Ok(value) => Node::Text(value.into_owned()),
                Err(e) => {
                    warn!(position, error = %e, "xml parser warning: keeping text unescaped");
                    Node::RawText(utf8(&text, position)?)
                }
            },
            Event::CData(data) => Node::CData(utf8(&data, position)?),
            Event::Comment(comment) => Node::Comment(utf8(&comment, position)?),
            Event::Decl(decl) => Node::Declaration(utf8(&decl, position)?),
            Event::PI(pi) => Node::ProcessingInstruction(utf8(&pi, position)?),
            Event::DocType(doctype) => Node::DocType(utf8(&doctype, position)?),
            Event::Eof => break,
            #[allow(unreachable_patterns)]
            _ => continue,
        };

        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => {
                match &node {
                    Node::Element(_) => {
                        roots += 1;
                        if roots > 1 {
                            warn!(position, "xml parser warning: multiple root elements");
                        }
                    }
                    Node::Text(t) | Node::RawText(t) if !t.trim().is_empty() => {
                        warn!(position, "xml parser warning: text outside the root element");
                    }
                    _ => {}
                }
                top.push(node);
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(ProxyError::xml_parse(
            reader.buffer_position() as u64,
            format!("unexpected end of document inside <{}>", open.name),
        ));
    }
    if roots == 0 {
        return Err(ProxyError::xml_parse(0, "document has no root element"));
    }

    Ok(Document { nodes: top })
}

fn element_from(start: &BytesStart<'_>, position: u64) -> Result<Element> {
    let mut element = Element::new(utf8(start.name().as_ref(), position)?);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ProxyError::xml_parse(position, e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| ProxyError::xml_parse(position, e.to_string()))?;
        element.attributes.push(Attribute {
            name: utf8(attr.key.as_ref(), position)?,
            value: value.into_owned(),
        });
    }
    Ok(element)
}

fn utf8(bytes: &[u8], position: u64) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ProxyError::xml_parse(position, format!("invalid UTF-8: {}", e)))
}
