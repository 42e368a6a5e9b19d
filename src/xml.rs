//! Namespace-aware XML element tree.
//!
//! Tokenization is delegated to quick-xml: this module only consumes its
//! push events (start / text / end) to assemble an [`Element`], and renders
//! an element back to markup. Stanzas are parsed one at a time after the
//! framing layer has cut them out of the stream, so the stream-level scope
//! (`jabber:client` default namespace, `stream:` prefix) is implied.

use std::collections::HashMap;
use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::ns;

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its namespace resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

/// Namespace declarations in scope while parsing.
#[derive(Debug, Clone)]
struct Scope {
    default_ns: String,
    prefixes: HashMap<String, String>,
}

impl Scope {
    fn root(default_ns: &str) -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("stream".to_string(), ns::STREAMS.to_string());
        prefixes.insert("xml".to_string(), ns::XML.to_string());
        Self {
            default_ns: default_ns.to_string(),
            prefixes,
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Xml(format!("invalid UTF-8: {}", e)))
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Parse a single element, assuming the `jabber:client` stream scope.
    pub fn parse(xml: &str) -> Result<Element> {
        Self::parse_in(xml, ns::CLIENT)
    }

    /// Parse a single element with `default_ns` as the inherited default namespace.
    pub fn parse_in(xml: &str, default_ns: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = true;

        let root = Scope::root(default_ns);
        let mut stack: Vec<(Element, Scope)> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let parent = stack.last().map(|(_, scope)| scope).unwrap_or(&root);
                    let opened = open_element(&e, parent)?;
                    stack.push(opened);
                }
                Event::Empty(e) => {
                    let parent = stack.last().map(|(_, scope)| scope).unwrap_or(&root);
                    let (element, _) = open_element(&e, parent)?;
                    if let Some(done) = attach(&mut stack, element) {
                        return Ok(done);
                    }
                }
                Event::End(_) => {
                    let (element, _) = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced closing tag".to_string()))?;
                    if let Some(done) = attach(&mut stack, element) {
                        return Ok(done);
                    }
                }
                Event::Text(t) => {
                    // Whitespace around the root element is not content
                    if let Some((top, _)) = stack.last_mut() {
                        let text = t.unescape()?;
                        top.append_text(text.as_ref());
                    }
                }
                Event::CData(c) => {
                    if let Some((top, _)) = stack.last_mut() {
                        let raw = c.into_inner();
                        top.append_text(utf8(&raw)?);
                    }
                }
                Event::Eof => {
                    return Err(Error::Xml("unexpected end of element".to_string()));
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True if this element has the given local name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Sets the attribute only when a value is present.
    pub fn with_opt_attr(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.with_attr(key, value),
            None => self,
        }
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.append_child(child);
        self
    }

    pub fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.children.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(text),
            _ => self.children.push(Node::Text(text.to_string())),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.append_text(text);
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping text.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, namespace))
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Render as markup in the `jabber:client` stream scope.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, ns::CLIENT);
        out
    }

    fn write_xml(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace != parent_ns {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.namespace.as_str()));
            out.push('\'');
        }
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_xml(out, &self.namespace),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn open_element(start: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope)> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?.to_string();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            scope.default_ns = value;
            continue;
        }
        if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.insert(prefix.to_string(), value.clone());
        }
        attrs.push((key, value));
    }

    // A prefixed attribute carries its declaration, so the element renders
    // correctly when lifted out of the ancestor that declared the prefix.
    let mut inherited: Vec<(String, String)> = Vec::new();
    for (key, _) in &attrs {
        let Some((prefix, _)) = key.split_once(':') else {
            continue;
        };
        if prefix == "xml" || prefix == "xmlns" {
            continue;
        }
        let declaration = format!("xmlns:{}", prefix);
        if attrs.iter().chain(&inherited).any(|(k, _)| *k == declaration) {
            continue;
        }
        let namespace = scope
            .prefixes
            .get(prefix)
            .ok_or_else(|| Error::Xml(format!("unbound attribute prefix '{}'", prefix)))?;
        inherited.push((declaration, namespace.clone()));
    }
    attrs.extend(inherited);

    let qname = utf8(start.name().as_ref())?.to_string();
    let (namespace, local) = match qname.split_once(':') {
        Some((prefix, local)) => {
            let namespace = scope
                .prefixes
                .get(prefix)
                .cloned()
                .ok_or_else(|| Error::Xml(format!("unbound namespace prefix '{}'", prefix)))?;
            (namespace, local.to_string())
        }
        None => (scope.default_ns.clone(), qname),
    };

    let element = Element {
        name: local,
        namespace,
        attrs,
        children: Vec::new(),
    };
    Ok((element, scope))
}

/// Attach a completed element to its parent, or hand it back if it was the root.
fn attach(stack: &mut [(Element, Scope)], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some((parent, _)) => {
            parent.append_child(element);
            None
        }
        None => Some(element),
    }
}
