//! HTML documents backed by an html5ever reference-counted tree.

use std::{cell::RefCell, rc::Rc};

use html5ever::{
    Attribute, LocalName, Namespace, ParseOpts, QualName, parse_document,
    tendril::{StrTendril, TendrilSink},
};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom};

use super::{DomNode, NodeKind};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// Elements that never have children or an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

/// Elements whose text children are serialized without escaping.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "iframe", "noembed", "noframes", "noscript", "plaintext", "script", "style", "xmp",
];

/// A parsed HTML document.
#[derive(derive_more::Debug)]
pub struct HtmlDocument {
    #[debug(skip)]
    root: Handle,
}

impl HtmlDocument {
    /// Parses `html` with the HTML5 tree construction rules.
    ///
    /// Parsing never fails; malformed markup is repaired the way browsers do.
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        Self {
            root: dom.document,
        }
    }

    /// Returns the document node.
    pub fn root(&self) -> &Handle {
        &self.root
    }

    /// Serializes the document's children back to markup.
    ///
    /// Written by hand because rcdom's `SerializableHandle` skips `<template>`
    /// contents, which would drop rewritten template scripts.
    ///
    /// Attribute values escape `&`, `"`, `<`, `>` and no-break spaces. Text is escaped
    /// except inside raw text elements such as `<script>` and `<style>`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut stack = Vec::new();
        push_children(&mut stack, &self.root.children.borrow(), false);
        while let Some(op) = stack.pop() {
            match op {
                Op::Close(name) => {
                    out.push_str("</");
                    out.push_str(&name);
                    out.push('>');
                }
                Op::Open(handle, raw) => match &handle.data {
                    NodeData::Document => {
                        push_children(&mut stack, &handle.children.borrow(), false);
                    }
                    NodeData::Doctype { name, .. } => {
                        out.push_str("<!DOCTYPE ");
                        out.push_str(name);
                        out.push('>');
                    }
                    NodeData::Text { contents } => {
                        if raw {
                            out.push_str(&contents.borrow());
                        } else {
                            escape(&mut out, &contents.borrow(), false);
                        }
                    }
                    NodeData::Comment { contents } => {
                        out.push_str("<!--");
                        out.push_str(contents);
                        out.push_str("-->");
                    }
                    NodeData::ProcessingInstruction { target, contents } => {
                        out.push_str("<?");
                        out.push_str(target);
                        out.push(' ');
                        out.push_str(contents);
                        out.push('>');
                    }
                    NodeData::Element {
                        name,
                        attrs,
                        template_contents,
                        ..
                    } => {
                        out.push('<');
                        out.push_str(&name.local);
                        for attr in attrs.borrow().iter() {
                            out.push(' ');
                            if let Some(prefix) = &attr.name.prefix {
                                out.push_str(prefix);
                                out.push(':');
                            }
                            out.push_str(&attr.name.local);
                            out.push_str("=\"");
                            escape(&mut out, &attr.value, true);
                            out.push('"');
                        }
                        out.push('>');
                        let is_html = &*name.ns == HTML_NAMESPACE;
                        if is_html && VOID_ELEMENTS.contains(&&*name.local) {
                            continue;
                        }
                        stack.push(Op::Close(name.local.clone()));
                        let raw = is_html && RAW_TEXT_ELEMENTS.contains(&&*name.local);
                        match template_contents.borrow().as_ref() {
                            Some(contents) => {
                                push_children(&mut stack, &contents.children.borrow(), raw)
                            }
                            None => push_children(&mut stack, &handle.children.borrow(), raw),
                        }
                    }
                },
            }
        }
        out
    }
}

enum Op {
    Open(Handle, bool),
    Close(LocalName),
}

fn push_children(stack: &mut Vec<Op>, children: &[Handle], raw: bool) {
    stack.extend(children.iter().rev().map(|child| Op::Open(child.clone(), raw)));
}

fn escape(out: &mut String, text: &str, attr_mode: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attr_mode => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn attribute_name(name: &str) -> QualName {
    QualName::new(None, Namespace::from(""), LocalName::from(name))
}

fn text_node(text: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(StrTendril::from(text)),
    })
}

impl DomNode for Handle {
    fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::Document => NodeKind::Document,
            NodeData::Doctype { .. } => NodeKind::Doctype,
            NodeData::Text { .. } => NodeKind::Text,
            NodeData::Comment { .. } => NodeKind::Comment,
            NodeData::Element { .. } => NodeKind::Element,
            NodeData::ProcessingInstruction { .. } => NodeKind::ProcessingInstruction,
        }
    }

    fn tag_name(&self) -> Option<&str> {
        match &self.data {
            NodeData::Element { name, .. } => Some(&*name.local),
            _ => None,
        }
    }

    fn children(&self) -> Vec<Self> {
        if let NodeData::Element {
            template_contents, ..
        } = &self.data
        {
            if let Some(contents) = template_contents.borrow().as_ref() {
                return contents.children.borrow().clone();
            }
        }
        self.children.borrow().clone()
    }

    fn text(&self) -> Option<String> {
        match &self.data {
            NodeData::Text { contents } => Some(contents.borrow().to_string()),
            NodeData::Comment { contents } => Some(contents.to_string()),
            _ => None,
        }
    }

    fn attribute(&self, name: &str) -> Option<String> {
        match &self.data {
            NodeData::Element { attrs, .. } => attrs
                .borrow()
                .iter()
                .find(|attr| (*attr.name.local).eq_ignore_ascii_case(name))
                .map(|attr| attr.value.to_string()),
            _ => None,
        }
    }

    fn set_attribute(&self, name: &str, value: &str) {
        let NodeData::Element { attrs, .. } = &self.data else {
            return;
        };
        let mut attrs = attrs.borrow_mut();
        match attrs
            .iter_mut()
            .find(|attr| (*attr.name.local).eq_ignore_ascii_case(name))
        {
            Some(attr) => attr.value = StrTendril::from(value),
            None => attrs.push(Attribute {
                name: attribute_name(name),
                value: StrTendril::from(value),
            }),
        }
    }

    fn replace_children_with_text(&self, text: &str) {
        let node = text_node(text);
        node.parent.set(Some(Rc::downgrade(self)));
        let old = std::mem::replace(&mut *self.children.borrow_mut(), vec![node]);
        for child in old {
            child.parent.set(None);
        }
    }

    fn prepend_children(&self, nodes: Vec<Self>) {
        for node in nodes.iter() {
            node.parent.set(Some(Rc::downgrade(self)));
        }
        self.children.borrow_mut().splice(0..0, nodes);
    }

    fn new_element(tag: &str, attrs: &[(&str, &str)], text: Option<&str>) -> Self {
        let attrs = attrs
            .iter()
            .map(|(name, value)| Attribute {
                name: attribute_name(name),
                value: StrTendril::from(*value),
            })
            .collect();
        let node = Node::new(NodeData::Element {
            name: QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(tag)),
            attrs: RefCell::new(attrs),
            template_contents: RefCell::new(None),
            mathml_annotation_xml_integration_point: false,
        });
        if let Some(text) = text {
            node.replace_children_with_text(text);
        }
        node
    }
}
