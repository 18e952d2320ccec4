//! The capabilities the script walker needs from a parsed document tree.

pub use self::html::HtmlDocument;

mod html;

/// Kind of a document tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Doctype,
    Element,
    Text,
    Comment,
    ProcessingInstruction,
}

/// A handle to a node in a mutable document tree.
///
/// Handles are cheap to clone and share the underlying node, so mutation
/// through any clone is visible through all of them.
pub trait DomNode: Clone + Sized {
    /// Returns the kind of this node.
    fn kind(&self) -> NodeKind;

    /// Returns the lowercase local tag name for elements.
    fn tag_name(&self) -> Option<&str>;

    /// Returns a snapshot of the direct children.
    ///
    /// For `<template>` elements these are the children of its contents fragment.
    fn children(&self) -> Vec<Self>;

    /// Returns the raw contents of text and comment nodes.
    fn text(&self) -> Option<String>;

    /// Returns the decoded value of the attribute `name` (ASCII case-insensitive).
    fn attribute(&self, name: &str) -> Option<String>;

    /// Sets the attribute `name` to the decoded `value`, adding it if missing.
    fn set_attribute(&self, name: &str, value: &str);

    /// Replaces all children with a single text node.
    fn replace_children_with_text(&self, text: &str);

    /// Inserts `nodes` in order before the existing children.
    fn prepend_children(&self, nodes: Vec<Self>);

    /// Creates a detached element with the given attributes and optional text child.
    fn new_element(tag: &str, attrs: &[(&str, &str)], text: Option<&str>) -> Self;

    /// Returns `true` for an element named `tag`.
    fn is_element(&self, tag: &str) -> bool {
        self.kind() == NodeKind::Element && self.tag_name() == Some(tag)
    }
}
