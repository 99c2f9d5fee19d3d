//! An arena-backed DOM for rewriting article HTML fragments.
//!
//! Nodes live in a flat vector keyed by integer ids; parent/child links are
//! index relations, which sidesteps ownership cycles entirely. Deleting a
//! node merely detaches it from its parent's child list; the memory is
//! reclaimed when the whole arena drops at the end of the article.
//!
//! Serialisation is deterministic (attribute order preserved, one escaping
//! alphabet), so rewriting the same input twice yields identical bytes.

mod parser;

pub use parser::parse;

/// A node handle. Index into the arena.
pub type NodeId = usize;

/// Elements whose content model forbids children.
static VOID_ELEMENTS: phf::Set<&'static str> = phf::phf_set! {
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link",
    "meta", "param", "source", "track", "wbr",
};

/// Elements whose text content is raw (no entity processing).
static RAW_TEXT_ELEMENTS: phf::Set<&'static str> = phf::phf_set! {
    "script", "style",
};

/// An element's name and attributes.
#[derive(Debug)]
pub struct Element {
    /// Lower-cased tag name.
    pub name: String,
    /// Attributes in source order, names lower-cased, values decoded.
    attrs: Vec<(String, String)>,
}

impl Element {
    /// Creates an element with the given attributes.
    pub fn new(name: &str, attrs: Vec<(String, String)>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            attrs,
        }
    }

    /// Gets an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets an attribute, replacing any existing value in place so the
    /// serialised attribute order stays stable.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some((_, slot)) = self.attrs.iter_mut().find(|(attr, _)| attr == name) {
            value.clone_into(slot);
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    /// Removes an attribute.
    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(attr, _)| attr != name);
    }

    /// Returns true if the space-separated `class` attribute contains
    /// `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|list| list.split_ascii_whitespace().any(|c| c == class))
    }

    /// The element's classes.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class")
            .unwrap_or_default()
            .split_ascii_whitespace()
    }

    /// True if this element never has children.
    fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(self.name.as_str())
    }
}

/// The payload of one node.
#[derive(Debug)]
pub enum NodeData {
    /// An element with attributes.
    Element(Element),
    /// Decoded character data.
    Text(String),
    /// A comment, body stored verbatim.
    Comment(String),
}

/// One arena slot.
#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

/// A parsed HTML fragment.
#[derive(Debug)]
pub struct Fragment {
    nodes: Vec<Node>,
}

/// The id of the synthetic root node.
const ROOT: NodeId = 0;

impl Fragment {
    /// Creates an empty fragment holding only the synthetic root.
    pub(super) fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Text(String::new()),
            }],
        }
    }

    /// The synthetic root node.
    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// A node's payload.
    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id].data
    }

    /// The element at `id`, if it is one.
    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id].data {
            NodeData::Element(element) => Some(element),
            _ => None,
        }
    }

    /// The element at `id`, mutably.
    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id].data {
            NodeData::Element(element) => Some(element),
            _ => None,
        }
    }

    /// A node's parent.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// A node's children.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Appends a new node under `parent` and returns its id.
    pub fn append(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            data,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Detaches `id` (and implicitly its subtree) from the tree. The arena
    /// slots stay allocated until the fragment drops.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&child| child != id);
        }
    }

    /// Replaces `id` with its own children, splicing them into the parent
    /// at the same position. Used to strip a link wrapper while keeping the
    /// wrapped content.
    pub fn unwrap(&mut self, id: NodeId) {
        let Some(parent) = self.nodes[id].parent.take() else {
            return;
        };
        let children = std::mem::take(&mut self.nodes[id].children);
        for &child in &children {
            self.nodes[child].parent = Some(parent);
        }
        let siblings = &mut self.nodes[parent].children;
        if let Some(position) = siblings.iter().position(|&sibling| sibling == id) {
            siblings.splice(position..=position, children);
        }
    }

    /// All element ids in the subtree of `id`, preorder. A snapshot, so the
    /// caller may mutate the tree while iterating.
    pub fn elements_in(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect(id, &mut |fragment, node| {
            matches!(fragment.data(node), NodeData::Element(_)).then_some(node)
        }, &mut out);
        out
    }

    /// All elements named `name` in the whole fragment, preorder.
    pub fn elements_named(&self, name: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect(ROOT, &mut |fragment, node| {
            fragment
                .element(node)
                .is_some_and(|element| element.name == name)
                .then_some(node)
        }, &mut out);
        out
    }

    /// The nearest ancestor element named `name`.
    pub fn ancestor_named(&self, id: NodeId, name: &str) -> Option<NodeId> {
        let mut cursor = self.parent(id);
        while let Some(node) = cursor {
            if self.element(node).is_some_and(|element| element.name == name) {
                return Some(node);
            }
            cursor = self.parent(node);
        }
        None
    }

    /// Returns true if the subtree of `id` contains an element named
    /// `name`, `id` itself excluded.
    pub fn contains_element(&self, id: NodeId, name: &str) -> bool {
        self.children(id).iter().any(|&child| {
            self.element(child)
                .is_some_and(|element| element.name == name)
                || self.contains_element(child, name)
        })
    }

    /// Concatenated descendant text of `id`.
    pub fn text_of(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    /// Serialises the fragment back to HTML.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for &child in &self.nodes[ROOT].children {
            self.write_node(child, false, &mut out);
        }
        out
    }

    fn collect(
        &self,
        id: NodeId,
        filter: &mut impl FnMut(&Self, NodeId) -> Option<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        for &child in &self.nodes[id].children {
            out.extend(filter(self, child));
            self.collect(child, filter, out);
        }
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Comment(_) => {}
            NodeData::Element(_) => {
                for &child in &self.nodes[id].children {
                    self.collect_text(child, out);
                }
            }
        }
    }

    fn write_node(&self, id: NodeId, raw_text: bool, out: &mut String) {
        match &self.nodes[id].data {
            NodeData::Text(text) => {
                if raw_text {
                    out.push_str(text);
                } else {
                    // `encode_text`'s alphabet (& < >) is the exact inverse
                    // of the parser's decode, keeping serialisation
                    // idempotent.
                    out.push_str(&html_escape::encode_text(text));
                }
            }
            NodeData::Comment(body) => {
                out.push_str("<!--");
                out.push_str(body);
                out.push_str("-->");
            }
            NodeData::Element(element) => {
                out.push('<');
                out.push_str(&element.name);
                for (name, value) in &element.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if element.is_void() {
                    return;
                }
                let raw = RAW_TEXT_ELEMENTS.contains(element.name.as_str());
                for &child in &self.nodes[id].children {
                    self.write_node(child, raw, out);
                }
                out.push_str("</");
                out.push_str(&element.name);
                out.push('>');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_serialize() {
        let mut fragment = Fragment::new();
        let root = fragment.root();
        let p = fragment.append(root, NodeData::Element(Element::new("p", vec![])));
        fragment.append(p, NodeData::Text("a < b & c".to_string()));
        assert_eq!(fragment.to_html(), "<p>a &lt; b &amp; c</p>");
    }

    #[test]
    fn detach_removes_subtree() {
        let mut fragment = parse("<div><span>x</span><b>y</b></div>");
        let span = fragment.elements_named("span")[0];
        fragment.detach(span);
        assert_eq!(fragment.to_html(), "<div><b>y</b></div>");
    }

    #[test]
    fn unwrap_splices_children_in_place() {
        let mut fragment = parse("<p>a<a href=\"x\"><img src=\"y\">b</a>c</p>");
        let link = fragment.elements_named("a")[0];
        fragment.unwrap(link);
        assert_eq!(fragment.to_html(), "<p>a<img src=\"y\">bc</p>");
    }

    #[test]
    fn class_queries() {
        let fragment = parse("<div class=\"thumb  tright\">x</div>");
        let div = fragment.elements_named("div")[0];
        let element = fragment.element(div).unwrap();
        assert!(element.has_class("thumb"));
        assert!(element.has_class("tright"));
        assert!(!element.has_class("thumbinner"));
    }

    #[test]
    fn contains_element_ignores_self() {
        let fragment = parse("<div class=\"hatnote\">plain text</div>");
        let div = fragment.elements_named("div")[0];
        assert!(!fragment.contains_element(div, "a"));

        let fragment = parse("<div class=\"hatnote\">see <i><a href=\"x\">y</a></i></div>");
        let div = fragment.elements_named("div")[0];
        assert!(fragment.contains_element(div, "a"));
    }

    #[test]
    fn ancestors() {
        let fragment = parse("<a href=\"x\"><span><img src=\"y\"></span></a>");
        let img = fragment.elements_named("img")[0];
        let a = fragment.ancestor_named(img, "a").unwrap();
        assert_eq!(fragment.element(a).unwrap().name, "a");
        assert_eq!(fragment.ancestor_named(img, "table"), None);
    }
}
