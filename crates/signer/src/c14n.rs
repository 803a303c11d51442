//! Exclusive XML canonicalization 1.0, without comments, over a `roxmltree` tree.
//!
//! Only namespaces visibly utilized by an element or its attributes are rendered, on the
//! first output element that uses them. Attributes are sorted by namespace URI then local
//! name; empty elements are written as start/end pairs.

use roxmltree::{Node, NodeId, NodeType};
use std::collections::BTreeMap;
use thiserror::Error;

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Error)]
pub enum C14nError {
    #[error("xml parse error: {0}")]
    Parse(#[from] roxmltree::Error),
    #[error("node is not an element")]
    NotAnElement,
    #[error("no prefix bound to namespace {0}")]
    UnboundNamespace(String),
}

/// Canonical form of `node`'s subtree, skipping the subtree rooted at `exclude`.
pub fn canonicalize(node: Node<'_, '_>, exclude: Option<NodeId>) -> Result<String, C14nError> {
    if !node.is_element() {
        return Err(C14nError::NotAnElement);
    }
    let mut out = String::new();
    write_element(node, exclude, &BTreeMap::new(), &mut out)?;
    Ok(out)
}

/// Canonical form of the root element of a standalone document.
pub fn canonicalize_str(xml: &str) -> Result<String, C14nError> {
    let doc = roxmltree::Document::parse(xml)?;
    canonicalize(doc.root_element(), None)
}

type Rendered = BTreeMap<String, String>;

fn write_element(
    node: Node<'_, '_>,
    exclude: Option<NodeId>,
    rendered: &Rendered,
    out: &mut String,
) -> Result<(), C14nError> {
    let qname = element_qname(node);
    let prefix = qname.split_once(':').map(|(p, _)| p).unwrap_or("");
    let uri = node.tag_name().namespace().unwrap_or("");

    let mut needed = Rendered::new();
    let default_unset = prefix.is_empty() && uri.is_empty() && !rendered.contains_key("");
    if !default_unset && rendered.get(prefix).map(String::as_str) != Some(uri) {
        needed.insert(prefix.to_string(), uri.to_string());
    }

    let mut attrs: Vec<(&str, &str, String, &str)> = Vec::new();
    for attr in node.attributes() {
        let ns = attr.namespace().unwrap_or("");
        let name = if ns.is_empty() {
            attr.name().to_string()
        } else if ns == XML_NS {
            format!("xml:{}", attr.name())
        } else {
            let p = attribute_prefix(node, ns)?;
            if rendered.get(p).map(String::as_str) != Some(ns) {
                needed.insert(p.to_string(), ns.to_string());
            }
            format!("{p}:{}", attr.name())
        };
        attrs.push((ns, attr.name(), name, attr.value()));
    }
    attrs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    out.push('<');
    out.push_str(qname);
    for (p, ns) in &needed {
        if p.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(p);
            out.push_str("=\"");
        }
        escape_attr(ns, out);
        out.push('"');
    }
    for (_, _, name, value) in &attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');

    let scope;
    let rendered = if needed.is_empty() {
        rendered
    } else {
        let mut merged = rendered.clone();
        merged.extend(needed);
        scope = merged;
        &scope
    };

    for child in node.children() {
        if Some(child.id()) == exclude {
            continue;
        }
        match child.node_type() {
            NodeType::Element => write_element(child, exclude, rendered, out)?,
            NodeType::Text => escape_text(child.text().unwrap_or_default(), out),
            NodeType::PI => {
                if let Some(pi) = child.pi() {
                    out.push_str("<?");
                    out.push_str(pi.target);
                    if let Some(value) = pi.value {
                        out.push(' ');
                        out.push_str(value);
                    }
                    out.push_str("?>");
                }
            }
            NodeType::Comment | NodeType::Root => {}
        }
    }

    out.push_str("</");
    out.push_str(qname);
    out.push('>');
    Ok(())
}

/// Qualified name as written in the source, which keeps the original prefix.
fn element_qname<'input>(node: Node<'_, 'input>) -> &'input str {
    let text = node.document().input_text();
    let rest = &text[node.range().start + 1..];
    let end = rest
        .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    &rest[..end]
}

fn attribute_prefix<'input>(node: Node<'_, 'input>, uri: &str) -> Result<&'input str, C14nError> {
    node.namespaces()
        .find_map(|ns| match ns.name() {
            Some(name) if ns.uri() == uri => Some(name),
            _ => None,
        })
        .ok_or_else(|| C14nError::UnboundNamespace(uri.to_string()))
}

pub(crate) fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

/// Text-node escaping for fragments assembled by hand.
pub(crate) fn escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_text(s, &mut out);
    out
}
