use anyhow::Result;
use sha2::{Digest, Sha256};

pub fn compute_sha256_hex(xml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(xml.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

pub fn find_element<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    path: &[&str],
) -> Option<roxmltree::Node<'a, 'input>> {
    if path.is_empty() {
        return Some(node);
    }
    for child in node.children() {
        if child.is_element() && child.tag_name().name() == path[0] {
            if path.len() == 1 {
                return Some(child);
            }
            if let Some(found) = find_element(child, &path[1..]) {
                return Some(found);
            }
        }
    }
    None
}

pub fn get_text_at_path(doc: &roxmltree::Document, path: &[&str]) -> Option<String> {
    find_element(doc.root_element(), path)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// First descendant element with the given local name.
pub fn find_descendant<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Header fields read back from a rendered or signed invoice.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct InvoiceSummary {
    pub root: String,
    pub root_id: Option<String>,
    pub version: Option<String>,
    pub access_key: String,
    pub issuer_tax_id: String,
    pub issuer_name: String,
    pub environment: String,
    pub establishment: String,
    pub emission_point: String,
    pub sequential: String,
    pub emission_date: String,
    pub buyer_id: String,
    pub buyer_name: String,
    pub grand_total: Option<String>,
    pub line_count: usize,
    pub signed: bool,
}

pub fn parse_invoice(xml: &str) -> Result<InvoiceSummary> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();

    let tax = |field: &str| get_text_at_path(&doc, &["infoTributaria", field]).unwrap_or_default();
    let info = |field: &str| get_text_at_path(&doc, &["infoFactura", field]).unwrap_or_default();

    let line_count = find_element(root, &["detalles"])
        .map(|d| d.children().filter(|c| c.is_element()).count())
        .unwrap_or(0);
    let signed = root
        .children()
        .any(|c| c.is_element() && c.tag_name().name() == "Signature");

    Ok(InvoiceSummary {
        root: root.tag_name().name().to_string(),
        root_id: root.attribute("id").map(str::to_string),
        version: root.attribute("version").map(str::to_string),
        access_key: tax("claveAcceso"),
        issuer_tax_id: tax("ruc"),
        issuer_name: tax("razonSocial"),
        environment: tax("ambiente"),
        establishment: tax("estab"),
        emission_point: tax("ptoEmi"),
        sequential: tax("secuencial"),
        emission_date: info("fechaEmision"),
        buyer_id: info("identificacionComprador"),
        buyer_name: info("razonSocialComprador"),
        grand_total: get_text_at_path(&doc, &["infoFactura", "importeTotal"]),
        line_count,
        signed,
    })
}

/// Access key embedded in a document, if any.
pub fn extract_access_key(xml: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    get_text_at_path(&doc, &["infoTributaria", "claveAcceso"])
}
