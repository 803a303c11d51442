//! SOAP envelopes for the SRI offline web services and typed readings of their responses.

use crate::{AuthorityMessage, AuthorizationResult, ReceptionResult, TransportError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use roxmltree::{Document, Node};

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
pub const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";

/// "Access key already registered" and "access key in processing": an earlier
/// submission of the same document already reached the authority.
pub const ALREADY_RECEIVED_CODES: [&str; 2] = ["43", "70"];

fn wrap_soap(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="{SOAP_ENV_NS}">
  <soapenv:Header/>
  <soapenv:Body>
    {body}
  </soapenv:Body>
</soapenv:Envelope>"#
    )
}

/// `validarComprobante` request carrying the signed document as base64.
pub fn reception_envelope(signed_xml: &str) -> String {
    wrap_soap(&format!(
        r#"<ns2:validarComprobante xmlns:ns2="{RECEPTION_NS}"><xml>{}</xml></ns2:validarComprobante>"#,
        BASE64.encode(signed_xml.as_bytes())
    ))
}

/// `autorizacionComprobante` request keyed by the access key alone.
pub fn authorization_envelope(access_key: &str) -> String {
    wrap_soap(&format!(
        r#"<ns2:autorizacionComprobante xmlns:ns2="{AUTHORIZATION_NS}"><claveAccesoComprobante>{access_key}</claveAccesoComprobante></ns2:autorizacionComprobante>"#
    ))
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn find<'a, 'input>(doc: &'a Document<'input>, name: &str) -> Option<Node<'a, 'input>> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn parse(raw: &str) -> Result<Document<'_>, TransportError> {
    Document::parse(raw).map_err(|e| TransportError::MalformedResponse(e.to_string()))
}

/// `faultstring` of a SOAP fault, if the body is one.
pub fn fault_string(raw: &str) -> Option<String> {
    let doc = Document::parse(raw).ok()?;
    let fault = find(&doc, "Fault")?;
    Some(child_text(fault, "faultstring").unwrap_or_else(|| "SOAP fault".to_string()))
}

/// Messages below `node`. Nested `mensaje` text elements are skipped: only
/// entries that carry an `identificador` count.
fn messages(node: Node<'_, '_>) -> Vec<AuthorityMessage> {
    node.descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "mensaje")
        .filter(|n| child(*n, "identificador").is_some())
        .map(|n| AuthorityMessage {
            identifier: child_text(n, "identificador").unwrap_or_default(),
            message: child_text(n, "mensaje").unwrap_or_default(),
            additional_info: child_text(n, "informacionAdicional"),
            kind: child_text(n, "tipo"),
        })
        .collect()
}

pub fn parse_reception_response(raw: &str) -> Result<ReceptionResult, TransportError> {
    let doc = parse(raw)?;
    let response = find(&doc, "RespuestaRecepcionComprobante").ok_or_else(|| {
        TransportError::MalformedResponse(
            fault_string(raw)
                .unwrap_or_else(|| "missing RespuestaRecepcionComprobante".to_string()),
        )
    })?;
    let state = child_text(response, "estado")
        .ok_or_else(|| {
            TransportError::MalformedResponse("reception response has no estado".to_string())
        })?;
    let messages = messages(response);
    let raw_response = raw.to_string();

    match state.as_str() {
        "RECIBIDA" => Ok(ReceptionResult::Accepted { messages, raw_response }),
        "DEVUELTA" => {
            let already_received = !messages.is_empty()
                && messages
                    .iter()
                    .all(|m| ALREADY_RECEIVED_CODES.contains(&m.identifier.as_str()));
            if already_received {
                tracing::warn!(
                    codes = ?messages.iter().map(|m| m.identifier.as_str()).collect::<Vec<_>>(),
                    "document already held by the authority, treating as received"
                );
                Ok(ReceptionResult::Accepted { messages, raw_response })
            } else {
                Ok(ReceptionResult::Returned { messages, raw_response })
            }
        }
        other => Err(TransportError::MalformedResponse(format!(
            "unknown reception estado {other:?}"
        ))),
    }
}

pub fn parse_authorization_response(raw: &str) -> Result<AuthorizationResult, TransportError> {
    let doc = parse(raw)?;
    let response = find(&doc, "RespuestaAutorizacionComprobante").ok_or_else(|| {
        TransportError::MalformedResponse(
            fault_string(raw)
                .unwrap_or_else(|| "missing RespuestaAutorizacionComprobante".to_string()),
        )
    })?;
    let raw_response = raw.to_string();

    let entries: Vec<Node> = response
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "autorizacion")
        .collect();
    let state_of = |n: &Node| child_text(*n, "estado").unwrap_or_default().to_uppercase();

    if let Some(entry) = entries.iter().find(|n| state_of(*n) == "AUTORIZADO") {
        let authorization_number = child_text(*entry, "numeroAutorizacion").ok_or_else(|| {
            let missing = "authorized entry has no numeroAutorizacion";
            TransportError::MalformedResponse(missing.to_string())
        })?;
        return Ok(AuthorizationResult::Authorized {
            authorization_number,
            authorization_date: child_text(*entry, "fechaAutorizacion"),
            authorized_document: child_text(*entry, "comprobante"),
            messages: messages(*entry),
            raw_response,
        });
    }
    if let Some(entry) = entries
        .iter()
        .find(|n| matches!(state_of(*n).as_str(), "NO AUTORIZADO" | "RECHAZADA"))
    {
        return Ok(AuthorizationResult::NotAuthorized {
            messages: messages(*entry),
            raw_response,
        });
    }
    if let Some(entry) = entries
        .iter()
        .find(|n| !matches!(state_of(*n).as_str(), "EN PROCESO" | "PPR" | ""))
    {
        return Err(TransportError::MalformedResponse(format!(
            "unknown authorization estado {:?}",
            state_of(entry)
        )));
    }

    Ok(AuthorizationResult::Pending {
        messages: entries.iter().flat_map(|n| messages(*n)).collect(),
        raw_response,
    })
}
