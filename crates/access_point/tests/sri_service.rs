use access_point::sri_service::{SriEndpoints, SriServiceClient};
use access_point::{AuthorizationResult, FiscalTransport, TransportError};
use ec_einv_core::access_key::AccessKey;
use ec_einv_core::models::Environment;
use httpmock::prelude::*;
use std::time::Duration;

const KEY: &str = "1503202401179001167400110010020000001231234567819";
const RECEPTION: &str = "/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
const AUTHORIZATION: &str = "/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";

fn client(server: &MockServer, timeout: Duration) -> std::sync::Arc<SriServiceClient> {
    let endpoints = SriEndpoints::with_base(&server.base_url());
    SriServiceClient::with_endpoints(endpoints.clone(), endpoints, timeout).unwrap()
}

fn reception_response(estado: &str, mensajes: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion"><RespuestaRecepcionComprobante><estado>{estado}</estado><comprobantes><comprobante><claveAcceso>{KEY}</claveAcceso><mensajes>{mensajes}</mensajes></comprobante></comprobantes></RespuestaRecepcionComprobante></ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}

#[test]
fn default_endpoints_per_environment() {
    let test = SriEndpoints::for_environment(Environment::Test);
    assert_eq!(
        test.reception,
        "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline"
    );
    let prod = SriEndpoints::for_environment(Environment::Production);
    assert_eq!(
        prod.authorization,
        "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline"
    );
}

#[tokio::test]
async fn accepted_reception() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(RECEPTION)
                .header("SOAPAction", "")
                .body_contains("validarComprobante")
                .body_contains("PGZhY3R1cmE+");
            then.status(200).body(reception_response("RECIBIDA", ""));
        })
        .await;

    let result = client(&server, Duration::from_secs(5))
        .submit_for_reception("<factura>", Environment::Test)
        .await
        .unwrap();
    assert!(result.is_accepted());
    mock.assert_async().await;
}

#[tokio::test]
async fn returned_reception_keeps_messages() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(RECEPTION);
            then.status(200).body(reception_response(
                "DEVUELTA",
                "<mensaje><identificador>35</identificador><mensaje>ARCHIVO NO CUMPLE ESTRUCTURA XML</mensaje><tipo>ERROR</tipo></mensaje>",
            ));
        })
        .await;

    let result = client(&server, Duration::from_secs(5))
        .submit_for_reception("<factura/>", Environment::Test)
        .await
        .unwrap();
    assert!(!result.is_accepted());
    assert_eq!(result.messages()[0].identifier, "35");
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(RECEPTION);
            then.status(503).body("maintenance");
        })
        .await;

    let err = client(&server, Duration::from_secs(5))
        .submit_for_reception("<factura/>", Environment::Test)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Server { status: 503, body: "maintenance".into() });
    assert!(err.is_retryable());
}

#[tokio::test]
async fn client_errors_are_not_retryable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(RECEPTION);
            then.status(404);
        })
        .await;

    let err = client(&server, Duration::from_secs(5))
        .submit_for_reception("<factura/>", Environment::Test)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Http { status: 404, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(RECEPTION);
            then.status(200)
                .delay(Duration::from_secs(2))
                .body(reception_response("RECIBIDA", ""));
        })
        .await;

    let err = client(&server, Duration::from_millis(200))
        .submit_for_reception("<factura/>", Environment::Test)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
}

#[tokio::test]
async fn unreachable_host_is_a_connection_error() {
    let endpoints = SriEndpoints::with_base("http://127.0.0.1:1");
    let timeout = Duration::from_secs(2);
    let client = SriServiceClient::with_endpoints(endpoints.clone(), endpoints, timeout).unwrap();
    let err = client
        .submit_for_reception("<factura/>", Environment::Test)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connection(_)));
}

#[tokio::test]
async fn authorization_query() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(AUTHORIZATION)
                .body_contains(format!("<claveAccesoComprobante>{KEY}</claveAccesoComprobante>"));
            then.status(200).body(format!(
                r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><claveAccesoConsultada>{KEY}</claveAccesoConsultada><numeroComprobantes>1</numeroComprobantes><autorizaciones><autorizacion><estado>AUTORIZADO</estado><numeroAutorizacion>{KEY}</numeroAutorizacion><fechaAutorizacion>2024-03-15T10:20:30-05:00</fechaAutorizacion><ambiente>PRUEBAS</ambiente><comprobante><![CDATA[<factura/>]]></comprobante><mensajes/></autorizacion></autorizaciones></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#
            ));
        })
        .await;

    let key = AccessKey::parse(KEY).unwrap();
    let result = client(&server, Duration::from_secs(5))
        .query_authorization(&key, Environment::Test)
        .await
        .unwrap();
    match result {
        AuthorizationResult::Authorized {
            authorization_number,
            authorization_date,
            authorized_document,
            ..
        } => {
            assert_eq!(authorization_number, KEY);
            assert_eq!(authorization_date.as_deref(), Some("2024-03-15T10:20:30-05:00"));
            assert_eq!(authorized_document.as_deref(), Some("<factura/>"));
        }
        other => panic!("unexpected {other:?}"),
    }
    mock.assert_async().await;
}
