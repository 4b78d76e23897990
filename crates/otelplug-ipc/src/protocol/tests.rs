//! Unit tests for the protocol envelopes.

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::metadata::{PluginMetadata, PluginType};

#[rstest]
#[case(Method::Initialize)]
#[case(Method::Start)]
#[case(Method::Stop)]
#[case(Method::HealthCheck)]
#[case(Method::GetFactory)]
fn method_names_parse_back(#[case] method: Method) {
    assert_eq!(method.as_str().parse::<Method>().expect("known"), method);
}

#[test]
fn unknown_method_error_names_the_method() {
    let error = "Reload".parse::<Method>().expect_err("unknown");
    assert_eq!(error.to_string(), "unknown method: Reload");
}

#[test]
fn request_params_decode_as_typed_value() {
    let metadata = PluginMetadata::new("otlp", PluginType::Receiver, "1.0.0");
    let request = IpcRequest::with_params(Method::Initialize, &metadata).expect("encode");
    let decoded = IpcRequest::decode(&request.encode().expect("encode")).expect("decode");
    assert_eq!(decoded.method().expect("method"), Method::Initialize);
    assert_eq!(decoded.params_as::<PluginMetadata>().expect("params"), metadata);
}

#[test]
fn request_without_params_decodes_to_null() {
    let decoded = IpcRequest::decode(br#"{"method":"Start"}"#).expect("decode");
    assert_eq!(decoded.params(), &serde_json::Value::Null);
}

#[test]
fn response_with_both_fields_is_malformed() {
    let error = IpcResponse::decode(br#"{"result":1,"error":"boom"}"#).expect_err("malformed");
    assert!(matches!(error, ProtocolError::Malformed { .. }));
}

#[test]
fn empty_error_is_treated_as_success() {
    let response = IpcResponse::decode(br#"{"result":{"ok":true},"error":""}"#).expect("decode");
    assert_eq!(response.error(), None);
    assert_eq!(response.into_result(), Ok(json!({"ok": true})));
}

#[test]
fn failure_serialises_without_result() {
    let bytes = IpcResponse::failure(NOT_STARTED).encode().expect("encode");
    assert_eq!(bytes, br#"{"error":"plugin not started"}"#);
    let decoded = IpcResponse::decode(&bytes).expect("decode");
    assert_eq!(decoded.into_result(), Err(NOT_STARTED.to_owned()));
}

#[test]
fn garbage_does_not_decode() {
    assert!(matches!(
        IpcRequest::decode(b"not json"),
        Err(ProtocolError::Decode { what: "request", .. })
    ));
}
