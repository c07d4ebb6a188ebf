//! Unit tests for ServiceError and ServiceResult types

use ferrous_services::{ServiceError, ServiceResult};
use std::error::Error;

#[test]
fn test_error_display_not_registered() {
    let error = ServiceError::NotRegistered("cart".to_string());
    assert_eq!(format!("{}", error), "Service not registered: cart");
}

#[test]
fn test_error_display_reserved_field() {
    let error = ServiceError::ReservedField {
        service: "cart".to_string(),
        field: "reset".to_string(),
    };
    let display_str = error.to_string();
    assert_eq!(display_str, "Field `reset` of service `cart` uses a reserved name");
    assert!(display_str.contains("reserved"));
}

#[test]
fn test_error_display_method_and_field() {
    let missing_method = ServiceError::MethodNotFound {
        service: "feed".to_string(),
        method: "load".to_string(),
    };
    assert_eq!(missing_method.to_string(), "Service `feed` has no method `load`");

    let missing_field = ServiceError::FieldNotFound {
        service: "feed".to_string(),
        field: "url".to_string(),
    };
    assert_eq!(missing_field.to_string(), "Service `feed` has no field `url`");
}

#[test]
fn test_error_display_cancelled_and_runtime() {
    let cancelled = ServiceError::Cancelled { method: "poll".to_string() };
    assert_eq!(cancelled.to_string(), "Call to `poll` cancelled: instance destroyed");

    let no_runtime = ServiceError::NoRuntime("poll".to_string());
    assert!(no_runtime.to_string().contains("poll"));
}

#[test]
fn test_serde_errors_convert() {
    let parse: Result<u32, _> = serde_json::from_str::<u32>("\"x\"");
    let error: ServiceError = parse.unwrap_err().into();
    assert!(matches!(error, ServiceError::Serialization(_)));
}

#[test]
fn test_error_is_std_error_and_clone() {
    let error = ServiceError::failed("boom");
    let cloned = error.clone();
    assert_eq!(error, cloned);

    let dyn_error: &dyn Error = &error;
    assert!(dyn_error.source().is_none());
}

#[test]
fn test_result_alias() {
    fn lookup(ok: bool) -> ServiceResult<u8> {
        if ok {
            Ok(1)
        } else {
            Err(ServiceError::PluginNotRegistered("Cache"))
        }
    }
    assert_eq!(lookup(true), Ok(1));
    assert_eq!(lookup(false).unwrap_err().to_string(), "Plugin not registered: Cache");
}
