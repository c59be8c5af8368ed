use thiserror::Error;
use wasm_bindgen::JsValue;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Event source unavailable: {0}")]
    Unavailable(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Signer error: {0}")]
    SignerError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing capability: {0}")]
    CapabilityMissing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Payment error: {0}")]
    PaymentError(String),

    #[error("{0}")]
    Other(String),
}

impl From<JsValue> for CoreError {
    fn from(value: JsValue) -> Self {
        if let Some(s) = value.as_string() {
            CoreError::JsError(s)
        } else {
            CoreError::JsError(format!("{:?}", value))
        }
    }
}

impl From<CoreError> for JsValue {
    fn from(error: CoreError) -> Self {
        JsValue::from_str(&error.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::ParseError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
