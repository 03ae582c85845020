//! Fixed-shape JSON error bodies for the web application.
//!
//! `render("404.json")` always yields `{"errors":{"detail":"Not Found"}}`;
//! the body depends only on the status code in the template name.

use http::StatusCode;
use serde_json::{json, Value};

use crate::domain::ValidationError;

/// Standard HTTP reason phrase for a status code.
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    StatusCode::from_u16(status).ok()?.canonical_reason()
}

/// Error body for a status code.
pub fn render_status(status: u16) -> Result<Value, ValidationError> {
    let detail = reason_phrase(status).ok_or_else(|| ValidationError::UnknownTemplate {
        template: status.to_string(),
    })?;
    Ok(json!({ "errors": { "detail": detail } }))
}

/// Error body for a template name such as `404.json`.
pub fn render(template: &str) -> Result<Value, ValidationError> {
    let unknown = || ValidationError::UnknownTemplate {
        template: template.to_string(),
    };
    let (code, format) = template.split_once('.').ok_or_else(unknown)?;
    if format != "json" {
        return Err(unknown());
    }
    let status: u16 = code.parse().map_err(|_| unknown())?;
    render_status(status).map_err(|_| unknown())
}
