// =============================================================================
// Network plumbing: gated HTTP client, WebSocket session, URL templating
// =============================================================================

pub mod http;
pub mod ws;

use crate::error::{EngineError, EngineResult};

/// Substitute `{name}` placeholders in an endpoint template.
///
/// Every placeholder left unresolved after substitution is an error; silent
/// partial URLs are how malformed requests reach the wire.
pub fn render_endpoint(template: &str, values: &[(&str, &str)]) -> EngineResult<String> {
    let mut rendered = template.to_string();
    for (name, value) in values {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    if let Some(start) = rendered.find('{') {
        let end = rendered[start..]
            .find('}')
            .map(|i| start + i + 1)
            .unwrap_or(rendered.len());
        return Err(EngineError::BadConfig(format!(
            "unresolved placeholder {} in endpoint template {template}",
            &rendered[start..end]
        )));
    }
    Ok(rendered)
}
