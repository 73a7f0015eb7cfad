use axum::http::HeaderMap;

/// Resolve the client IP from proxy headers, in trust order:
/// `cf-connecting-ip`, `x-real-ip`, then the first entry of
/// `x-forwarded-for`. Returns `None` when no header yields a usable value.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}
