use super::*;

pub(super) async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };
    problem_response(problem)
}

pub(super) fn problem_response(problem: ProblemDetails) -> Response {
    let status =
        StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

pub(super) async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(request).await);
    }

    let Some(expected) = state.auth.token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = extract_token(request.headers());
    if provided.as_deref() == Some(expected) {
        return Ok(next.run(request).await);
    }

    Err(ApiError::Sandbox(SandboxError::TokenInvalid {
        message: Some("missing or invalid token".to_string()),
    }))
}

/// Accepts `Bearer`/`Token` credentials and the password half of HTTP Basic.
pub(super) fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            for engine in engines {
                let Ok(decoded) = engine.decode(rest) else {
                    continue;
                };
                let Ok(decoded) = String::from_utf8(decoded) else {
                    continue;
                };
                if let Some((_, password)) = decoded.split_once(':') {
                    return Some(password.to_string());
                }
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            None
        }
        _ => None,
    }
}

pub(super) fn to_sse_event(event: &ClassifiedEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

pub(super) fn http_logging_enabled() -> bool {
    !matches!(
        std::env::var("SANDBOX_RELAY_LOG_HTTP"),
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false")
    )
}
