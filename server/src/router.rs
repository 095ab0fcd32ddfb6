//! §4.I Virtual-Host Router — the `:80`/`:443` reverse proxy that
//! dispatches by `Host`, enforces rate limiting, the smart-shield
//! interstitial, and per-host basic auth, then reverse-proxies to the
//! client's bound public port through a capturing transport that ships
//! an `InspectRecord` back to the owning client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use tracing::{error, warn};
use uuid::Uuid;

use tunnelcow_protocol::inspect::{
    sanitize_body, BINARY_REQUEST_BODY, BINARY_RESPONSE_BODY, REQUEST_BODY_TOO_LARGE,
    RESPONSE_BODY_TOO_LARGE,
};
use tunnelcow_protocol::{InspectRecord, Message};

use crate::auth::{auth_cookie_name, auth_cookie_value, shield_cookie_value, SHIELD_COOKIE_NAME};
use crate::certs::ChallengeStore;
use crate::domain::{DomainEntry, DomainRegistry};
use crate::ratelimit::RateLimiter;
use crate::registry::SessionRegistry;

const MAX_PROXIED_BODY: usize = 10 * 1024 * 1024;

const LOGIN_FORM_TEMPLATE: &str = include_str!("../templates/login_form.html");
const SHIELD_CHALLENGE_HTML: &str = include_str!("../templates/shield_challenge.html");

pub struct RouterState {
    pub domains: Arc<DomainRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub server_token: String,
    pub http_client: reqwest::Client,
    pub challenges: ChallengeStore,
}

pub fn plain_router(state: Arc<RouterState>) -> Router {
    let challenge_state = state.clone();
    Router::new()
        .route(
            "/.well-known/acme-challenge/:token",
            get(move |path| acme_challenge_handler(challenge_state.clone(), path)),
        )
        .fallback(move |headers, method, uri, conn: ConnectInfo<SocketAddr>, body| {
            let state = state.clone();
            handle_request(state, false, headers, method, uri, conn, body)
        })
}

pub fn secure_router(state: Arc<RouterState>) -> Router {
    Router::new().fallback(move |headers, method, uri, conn: ConnectInfo<SocketAddr>, body| {
        let state = state.clone();
        handle_request(state, true, headers, method, uri, conn, body)
    })
}

/// Routed ahead of the plain-HTTP vhost fallback per §4.J so
/// `/.well-known/acme-challenge/...` is always served directly, and is
/// the only route the ACME account needs answered on `:80`.
async fn acme_challenge_handler(
    state: Arc<RouterState>,
    axum::extract::Path(token): axum::extract::Path<String>,
) -> Response {
    match state.challenges.take_response(&token).await {
        Some(key_auth) => (StatusCode::OK, key_auth).into_response(),
        None => (StatusCode::NOT_FOUND, "no challenge for this token").into_response(),
    }
}

fn host_without_port(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HOST)?.to_str().ok()?;
    Some(raw.split(':').next().unwrap_or(raw).to_string())
}

async fn handle_request(
    state: Arc<RouterState>,
    is_tls: bool,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Body,
) -> Response {
    let Some(host) = host_without_port(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let Some(entry) = state.domains.get(&host) else {
        return (StatusCode::NOT_FOUND, "Domain not mapped").into_response();
    };

    let client_ip = peer.ip().to_string();

    if entry.rate_limit > 0 && !state.limiter.allow(&client_ip, entry.rate_limit) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if entry.smart_shield {
        if uri.path() == "/tunnelcow" && method == Method::POST {
            return shield_verify_response(&state.server_token, &client_ip);
        }
        if !shield_cookie_valid(&headers, &state.server_token, &client_ip) {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                SHIELD_CHALLENGE_HTML,
            )
                .into_response();
        }
    }

    if is_tls && entry.mode == "http" {
        return (StatusCode::FORBIDDEN, "HTTPS not enabled for this domain").into_response();
    }
    if !is_tls && entry.mode != "http" {
        let target = format!("https://{host}{}", path_and_query(&uri));
        return Redirect::temporary(&target).into_response();
    }

    if let Some(user) = entry.auth_user.as_deref().filter(|u| !u.is_empty()) {
        let pass = entry.auth_pass.as_deref().unwrap_or("");
        if method == Method::POST && uri.path() == "/" && looks_like_login_submit(&headers) {
            return handle_login_submit(&state, &host, user, pass, body).await;
        }
        if !auth_cookie_valid(&headers, &state.server_token, &host, user, pass) {
            return login_form_response(None);
        }
    }

    proxy_with_capture(&state, &entry, &host, &client_ip, method, uri, headers, body).await
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn shield_cookie_valid(headers: &HeaderMap, secret: &str, client_ip: &str) -> bool {
    let expected = shield_cookie_value(secret, client_ip);
    read_cookie(headers, SHIELD_COOKIE_NAME).as_deref() == Some(expected.as_str())
}

fn shield_verify_response(secret: &str, client_ip: &str) -> Response {
    let value = shield_cookie_value(secret, client_ip);
    let cookie = format!(
        "{SHIELD_COOKIE_NAME}={value}; Max-Age={}; Path=/; HttpOnly",
        crate::auth::SHIELD_COOKIE_MAX_AGE_SECS
    );
    (StatusCode::OK, [(header::SET_COOKIE, cookie)], "").into_response()
}

fn auth_cookie_valid(headers: &HeaderMap, secret: &str, host: &str, user: &str, pass: &str) -> bool {
    let name = auth_cookie_name(host);
    let expected = auth_cookie_value(secret, host, user, pass);
    read_cookie(headers, &name).as_deref() == Some(expected.as_str())
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let mut parts = kv.trim().splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next()?;
        (k == name).then(|| v.to_string())
    })
}

fn looks_like_login_submit(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

async fn handle_login_submit(
    state: &RouterState,
    host: &str,
    user: &str,
    pass: &str,
    body: Body,
) -> Response {
    let Ok(bytes) = to_bytes(body, MAX_PROXIED_BODY).await else {
        return login_form_response(Some("could not read form"));
    };
    let form: std::collections::HashMap<String, String> =
        url::form_urlencoded::parse(&bytes).into_owned().collect();
    let submitted_user = form.get("username").map(String::as_str).unwrap_or("");
    let submitted_pass = form.get("password").map(String::as_str).unwrap_or("");

    if submitted_user == user && submitted_pass == pass {
        let name = auth_cookie_name(host);
        let value = auth_cookie_value(&state.server_token, host, user, pass);
        let cookie = format!(
            "{name}={value}; Max-Age={}; Path=/; HttpOnly",
            crate::auth::AUTH_COOKIE_MAX_AGE_SECS
        );
        Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(header::LOCATION, "/")
            .header(header::SET_COOKIE, cookie)
            .body(Body::empty())
            .unwrap()
    } else {
        login_form_response(Some("invalid username or password"))
    }
}

fn login_form_response(error: Option<&str>) -> Response {
    let banner = error
        .map(|e| format!("<p class=\"error\">{e}</p>"))
        .unwrap_or_default();
    let body = LOGIN_FORM_TEMPLATE.replace("{error_banner}", &banner);
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

/// The "capturing transport" of §4.I: proxies the request to
/// `127.0.0.1:<public_port>`, buffers up to 4 KiB of each body for the
/// `InspectRecord`, and ships the record to the owning client.
async fn proxy_with_capture(
    state: &RouterState,
    entry: &DomainEntry,
    host: &str,
    client_ip: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let ts_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let req_headers_joined = join_headers(&headers);
    let req_body_bytes = to_bytes(body, MAX_PROXIED_BODY)
        .await
        .unwrap_or_default();
    let req_body_captured = sanitize_body(&req_body_bytes, REQUEST_BODY_TOO_LARGE, BINARY_REQUEST_BODY);

    let upstream_url = format!(
        "http://127.0.0.1:{}{}",
        entry.public_port,
        path_and_query(&uri)
    );

    let mut req_builder = state
        .http_client
        .request(method.clone(), &upstream_url)
        .body(req_body_bytes.to_vec());
    for (name, value) in headers.iter() {
        if name == header::HOST {
            continue;
        }
        req_builder = req_builder.header(name, value);
    }
    req_builder = req_builder.header(header::HOST, host);

    let outcome = req_builder.send().await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, res_headers_joined, res_body_captured, response) = match outcome {
        Ok(resp) => {
            let status = resp.status();
            let res_headers_joined = join_reqwest_headers(resp.headers());
            let mut builder = Response::builder().status(status);
            for (name, value) in resp.headers().iter() {
                builder = builder.header(name, value);
            }
            let res_bytes = resp.bytes().await.unwrap_or_default();
            let captured =
                sanitize_body(&res_bytes, RESPONSE_BODY_TOO_LARGE, BINARY_RESPONSE_BODY);
            let response = builder.body(Body::from(res_bytes)).unwrap();
            (status.as_u16(), res_headers_joined, captured, response)
        }
        Err(e) => {
            warn!("upstream proxy error for {host} -> :{}: {e}", entry.public_port);
            let body_text = format!("upstream error: {e}");
            let response = (StatusCode::BAD_GATEWAY, body_text.clone()).into_response();
            (502, String::new(), body_text, response)
        }
    };

    let record = InspectRecord {
        id,
        ts_millis,
        method: method.to_string(),
        url: uri.to_string(),
        req_headers: req_headers_joined,
        req_body: req_body_captured,
        status,
        res_headers: res_headers_joined,
        res_body: res_body_captured,
        duration_ms,
        client_ip: client_ip.to_string(),
        public_port: entry.public_port,
    };

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        ship_inspect_data(&sessions, record).await;
    });

    response
}

async fn ship_inspect_data(sessions: &SessionRegistry, record: InspectRecord) {
    let public_port = record.public_port;
    if let Some(session) = sessions.get(public_port) {
        if let Err(e) = session.send_control(Message::InspectData(record)).await {
            error!("failed to ship INSPECT_DATA for port {public_port}: {e}");
        }
    }
}

fn join_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| format!("{k}: {v}")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_reqwest_headers(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| format!("{k}: {v}")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn host_without_port_strips_the_port() {
        let headers = headers_with(&[(header::HOST, "api.example:8443")]);
        assert_eq!(host_without_port(&headers).as_deref(), Some("api.example"));
    }

    #[test]
    fn host_without_port_missing_header_is_none() {
        assert_eq!(host_without_port(&HeaderMap::new()), None);
    }

    #[test]
    fn path_and_query_includes_query_string() {
        let uri: Uri = "/ping?x=1".parse().unwrap();
        assert_eq!(path_and_query(&uri), "/ping?x=1");
    }

    #[test]
    fn path_and_query_defaults_to_root() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(path_and_query(&uri), "/");
    }

    #[test]
    fn shield_cookie_round_trips_through_the_verify_response() {
        let response = shield_verify_response("secret", "1.2.3.4");
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let value = set_cookie.split(';').next().unwrap().to_string();
        let headers = headers_with(&[(header::COOKIE, &value)]);
        assert!(shield_cookie_valid(&headers, "secret", "1.2.3.4"));
        assert!(!shield_cookie_valid(&headers, "secret", "5.6.7.8"));
    }

    #[test]
    fn auth_cookie_round_trips_for_matching_credentials() {
        let name = crate::auth::auth_cookie_name("api.example");
        let value = crate::auth::auth_cookie_value("secret", "api.example", "alice", "pw");
        let headers = headers_with(&[(header::COOKIE, &format!("{name}={value}"))]);
        assert!(auth_cookie_valid(&headers, "secret", "api.example", "alice", "pw"));
        assert!(!auth_cookie_valid(
            &headers,
            "secret",
            "api.example",
            "alice",
            "wrong"
        ));
    }

    #[test]
    fn looks_like_login_submit_requires_form_content_type() {
        let form = headers_with(&[(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )]);
        assert!(looks_like_login_submit(&form));
        assert!(!looks_like_login_submit(&HeaderMap::new()));
    }

    #[test]
    fn join_headers_formats_as_comma_joined_pairs() {
        let headers = headers_with(&[(header::HOST, "api.example")]);
        assert_eq!(join_headers(&headers), "host: api.example");
    }
}
