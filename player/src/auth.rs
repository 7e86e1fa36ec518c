//! Server-type detection and the login flow that primes a session's cookie
//! jar before the recorded script starts. A no-op unless both
//! `SHINYCANNON_USER` and `SHINYCANNON_PASS` are set and the target turns
//! out to be protected.

use scraper::{Html, Selector};
use url::Url;

use core::error::ShinyError;

use crate::cli::Credentials;
use crate::http::HttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    Rsc,
    Ssp,
    Unknown,
}

/// A GET against `url` returning 403 or 404 is treated as the gateway
/// hiding an unauthenticated app behind it.
pub async fn is_protected(http: &HttpClient, url: &str) -> Result<bool, ShinyError> {
    let response = http
        .get(url)
        .await
        .map_err(|e| ShinyError::Auth(format!("probe request to {url} failed: {e}")))?;
    Ok(response.status == 403 || response.status == 404)
}

pub fn served_by(response: &crate::http::SimpleResponse) -> ServedBy {
    let headers = &response.headers;

    if let Some(powered_by) = headers.get("x-powered-by").and_then(|v| v.to_str().ok()) {
        if powered_by == "Express" || powered_by == "Shiny Server Pro" {
            return ServedBy::Ssp;
        }
    }
    if headers.contains_key("rscid") {
        return ServedBy::Rsc;
    }
    if let Some(server) = headers.get("server").and_then(|v| v.to_str().ok()) {
        if server.starts_with("RStudio Connect") {
            return ServedBy::Rsc;
        }
    }
    if headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|cookie| cookie.trim_start().starts_with("rscid="))
    {
        return ServedBy::Rsc;
    }

    ServedBy::Unknown
}

/// Reverse-proxy-aware `__login__` URL.
///
/// RSC mounts the login endpoint at the app's deployment root, which for a
/// path with more than two segments means dropping the last two (content
/// name + revision) before appending `__login__`.
pub fn login_url_for(url: &str, server: ServedBy) -> Result<String, ShinyError> {
    let parsed = Url::parse(url).map_err(|e| ShinyError::Auth(format!("bad url {url}: {e}")))?;

    match server {
        ServedBy::Rsc => {
            let segments: Vec<&str> = parsed
                .path_segments()
                .map(|s| s.filter(|seg| !seg.is_empty()).collect())
                .unwrap_or_default();
            let mut base = parsed.clone();
            if segments.len() > 2 {
                let kept = &segments[..segments.len() - 2];
                base.set_path(&format!("/{}/__login__", kept.join("/")));
            } else {
                base.set_path("/__login__");
            }
            Ok(base.to_string())
        }
        ServedBy::Ssp => {
            let mut base = parsed.clone();
            let path = base.path().trim_end_matches('/').to_string();
            base.set_path(&format!("{path}/__login__"));
            Ok(base.to_string())
        }
        ServedBy::Unknown => Err(ShinyError::Auth(format!(
            "cannot determine login url for {url}: unknown server type"
        ))),
    }
}

/// SSP embeds hidden CSRF-style inputs in the login page; RSC needs none.
pub fn get_inputs(body: &str, server: ServedBy) -> Vec<(String, String)> {
    if server != ServedBy::Ssp {
        return Vec::new();
    }

    let document = Html::parse_document(body);
    let selector = Selector::parse(r#"input[type="hidden"]"#).expect("static selector is valid");

    document
        .select(&selector)
        .filter_map(|el| {
            let name = el.value().attr("name")?.to_string();
            let value = el.value().attr("value").unwrap_or_default().to_string();
            Some((name, value))
        })
        .collect()
}

fn status_is_ok_or_redirect(status: u16) -> bool {
    status == 200 || status == 302
}

pub async fn login_rsc(
    http: &HttpClient,
    login_url: &str,
    creds: &Credentials,
) -> Result<(), ShinyError> {
    let body = serde_json::json!({
        "username": creds.user,
        "password": creds.password,
    });
    let response = http
        .post_json(login_url, &body)
        .await
        .map_err(|e| ShinyError::Auth(format!("rsc login post failed: {e}")))?;

    if !status_is_ok_or_redirect(response.status.as_u16()) {
        return Err(ShinyError::Auth(format!(
            "rsc login returned unexpected status {}",
            response.status
        )));
    }

    let jar_url = Url::parse(login_url).map_err(|e| ShinyError::Auth(e.to_string()))?;
    if http.find_cookie(&jar_url, "rsconnect").is_none() {
        return Err(ShinyError::Auth(
            "rsc login did not set the rsconnect cookie".into(),
        ));
    }
    Ok(())
}

pub async fn login_ssp(
    http: &HttpClient,
    login_url: &str,
    creds: &Credentials,
    hidden_inputs: &[(String, String)],
) -> Result<(), ShinyError> {
    let mut form = vec![
        ("username".to_string(), creds.user.clone()),
        ("password".to_string(), creds.password.clone()),
    ];
    form.extend_from_slice(hidden_inputs);

    let response = http
        .post_form(login_url, &form)
        .await
        .map_err(|e| ShinyError::Auth(format!("ssp login post failed: {e}")))?;

    if !status_is_ok_or_redirect(response.status.as_u16()) {
        return Err(ShinyError::Auth(format!(
            "ssp login returned unexpected status {}",
            response.status
        )));
    }

    let jar_url = Url::parse(login_url).map_err(|e| ShinyError::Auth(e.to_string()))?;
    if http.find_cookie(&jar_url, "session_state").is_none() {
        return Err(ShinyError::Auth(
            "ssp login did not set the session_state cookie".into(),
        ));
    }
    Ok(())
}

/// GETs `url` to infer the server type and scrape any hidden login-form
/// inputs, then dispatches to the matching login flow.
pub async fn post_login(http: &HttpClient, url: &str, creds: &Credentials) -> Result<(), ShinyError> {
    let probe = http
        .get(url)
        .await
        .map_err(|e| ShinyError::Auth(format!("login probe request failed: {e}")))?;
    let server = served_by(&probe);

    let login_url = login_url_for(url, server)?;
    let hidden_inputs = get_inputs(&probe.body, server);

    match server {
        ServedBy::Rsc => login_rsc(http, &login_url, creds).await,
        ServedBy::Ssp => login_ssp(http, &login_url, creds, &hidden_inputs).await,
        ServedBy::Unknown => Err(ShinyError::Auth(format!(
            "cannot log in to {url}: unknown server type"
        ))),
    }
}

/// No-op unless credentials are present and the app is actually protected.
pub async fn maybe_login(
    http: &HttpClient,
    app_url: &str,
    creds: Option<&Credentials>,
) -> Result<(), ShinyError> {
    let Some(creds) = creds else {
        return Ok(());
    };
    if !is_protected(http, app_url).await? {
        return Ok(());
    }
    post_login(http, app_url, creds).await
}
