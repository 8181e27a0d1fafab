//! HTTP client for the push endpoint and the SignIn cookie exchange.
//!
//! Cookies are shared mutable state: the auto-login path replaces them and
//! every request reads them, so they live behind a mutex.

use std::path::Path;

use anyhow::{bail, Context, Result};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};

use crate::protocol::route;

pub struct HttpClient {
    client: Client,
    cookies: parking_lot::Mutex<Vec<String>>,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        // redirects are not followed: SignIn answers with Set-Cookie, and a
        // followed redirect would drop it
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            cookies: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn cookies(&self) -> Vec<String> {
        self.cookies.lock().clone()
    }

    pub fn set_cookies(&self, cookies: Vec<String>) {
        *self.cookies.lock() = cookies;
    }

    fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.lock();
        if cookies.is_empty() {
            None
        } else {
            Some(cookies.join("; "))
        }
    }

    /// POST an urlencoded form with the session cookies attached.
    pub async fn post_form(&self, url: &str, fields: &[(&str, String)]) -> Result<Response> {
        let mut req = self.client.post(url).form(fields);
        if let Some(header) = self.cookie_header() {
            req = req.header(COOKIE, header);
        }
        req.send().await.with_context(|| format!("post {}", url))
    }

    /// POST a multipart form carrying the file body under `file_field`.
    pub async fn post_multipart(
        &self,
        url: &str,
        fields: &[(&str, String)],
        file_field: &'static str,
        file_path: &Path,
    ) -> Result<Response> {
        let body = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("read upload body {}", file_path.display()))?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name.to_string(), value.clone());
        }
        form = form.part(file_field, Part::bytes(body).file_name(file_name));

        let mut req = self.client.post(url).multipart(form);
        if let Some(header) = self.cookie_header() {
            req = req.header(COOKIE, header);
        }
        req.send().await.with_context(|| format!("post {}", url))
    }

    /// Exchange credentials for session cookies at the server's SignIn
    /// endpoint. Returns the cookies without installing them; the caller
    /// decides whether to replace the session set.
    pub async fn sign_in(
        &self,
        scheme: &str,
        host: &str,
        user_name: &str,
        password: &str,
    ) -> Result<Vec<String>> {
        let url = format!("{}://{}{}", scheme, host, route::SIGN_IN);
        let resp = self
            .client
            .post(&url)
            .form(&[("username", user_name), ("password", password)])
            .send()
            .await
            .with_context(|| format!("sign in at {}", url))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::FOUND {
            bail!("sign in failed with status {}", resp.status());
        }
        let cookies: Vec<String> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        Ok(cookies)
    }
}

/// Extract the `name=value` pair from a Set-Cookie header value.
fn parse_set_cookie(value: &str) -> Option<String> {
    let pair = value.split(';').next()?.trim();
    if pair.contains('=') {
        Some(pair.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing() {
        assert_eq!(
            parse_set_cookie("session=abc123; Path=/; HttpOnly"),
            Some("session=abc123".to_string())
        );
        assert_eq!(parse_set_cookie("token=x"), Some("token=x".to_string()));
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let hc = HttpClient::new().unwrap();
        assert!(hc.cookie_header().is_none());
        hc.set_cookies(vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(hc.cookie_header().unwrap(), "a=1; b=2");
        assert_eq!(hc.cookies().len(), 2);
    }
}
