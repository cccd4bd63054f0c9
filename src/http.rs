//! Request and response values flowing through the gateway.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// An intercepted request from the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: impl Into<String>, url: Url) -> Self {
    Self {
      method: method.into().to_uppercase(),
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// A JSON POST, used for sync delivery and queued mutations.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Self {
    Self {
      method: "POST".to_string(),
      url,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(body.to_string().into_bytes()),
    }
  }

  /// Build a host-issued request. A JSON body without an explicit method is
  /// sent as POST; GET and HEAD never carry a body.
  pub fn compose(method: Option<&str>, url: Url, body: Option<&serde_json::Value>) -> Result<Self> {
    let Some(body) = body else {
      return Ok(Self::new(method.unwrap_or("GET"), url));
    };

    let mut request = Self::post_json(url, body);
    if let Some(method) = method {
      request.method = method.to_uppercase();
    }
    if matches!(request.method.as_str(), "GET" | "HEAD") {
      bail!("{} request cannot carry a body", request.method);
    }
    Ok(request)
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Cache identity: method plus absolute URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }
}

/// A response as returned to the host, either from the network or a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// The designated response for an unreachable network with nothing cached.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_date(self, date: DateTime<Utc>) -> Self {
    self.with_header("date", date.to_rfc2822())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Timestamp from the response's own `date` header.
  pub fn date(&self) -> Option<DateTime<Utc>> {
    self
      .header("date")
      .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
      .map(|d| d.with_timezone(&Utc))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_cache_key_strips_fragment() {
    let req = Request::get(Url::parse("http://localhost:3000/page?x=1#section").unwrap());
    assert_eq!(req.cache_key(), "GET http://localhost:3000/page?x=1");
  }

  #[test]
  fn test_method_is_normalized() {
    let req = Request::new("post", Url::parse("http://localhost:3000/api/x").unwrap());
    assert_eq!(req.method, "POST");
    assert!(!req.is_get());
  }

  #[test]
  fn test_body_defaults_to_post() {
    let url = Url::parse("http://localhost:3000/api/tickets").unwrap();
    let body = serde_json::json!({"subject": "vpn"});

    let req = Request::compose(None, url.clone(), Some(&body)).unwrap();
    assert_eq!(req.method, "POST");
    assert!(req.body.is_some());

    let req = Request::compose(Some("put"), url.clone(), Some(&body)).unwrap();
    assert_eq!(req.method, "PUT");

    let req = Request::compose(None, url.clone(), None).unwrap();
    assert!(req.is_get());
    assert!(req.body.is_none());

    assert!(Request::compose(Some("GET"), url, Some(&body)).is_err());
  }

  #[test]
  fn test_parse_http_date() {
    let resp = Response::new(200, "ok").with_header("Date", "Tue, 15 Nov 1994 08:12:31 GMT");
    let expected = Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap();
    assert_eq!(resp.date(), Some(expected));
  }

  #[test]
  fn test_missing_or_garbage_date() {
    assert_eq!(Response::new(200, "ok").date(), None);
    let resp = Response::new(200, "ok").with_header("date", "yesterday");
    assert_eq!(resp.date(), None);
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::offline().is_success());
  }
}
