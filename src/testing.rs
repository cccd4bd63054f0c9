//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::Network;

/// What the fake network does with a request.
pub enum Reply {
  Respond(Response),
  Fail,
  Slow(Duration, Response),
}

type Handler = Box<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Scripted network that records every request it sees.
#[derive(Clone)]
pub struct FakeNetwork {
  handler: Arc<Mutex<Handler>>,
  log: Arc<Mutex<Vec<Request>>>,
}

impl FakeNetwork {
  pub fn new(handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
    Self {
      handler: Arc::new(Mutex::new(Box::new(handler))),
      log: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Every request answers 200 with the path as body.
  pub fn echo() -> Self {
    Self::new(|req| Reply::Respond(Response::new(200, req.url.path())))
  }

  pub fn offline() -> Self {
    Self::new(|_| Reply::Fail)
  }

  pub fn set_handler(&self, handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) {
    *self.handler.lock().unwrap() = Box::new(handler);
  }

  pub fn calls(&self) -> usize {
    self.log.lock().unwrap().len()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.log.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.log.lock().unwrap().push(request.clone());
    let reply = (self.handler.lock().unwrap())(request);
    match reply {
      Reply::Respond(resp) => Ok(resp),
      Reply::Fail => Err(eyre!("connection refused: {}", request.url)),
      Reply::Slow(delay, resp) => {
        tokio::time::sleep(delay).await;
        Ok(resp)
      }
    }
  }
}

pub fn url(path: &str) -> Url {
  Config::default().resolve(path).unwrap()
}

pub fn get(path: &str) -> Request {
  Request::get(url(path))
}
