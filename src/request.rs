use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// One call against the cluster. `path` is relative to the base URL and may
/// carry a query string.
#[derive(Debug, Clone, PartialEq)]
pub struct EsRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl EsRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        EsRequest {
            method,
            path: path.into(),
            body,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, None)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path, None)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path, None)
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path, Some(body))
    }

    pub fn put_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path, Some(body))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, None)
    }

    pub fn delete_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::DELETE, path, Some(body))
    }
}

#[derive(Debug, Clone)]
pub struct EsResponse {
    pub path: String,
    pub status: StatusCode,
    pub body: String,
}

impl EsResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|source| Error::Decode {
            path: self.path.clone(),
            source,
        })
    }

    /// Body as indented JSON, or untouched when it is not JSON (`_cat` output).
    pub fn pretty(&self) -> String {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| self.body.clone()),
            Err(_) => self.body.trim_end().to_string(),
        }
    }
}

/// Rejects names that would turn an index call into a cluster-wide one.
pub(crate) fn require_index(index: &str) -> Result<&str> {
    let index = index.trim();
    if index.is_empty() {
        return Err(Error::InvalidArgument("index name must not be empty".to_string()));
    }
    if index.contains(char::is_whitespace) || index.contains('/') {
        return Err(Error::InvalidArgument(format!("invalid index name: {:?}", index)));
    }
    Ok(index)
}
