use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use structopt::StructOpt;

use crate::error::{Error, Result};
use crate::request::{EsRequest, EsResponse};

#[derive(Debug, StructOpt, Clone)]
pub struct ConnectionOptions {
    /// Cluster base URL
    #[structopt(long, env = "ES_URL", default_value = "http://localhost:9200")]
    pub url: String,
    /// Basic auth user
    #[structopt(long, env = "ES_USER")]
    pub user: Option<String>,
    /// Basic auth password
    #[structopt(long, env = "ES_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Accept invalid TLS certificates
    #[structopt(long)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[structopt(long, env = "ES_TIMEOUT", default_value = "30")]
    pub timeout: u64,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        ConnectionOptions {
            url: url.into(),
            user: None,
            password: None,
            insecure: false,
            timeout: 30,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

pub struct EsClient {
    base_url: String,
    client: Client,
    user: Option<String>,
    password: Option<String>,
}

impl EsClient {
    pub fn new(opts: &ConnectionOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(opts.timeout))
            .danger_accept_invalid_certs(opts.insecure)
            .build()
            .map_err(|source| Error::Http {
                method: Method::GET,
                path: opts.url.clone(),
                source,
            })?;
        Ok(EsClient {
            base_url: opts.url.trim_end_matches('/').to_string(),
            client,
            user: opts.user.clone(),
            password: opts.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn builder(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path).as_str());
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// Sends one request. Anything outside 2xx is an `Error::Status`.
    pub fn send(&self, req: &EsRequest) -> Result<EsResponse> {
        let mut builder = self.builder(req.method.clone(), &req.path);
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        let resp = self.execute(&req.method, &req.path, builder)?;
        check_status(&req.method, &req.path, resp)
    }

    /// POSTs newline-delimited JSON, as `_bulk` expects.
    pub fn send_ndjson(&self, path: &str, body: String) -> Result<EsResponse> {
        let builder = self
            .builder(Method::POST, path)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let resp = self.execute(&Method::POST, path, builder)?;
        check_status(&Method::POST, path, resp)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(&EsRequest::get(path))?.json()
    }

    /// HEAD probe: 200 is true, 404 is false.
    pub fn exists(&self, path: &str) -> Result<bool> {
        let builder = self.builder(Method::HEAD, path);
        let resp = self.execute(&Method::HEAD, path, builder)?;
        match resp.status().as_u16() {
            404 => Ok(false),
            _ => check_status(&Method::HEAD, path, resp).map(|_| true),
        }
    }

    fn execute(&self, method: &Method, path: &str, builder: RequestBuilder) -> Result<Response> {
        log::debug!("method: {} path: {}", method, path);
        builder.send().map_err(|source| Error::Http {
            method: method.clone(),
            path: path.to_string(),
            source,
        })
    }
}

fn check_status(method: &Method, path: &str, resp: Response) -> Result<EsResponse> {
    let status = resp.status();
    log::debug!("method: {} path: {} status: {:?}", method, path, status);
    let body = resp.text().map_err(|source| Error::Http {
        method: method.clone(),
        path: path.to_string(),
        source,
    })?;
    if !status.is_success() {
        log::error!("method: {} path: {} status: {} error: {}", method, path, status.as_u16(), body);
        return Err(Error::Status {
            method: method.clone(),
            path: path.to_string(),
            status,
            body,
        });
    }
    Ok(EsResponse {
        path: path.to_string(),
        status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let client = EsClient::new(&ConnectionOptions::new("http://localhost:9200/")).unwrap();
        assert_eq!(client.url("/_cluster/health"), "http://localhost:9200/_cluster/health");
        assert_eq!(client.url("logs/_refresh"), "http://localhost:9200/logs/_refresh");
    }
}
