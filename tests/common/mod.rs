#![allow(dead_code)]

use es_admin::client::{ConnectionOptions, EsClient};
use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer, Request};

/// Mock cluster for the blocking client. The server runs on its own runtime
/// while requests are sent from the test thread.
pub struct MockEs {
    pub server: MockServer,
    rt: Runtime,
}

impl MockEs {
    pub fn start() -> Self {
        let rt = Runtime::new().expect("tokio runtime");
        let server = rt.block_on(MockServer::start());
        MockEs { server, rt }
    }

    pub fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn client(&self) -> EsClient {
        EsClient::new(&self.connection()).expect("client")
    }

    pub fn connection(&self) -> ConnectionOptions {
        ConnectionOptions::new(self.uri())
    }

    pub fn requests(&self) -> Vec<Request> {
        self.rt
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }

    /// `METHOD path?query` of every received request, in order.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| match r.url.query() {
                Some(query) => format!("{} {}?{}", r.method, r.url.path(), query),
                None => format!("{} {}", r.method, r.url.path()),
            })
            .collect()
    }

    pub fn body_of(&self, method: &str, path: &str) -> Option<serde_json::Value> {
        self.requests()
            .iter()
            .find(|r| r.method.to_string() == method && r.url.path() == path)
            .and_then(|r| serde_json::from_slice(&r.body).ok())
    }
}
