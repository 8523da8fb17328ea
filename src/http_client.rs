//! Shared outbound HTTP client. One `reqwest::Client` is reused for every
//! hop so connections to a given bridge or homeserver are pooled.

use std::time::Duration;

use reqwest::Client;

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn timeout(seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
