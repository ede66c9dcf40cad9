//! The HTTP transport behind tracker announces.
//!
//! The tracker client only consumes `{status, body}`; connection handling,
//! timeouts and redirects are this layer's problem. Tests inject stub
//! transports through the same trait.

use std::{future::Future, time::Duration};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

pub trait HttpTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}

/// The production transport.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}
