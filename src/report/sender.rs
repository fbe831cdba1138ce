//! HTTP delivery of signed reports.

use super::ReportContainer;
use crate::config::{trim_nul, ErrResponse};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;

/// What one delivery attempt did to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the coordinator; the report leaves the system.
    Delivered,
    /// Network-level failure; worth retrying later.
    Transient,
    /// The coordinator rejected it or the request itself is broken; logged
    /// and dropped, never retried.
    Fatal,
}

/// Destination for signed reports. The retry pipeline is written against
/// this seam so tests can script outcomes.
#[async_trait]
pub trait ReportSink: Send + Sync + 'static {
    async fn deliver(&self, report: &ReportContainer) -> SendOutcome;
}

/// POSTs reports to the coordinator's report endpoint.
pub struct ReportClient {
    http: reqwest::Client,
    report_url: String,
    name: String,
}

impl ReportClient {
    /// `base` is the coordinator origin, e.g. `http://star.example:8080`.
    pub fn new(http: reqwest::Client, base: &str, name: &str) -> Self {
        ReportClient {
            http,
            report_url: format!("{base}/report"),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ReportSink for ReportClient {
    async fn deliver(&self, report: &ReportContainer) -> SendOutcome {
        debug!("sending {} report of {}", report.kind(), report.target());
        let request = self
            .http
            .post(&self.report_url)
            .query(&[("type", report.kind().as_str())])
            .header("Content-Type", "application/json; charset=UTF-8")
            .header("X-StarPing-Name", &self.name)
            .header("X-StarPing-Signature", report.signature())
            .body(report.body().to_vec());
        match request.send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                // drain so the pooled connection stays reusable
                let _ = response.bytes().await;
                SendOutcome::Delivered
            }
            Ok(response) => {
                let status = response.status();
                warn!(
                    "failed sending {} report of {}, HTTP status {status}: {}; discarding",
                    report.kind(),
                    report.target(),
                    server_message(response).await
                );
                SendOutcome::Fatal
            }
            Err(err) if err.is_connect() || err.is_timeout() => {
                info!(
                    "failed sending {} report of {}, network error: {err}; queueing for retry",
                    report.kind(),
                    report.target()
                );
                SendOutcome::Transient
            }
            Err(err) => {
                warn!(
                    "failed sending {} report of {}, unrecoverable error: {err}; discarding",
                    report.kind(),
                    report.target()
                );
                SendOutcome::Fatal
            }
        }
    }
}

/// Best-effort extraction of the coordinator's error message.
async fn server_message(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let body = trim_nul(&bytes);
            match serde_json::from_slice::<ErrResponse>(body) {
                Ok(err) => err.message,
                Err(_) => String::from_utf8_lossy(body).into_owned(),
            }
        }
        Err(err) => format!("<failed reading response body: {err}>"),
    }
}
