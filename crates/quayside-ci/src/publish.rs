//! Publishing vulnerability reports to the security-reporting surface.

use std::sync::Arc;

use async_trait::async_trait;
use quayside_state::{ReportStore, VulnerabilityReport};
use tracing::info;

use crate::error::CiError;

/// Destination for scan reports.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, report: &VulnerabilityReport) -> Result<(), CiError>;
}

/// Stores reports in a [`ReportStore`], queryable by severity.
pub struct StorePublisher {
    store: Arc<dyn ReportStore>,
}

impl StorePublisher {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReportPublisher for StorePublisher {
    fn name(&self) -> &str {
        "report-store"
    }

    async fn publish(&self, report: &VulnerabilityReport) -> Result<(), CiError> {
        self.store.publish(report).await?;
        Ok(())
    }
}

/// POSTs each report as JSON to an HTTP endpoint, authenticated with the
/// ambient pipeline token.
pub struct HttpReportPublisher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpReportPublisher {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, CiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quayside/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CiError::ReportUpload(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl ReportPublisher for HttpReportPublisher {
    fn name(&self) -> &str {
        &self.url
    }

    async fn publish(&self, report: &VulnerabilityReport) -> Result<(), CiError> {
        let mut request = self.client.post(&self.url).json(report);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CiError::ReportUpload(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CiError::ReportUpload(format!("{status}: {body}")));
        }

        info!(url = %self.url, digest = %report.image_digest, "report uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quayside_state::fakes::MemoryReportStore;
    use quayside_state::{Finding, ImageDigest, Severity};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn report() -> VulnerabilityReport {
        VulnerabilityReport {
            image_digest: ImageDigest::of_bytes(b"img"),
            image_ref: "ghcr.io/acme/shop:main".to_string(),
            scanner: "trivy".to_string(),
            findings: vec![Finding {
                id: "CVE-2024-0001".to_string(),
                package: "libssl3".to_string(),
                installed_version: "3.1.4".to_string(),
                fixed_version: None,
                severity: Severity::Critical,
                title: None,
            }],
            scanned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn store_publisher_makes_report_queryable() {
        let store = Arc::new(MemoryReportStore::new());
        let publisher = StorePublisher::new(store.clone());
        publisher.publish(&report()).await.unwrap();

        let critical = store.list_at_least(Severity::Critical).await.unwrap();
        assert_eq!(critical.len(), 1);
    }

    #[tokio::test]
    async fn http_publisher_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reports"))
            .and(header("authorization", "Bearer ghs_token"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = HttpReportPublisher::new(
            format!("{}/reports", server.uri()),
            Some("ghs_token".to_string()),
        )
        .unwrap();
        publisher.publish(&report()).await.unwrap();
    }

    #[tokio::test]
    async fn http_publisher_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let publisher = HttpReportPublisher::new(server.uri(), None).unwrap();
        let err = publisher.publish(&report()).await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
