//! REST client for the controller's probe-target list and result
//! ingestion endpoints.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::VoyagerConfig;
use crate::error::ProbeError;
use crate::probe::{Probe, ProbeTarget};

const PAGE_SIZE: usize = 100;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// DRF list envelope returned by the target-list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetPage {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<ProbeTarget>,
}

impl TargetPage {
    fn has_more(&self) -> bool {
        self.next.as_deref().is_some_and(|next| !next.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct VoyagerClient {
    http: reqwest::Client,
    server: String,
    token: String,
}

impl VoyagerClient {
    pub fn new(config: &VoyagerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            server: config.server.clone(),
            token: config.token.clone(),
        })
    }

    fn targets_url(&self) -> String {
        format!("https://{}/api/v1/probes/probe-targets/", self.server)
    }

    fn results_url(&self) -> String {
        format!("https://{}/api/v1/probe-results/", self.server)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// Fetch the full target list, following DRF pagination until the
    /// `next` link runs out.
    pub async fn fetch_targets(&self) -> Result<Vec<ProbeTarget>, ProbeError> {
        let mut targets = Vec::new();
        let mut offset = 0usize;
        loop {
            let response = self
                .http
                .get(self.targets_url())
                .header(AUTHORIZATION, self.auth_header())
                .query(&[("limit", PAGE_SIZE), ("offset", offset)])
                .send()
                .await
                .map_err(|err| ProbeError::ControllerFetch(err.to_string()))?;

            if response.status() != StatusCode::OK {
                return Err(ProbeError::ControllerFetch(format!(
                    "{} from target list",
                    response.status()
                )));
            }

            let page: TargetPage = response
                .json()
                .await
                .map_err(|err| ProbeError::ControllerFetch(err.to_string()))?;
            debug!(
                count = page.count,
                fetched = page.results.len(),
                offset,
                "fetched target page"
            );

            let has_more = page.has_more();
            targets.extend(page.results);
            if !has_more {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(targets)
    }

    /// Ship one completed probe cycle. The ingestion API answers 201 on
    /// success; anything else is a publish failure for the caller to log.
    pub async fn publish(&self, probe: &Probe) -> Result<(), ProbeError> {
        let response = self
            .http
            .post(self.results_url())
            .header(AUTHORIZATION, self.auth_header())
            .json(probe)
            .send()
            .await
            .map_err(|err| ProbeError::Publish(err.to_string()))?;

        if response.status() != StatusCode::CREATED {
            warn!(status = %response.status(), target = %probe.target, "result ingestion rejected probe");
            return Err(ProbeError::Publish(format!(
                "{} from result ingestion",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> VoyagerClient {
        VoyagerClient::new(&VoyagerConfig {
            token: "secret".to_string(),
            server: "controller.example.com:8443".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_urls() {
        let client = client();
        assert_eq!(
            client.targets_url(),
            "https://controller.example.com:8443/api/v1/probes/probe-targets/"
        );
        assert_eq!(
            client.results_url(),
            "https://controller.example.com:8443/api/v1/probe-results/"
        );
        assert_eq!(client.auth_header(), "Token secret");
    }

    #[test]
    fn test_target_page_pagination_markers() {
        let page: TargetPage = serde_json::from_str(
            r#"{"count": 250, "next": "https://c/api?offset=100", "previous": null, "results": []}"#,
        )
        .unwrap();
        assert!(page.has_more());

        let last: TargetPage =
            serde_json::from_str(r#"{"count": 250, "next": null, "previous": "x", "results": []}"#)
                .unwrap();
        assert!(!last.has_more());

        // some DRF deployments send "" instead of null on the last page
        let empty_next: TargetPage =
            serde_json::from_str(r#"{"count": 250, "next": "", "previous": "x", "results": []}"#)
                .unwrap();
        assert!(!empty_next.has_more());
    }

    #[test]
    fn test_target_page_decodes_results() {
        let page: TargetPage = serde_json::from_str(
            r#"{
                "count": 1,
                "next": null,
                "previous": null,
                "results": [
                    {"destination": "order.example.com", "interval": 30,
                     "probe_count": 3, "probe_type": "tcp", "port": 443}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].destination, "order.example.com");
        assert_eq!(page.results[0].port, 443);
    }
}
