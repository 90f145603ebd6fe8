use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{AnalysisOracle, AnalysisVerdict, ImagePayload, OracleError};

pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    mime_type: &'a str,
    image: String,
}

/// JSON-over-HTTP oracle client.
///
/// `POST <url>` with `{"mimeType", "image": <data URL>}`; the response body
/// is the verdict. The blocking client runs on the blocking pool.
#[derive(Clone)]
pub struct HttpOracle {
    agent: ureq::Agent,
    url: url::Url,
    token: Option<String>,
}

impl HttpOracle {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| anyhow::anyhow!("invalid oracle url '{}': {}", url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "oracle url must be http or https, got '{}'",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, url, token })
    }

    fn call(&self, image: &ImagePayload) -> Result<AnalysisVerdict, OracleError> {
        let body = AnalyzeRequest {
            mime_type: &image.mime_type,
            image: image.to_data_url(),
        };
        let mut request = self
            .agent
            .post(self.url.as_str())
            .set("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }

        let response = match request.send_json(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(OracleError::Status {
                    code,
                    body: body.chars().take(200).collect(),
                });
            }
            Err(ureq::Error::Transport(t)) => return Err(OracleError::Transport(t.to_string())),
        };

        let verdict: AnalysisVerdict = response
            .into_json()
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        verdict.validate()
    }
}

#[async_trait]
impl AnalysisOracle for HttpOracle {
    async fn analyze(&self, image: ImagePayload) -> Result<AnalysisVerdict, OracleError> {
        let client = self.clone();
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || client.call(&image))
            .await
            .map_err(|e| OracleError::Transport(format!("oracle task failed: {}", e)))?;
        match &result {
            Ok(v) => log::info!(
                "HttpOracle: verdict {} (p={:.2}) in {}ms",
                v.anomaly_grade,
                v.probability_of_genuine_event,
                started.elapsed().as_millis()
            ),
            Err(e) => log::warn!("HttpOracle: {}", e),
        }
        result
    }
}
