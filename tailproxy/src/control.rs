use crate::model::{
    NetMap, RegisterRequest, RegisterResponse, RegisterUrlRequest, RegisterUrlResponse,
};
use anyhow::{anyhow, Context, Result};

/// HTTP client for the overlay coordination server.
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
    node_token: Option<String>,
}

impl ControlClient {
    pub fn new(base_url: &str, node_token: Option<String>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("no control URL configured"));
        }
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build control client")?;
        Ok(Self {
            base_url,
            client,
            node_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.node_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let response = self
            .client
            .post(self.endpoint("/v1/register"))
            .json(&request)
            .send()
            .await
            .context("register request failed")?
            .error_for_status()
            .context("register rejected")?;
        Ok(response.json().await?)
    }

    pub async fn register_url(&self, request: RegisterUrlRequest) -> Result<RegisterUrlResponse> {
        let response = self
            .client
            .post(self.endpoint("/v1/register-url"))
            .json(&request)
            .send()
            .await
            .context("register-url request failed")?
            .error_for_status()
            .context("register-url rejected")?;
        Ok(response.json().await?)
    }

    pub async fn netmap(&self, node_id: &str) -> Result<NetMap> {
        let response = self
            .with_token(
                self.client
                    .get(self.endpoint(&format!("/v1/nodes/{}/netmap", node_id))),
            )
            .send()
            .await
            .context("netmap request failed")?
            .error_for_status()
            .context("netmap rejected")?;
        Ok(response.json().await?)
    }

    /// The absolute URL a user opens to approve interactive authentication.
    pub fn auth_url(&self, auth_path: &str) -> String {
        self.endpoint(auth_path)
    }
}
