//! HTTP client for the control plane's REST record store.

use crate::api::{Authorization, Container, ContainerPage, ContainerState, ControlPlane, Filter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::json;

/// REST implementation of [`ControlPlane`].
#[derive(Clone)]
pub struct RestControlPlane {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl RestControlPlane {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| Error::InvalidResponse(format!("invalid control plane URL: {err}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| Error::InvalidResponse(format!("cannot build URL for {path:?}: {err}")))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|err| {
            Error::InvalidResponse(format!("cannot decode control plane response: {err}"))
        })
    }

    async fn send_empty(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn current_authorization(&self) -> Result<Authorization> {
        let url = self.url("api_client_authorizations/current")?;
        self.send_json(self.http.get(url)).await
    }

    async fn list_containers(&self, filters: &[Filter], offset: usize) -> Result<ContainerPage> {
        let url = self.url("containers")?;
        let filters_json = serde_json::to_string(filters)
            .map_err(|err| Error::InvalidResponse(format!("cannot encode filters: {err}")))?;
        let offset = offset.to_string();
        self.send_json(self.http.get(url).query(&[
            ("filters", filters_json.as_str()),
            ("order", r#"["priority desc"]"#),
            ("offset", offset.as_str()),
        ]))
        .await
    }

    async fn get_container(&self, uuid: &str) -> Result<Container> {
        let url = self.url(&format!("containers/{uuid}"))?;
        self.send_json(self.http.get(url)).await
    }

    async fn lock(&self, uuid: &str) -> Result<()> {
        let url = self.url(&format!("containers/{uuid}/lock"))?;
        self.send_empty(self.http.post(url)).await
    }

    async fn unlock(&self, uuid: &str) -> Result<()> {
        let url = self.url(&format!("containers/{uuid}/unlock"))?;
        self.send_empty(self.http.post(url)).await
    }

    async fn update_state(&self, uuid: &str, state: ContainerState) -> Result<()> {
        let url = self.url(&format!("containers/{uuid}"))?;
        let body = json!({ "container": { "state": state } });
        self.send_empty(self.http.put(url).json(&body)).await
    }
}
