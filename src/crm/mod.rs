use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, warn};

use crate::crm::model::{
    AssociationResult, BatchResults, CrmObject, SearchPage, SearchRequest, TokenGrant,
};
use crate::model::{EntityType, Session};

pub mod model;

pub const HUBSPOT_API_BASE: &str = "https://api.hubapi.com/";
pub const CLIENT_ID_ENV: &str = "HUBSPOT_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "HUBSPOT_CLIENT_SECRET";

/// OAuth app credentials used to exchange refresh tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl OAuthCredentials {
    pub fn from_env() -> Result<Self> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("environment variable {key} must be set"))
        };
        Ok(Self {
            client_id: read(CLIENT_ID_ENV)?,
            client_secret: read(CLIENT_SECRET_ENV)?,
        })
    }
}

/// Remote CRM operations the sync engine depends on.
#[async_trait]
pub trait CrmService: Send + Sync {
    async fn refresh_access_token(
        &self,
        credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant>;

    async fn search(
        &self,
        session: &Session,
        entity: EntityType,
        request: &SearchRequest,
    ) -> Result<SearchPage>;

    async fn read_associations(
        &self,
        session: &Session,
        from: EntityType,
        to: EntityType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>>;

    async fn batch_read(
        &self,
        session: &Session,
        entity: EntityType,
        ids: &[String],
        properties: &[&str],
    ) -> Result<Vec<CrmObject>>;
}

#[derive(Clone)]
pub struct HubSpotClient {
    http: Client,
    base_url: Url,
    token_path: String,
}

impl fmt::Debug for HubSpotClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubSpotClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HubSpotClient {
    pub fn new(base_url: &str, token_path: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid CRM base URL")?;
        let http = Client::builder()
            .user_agent("crm-sync/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token_path: token_path.trim_start_matches('/').to_string(),
        })
    }

    pub fn build_request(&self, path: &str, token: &str, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid CRM path {path}"))?;
        self.http
            .post(endpoint)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build CRM request")
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let url = request.url().clone();
        debug!(%url, "CRM request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach {url}"))?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by CRM");
            return Err(anyhow!("received 429 from {}: {}", url.path(), body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("CRM error {} on {}: {}", status, url.path(), body));
        }
        res.json::<T>()
            .await
            .with_context(|| format!("invalid JSON from {}", url.path()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
        body: &Value,
    ) -> Result<T> {
        let token = session.access_token().await;
        let request = self.build_request(path, &token, body)?;
        self.execute(request).await
    }
}

#[async_trait]
impl CrmService for HubSpotClient {
    async fn refresh_access_token(
        &self,
        credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant> {
        let endpoint = self
            .base_url
            .join(&self.token_path)
            .context("invalid token endpoint")?;
        let request = self
            .http
            .post(endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .build()
            .context("failed to build token request")?;
        self.execute(request).await
    }

    async fn search(
        &self,
        session: &Session,
        entity: EntityType,
        request: &SearchRequest,
    ) -> Result<SearchPage> {
        let body = serde_json::to_value(request).context("failed to encode search request")?;
        let path = format!("crm/v3/objects/{}/search", entity.as_str());
        self.post_json(session, &path, &body).await
    }

    async fn read_associations(
        &self,
        session: &Session,
        from: EntityType,
        to: EntityType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>> {
        let inputs: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        let path = format!(
            "crm/v3/associations/{}/{}/batch/read",
            from.as_str(),
            to.as_str()
        );
        let res: BatchResults<AssociationResult> = self
            .post_json(session, &path, &json!({ "inputs": inputs }))
            .await?;
        Ok(res.results)
    }

    async fn batch_read(
        &self,
        session: &Session,
        entity: EntityType,
        ids: &[String],
        properties: &[&str],
    ) -> Result<Vec<CrmObject>> {
        let inputs: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        let path = format!("crm/v3/objects/{}/batch/read", entity.as_str());
        let res: BatchResults<CrmObject> = self
            .post_json(
                session,
                &path,
                &json!({ "inputs": inputs, "properties": properties }),
            )
            .await?;
        Ok(res.results)
    }
}
