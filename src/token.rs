use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::crm::{CrmService, OAuthCredentials};
use crate::error::SyncError;
use crate::model::Account;
use crate::retry::{NoopHook, RetryError, RetryHook, RetryPolicy};

/// Exchanges refresh tokens and installs the result on the account session.
pub struct TokenManager {
    crm: Arc<dyn CrmService>,
    credentials: OAuthCredentials,
    policy: RetryPolicy,
}

impl TokenManager {
    pub fn new(crm: Arc<dyn CrmService>, credentials: OAuthCredentials, policy: RetryPolicy) -> Self {
        Self {
            crm,
            credentials,
            policy,
        }
    }

    #[instrument(skip_all, fields(account = %account.id))]
    pub async fn refresh(&self, account: &Account) -> Result<(), SyncError> {
        let crm = &*self.crm;
        let credentials = &self.credentials;
        let refresh_token = account.refresh_token.as_str();
        let grant = self
            .policy
            .run("refresh_access_token", &NoopHook, move || {
                crm.refresh_access_token(credentials, refresh_token)
            })
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => SyncError::AuthRefreshExhausted {
                    account: account.id.clone(),
                    attempts,
                    source: last.into(),
                },
                RetryError::Aborted(err) => err,
            })?;

        let expires_at = Utc::now() + Duration::seconds(grant.expires_in.max(0));
        let rotated = account.session.install(grant.access_token, expires_at).await;
        info!(rotated, %expires_at, "access token refreshed");
        Ok(())
    }
}

/// Refreshes the session before a retry when its cached expiry has passed.
pub struct ReauthHook<'a> {
    pub tokens: &'a TokenManager,
    pub account: &'a Account,
}

#[async_trait]
impl RetryHook for ReauthHook<'_> {
    async fn before_retry(&self, _retry: u32, _err: &anyhow::Error) -> Result<(), SyncError> {
        if self.account.session.is_expired_at(Utc::now()).await {
            info!(account = %self.account.id, "access token expired; refreshing before retry");
            self.tokens.refresh(self.account).await?;
        }
        Ok(())
    }
}
