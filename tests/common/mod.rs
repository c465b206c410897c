#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crm_sync::crm::model::{
    AssociationRef, AssociationResult, AssociationTarget, CrmObject, NextPage, Paging, SearchPage,
    SearchRequest, TokenGrant,
};
use crm_sync::crm::{CrmService, OAuthCredentials};
use crm_sync::model::{Action, EntityType, Session};
use crm_sync::sink::ActionSink;

pub fn credentials() -> OAuthCredentials {
    OAuthCredentials {
        client_id: "client".into(),
        client_secret: "secret".into(),
    }
}

pub fn record(id: &str, created: DateTime<Utc>, updated: DateTime<Utc>, props: Value) -> CrmObject {
    CrmObject {
        id: id.into(),
        properties: props.as_object().cloned(),
        created_at: created,
        updated_at: updated,
    }
}

pub fn page(results: Vec<CrmObject>, next: Option<&str>) -> SearchPage {
    SearchPage {
        results,
        paging: next.map(|after| Paging {
            next: Some(NextPage {
                after: after.to_string(),
            }),
        }),
    }
}

pub fn association(meeting_id: &str, targets: &[(&str, &str)]) -> AssociationResult {
    AssociationResult {
        from: AssociationRef {
            id: meeting_id.into(),
        },
        to: targets
            .iter()
            .map(|(id, kind)| AssociationTarget {
                id: id.to_string(),
                kind: kind.to_string(),
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct SearchCall {
    pub entity: EntityType,
    pub request: SearchRequest,
    pub token: String,
}

/// CRM double answering from per-operation scripts. An exhausted search
/// script answers with an empty last page; an exhausted refresh script
/// issues numbered tokens.
#[derive(Clone, Default)]
pub struct ScriptedCrm {
    searches: Arc<Mutex<HashMap<EntityType, VecDeque<Result<SearchPage>>>>>,
    search_calls: Arc<Mutex<Vec<SearchCall>>>,
    refreshes: Arc<Mutex<VecDeque<Result<TokenGrant>>>>,
    refresh_calls: Arc<Mutex<usize>>,
    associations: Arc<Mutex<HashMap<String, Result<Vec<AssociationResult>>>>>,
    emails: Arc<Mutex<HashMap<String, String>>>,
}

impl ScriptedCrm {
    pub async fn script_search(&self, entity: EntityType, response: Result<SearchPage>) {
        self.searches
            .lock()
            .await
            .entry(entity)
            .or_default()
            .push_back(response);
    }

    pub async fn fail_search(&self, entity: EntityType, times: usize) {
        for n in 0..times {
            self.script_search(entity, Err(anyhow!("search failure #{n}")))
                .await;
        }
    }

    pub async fn script_refresh(&self, response: Result<TokenGrant>) {
        self.refreshes.lock().await.push_back(response);
    }

    pub async fn script_associations(&self, meeting_id: &str, response: Result<Vec<AssociationResult>>) {
        self.associations
            .lock()
            .await
            .insert(meeting_id.to_string(), response);
    }

    pub async fn add_contact_email(&self, contact_id: &str, email: &str) {
        self.emails
            .lock()
            .await
            .insert(contact_id.to_string(), email.to_string());
    }

    pub async fn search_calls(&self) -> Vec<SearchCall> {
        self.search_calls.lock().await.clone()
    }

    pub async fn searches_for(&self, entity: EntityType) -> Vec<SearchCall> {
        self.search_calls()
            .await
            .into_iter()
            .filter(|c| c.entity == entity)
            .collect()
    }

    pub async fn refresh_calls(&self) -> usize {
        *self.refresh_calls.lock().await
    }
}

#[async_trait::async_trait]
impl CrmService for ScriptedCrm {
    async fn refresh_access_token(
        &self,
        _credentials: &OAuthCredentials,
        _refresh_token: &str,
    ) -> Result<TokenGrant> {
        let n = {
            let mut calls = self.refresh_calls.lock().await;
            *calls += 1;
            *calls
        };
        self.refreshes.lock().await.pop_front().unwrap_or_else(|| {
            Ok(TokenGrant {
                access_token: format!("token-{n}"),
                expires_in: 1800,
            })
        })
    }

    async fn search(
        &self,
        session: &Session,
        entity: EntityType,
        request: &SearchRequest,
    ) -> Result<SearchPage> {
        self.search_calls.lock().await.push(SearchCall {
            entity,
            request: request.clone(),
            token: session.access_token().await,
        });
        self.searches
            .lock()
            .await
            .get_mut(&entity)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| Ok(SearchPage::default()))
    }

    async fn read_associations(
        &self,
        _session: &Session,
        _from: EntityType,
        _to: EntityType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>> {
        let mut scripted = self.associations.lock().await;
        match ids.first().and_then(|id| scripted.remove(id)) {
            Some(response) => response,
            None => Ok(Vec::new()),
        }
    }

    async fn batch_read(
        &self,
        _session: &Session,
        _entity: EntityType,
        ids: &[String],
        _properties: &[&str],
    ) -> Result<Vec<CrmObject>> {
        let emails = self.emails.lock().await;
        let now = Utc::now();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let email = emails.get(id)?;
                Some(record(id, now, now, serde_json::json!({ "email": email })))
            })
            .collect())
    }
}

/// Sink double keeping every flushed batch; the first `failures` inserts fail.
#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<Action>>>>,
    failures: Arc<Mutex<usize>>,
}

impl RecordingSink {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: Arc::new(Mutex::new(failures)),
            ..Default::default()
        }
    }

    pub async fn batches(&self) -> Vec<Vec<Action>> {
        self.batches.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<Action> {
        self.batches().await.into_iter().flatten().collect()
    }
}

#[async_trait::async_trait]
impl ActionSink for RecordingSink {
    async fn insert_many(&self, actions: &[Action]) -> Result<()> {
        {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("sink unavailable"));
            }
        }
        self.batches.lock().await.push(actions.to_vec());
        Ok(())
    }
}
