use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// CRM object types swept by the engine, in the order the orchestrator visits them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Contacts,
    Companies,
    Meetings,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Contacts,
        EntityType::Companies,
        EntityType::Meetings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Contacts => "contacts",
            EntityType::Companies => "companies",
            EntityType::Meetings => "meetings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contacts" => Some(EntityType::Contacts),
            "companies" => Some(EntityType::Companies),
            "meetings" => Some(EntityType::Meetings),
            _ => None,
        }
    }

    /// Singular label used to build action names ("Contact Created").
    pub fn action_prefix(&self) -> &'static str {
        match self {
            EntityType::Contacts => "Contact",
            EntityType::Companies => "Company",
            EntityType::Meetings => "Meeting",
        }
    }

    /// Property the search filters and sorts on.
    pub fn modified_property(&self) -> &'static str {
        match self {
            EntityType::Contacts => "lastmodifieddate",
            EntityType::Companies | EntityType::Meetings => "hs_lastmodifieddate",
        }
    }

    /// Properties requested from the CRM and projected onto each action.
    pub fn properties(&self) -> &'static [&'static str] {
        match self {
            EntityType::Contacts => &[
                "firstname",
                "lastname",
                "jobtitle",
                "email",
                "hubspotscore",
                "hs_lead_status",
                "hs_analytics_source",
                "hs_latest_source",
            ],
            EntityType::Companies => &[
                "name",
                "domain",
                "country",
                "industry",
                "description",
                "annualrevenue",
                "numberofemployees",
                "hs_lead_status",
            ],
            EntityType::Meetings => &[
                "hs_meeting_title",
                "hs_createdate",
                "hs_lastmodifieddate",
                "hs_meeting_start_time",
                "hs_meeting_end_time",
            ],
        }
    }

    pub fn has_attendees(&self) -> bool {
        matches!(self, EntityType::Meetings)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionKind {
    Created,
    Updated,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Created => "Created",
            ActionKind::Updated => "Updated",
        }
    }
}

/// One normalized, classified output unit. Never mutated once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: Uuid,
    pub action_name: String,
    pub action_date: DateTime<Utc>,
    pub include_in_analytics: bool,
    pub entity_type: EntityType,
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_emails: Option<Vec<String>>,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        if self.action_name.ends_with(ActionKind::Created.as_str()) {
            ActionKind::Created
        } else {
            ActionKind::Updated
        }
    }
}

/// Bearer credentials for one account. Cloning shares the same underlying
/// state, so a refresh is visible to every call holding the session.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<RwLock<Credentials>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Credentials {
                access_token: access_token.into(),
                expires_at,
            })),
        }
    }

    pub async fn access_token(&self) -> String {
        self.inner.read().await.access_token.clone()
    }

    pub async fn snapshot(&self) -> Credentials {
        self.inner.read().await.clone()
    }

    /// A session with no known expiry is treated as expired so the first
    /// failure triggers a refresh.
    pub async fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.inner.read().await.expires_at {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }

    /// Installs a new token; returns true when the token value changed.
    pub async fn install(&self, access_token: String, expires_at: DateTime<Utc>) -> bool {
        let mut guard = self.inner.write().await;
        let changed = guard.access_token != access_token;
        if changed {
            guard.access_token = access_token;
        }
        guard.expires_at = Some(expires_at);
        changed
    }
}

/// One CRM connection and its per-entity sweep checkpoints.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub refresh_token: String,
    pub session: Session,
    pub checkpoints: HashMap<EntityType, DateTime<Utc>>,
}

impl Account {
    pub fn new(id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            refresh_token: refresh_token.into(),
            session: Session::default(),
            checkpoints: HashMap::new(),
        }
    }

    pub fn checkpoint(&self, entity: EntityType) -> Option<DateTime<Utc>> {
        self.checkpoints.get(&entity).copied()
    }
}
