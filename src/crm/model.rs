use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub filter_groups: Vec<FilterGroup>,
    pub sorts: Vec<Sort>,
    pub properties: Vec<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FilterGroup {
    pub filters: Vec<Filter>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterOperator {
    Gte,
    Lte,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub property_name: String,
    pub operator: FilterOperator,
    /// Epoch milliseconds, as the search API expects.
    pub value: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Ascending,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sort {
    pub property_name: String,
    pub direction: SortDirection,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<CrmObject>,
    pub paging: Option<Paging>,
}

impl SearchPage {
    pub fn next_after(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_ref())
            .map(|n| n.after.as_str())
            .filter(|after| !after.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Paging {
    pub next: Option<NextPage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NextPage {
    pub after: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CrmObject {
    pub id: String,
    pub properties: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AssociationResult {
    pub from: AssociationRef,
    #[serde(default)]
    pub to: Vec<AssociationTarget>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AssociationRef {
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AssociationTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Deserialize, Debug)]
pub(crate) struct BatchResults<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

/// Result of exchanging a refresh token.
#[derive(Deserialize, Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}
