//! Cursor pagination over one entity type, falling back to a fresh
//! date window when the search API's cursor ceiling is reached.
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::crm::model::{
    Filter, FilterGroup, FilterOperator, SearchPage, SearchRequest, Sort, SortDirection,
};
use crate::crm::CrmService;
use crate::enrich::AttendeeEnricher;
use crate::error::SyncError;
use crate::model::{Account, EntityType};
use crate::normalize::Normalizer;
use crate::queue::ActionQueue;
use crate::retry::{RetryError, RetryHook, RetryPolicy};
use crate::token::{ReauthHook, TokenManager};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Deepest `after` offset the search endpoint accepts.
pub const CURSOR_CEILING: u64 = 9_900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub entity: EntityType,
    pub started_at: DateTime<Utc>,
    pub pages: usize,
    pub actions: usize,
    pub windows: usize,
}

#[derive(Debug, Default)]
struct CursorState {
    after: Option<String>,
    window_start: Option<DateTime<Utc>>,
}

pub struct Sweeper {
    crm: Arc<dyn CrmService>,
    tokens: Arc<TokenManager>,
    enricher: AttendeeEnricher,
    normalizer: Normalizer,
    policy: RetryPolicy,
    page_size: u32,
    cursor_ceiling: u64,
}

impl Sweeper {
    pub fn new(
        crm: Arc<dyn CrmService>,
        tokens: Arc<TokenManager>,
        normalizer: Normalizer,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            enricher: AttendeeEnricher::new(crm.clone()),
            crm,
            tokens,
            normalizer,
            policy,
            page_size: DEFAULT_PAGE_SIZE,
            cursor_ceiling: CURSOR_CEILING,
        }
    }

    pub fn with_paging(mut self, page_size: u32, cursor_ceiling: u64) -> Self {
        self.page_size = page_size;
        self.cursor_ceiling = cursor_ceiling;
        self
    }

    /// Pages through every record of `entity` modified since the account's
    /// checkpoint, pushing one action per record. The checkpoint moves to the
    /// sweep's start instant only when the last page has been seen.
    #[instrument(skip_all, fields(account = %account.id, entity = %entity))]
    pub async fn sweep(
        &self,
        account: &mut Account,
        entity: EntityType,
        queue: &ActionQueue,
    ) -> Result<SweepReport, SyncError> {
        let started_at = Utc::now();
        let report = self.sweep_pages(account, entity, queue, started_at).await?;
        account.checkpoints.insert(entity, started_at);
        info!(
            pages = report.pages,
            actions = report.actions,
            windows = report.windows,
            "sweep complete"
        );
        Ok(report)
    }

    async fn sweep_pages(
        &self,
        account: &Account,
        entity: EntityType,
        queue: &ActionQueue,
        started_at: DateTime<Utc>,
    ) -> Result<SweepReport, SyncError> {
        let checkpoint = account.checkpoint(entity);
        let hook = ReauthHook {
            tokens: &self.tokens,
            account,
        };
        let mut report = SweepReport {
            entity,
            started_at,
            pages: 0,
            actions: 0,
            windows: 0,
        };
        let mut cursor = CursorState::default();

        loop {
            let lower = cursor.window_start.or(checkpoint);
            let request =
                build_search_request(entity, lower, started_at, self.page_size, cursor.after.take());
            let page = self.fetch_page(account, &hook, entity, &request).await?;
            report.pages += 1;
            debug!(
                page = report.pages,
                records = page.results.len(),
                after = ?request.after,
                "fetched page"
            );

            for record in &page.results {
                let Some(mut action) = self.normalizer.to_action(entity, record, checkpoint) else {
                    continue;
                };
                if entity.has_attendees() {
                    let emails = self
                        .enricher
                        .attendee_emails(&account.session, &record.id)
                        .await;
                    action.contact_emails = Some(emails);
                }
                queue.push(action).await?;
                report.actions += 1;
            }

            let Some(next) = page.next_after() else {
                break;
            };
            if cursor_position(next).is_some_and(|pos| pos >= self.cursor_ceiling) {
                let Some(window_start) = next_window(&page, lower) else {
                    warn!(after = next, "cursor ceiling reached but window cannot advance");
                    return Err(SyncError::WindowStalled {
                        entity,
                        after: next.to_string(),
                    });
                };
                info!(after = next, %window_start, "cursor ceiling reached; starting new window");
                cursor.window_start = Some(window_start);
                report.windows += 1;
            } else {
                cursor.after = Some(next.to_string());
            }
        }

        Ok(report)
    }

    async fn fetch_page(
        &self,
        account: &Account,
        hook: &dyn RetryHook,
        entity: EntityType,
        request: &SearchRequest,
    ) -> Result<SearchPage, SyncError> {
        let crm = &*self.crm;
        let session = &account.session;
        self.policy
            .run("search", hook, move || crm.search(session, entity, request))
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => SyncError::SweepExhausted {
                    entity,
                    attempts,
                    source: last.into(),
                },
                RetryError::Aborted(err) => err,
            })
    }
}

/// Filter `[lower, now]` on the entity's modified property (no lower bound
/// when there is neither a checkpoint nor a window), sorted ascending.
pub fn build_search_request(
    entity: EntityType,
    lower: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    page_size: u32,
    after: Option<String>,
) -> SearchRequest {
    let property = entity.modified_property();
    let bound = |operator, at: DateTime<Utc>| Filter {
        property_name: property.to_string(),
        operator,
        value: at.timestamp_millis().to_string(),
    };

    let mut filters = Vec::with_capacity(2);
    if let Some(lower) = lower {
        filters.push(bound(FilterOperator::Gte, lower));
    }
    filters.push(bound(FilterOperator::Lte, now));

    SearchRequest {
        filter_groups: vec![FilterGroup { filters }],
        sorts: vec![Sort {
            property_name: property.to_string(),
            direction: SortDirection::Ascending,
        }],
        properties: entity.properties().iter().map(|p| p.to_string()).collect(),
        limit: page_size,
        after,
    }
}

/// Numeric offset carried by an `after` token. Non-numeric tokens are opaque
/// and never trigger the windowing fallback.
fn cursor_position(after: &str) -> Option<u64> {
    after.trim().parse().ok()
}

/// The last record's modification instant, provided it moves the window
/// forward. Otherwise paging from it would repeat the same window forever.
fn next_window(page: &SearchPage, current: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let last = page.results.last()?.updated_at;
    match current {
        Some(current) if last <= current => None,
        _ => Some(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn first_sync_has_only_upper_bound() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let req = build_search_request(EntityType::Contacts, None, now, 100, None);
        let filters = &req.filter_groups[0].filters;
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].operator, FilterOperator::Lte);
        assert_eq!(filters[0].value, now.timestamp_millis().to_string());
        assert_eq!(filters[0].property_name, "lastmodifieddate");
        assert_eq!(req.sorts[0].property_name, "lastmodifieddate");
        assert_eq!(req.limit, 100);
        assert!(req.after.is_none());
    }

    #[test]
    fn bounded_request_filters_both_ends() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let lower = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let req = build_search_request(EntityType::Meetings, Some(lower), now, 100, Some("200".into()));
        let filters = &req.filter_groups[0].filters;
        assert_eq!(filters[0].operator, FilterOperator::Gte);
        assert_eq!(filters[0].value, lower.timestamp_millis().to_string());
        assert_eq!(filters[1].operator, FilterOperator::Lte);
        assert_eq!(filters[0].property_name, "hs_lastmodifieddate");
        assert_eq!(req.after.as_deref(), Some("200"));
        assert!(req.properties.contains(&"hs_meeting_title".to_string()));
    }

    #[test]
    fn cursor_position_parses_offsets() {
        assert_eq!(cursor_position("9900"), Some(9_900));
        assert_eq!(cursor_position("MTAw"), None);
    }
}
