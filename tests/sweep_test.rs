mod common;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use common::{association, credentials, page, record, RecordingSink, ScriptedCrm};
use crm_sync::crm::model::FilterOperator;
use crm_sync::error::SyncError;
use crm_sync::model::{Account, ActionKind, EntityType, Session};
use crm_sync::normalize::Normalizer;
use crm_sync::queue::ActionQueue;
use crm_sync::retry::{Backoff, RetryPolicy};
use crm_sync::sweep::Sweeper;
use crm_sync::token::TokenManager;

fn sweeper(crm: &ScriptedCrm) -> Sweeper {
    let crm: Arc<ScriptedCrm> = Arc::new(crm.clone());
    let tokens = Arc::new(TokenManager::new(
        crm.clone(),
        credentials(),
        RetryPolicy::new(3, Backoff::Immediate),
    ));
    Sweeper::new(
        crm,
        tokens,
        Normalizer::default(),
        RetryPolicy::new(5, Backoff::Immediate),
    )
}

fn queue(sink: &RecordingSink) -> ActionQueue {
    ActionQueue::spawn(Arc::new(sink.clone()), 2_000, 64)
}

fn account() -> Account {
    let mut account = Account::new("hub-1", "refresh-1");
    account.session = Session::new("live", Some(Utc::now() + Duration::hours(1)));
    account
}

fn contacts(range: std::ops::Range<usize>) -> Vec<crm_sync::crm::model::CrmObject> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    range
        .map(|n| {
            let at = base + Duration::minutes(n as i64);
            record(
                &format!("c{n}"),
                at,
                at + Duration::seconds(30),
                json!({ "email": format!("c{n}@example.com"), "firstname": "unknown" }),
            )
        })
        .collect()
}

#[tokio::test]
async fn first_sync_pages_until_cursor_ends() {
    let crm = ScriptedCrm::default();
    crm.script_search(EntityType::Contacts, Ok(page(contacts(0..100), Some("100"))))
        .await;
    crm.script_search(EntityType::Contacts, Ok(page(contacts(100..150), None)))
        .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();

    let before = Utc::now();
    let report = sweeper(&crm)
        .sweep(&mut account, EntityType::Contacts, &q)
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(report.pages, 2);
    assert_eq!(report.actions, 150);
    let checkpoint = account.checkpoint(EntityType::Contacts).unwrap();
    assert_eq!(checkpoint, report.started_at);
    assert!(checkpoint >= before && checkpoint <= after);

    let calls = crm.search_calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].request.after.is_none());
    let first_filters = &calls[0].request.filter_groups[0].filters;
    assert_eq!(first_filters.len(), 1);
    assert_eq!(first_filters[0].operator, FilterOperator::Lte);
    assert_eq!(
        first_filters[0].value,
        report.started_at.timestamp_millis().to_string()
    );
    assert_eq!(calls[1].request.after.as_deref(), Some("100"));
    assert_eq!(calls[1].request.limit, 100);

    let stats = q.drain().await.unwrap();
    assert_eq!(stats.flushed, 150);
    let actions = sink.actions().await;
    assert_eq!(actions.len(), 150);
    let ids: HashSet<_> = actions.iter().map(|a| a.id).collect();
    assert_eq!(ids.len(), 150);
    assert!(actions.iter().all(|a| a.action_name == "Contact Updated"));
    assert!(actions.iter().all(|a| !a.properties.contains_key("firstname")));
    assert_eq!(actions[0].properties["email"], "c0@example.com");
}

#[tokio::test]
async fn cursor_ceiling_restarts_with_date_window() {
    let crm = ScriptedCrm::default();
    let first = contacts(0..3);
    let last_modified = first[2].updated_at;
    crm.script_search(EntityType::Contacts, Ok(page(first, Some("9900"))))
        .await;
    crm.script_search(EntityType::Contacts, Ok(page(contacts(3..5), None)))
        .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();

    let report = sweeper(&crm)
        .sweep(&mut account, EntityType::Contacts, &q)
        .await
        .unwrap();
    assert_eq!(report.windows, 1);
    assert_eq!(report.pages, 2);

    let calls = crm.search_calls().await;
    assert_eq!(calls.len(), 2);
    for call in &calls {
        if let Some(after) = &call.request.after {
            assert!(after.parse::<u64>().unwrap() < 9_900);
        }
    }
    let windowed = &calls[1].request;
    assert!(windowed.after.is_none());
    let lower = &windowed.filter_groups[0].filters[0];
    assert_eq!(lower.operator, FilterOperator::Gte);
    assert_eq!(lower.property_name, "lastmodifieddate");
    assert_eq!(lower.value, last_modified.timestamp_millis().to_string());

    q.drain().await.unwrap();
    assert_eq!(sink.actions().await.len(), 5);
}

#[tokio::test]
async fn window_that_cannot_advance_fails_without_checkpoint() {
    let crm = ScriptedCrm::default();
    crm.script_search(EntityType::Contacts, Ok(page(contacts(0..3), Some("9900"))))
        .await;
    // Same modified instant as the window start: the window would not move.
    crm.script_search(EntityType::Contacts, Ok(page(contacts(2..3), Some("9900"))))
        .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();
    let prior = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
    account.checkpoints.insert(EntityType::Contacts, prior);

    let err = sweeper(&crm)
        .sweep(&mut account, EntityType::Contacts, &q)
        .await
        .unwrap_err();
    match err {
        SyncError::WindowStalled { entity, after } => {
            assert_eq!(entity, EntityType::Contacts);
            assert_eq!(after, "9900");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(account.checkpoint(EntityType::Contacts), Some(prior));
    assert_eq!(crm.search_calls().await.len(), 2);

    q.drain().await.unwrap();
    assert_eq!(sink.actions().await.len(), 4);
}

#[tokio::test]
async fn empty_page_at_ceiling_fails_without_checkpoint() {
    let crm = ScriptedCrm::default();
    crm.script_search(EntityType::Companies, Ok(page(Vec::new(), Some("9900"))))
        .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();

    let err = sweeper(&crm)
        .sweep(&mut account, EntityType::Companies, &q)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::WindowStalled {
            entity: EntityType::Companies,
            ..
        }
    ));
    assert_eq!(account.checkpoint(EntityType::Companies), None);
    assert_eq!(crm.search_calls().await.len(), 1);

    let stats = q.drain().await.unwrap();
    assert_eq!(stats.received, 0);
}

#[tokio::test]
async fn exhausted_search_keeps_already_queued_actions() {
    let crm = ScriptedCrm::default();
    crm.script_search(EntityType::Contacts, Ok(page(contacts(0..100), Some("100"))))
        .await;
    crm.fail_search(EntityType::Contacts, 5).await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();
    let prior = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
    account.checkpoints.insert(EntityType::Contacts, prior);

    let err = sweeper(&crm)
        .sweep(&mut account, EntityType::Contacts, &q)
        .await
        .unwrap_err();
    match &err {
        SyncError::SweepExhausted {
            entity,
            attempts,
            source,
        } => {
            assert_eq!(*entity, EntityType::Contacts);
            assert_eq!(*attempts, 5);
            assert!(matches!(
                source.downcast_ref::<SyncError>(),
                Some(SyncError::TransientNetwork(_))
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(account.checkpoint(EntityType::Contacts), Some(prior));
    assert_eq!(crm.search_calls().await.len(), 6);

    q.drain().await.unwrap();
    assert_eq!(sink.actions().await.len(), 100);
}

#[tokio::test]
async fn expired_token_is_refreshed_before_retry() {
    let crm = ScriptedCrm::default();
    crm.fail_search(EntityType::Companies, 1).await;
    crm.script_search(EntityType::Companies, Ok(page(Vec::new(), None)))
        .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = Account::new("hub-1", "refresh-1");
    account.session = Session::new("stale", Some(Utc::now() - Duration::minutes(1)));

    sweeper(&crm)
        .sweep(&mut account, EntityType::Companies, &q)
        .await
        .unwrap();

    assert_eq!(crm.refresh_calls().await, 1);
    let calls = crm.search_calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].token, "stale");
    assert_eq!(calls[1].token, "token-1");
    assert!(account.checkpoint(EntityType::Companies).is_some());
    q.drain().await.unwrap();
}

#[tokio::test]
async fn live_token_is_not_refreshed_on_retry() {
    let crm = ScriptedCrm::default();
    crm.fail_search(EntityType::Companies, 2).await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();

    sweeper(&crm)
        .sweep(&mut account, EntityType::Companies, &q)
        .await
        .unwrap();

    assert_eq!(crm.refresh_calls().await, 0);
    assert_eq!(crm.search_calls().await.len(), 3);
    q.drain().await.unwrap();
}

#[tokio::test]
async fn classification_follows_prior_checkpoint() {
    let checkpoint = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let crm = ScriptedCrm::default();
    crm.script_search(
        EntityType::Companies,
        Ok(page(
            vec![
                record(
                    "new",
                    checkpoint + Duration::hours(1),
                    checkpoint + Duration::hours(2),
                    json!({ "name": "Fresh Co", "domain": "n/a" }),
                ),
                record(
                    "old",
                    checkpoint - Duration::days(10),
                    checkpoint + Duration::hours(3),
                    json!({ "name": "Old Co", "industry": "Retail" }),
                ),
            ],
            None,
        )),
    )
    .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();
    account.checkpoints.insert(EntityType::Companies, checkpoint);

    sweeper(&crm)
        .sweep(&mut account, EntityType::Companies, &q)
        .await
        .unwrap();

    let calls = crm.search_calls().await;
    let lower = &calls[0].request.filter_groups[0].filters[0];
    assert_eq!(lower.operator, FilterOperator::Gte);
    assert_eq!(lower.value, checkpoint.timestamp_millis().to_string());
    assert_eq!(lower.property_name, "hs_lastmodifieddate");

    q.drain().await.unwrap();
    let actions = sink.actions().await;
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].kind(), ActionKind::Created);
    assert_eq!(actions[0].action_name, "Company Created");
    assert_eq!(actions[0].action_date, checkpoint + Duration::hours(1));
    assert!(!actions[0].properties.contains_key("domain"));
    assert_eq!(actions[1].action_name, "Company Updated");
    assert_eq!(actions[1].action_date, checkpoint + Duration::hours(3));
    assert!(actions.iter().all(|a| a.contact_emails.is_none()));
}

#[tokio::test]
async fn meetings_carry_attendee_emails() {
    let at = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
    let crm = ScriptedCrm::default();
    crm.script_search(
        EntityType::Meetings,
        Ok(page(
            vec![
                record("m1", at, at, json!({ "hs_meeting_title": "Kickoff" })),
                record("m2", at, at, json!({ "hs_meeting_title": "Solo" })),
                record("m3", at, at, json!({ "hs_meeting_title": "Broken" })),
            ],
            None,
        )),
    )
    .await;
    crm.script_associations(
        "m1",
        Ok(vec![association(
            "m1",
            &[
                ("c1", "meeting_event_to_contact"),
                ("c2", "meeting_to_company"),
                ("c3", "meeting_event_to_contact"),
                ("c4", "meeting_event_to_contact"),
            ],
        )]),
    )
    .await;
    crm.add_contact_email("c1", "ada@example.com").await;
    crm.add_contact_email("c2", "company@example.com").await;
    crm.add_contact_email("c3", "").await;
    crm.add_contact_email("c4", "grace@example.com").await;
    crm.script_associations("m3", Err(anyhow::anyhow!("associations down")))
        .await;

    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();
    let report = sweeper(&crm)
        .sweep(&mut account, EntityType::Meetings, &q)
        .await
        .unwrap();
    assert_eq!(report.actions, 3);

    q.drain().await.unwrap();
    let actions = sink.actions().await;
    assert_eq!(
        actions[0].contact_emails.as_deref(),
        Some(&["ada@example.com".to_string(), "grace@example.com".to_string()][..])
    );
    assert_eq!(actions[0].properties["hs_meeting_title"], "Kickoff");
    assert_eq!(actions[1].contact_emails.as_deref(), Some(&[][..]));
    assert_eq!(actions[2].contact_emails.as_deref(), Some(&[][..]));
    assert!(actions.iter().all(|a| a.action_name == "Meeting Updated"));
}

#[tokio::test]
async fn records_without_properties_are_skipped() {
    let now = Utc::now();
    let crm = ScriptedCrm::default();
    let mut bare = record("x", now, now, json!({}));
    bare.properties = None;
    crm.script_search(
        EntityType::Contacts,
        Ok(page(vec![bare, record("y", now, now, json!({ "email": "y@example.com" }))], None)),
    )
    .await;
    let sink = RecordingSink::default();
    let q = queue(&sink);
    let mut account = account();

    let report = sweeper(&crm)
        .sweep(&mut account, EntityType::Contacts, &q)
        .await
        .unwrap();
    assert_eq!(report.actions, 1);
    q.drain().await.unwrap();
    assert_eq!(sink.actions().await.len(), 1);
}
