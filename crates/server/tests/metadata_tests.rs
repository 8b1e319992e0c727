//! Integration tests for the SQLite metadata store.

mod common;

use common::TestMetadata;
use haul_core::{AccessStatus, Filter, JobOutcome, JobStatus, Subject, SubjectKind};
use haul_metadata::MetadataError;
use haul_metadata::models::*;
use haul_metadata::repos::{FilterRepo, LogRepo};
use haul_server::{AccessGate, JobLedger};
use time::OffsetDateTime;

fn new_job(url: &str, requester_id: i64, created_at: OffsetDateTime) -> NewJob {
    NewJob {
        url: url.to_string(),
        requester_id,
        requester_label: format!("user{requester_id}"),
        origin_id: requester_id,
        created_at,
    }
}

#[tokio::test]
async fn test_first_contact_then_approval() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());
    let alice = Subject::User(42);

    let row = gate.register(alice, "alice").await.unwrap();
    assert_eq!(row.status().unwrap(), AccessStatus::Pending);
    assert_eq!(row.subject().unwrap(), alice);
    assert!(!gate.is_allowed(alice).await.unwrap());

    gate.approve(alice).await.unwrap();
    assert!(gate.is_allowed(alice).await.unwrap());

    // re-registration refreshes the label, never the status
    let row = gate.register(alice, "alice2").await.unwrap();
    assert_eq!(row.status, "approved");
    assert_eq!(row.label, "alice2");
    assert!(gate.is_allowed(alice).await.unwrap());
}

#[tokio::test]
async fn test_register_never_resurrects_rejected() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());
    let group = Subject::Group(-100);

    gate.register(group, "spam").await.unwrap();
    gate.reject(group).await.unwrap();

    let row = gate.register(group, "spam").await.unwrap();
    assert_eq!(row.status().unwrap(), AccessStatus::Rejected);
    assert!(!gate.admit(group, "spam").await);
}

#[tokio::test]
async fn test_remove_then_contact_is_pending() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());
    let bob = Subject::User(7);

    gate.grant(bob, "bob").await.unwrap();
    assert!(gate.is_allowed(bob).await.unwrap());

    gate.remove(bob).await.unwrap();
    assert!(gate.get(bob).await.unwrap().is_none());

    let row = gate.register(bob, "bob").await.unwrap();
    assert_eq!(row.status().unwrap(), AccessStatus::Pending);
    assert!(!gate.is_allowed(bob).await.unwrap());
}

#[tokio::test]
async fn test_status_changes_on_unknown_subjects_fail() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());

    assert!(matches!(
        gate.approve(Subject::User(1)).await,
        Err(MetadataError::NotFound(_))
    ));
    assert!(matches!(
        gate.remove(Subject::Group(1)).await,
        Err(MetadataError::NotFound(_))
    ));
    assert!(matches!(
        gate.register(Subject::User(0), "nobody").await,
        Err(MetadataError::Validation(_))
    ));
    assert!(matches!(
        gate.approve(Subject::User(0)).await,
        Err(MetadataError::Validation(_))
    ));
    assert!(matches!(
        gate.reject(Subject::Group(0)).await,
        Err(MetadataError::Validation(_))
    ));
    assert!(matches!(
        gate.remove(Subject::Group(0)).await,
        Err(MetadataError::Validation(_))
    ));
}

#[tokio::test]
async fn test_users_and_groups_are_separate() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());

    gate.grant(Subject::User(5), "five").await.unwrap();
    gate.register(Subject::Group(5), "group five").await.unwrap();
    gate.register(Subject::Group(6), "group six").await.unwrap();

    assert!(gate.is_allowed(Subject::User(5)).await.unwrap());
    assert!(!gate.is_allowed(Subject::Group(5)).await.unwrap());

    let groups = gate.list(SubjectKind::Group, None).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.kind == "group"));

    let pending_users = gate
        .list(SubjectKind::User, Some(AccessStatus::Pending))
        .await
        .unwrap();
    assert!(pending_users.is_empty());
}

#[tokio::test]
async fn test_grant_keeps_existing_label_when_blank() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let gate = AccessGate::new(metadata.store());
    let carol = Subject::User(9);

    gate.register(carol, "carol").await.unwrap();
    gate.grant(carol, "").await.unwrap();

    let row = gate.get(carol).await.unwrap().unwrap();
    assert_eq!(row.label, "carol");
    assert!(row.is_approved());
}

#[tokio::test]
async fn test_ledger_terminal_failure_is_listed() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let ledger = JobLedger::new(metadata.store());
    let now = OffsetDateTime::now_utc();

    let id = ledger
        .insert(&new_job("https://x.com/a/status/1", 42, now))
        .await
        .unwrap();
    let row = ledger.get(id).await.unwrap().unwrap();
    assert_eq!(row.status().unwrap(), JobStatus::Pending);

    ledger
        .update_terminal(
            id,
            &JobOutcome::Failed {
                error: "network timeout".to_string(),
            },
        )
        .await
        .unwrap();

    let (rows, total) = ledger.list(&JobFilter::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].status, "failed");
    assert_eq!(rows[0].error_text, "network timeout");
    assert_eq!(rows[0].result_name, "");
}

#[tokio::test]
async fn test_second_terminal_update_overwrites() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let ledger = JobLedger::new(metadata.store());

    let id = ledger
        .insert(&new_job("https://youtu.be/a", 1, OffsetDateTime::now_utc()))
        .await
        .unwrap();
    ledger
        .update_terminal(
            id,
            &JobOutcome::Failed {
                error: "first".to_string(),
            },
        )
        .await
        .unwrap();
    ledger
        .update_terminal(
            id,
            &JobOutcome::Success {
                result_name: "a.mp4".to_string(),
            },
        )
        .await
        .unwrap();

    let row = ledger.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, "success");
    assert_eq!(row.result_name, "a.mp4");
    assert_eq!(row.error_text, "");

    assert!(matches!(
        ledger
            .update_terminal(
                id + 100,
                &JobOutcome::Success {
                    result_name: String::new()
                }
            )
            .await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_jobs_filters_and_pages() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let ledger = JobLedger::new(metadata.store());
    let now = OffsetDateTime::now_utc();

    let mut ids = Vec::new();
    for i in 0..5 {
        let requester = if i % 2 == 0 { 1 } else { 2 };
        ids.push(
            ledger
                .insert(&new_job(&format!("https://youtu.be/{i}"), requester, now))
                .await
                .unwrap(),
        );
    }
    ledger
        .update_terminal(
            ids[0],
            &JobOutcome::Success {
                result_name: "0.mp4".to_string(),
            },
        )
        .await
        .unwrap();

    let (rows, total) = ledger
        .list(&JobFilter {
            requester_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert!(rows.iter().all(|r| r.requester_id == 1));
    // newest first
    assert_eq!(rows[0].id, ids[4]);

    let (rows, total) = ledger
        .list(&JobFilter {
            status: Some(JobStatus::Pending),
            limit: 2,
            offset: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 4);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, ids[3]);
}

#[tokio::test]
async fn test_stats_aggregates() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let ledger = JobLedger::new(metadata.store());
    let now = OffsetDateTime::now_utc();

    let urls = [
        ("https://www.youtube.com/watch?v=1", 1),
        ("https://www.youtube.com/watch?v=2", 2),
        ("http://youtu.be/3", 1),
        ("https://tiktok.com", 3),
    ];
    let mut ids = Vec::new();
    for (url, requester) in urls {
        ids.push(ledger.insert(&new_job(url, requester, now)).await.unwrap());
    }
    // outside the 30-day window, still counted in totals
    ledger
        .insert(&new_job(
            "https://www.youtube.com/watch?v=old",
            4,
            now - time::Duration::days(45),
        ))
        .await
        .unwrap();

    ledger
        .update_terminal(
            ids[0],
            &JobOutcome::Success {
                result_name: "1.mp4".to_string(),
            },
        )
        .await
        .unwrap();
    ledger
        .update_terminal(
            ids[1],
            &JobOutcome::Failed {
                error: "gone".to_string(),
            },
        )
        .await
        .unwrap();

    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active_requesters, 4);

    let recent: i64 = stats.daily.iter().map(|d| d.count).sum();
    assert_eq!(recent, 4);

    assert_eq!(
        stats.top_domains[0],
        DomainCount {
            domain: "www.youtube.com".to_string(),
            count: 3
        }
    );
    assert!(stats.top_domains.contains(&DomainCount {
        domain: "tiktok.com".to_string(),
        count: 1
    }));
    assert!(stats.top_domains.contains(&DomainCount {
        domain: "youtu.be".to_string(),
        count: 1
    }));
}

#[tokio::test]
async fn test_filters_crud_and_seed() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let store = metadata.store();

    // defaults are seeded into an empty table only once
    let seeded = store.seed_filters(&[]).await.unwrap();
    assert!(seeded > 0);
    assert_eq!(store.seed_filters(&[]).await.unwrap(), 0);
    assert_eq!(store.filter_count().await.unwrap(), seeded as u64);

    let spec = FilterSpec {
        hosts: vec!["vimeo.com".to_string(), "player.vimeo.com".to_string()],
        exclude_query_params: true,
        path_pattern: Some(r"^/\d+".to_string()),
        credentials_ref: Some("/etc/haul/vimeo.cookies".to_string()),
    };
    let id = store.insert_filter(&spec).await.unwrap();

    let filter: Filter = store
        .list_filters()
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.id == id)
        .unwrap()
        .into();
    assert_eq!(filter.hosts, spec.hosts);
    assert_eq!(filter.path_pattern.as_deref(), Some(r"^/\d+"));

    let updated = FilterSpec {
        path_pattern: None,
        ..spec.clone()
    };
    store.update_filter(id, &updated).await.unwrap();
    let row = store
        .list_filters()
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.id == id)
        .unwrap();
    assert_eq!(Filter::from(row).path_pattern, None);

    store.delete_filter(id).await.unwrap();
    assert!(matches!(
        store.delete_filter(id).await,
        Err(MetadataError::NotFound(_))
    ));
    assert!(matches!(
        store.insert_filter(&FilterSpec::default()).await,
        Err(MetadataError::Validation(_))
    ));
}

#[tokio::test]
async fn test_configured_filters_win_over_defaults() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let store = metadata.store();

    let configured = vec![FilterSpec {
        hosts: vec!["example.com".to_string()],
        ..Default::default()
    }];
    assert_eq!(store.seed_filters(&configured).await.unwrap(), 1);

    let rows = store.list_filters().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].hosts, "example.com");
}

#[tokio::test]
async fn test_logs_listing() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let store = metadata.store();

    let first = store
        .insert_log("INFO", "Request admitted", r#"{"url":"https://youtu.be/a"}"#)
        .await
        .unwrap();
    store
        .insert_log("WARN", "Download failed", r#"{"url":"https://x.com/b"}"#)
        .await
        .unwrap();
    store
        .insert_log("INFO", "Shutdown complete", "{}")
        .await
        .unwrap();

    let (rows, total) = store.list_logs(&LogFilter::default()).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(rows[0].message, "Shutdown complete");

    let (rows, total) = store
        .list_logs(&LogFilter {
            level: Some("info".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(rows.iter().all(|r| r.level == "INFO"));

    let (rows, _) = store
        .list_logs(&LogFilter {
            search: Some("x.com".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].level, "WARN");

    let since = store.list_logs_since(first).await.unwrap();
    assert_eq!(since.len(), 2);
    assert!(since[0].id < since[1].id);
}
