// Property-based tests for queued and recurring fires

use chrono::{DateTime, Duration, TimeZone, Utc};
use engine::config::DispatchConfig;
use engine::definition::NotificationDefinition;
use engine::delivery::{BackendRegistry, RecordingBackend};
use engine::directory::{Filter, InMemoryDirectory};
use engine::dispatcher::{Dispatcher, ScheduleOutcome};
use engine::models::{Context, FireEvent, Recipient, ScheduleRequest};
use engine::queue::{FireQueue, InMemoryQueue};
use engine::registry::NotificationRegistry;
use engine::render::TeraRenderer;
use engine::scope::Scope;
use engine::trigger::{DelayedTrigger, RecurrenceRule, Trigger};
use proptest::prelude::*;
use std::sync::Arc;

const HOURLY: &str = "0 0 * * * * *";

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn setup(rule: RecurrenceRule) -> (Dispatcher, Arc<InMemoryQueue>, Arc<RecordingBackend>) {
    let mut builder = NotificationRegistry::builder();
    builder
        .register(
            NotificationDefinition::builder("hourly")
                .trigger(Trigger::Calendar(rule))
                .backends(["email"])
                .template("default", "hourly.txt")
                .build()
                .unwrap(),
        )
        .unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    let email = Arc::new(RecordingBackend::new());
    let dispatcher = Dispatcher::new(
        Arc::new(builder.build()),
        Arc::new(InMemoryDirectory::new([Recipient::new("ops")])),
        Arc::new(TeraRenderer::from_templates([("hourly.txt", "tick for {{ recipient.id }}")]).unwrap()),
        BackendRegistry::new().with_backend("email", email.clone()),
        queue.clone(),
        DispatchConfig::default(),
    )
    .unwrap();

    (dispatcher, queue, email)
}

/// Property: Each fire of a recurring notification arms exactly one next occurrence
#[test]
fn property_recurring_rearms_once_per_fire() {
    proptest!(|(created_at in instant(), fires in 1usize..6)| {
        let rule = RecurrenceRule::new(HOURLY).unwrap();
        let (dispatcher, queue, email) = setup(rule);
        let rt = runtime();

        let outcome = rt
            .block_on(dispatcher.schedule(ScheduleRequest::new("hourly", Context::new()).at(created_at)))
            .unwrap();
        let ScheduleOutcome::Recurring(handle) = outcome else {
            panic!("expected a recurring registration");
        };
        prop_assert!(handle.fire_at > created_at);
        prop_assert!(handle.fire_at - created_at <= Duration::hours(1));

        let mut expected_at = handle.fire_at;
        for _ in 0..fires {
            let due = rt.block_on(queue.take_due(expected_at));
            prop_assert_eq!(due.len(), 1);
            prop_assert_eq!(due[0].fire_at, Some(expected_at));

            let report = rt.block_on(dispatcher.fire_event(&due[0])).unwrap();
            let next = report.rearmed.expect("next occurrence armed");
            prop_assert_eq!(next.fire_at, expected_at + Duration::hours(1));
            prop_assert_eq!(rt.block_on(queue.len()), 1);
            expected_at = next.fire_at;
        }

        prop_assert_eq!(rt.block_on(email.count()), fires);
    });
}

/// Property: Redelivering an occurrence re-arms the same next occurrence
#[test]
fn property_redelivery_does_not_duplicate_rearm() {
    proptest!(|(fire_at in instant())| {
        let rule = RecurrenceRule::new(HOURLY).unwrap();
        let (dispatcher, queue, _) = setup(rule.clone());
        let rt = runtime();

        let event = FireEvent::new("hourly", Context::new(), None, Some(fire_at)).with_recurrence(rule);
        let first = rt.block_on(dispatcher.fire_event(&event)).unwrap();
        let second = rt.block_on(dispatcher.fire_event(&event)).unwrap();

        prop_assert_eq!(first.rearmed, second.rearmed);
        prop_assert_eq!(rt.block_on(queue.len()), 1);
    });
}

/// Property: A rule past its end date is never re-armed
#[test]
fn property_exhausted_rule_is_not_rearmed() {
    proptest!(|(after in instant(), minutes_left in 0i64..60)| {
        let open_ended = RecurrenceRule::new(HOURLY).unwrap();
        let fire_at = open_ended.next_after(after).unwrap().unwrap();
        let rule = open_ended.until(fire_at + Duration::minutes(minutes_left));
        let (dispatcher, queue, email) = setup(rule.clone());
        let rt = runtime();

        let event = FireEvent::new("hourly", Context::new(), None, Some(fire_at)).with_recurrence(rule);
        let report = rt.block_on(dispatcher.fire_event(&event)).unwrap();

        prop_assert!(report.rearmed.is_none());
        prop_assert!(rt.block_on(queue.is_empty()));
        prop_assert_eq!(rt.block_on(email.count()), 1);
    });
}

#[tokio::test]
async fn test_one_off_jobs_wait_until_due() {
    let queue = InMemoryQueue::new();
    let at = Utc.with_ymd_and_hms(2024, 3, 3, 18, 0, 0).unwrap();
    let event = FireEvent::new("hourly", Context::new(), None, Some(at));

    queue.enqueue(event.clone(), at).await.unwrap();

    assert!(queue.take_due(at - Duration::seconds(1)).await.is_empty());
    assert_eq!(queue.take_due(at).await, vec![event]);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_scope_is_resolved_again_when_queued_event_fires() {
    let mut builder = NotificationRegistry::builder();
    builder
        .register(
            NotificationDefinition::builder("ops-alert")
                .scope(Scope::query(Filter::eq("team", "ops")))
                .trigger(Trigger::Delayed(DelayedTrigger::new(Duration::hours(1))))
                .backends(["email"])
                .template("default", "alert.txt")
                .build()
                .unwrap(),
        )
        .unwrap();

    let directory = Arc::new(InMemoryDirectory::new([
        Recipient::new("lan").with_attribute("team", "ops"),
        Recipient::new("minh").with_attribute("team", "ops"),
        Recipient::new("hoa").with_attribute("team", "dev"),
    ]));
    let queue = Arc::new(InMemoryQueue::new());
    let email = Arc::new(RecordingBackend::new());
    let dispatcher = Dispatcher::new(
        Arc::new(builder.build()),
        directory.clone(),
        Arc::new(TeraRenderer::from_templates([("alert.txt", "alert for {{ recipient.id }}")]).unwrap()),
        BackendRegistry::new().with_backend("email", email.clone()),
        queue.clone(),
        DispatchConfig::default(),
    )
    .unwrap();

    let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let outcome = dispatcher
        .schedule(ScheduleRequest::new("ops-alert", Context::new()).at(created_at))
        .await
        .unwrap();
    let handle = outcome.handle().unwrap().clone();
    assert_eq!(email.count().await, 0);

    // Directory changes between schedule and fire
    directory
        .insert(Recipient::new("thu").with_attribute("team", "ops"))
        .await;
    assert!(directory.remove("minh").await);

    let due = queue.take_due(handle.fire_at).await;
    assert_eq!(due.len(), 1);
    let report = dispatcher.fire_event(&due[0]).await.unwrap();

    assert_eq!(report.recipients, 2);
    let mut delivered: Vec<String> = email
        .deliveries()
        .await
        .into_iter()
        .map(|d| d.recipient.id)
        .collect();
    delivered.sort();
    assert_eq!(delivered, vec!["lan", "thu"]);
}
