//! Bounce engine integration tests: dated accounting, threshold crossing,
//! idempotent auto-unsubscription.

use std::sync::Arc;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;

use pts_mail::bounces::{BounceEngine, BounceOutcome};
use pts_mail::codec::{verp, MailMessage};
use pts_shared::models::Package;
use pts_shared::storage::{MemoryStorage, Storage};
use pts_shared::transport::RecordingTransport;
use pts_shared::PtsConfig;

struct Harness {
    engine: BounceEngine,
    storage: Arc<MemoryStorage>,
    transport: Arc<RecordingTransport>,
}

fn harness() -> Harness {
    let config = PtsConfig::default();
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(RecordingTransport::new());
    let engine = BounceEngine::new(config, storage.clone(), transport.clone());
    Harness {
        engine,
        storage,
        transport,
    }
}

fn bounce_recipient(date: &str, user: &str) -> String {
    verp::encode(&format!("bounces+{date}@pts.example.org"), user).unwrap()
}

#[tokio::test]
async fn well_formed_bounce_increments_the_decoded_day() {
    let h = harness();
    let outcome = h
        .engine
        .handle(&bounce_recipient("20240507", "amy@x.org"))
        .await
        .unwrap();

    let date = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap();
    assert_eq!(
        outcome,
        BounceOutcome::Recorded {
            email: "amy@x.org".to_string(),
            date,
        }
    );

    // The date comes from the address, not the wall clock, so a second
    // late-arriving bounce lands on the same day.
    h.engine
        .handle(&bounce_recipient("20240507", "amy@x.org"))
        .await
        .unwrap();
    let records = h.storage.bounce_records("amy@x.org", 7).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].date, date);
    assert_eq!(records[0].bounced_count, 2);
}

#[tokio::test]
async fn malformed_bounce_addresses_are_discarded() {
    let h = harness();
    let addresses = vec![
        "bounces+notadate@pts.example.org".to_string(),
        // Valid VERP but the date has a bad month.
        verp::encode("bounces+20241307@pts.example.org", "amy@x.org").unwrap(),
        // Another system's bounce address.
        bounce_recipient("20240507", "amy@x.org").replace("pts.example.org", "other.example"),
        "not-a-verp-address@pts.example.org".to_string(),
    ];
    for address in &addresses {
        let outcome = h.engine.handle(address).await.unwrap();
        assert_eq!(outcome, BounceOutcome::Invalid, "address {address}");
    }
    assert!(h.storage.bounce_records("amy@x.org", 7).await.unwrap().is_empty());
}

#[tokio::test]
async fn threshold_crossing_unsubscribes_once_and_notifies_once() {
    let h = harness();
    for name in ["alpha", "beta"] {
        h.storage.create_package(Package::source(name)).await.unwrap();
        h.storage.subscribe(name, "u@x.org").await.unwrap();
    }

    // Seven straight days of 10 sent / 9 bounced.
    for day in 1..=7 {
        let date = NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
        for _ in 0..10 {
            h.storage.add_sent("u@x.org", date).await.unwrap();
        }
        for _ in 0..9 {
            h.storage.add_bounce("u@x.org", date).await.unwrap();
        }
    }

    // One more bounce crosses the threshold.
    let outcome = h
        .engine
        .handle(&bounce_recipient("20240507", "u@x.org"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        BounceOutcome::Unsubscribed {
            email: "u@x.org".to_string(),
            packages: vec!["alpha".to_string(), "beta".to_string()],
        }
    );

    // All subscriptions are gone.
    assert!(h
        .storage
        .subscriptions_for_user("u@x.org")
        .await
        .unwrap()
        .is_empty());

    // Exactly one notification, listing the affected packages.
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope_to, "u@x.org");
    let notification = MailMessage::parse(sent[0].data.clone()).unwrap();
    assert_eq!(
        notification.subject().as_deref(),
        Some("All your subscriptions from the PTS have been cancelled")
    );
    let body = notification.first_plain_text().unwrap();
    assert!(body.contains("alpha"));
    assert!(body.contains("beta"));

    // Later bounces stay above the threshold but trigger nothing new.
    let outcome = h
        .engine
        .handle(&bounce_recipient("20240507", "u@x.org"))
        .await
        .unwrap();
    assert!(matches!(outcome, BounceOutcome::Recorded { .. }));
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn below_threshold_user_keeps_subscriptions() {
    let h = harness();
    h.storage
        .create_package(Package::source("alpha"))
        .await
        .unwrap();
    h.storage.subscribe("alpha", "u@x.org").await.unwrap();

    // Four bad days out of seven: under the five-day requirement.
    for day in 1..=7u32 {
        let date = NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
        for _ in 0..10 {
            h.storage.add_sent("u@x.org", date).await.unwrap();
        }
        if day <= 4 {
            for _ in 0..9 {
                h.storage.add_bounce("u@x.org", date).await.unwrap();
            }
        }
    }

    let outcome = h
        .engine
        .handle(&bounce_recipient("20240508", "u@x.org"))
        .await
        .unwrap();
    assert!(matches!(outcome, BounceOutcome::Recorded { .. }));
    assert_eq!(
        h.storage
            .subscriptions_for_user("u@x.org")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(h.transport.sent().is_empty());
}
