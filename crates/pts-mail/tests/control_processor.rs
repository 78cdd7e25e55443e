//! Control processor integration tests: command execution, the error
//! budget, the confirmation flow and reply discipline.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use pts_mail::codec::MailMessage;
use pts_mail::control::{ControlOutcome, ControlProcessor};
use pts_shared::models::{Package, Team};
use pts_shared::storage::{MemoryStorage, Storage};
use pts_shared::transport::RecordingTransport;
use pts_shared::PtsConfig;

struct Harness {
    processor: ControlProcessor,
    storage: Arc<MemoryStorage>,
    transport: Arc<RecordingTransport>,
}

fn harness() -> Harness {
    let config = PtsConfig::default();
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(RecordingTransport::new());
    let processor = ControlProcessor::new(config, storage.clone(), transport.clone());
    Harness {
        processor,
        storage,
        transport,
    }
}

fn control_mail(from: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\n\
         To: control@pts.example.org\r\n\
         Subject: commands\r\n\
         \r\n\
         {}\r\n",
        body.replace('\n', "\r\n")
    )
    .into_bytes()
}

fn body_of(data: &[u8]) -> String {
    MailMessage::parse(data.to_vec())
        .unwrap()
        .first_plain_text()
        .unwrap()
}

#[tokio::test]
async fn which_lists_subscriptions_and_replies_once() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();
    h.storage.subscribe("nginx", "user@x.org").await.unwrap();

    let outcome = h
        .processor
        .process(&control_mail("user@x.org", "which\nthanks"))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 2 });

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1, "at most one reply per inbound message");
    assert_eq!(sent[0].envelope_to, "user@x.org");

    let reply = MailMessage::parse(sent[0].data.clone()).unwrap();
    assert_eq!(reply.subject().as_deref(), Some("Re: commands"));
    assert_eq!(reply.header_all("X-Loop"), ["control@pts.example.org"]);
    let body = body_of(&sent[0].data);
    assert!(body.contains("> which"));
    assert!(body.contains("* nginx"));
    assert!(body.contains("Stopping processing here."));
}

#[tokio::test]
async fn error_budget_halts_processing_before_later_valid_lines() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();

    // Five garbage lines exhaust the budget; the valid subscribe after
    // them must not run and no reply goes out.
    let body = "garbage one\n\
                garbage two\n\
                garbage three\n\
                garbage four\n\
                garbage five\n\
                subscribe nginx user@x.org";
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", body))
        .await
        .unwrap();

    assert_eq!(outcome, ControlOutcome::Ignored);
    assert!(h.transport.sent().is_empty());
    assert!(h
        .storage
        .get_subscription("nginx", "user@x.org")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn four_errors_still_allow_later_commands() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();
    h.storage.subscribe("nginx", "user@x.org").await.unwrap();

    let body = "junk a\njunk b\njunk c\njunk d\nwhich";
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", body))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
}

#[tokio::test]
async fn own_loop_address_drops_silently() {
    let h = harness();
    let raw = "From: user@x.org\r\n\
         X-Loop: control@pts.example.org\r\n\
         Subject: echo\r\n\
         \r\n\
         which\r\n";
    let outcome = h.processor.process(raw.as_bytes()).await.unwrap();
    assert_eq!(outcome, ControlOutcome::LoopDropped);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn html_only_mail_gets_a_plain_text_warning() {
    let h = harness();
    let raw = "From: user@x.org\r\n\
        Content-Type: text/html\r\n\
        Subject: pretty\r\n\
        \r\n\
        <p>subscribe nginx</p>\r\n";
    let outcome = h.processor.process(raw.as_bytes()).await.unwrap();
    assert_eq!(outcome, ControlOutcome::WarningSent);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(body_of(&sent[0].data).contains("text/plain"));
}

#[tokio::test]
async fn subscribe_confirmation_round_trip() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();

    // Phase one: the subscribe enqueues a token, nothing changes yet.
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", "subscribe nginx"))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    assert!(h
        .storage
        .get_subscription("nginx", "user@x.org")
        .await
        .unwrap()
        .is_none());

    // Reply plus confirmation mail.
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    let confirmation = sent
        .iter()
        .find(|outbound| {
            MailMessage::parse(outbound.data.clone())
                .unwrap()
                .subject()
                .is_some_and(|subject| subject.starts_with("CONFIRM "))
        })
        .expect("a confirmation mail was sent");
    assert_eq!(confirmation.envelope_to, "user@x.org");
    let token = MailMessage::parse(confirmation.data.clone())
        .unwrap()
        .subject()
        .unwrap()
        .trim_start_matches("CONFIRM ")
        .to_string();

    // Phase two: the confirm command applies the subscription.
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", &format!("confirm {token}")))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    let subscription = h
        .storage
        .get_subscription("nginx", "user@x.org")
        .await
        .unwrap()
        .expect("subscription created on confirm");
    assert!(subscription.active);

    // Tokens are single-use.
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", &format!("confirm {token}")))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    let last_reply = h.transport.sent().pop().unwrap();
    assert!(body_of(&last_reply.data).contains("unknown confirmation token"));
}

#[tokio::test]
async fn subscribe_for_unknown_package_reports_an_error() {
    let h = harness();
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", "subscribe ghost"))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(body_of(&sent[0].data).contains("Error: package ghost does not exist."));
}

#[tokio::test]
async fn duplicate_subscribe_warns_instead_of_erroring() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();
    h.storage.subscribe("nginx", "user@x.org").await.unwrap();

    let outcome = h
        .processor
        .process(&control_mail("user@x.org", "subscribe nginx"))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    let sent = h.transport.sent();
    // No confirmation mail for a no-op; just the warning reply.
    assert_eq!(sent.len(), 1);
    assert!(body_of(&sent[0].data).contains("already subscribed"));
}

#[tokio::test]
async fn unsubscribe_and_keyword_commands_act_directly() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();
    h.storage.subscribe("nginx", "user@x.org").await.unwrap();

    let body = "keyword nginx = bts archive\nunsubscribe nginx";
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", body))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 2 });

    let reply = body_of(&h.transport.sent()[0].data);
    assert!(reply.contains("Keywords for user@x.org on nginx: bts, archive"));
    assert!(reply.contains("user@x.org has been unsubscribed from nginx"));
    assert!(h
        .storage
        .get_subscription("nginx", "user@x.org")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn join_team_requires_public_team_and_confirmation() {
    let h = harness();
    h.storage
        .create_team(Team::new("pkg-rust", "Rust team", "owner@x.org", true))
        .await
        .unwrap();
    h.storage
        .create_team(Team::new("private-team", "Private", "owner@x.org", false))
        .await
        .unwrap();

    // Private team: refused outright, no token created.
    let outcome = h
        .processor
        .process(&control_mail("user@x.org", "join-team private-team"))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Replied { processed: 1 });
    assert!(body_of(&h.transport.sent()[0].data).contains("not public"));

    // Public team: confirmation mail, then membership on confirm.
    h.processor
        .process(&control_mail("user@x.org", "join-team pkg-rust"))
        .await
        .unwrap();
    let sent = h.transport.sent();
    let confirmation = sent
        .iter()
        .find_map(|outbound| {
            let subject = MailMessage::parse(outbound.data.clone()).unwrap().subject()?;
            subject
                .strip_prefix("CONFIRM ")
                .map(|token| token.to_string())
        })
        .expect("confirmation token issued");

    h.processor
        .process(&control_mail("user@x.org", &format!("confirm {confirmation}")))
        .await
        .unwrap();
    let team = h.storage.get_team("pkg-rust").await.unwrap().unwrap();
    assert!(team.members.contains("user@x.org"));
}

#[tokio::test]
async fn who_obfuscates_subscriber_domains() {
    let h = harness();
    h.storage.create_package(Package::source("nginx")).await.unwrap();
    h.storage.subscribe("nginx", "amy@example.org").await.unwrap();

    h.processor
        .process(&control_mail("user@x.org", "who nginx"))
        .await
        .unwrap();
    let body = body_of(&h.transport.sent()[0].data);
    assert!(body.contains("amy@..."));
    assert!(!body.contains("amy@example.org"));
}

#[tokio::test]
async fn unsubscribe_all_round_trip() {
    let h = harness();
    for name in ["alpha", "beta"] {
        h.storage.create_package(Package::source(name)).await.unwrap();
        h.storage.subscribe(name, "user@x.org").await.unwrap();
    }

    h.processor
        .process(&control_mail("user@x.org", "unsubscribe-all"))
        .await
        .unwrap();
    let token = h
        .transport
        .sent()
        .iter()
        .find_map(|outbound| {
            let subject = MailMessage::parse(outbound.data.clone()).unwrap().subject()?;
            subject.strip_prefix("CONFIRM ").map(str::to_string)
        })
        .expect("confirmation token issued");

    h.processor
        .process(&control_mail("user@x.org", &format!("confirm {token}")))
        .await
        .unwrap();

    assert!(h
        .storage
        .subscriptions_for_user("user@x.org")
        .await
        .unwrap()
        .is_empty());
    let final_reply = h.transport.sent().pop().unwrap();
    let body = body_of(&final_reply.data);
    assert!(body.contains("Unsubscribing user@x.org from alpha"));
    assert!(body.contains("Unsubscribing user@x.org from beta"));
}
