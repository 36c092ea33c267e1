//! Storage-level walkthroughs of the platform's key flows: start-template
//! versioning, the exactly-once sale claim, and recovery-delivery
//! idempotency under racing writers.

use chrono::{Duration, Utc};

use hive_store::blocks::BlockDraft;
use hive_store::payments::TxDraft;
use hive_store::types::{Container, ContainerKind, TxKind, TxStatus};
use hive_store::Store;

fn store() -> Store {
    Store::open_in_memory().unwrap()
}

#[test]
fn start_template_delivered_once_per_version() {
    let store = store();
    let bot_id = 42;
    let user = 111;

    // Admin configures a three-block template.
    let container = Container::new(ContainerKind::Start, bot_id);
    for text in ["Bem-vindo!", "Veja isso", "E isso"] {
        store
            .insert_block(
                container,
                BlockDraft {
                    text: Some(text.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    // First /start: eligible, deliver, record v1.
    let v = store.start_template_version(bot_id).unwrap();
    assert_eq!(store.start_status(bot_id, user).unwrap(), None);
    store.record_start_delivery(bot_id, user, v).unwrap();

    // Second /start with the same version: skip.
    assert_eq!(store.start_status(bot_id, user).unwrap(), Some(v));

    // Admin edits the template; the user becomes eligible again.
    let v2 = store.bump_start_template(bot_id).unwrap();
    assert_ne!(store.start_status(bot_id, user).unwrap(), Some(v2));
}

#[test]
fn sale_approval_is_exactly_once_across_racing_workers() {
    let store = store();
    let tx = store
        .create_transaction(TxDraft {
            bot_id: 1,
            user_tg_id: 111,
            kind: TxKind::Offer,
            offer_id: Some(7),
            upsell_id: None,
            tracker_id: None,
            amount_cents: 4990,
            external_id: "gw-789".into(),
            pix_code: "000201pix".into(),
        })
        .unwrap();
    store
        .transition_transaction(tx.id, TxStatus::Created, TxStatus::Pending)
        .unwrap();

    // Both the poll loop and the webhook observe `paid`; only one guarded
    // transition succeeds.
    let w1 = store
        .transition_transaction(tx.id, TxStatus::Pending, TxStatus::Paid)
        .unwrap();
    let w2 = store
        .transition_transaction(tx.id, TxStatus::Pending, TxStatus::Paid)
        .unwrap();
    assert!(w1 ^ w2);

    // Both workers still run the fan-out task; the notification claim picks
    // a single winner.
    let c1 = store.claim_sale_notification(tx.id, 10, None).unwrap();
    let c2 = store.claim_sale_notification(tx.id, 10, None).unwrap();
    assert!(c1 ^ c2);

    // Deliverable dispatch happens once, then the state is terminal.
    assert!(store
        .transition_transaction(tx.id, TxStatus::Paid, TxStatus::Delivered)
        .unwrap());
    assert!(!store
        .transition_transaction(tx.id, TxStatus::Paid, TxStatus::Delivered)
        .unwrap());
    assert!(store.has_delivered_transaction(1, 111).unwrap());
}

#[test]
fn recovery_episode_survives_duplicate_scheduling() {
    let store = store();
    let bot_id = 5;
    let user = 222;

    store
        .upsert_recovery_campaign(bot_id, 600, "America/Sao_Paulo", true)
        .unwrap();
    let s1 = store.add_recovery_step(bot_id, "10m").unwrap();
    let s2 = store.add_recovery_step(bot_id, "+1d 09:00").unwrap();

    let at = Utc::now() + Duration::minutes(10);
    // Two watchdog tasks race on the same episode/step pair.
    let first = store
        .ensure_recovery_delivery(bot_id, user, 1, "ep-xyz", s1.id, at)
        .unwrap();
    let second = store
        .ensure_recovery_delivery(bot_id, user, 1, "ep-xyz", s1.id, at)
        .unwrap();
    assert!(first && !second);

    // Step 1 sends once; step 2 chains.
    let d = store
        .get_recovery_delivery(bot_id, user, "ep-xyz", s1.id)
        .unwrap()
        .unwrap();
    store.mark_recovery_sent(d.id).unwrap();
    assert!(store.mark_recovery_sent(d.id).is_err());

    let next = store.next_recovery_step(bot_id, s1.ordinal).unwrap().unwrap();
    assert_eq!(next.id, s2.id);

    // Reconfiguring the campaign bumps the version, orphaning the episode.
    let reconfigured = store
        .upsert_recovery_campaign(bot_id, 600, "America/Sao_Paulo", true)
        .unwrap();
    assert_eq!(reconfigured.version, 2);
}
