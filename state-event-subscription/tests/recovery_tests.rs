mod common;

use lifecycle::LifecycleStatus;
use state_event_subscription::test_utils::FaultPoint;
use state_event_subscription::SubscriptionPhase;

use common::*;

#[tokio::test]
async fn gives_up_after_max_retries_plus_one_intermittent_failures() {
    let bus = ledger_bus(1);
    bus.inject_intermittent(FaultPoint::Poll, 3);

    let config = test_config().with_max_processor_retries(2);
    let (mut subscription, registry) = start(&bus, config, LedgerProcessor::new());

    subscription.join().await;

    let reason = subscription.last_error().expect("error reason");
    assert!(
        reason.contains("3 consecutive intermittent failures"),
        "unexpected reason: {reason}"
    );
    assert!(registry.status_of(EVENTS).is_some_and(|s| s.is_error()));
    assert!(!registry.get_status().healthy);
    assert!(!subscription.is_running());
    assert_eq!(subscription.phase(), SubscriptionPhase::Stopped);
}

#[tokio::test]
async fn keeps_running_when_failures_stay_within_the_retry_budget() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 100 });
    bus.inject_intermittent(FaultPoint::Poll, 2);

    let config = test_config().with_max_processor_retries(2);
    let (subscription, _registry) = start(&bus, config, LedgerProcessor::new());

    wait_until("the deposit committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(1)
    })
    .await;

    assert!(subscription.is_running());
    assert_eq!(subscription.status(), LifecycleStatus::Up);
    assert_eq!(subscription.last_error(), None);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn retry_counter_resets_after_a_successful_cycle() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 1 });
    bus.inject_intermittent(FaultPoint::CommitTransaction, 2);

    let config = test_config().with_max_processor_retries(2);
    let (subscription, _registry) = start(&bus, config, LedgerProcessor::new());

    wait_until("the first deposit committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(1)
    })
    .await;

    bus.inject_intermittent(FaultPoint::CommitTransaction, 2);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 2 });

    wait_until("the second deposit committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(2)
    })
    .await;

    assert!(subscription.is_running());
    assert_eq!(bus.aborted_transactions(), 4);
    assert_eq!(committed_balance(&bus, "acct-1"), Some(3));

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn empty_polls_between_failed_commits_do_not_reset_retries() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 100 });
    bus.inject_intermittent(FaultPoint::CommitTransaction, 3);
    bus.empty_poll_after_rewind(true);

    let config = test_config().with_max_processor_retries(2);
    let (mut subscription, _registry) = start(&bus, config, LedgerProcessor::new());

    subscription.join().await;

    let reason = subscription.last_error().expect("error reason");
    assert!(
        reason.contains("3 consecutive intermittent failures"),
        "unexpected reason: {reason}"
    );
    assert_eq!(bus.aborted_transactions(), 3);
    assert_eq!(bus.committed_offset(GROUP, EVENTS, 0), None);
}

#[tokio::test]
async fn failed_state_replay_is_retried() {
    let bus = ledger_bus(1);
    bus.produce_json(STATE, 0, "acct-1", &40);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 60 });
    bus.inject_intermittent(FaultPoint::ReadState, 1);

    let (subscription, _registry) = start(&bus, test_config(), LedgerProcessor::new());

    wait_until("the deposit committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(1)
    })
    .await;

    assert_eq!(bus.state_reads(), vec![vec![0]]);
    assert_eq!(committed_balance(&bus, "acct-1"), Some(100));
    assert_eq!(bus.committed_transactions(), 1);
    assert_eq!(subscription.status(), LifecycleStatus::Up);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn fatal_failure_stops_without_retrying() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 100 });
    bus.inject_fatal(FaultPoint::Send, 1);

    let (mut subscription, _registry) = start(&bus, test_config(), LedgerProcessor::new());

    subscription.join().await;

    let reason = subscription.last_error().expect("error reason");
    assert!(reason.starts_with("fatal failure"), "unexpected reason: {reason}");
    assert_eq!(bus.aborted_transactions(), 1);
    assert_eq!(bus.committed_offset(GROUP, EVENTS, 0), None);
    assert!(bus.records(POSTED).is_empty());
    assert_eq!(bus.consumers_created(), 1);
}

#[tokio::test]
async fn reconnects_when_producer_creation_fails_intermittently() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 7 });
    bus.inject_intermittent(FaultPoint::CreateProducer, 1);

    let (subscription, _registry) = start(&bus, test_config(), LedgerProcessor::new());

    wait_until("the deposit committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(1)
    })
    .await;

    assert_eq!(bus.consumers_created(), 2);
    assert_eq!(bus.live_consumers(), 1);
    assert_eq!(committed_balance(&bus, "acct-1"), Some(7));

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn undecodable_state_stops_the_subscription() {
    let bus = ledger_bus(1);
    bus.produce_raw(STATE, 0, Some(b"acct-1".to_vec()), Some(b"{broken".to_vec()));
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 1 });

    let (mut subscription, _registry) = start(&bus, test_config(), LedgerProcessor::new());

    subscription.join().await;

    let reason = subscription.last_error().expect("error reason");
    assert!(
        reason.contains("undecodable state record at ledger-state/0@0"),
        "unexpected reason: {reason}"
    );
    assert_eq!(bus.committed_offset(GROUP, EVENTS, 0), None);
}

#[tokio::test]
async fn revoked_partition_is_replayed_before_its_events_are_processed_again() {
    let bus = ledger_bus(1);
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Deposit { amount: 100 });
    bus.produce_json(EVENTS, 0, "acct-1", &LedgerEvent::Withdraw { amount: 30 });

    let rebalancer = bus.clone();
    let processor = LedgerProcessor::new().with_hook(move || {
        rebalancer.revoke(&[0]);
        rebalancer.assign(&[0]);
    });
    let seen = processor.seen();
    let (subscription, _registry) = start(&bus, test_config(), processor);

    wait_until("both events committed", || {
        bus.committed_offset(GROUP, EVENTS, 0) == Some(2)
    })
    .await;

    let reads = bus.state_reads();
    assert!(reads.len() >= 2, "expected a replay after reassignment: {reads:?}");
    assert!(reads.iter().all(|partitions| partitions == &vec![0]));

    // The interrupted attempt committed nothing, the replayed one everything.
    assert_eq!(postings(&bus).len(), 2);
    assert_eq!(committed_balance(&bus, "acct-1"), Some(70));
    assert_eq!(bus.committed_transactions(), 1);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&("acct-1".to_string(), None)));
    assert_eq!(seen.last(), Some(&("acct-1".to_string(), Some(100))));
    assert_eq!(subscription.status(), LifecycleStatus::Up);

    subscription.close().await.unwrap();
}
