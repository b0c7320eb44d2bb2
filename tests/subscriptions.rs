//! Shell subscriptions through the service: filter union, pipe delivery, limits

mod common;

use common::{count_config, TestService};
use std::collections::BTreeSet;
use telemd::config::{ConfigKey, SimpleAtomMatcher};
use telemd::event::{LogEvent, Value};
use telemd::subscription::{read_frame, ShellSubscription, ShellTransport, SubscriptionError};

fn pushed(atoms: &[i32]) -> ShellSubscription {
    ShellSubscription {
        pushed: atoms.iter().map(|a| SimpleAtomMatcher::new(*a)).collect(),
        pulled: Vec::new(),
    }
}

#[tokio::test]
async fn test_filter_is_union_of_configs_and_shell_clients() {
    let ctx = TestService::new();
    let service = &ctx.service;
    service
        .add_config(ConfigKey::new(0, 1), &count_config(1), 0, 0)
        .await
        .unwrap();

    let (_reader, writer) = tokio::io::duplex(1024);
    let id = service
        .subscriber()
        .subscribe(pushed(&[20, 21]), ShellTransport::Pipe(Box::new(writer)), 0)
        .unwrap();
    assert_eq!(service.filter().atom_ids(), BTreeSet::from([10, 20, 21]));

    service.subscriber().unsubscribe(&id).await.unwrap();
    assert_eq!(service.filter().atom_ids(), BTreeSet::from([10]));
}

#[tokio::test]
async fn test_pushed_atoms_reach_pipe_client() {
    let ctx = TestService::new();
    let service = &ctx.service;
    let (mut reader, writer) = tokio::io::duplex(4096);
    service
        .subscriber()
        .subscribe(pushed(&[20]), ShellTransport::Pipe(Box::new(writer)), 0)
        .unwrap();

    service.on_log_event(&LogEvent::new(20, 5).with_value(Value::Long(9)));
    // Not subscribed and not used by any config, so the filter drops it
    service.on_log_event(&LogEvent::new(30, 6));
    assert_eq!(service.subscriber().run_once(10).await, 1);

    let data = read_frame(&mut reader).await.unwrap().unwrap();
    assert_eq!(data.atoms.len(), 1);
    assert_eq!(data.atoms[0].atom_id, 20);
    assert_eq!(data.elapsed_timestamp_nanos, vec![5]);
    assert_eq!(service.stats().snapshot().atoms[&30].dropped, 1);
}

#[tokio::test]
async fn test_subscription_limit_comes_from_settings() {
    let ctx = TestService::with_settings(|s| s.max_subscriptions = 1);
    let subscriber = ctx.service.subscriber();
    let (_r1, w1) = tokio::io::duplex(64);
    let (_r2, w2) = tokio::io::duplex(64);
    subscriber
        .subscribe(pushed(&[1]), ShellTransport::Pipe(Box::new(w1)), 0)
        .unwrap();
    let err = subscriber
        .subscribe(pushed(&[2]), ShellTransport::Pipe(Box::new(w2)), 0)
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::TooManySubscriptions(1)));

    let err = subscriber
        .subscribe(
            ShellSubscription::default(),
            ShellTransport::Pipe(Box::new(tokio::io::sink())),
            0,
        )
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidSubscription(_)));
}
