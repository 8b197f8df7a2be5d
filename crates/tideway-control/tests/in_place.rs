//! Integration tests for the in-place executor.

mod common;

use std::sync::Arc;

use common::fakes::{host, FakeBroker, FakeLocator};
use common::{config, context, UNREACHABLE};
use tideway_control::config::EnvironmentConfig;
use tideway_control::executor::{InPlaceExecutor, StrategyExecutor};
use tideway_control::process::CommandOutput;
use tideway_control::{ControlError, ErrorClass, ExecutionStatus};

fn executor(locator: Arc<FakeLocator>, broker: Arc<FakeBroker>) -> InPlaceExecutor {
    InPlaceExecutor::new(locator, broker, config(UNREACHABLE).in_place)
}

#[tokio::test]
async fn only_relay_hosts_means_nothing_to_deploy() {
    let locator = Arc::new(FakeLocator::new(vec![host("i-1", "10.0.0.10", "prod-bastion")]));
    let broker = Arc::new(FakeBroker::healthy());
    let config = config(UNREACHABLE);

    let err = executor(locator, broker.clone())
        .execute(&context(&config, "in_place"))
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::NoTargets { ref environment } if environment == "prod"));
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert!(broker.connected().is_empty());
}

#[tokio::test]
async fn relay_hosts_are_never_updated() {
    let locator = Arc::new(FakeLocator::new(vec![
        host("i-1", "10.0.1.5", "prod-web-1"),
        host("i-2", "10.0.1.6", "prod-web-2"),
        host("i-3", "10.0.0.10", "prod-bastion"),
    ]));
    let broker = Arc::new(FakeBroker::healthy());
    let config = config(UNREACHABLE);

    let outcome = executor(locator, broker.clone())
        .execute(&context(&config, "in_place"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.targets.len(), 2);
    assert_eq!(broker.connected(), vec!["10.0.1.5", "10.0.1.6"]);

    let commands = broker.commands.lock().unwrap().clone();
    assert_eq!(commands.len(), 2);
    for (_, script) in commands {
        assert!(script.contains(
            "docker pull '123456789012.dkr.ecr.us-east-1.amazonaws.com/bluegreen-app:v2'"
        ));
        assert!(script.contains("--name 'bluegreen-app'"));
    }
}

#[tokio::test]
async fn one_failing_host_does_not_abort_the_others() {
    let locator = Arc::new(FakeLocator::new(vec![
        host("i-1", "10.0.1.5", "prod-web-1"),
        host("i-2", "10.0.1.6", "prod-web-2"),
        host("i-3", "10.0.1.7", "prod-web-3"),
    ]));
    let broker = Arc::new(FakeBroker::new(|address| {
        if address == "10.0.1.6" {
            Ok(CommandOutput::failed(1, "net/http: TLS handshake timeout"))
        } else {
            Ok(CommandOutput::ok("started"))
        }
    }));
    let config = config(UNREACHABLE);

    let outcome = executor(locator, broker.clone())
        .execute(&context(&config, "in_place"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::PartiallyFailed);
    assert_eq!(broker.connected().len(), 3);

    let failed: Vec<_> = outcome.targets.iter().filter(|t| !t.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target, "10.0.1.6");
    assert_eq!(failed[0].error_class, Some(ErrorClass::Transient));

    let err = outcome.to_error("prod");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn denied_pull_makes_the_failure_permanent() {
    let locator = Arc::new(FakeLocator::new(vec![
        host("i-1", "10.0.1.5", "prod-web-1"),
        host("i-2", "10.0.1.6", "prod-web-2"),
    ]));
    let broker = Arc::new(FakeBroker::new(|address| {
        if address == "10.0.1.5" {
            Ok(CommandOutput::failed(1, "pull access denied for bluegreen-app"))
        } else {
            Ok(CommandOutput::failed(1, "connection reset by peer"))
        }
    }));
    let config = config(UNREACHABLE);

    let outcome = executor(locator, broker)
        .execute(&context(&config, "in_place"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(!outcome.to_error("prod").is_retryable());
}

#[tokio::test]
async fn relay_is_used_for_private_hosts() {
    let mut config = config(UNREACHABLE);
    let prod: &mut EnvironmentConfig = config.environments.get_mut("prod").unwrap();
    prod.relay_host = Some("bastion.example.com:2222\r\n".to_owned());

    let locator = Arc::new(FakeLocator::new(vec![host("i-1", "10.0.1.5", "prod-web-1")]));
    let broker = Arc::new(FakeBroker::healthy());

    executor(locator.clone(), broker.clone())
        .execute(&context(&config, "in_place"))
        .await
        .unwrap();

    assert_eq!(
        locator.queries.lock().unwrap().as_slice(),
        &[("prod".to_owned(), true)]
    );
    let connections = broker.connections.lock().unwrap().clone();
    assert_eq!(connections.len(), 1);
    assert!(connections[0]
        .1
        .as_deref()
        .unwrap()
        .contains("bastion.example.com"));
}
