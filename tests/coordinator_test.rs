//! Update coordinator integration tests

mod common;

use common::{config, eventually, CountingPage, Fixture, StallingNetwork};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use maestro_offline::cache::MemoryCacheStorage;
use maestro_offline::clock::ManualClock;
use maestro_offline::network::MemoryNetwork;
use maestro_offline::{CoordinatorConfig, UpdateCoordinator, UpdateNotice, WorkerHost};

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        update_interval: Duration::from_secs(3600),
        install_timeout: Duration::from_secs(5),
        reply_timeout: Duration::from_secs(1),
    }
}

/// Fixture with v1 active and a registered coordinator on one page
async fn registered(
    skip_waiting: bool,
) -> (Fixture, UpdateCoordinator, Arc<CountingPage>) {
    let fixture = Fixture::new();
    fixture.serve_shell(&["/"]);
    fixture.host.deploy(config("1", &["/"], skip_waiting));

    let page = Arc::new(CountingPage::default());
    let coordinator = UpdateCoordinator::new(
        Some(fixture.host.connect()),
        page.clone(),
        coordinator_config(),
    );
    coordinator.register().await.unwrap();
    (fixture, coordinator, page)
}

fn collect_notices(coordinator: &UpdateCoordinator) -> Arc<Mutex<Vec<UpdateNotice>>> {
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    coordinator.on_update_available(move |notice| {
        sink.lock().unwrap().push(notice.clone());
    });
    notices
}

#[tokio::test]
async fn test_register_without_controller_support_is_a_no_op() {
    let page = Arc::new(CountingPage::default());
    let coordinator = UpdateCoordinator::new(None, page.clone(), coordinator_config());

    coordinator.register().await.unwrap();

    assert_eq!(coordinator.notice(), UpdateNotice::default());
    assert_eq!(coordinator.current_version().await, None);
    assert!(!coordinator.install_update().await);
    assert!(!coordinator.is_polling());
    assert_eq!(page.reloads(), 0);
}

#[tokio::test]
async fn test_zero_update_interval_is_rejected() {
    let fixture = Fixture::new();
    fixture.serve_shell(&["/"]);
    fixture.host.deploy(config("1", &["/"], true));

    let coordinator = UpdateCoordinator::new(
        Some(fixture.host.connect()),
        Arc::new(CountingPage::default()),
        CoordinatorConfig {
            update_interval: Duration::ZERO,
            ..coordinator_config()
        },
    );

    assert!(coordinator.register().await.is_err());
    assert!(!coordinator.is_polling());
    assert_eq!(fixture.network.calls(), 0);
    assert!(fixture.host.active().is_none());
}

#[tokio::test]
async fn test_register_seeds_current_version_once() {
    let (fixture, coordinator, _page) = registered(true).await;

    assert_eq!(coordinator.notice().current_version.as_deref(), Some("1"));
    assert_eq!(coordinator.current_version().await.as_deref(), Some("1"));
    assert!(!coordinator.notice().update_available);

    // Second call does not register again
    let calls = fixture.network.calls();
    coordinator.register().await.unwrap();
    assert_eq!(fixture.network.calls(), calls);
    assert!(coordinator.is_polling());
}

#[tokio::test]
async fn test_waiting_version_is_announced() {
    let (fixture, coordinator, _page) = registered(false).await;
    let notices = collect_notices(&coordinator);

    fixture.host.deploy(config("2", &["/"], false));
    coordinator.check_for_update().await;

    assert!(eventually(|| !notices.lock().unwrap().is_empty()).await);
    assert_eq!(
        notices.lock().unwrap()[0],
        UpdateNotice {
            current_version: Some("1".into()),
            new_version: Some("2".into()),
            update_available: true,
        }
    );
}

#[tokio::test]
async fn test_self_promoting_version_is_announced_once() {
    let (fixture, coordinator, _page) = registered(true).await;
    let notices = collect_notices(&coordinator);

    fixture.host.deploy(config("2", &["/"], true));
    coordinator.check_for_update().await;

    assert!(eventually(|| !notices.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let notices = notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].new_version.as_deref(), Some("2"));
    assert_eq!(coordinator.notice().new_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_unsubscribed_listener_is_not_called() {
    let (fixture, coordinator, _page) = registered(false).await;
    let notices = Arc::new(Mutex::new(Vec::<UpdateNotice>::new()));
    let sink = notices.clone();
    let subscription = coordinator.on_update_available(move |notice| {
        sink.lock().unwrap().push(notice.clone());
    });
    let kept = collect_notices(&coordinator);

    subscription.unsubscribe();
    fixture.host.deploy(config("2", &["/"], false));
    coordinator.check_for_update().await;

    assert!(eventually(|| !kept.lock().unwrap().is_empty()).await);
    assert!(notices.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_install_update_switches_controller_and_reloads() {
    let (fixture, coordinator, page) = registered(false).await;
    fixture.host.deploy(config("2", &["/"], false));
    coordinator.check_for_update().await;
    assert!(coordinator.connection().unwrap().waiting().is_some());

    assert!(coordinator.install_update().await);

    assert_eq!(page.reloads(), 1);
    let connection = coordinator.connection().unwrap();
    assert_eq!(connection.controller().unwrap().version(), "2");
    assert!(connection.waiting().is_none());
    assert_eq!(
        coordinator.notice(),
        UpdateNotice {
            current_version: Some("2".into()),
            new_version: None,
            update_available: false,
        }
    );
}

#[tokio::test]
async fn test_install_update_without_waiting_version_returns_false() {
    let (_fixture, coordinator, page) = registered(false).await;

    assert!(!coordinator.install_update().await);
    assert_eq!(page.reloads(), 0);
}

#[tokio::test]
async fn test_install_update_times_out() {
    let memory = MemoryNetwork::new();
    memory.serve(&common::url("/"), maestro_offline::FetchResponse::ok("text/html", "home"));
    let network = Arc::new(StallingNetwork::new(memory));
    let host = WorkerHost::new(
        Arc::new(MemoryCacheStorage::new()),
        network.clone(),
        Arc::new(ManualClock::new(0)),
    );
    host.deploy(config("1", &["/"], false));

    let page = Arc::new(CountingPage::default());
    let coordinator = UpdateCoordinator::new(
        Some(host.connect()),
        page.clone(),
        CoordinatorConfig {
            install_timeout: Duration::from_millis(100),
            ..coordinator_config()
        },
    );
    coordinator.register().await.unwrap();

    host.deploy(config("2", &["/"], false));
    coordinator.check_for_update().await;
    assert!(host.waiting().is_some());

    // v3 install hangs on the origin and holds the host's lifecycle jobs
    network.stall(true);
    host.deploy(config("3", &["/"], false));
    let stuck = tokio::spawn({
        let host = host.clone();
        async move { host.update().await }
    });
    assert!(eventually(|| host.installing().is_some()).await);

    assert!(!coordinator.install_update().await);
    assert_eq!(page.reloads(), 0);
    assert_eq!(
        coordinator.connection().unwrap().controller().unwrap().version(),
        "1"
    );

    stuck.abort();
}

#[tokio::test]
async fn test_periodic_check_installs_new_deployments_until_disposed() {
    let fixture = Fixture::new();
    fixture.serve_shell(&["/"]);
    fixture.host.deploy(config("1", &["/"], false));
    let coordinator = UpdateCoordinator::new(
        Some(fixture.host.connect()),
        Arc::new(CountingPage::default()),
        CoordinatorConfig {
            update_interval: Duration::from_millis(20),
            ..coordinator_config()
        },
    );
    coordinator.register().await.unwrap();

    fixture.host.deploy(config("2", &["/"], false));
    assert!(eventually(|| fixture.host.waiting().is_some()).await);

    coordinator.dispose();
    assert!(!coordinator.is_polling());

    fixture.host.deploy(config("3", &["/"], false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.host.waiting().unwrap().version(), "2");
}

#[tokio::test]
async fn test_visible_page_checks_for_update() {
    let (fixture, coordinator, _page) = registered(false).await;
    fixture.host.deploy(config("2", &["/"], false));

    coordinator.on_visibility_change(true).await;
    assert!(fixture.host.waiting().is_none());

    coordinator.on_visibility_change(false).await;
    assert_eq!(fixture.host.waiting().unwrap().version(), "2");
}
