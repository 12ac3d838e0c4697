//! Delivery tests driven through the manual backend on a paused clock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use traywatch_watcher::{
    ChangeEvent, ChangeKind, ChangeKinds, ManualBackendFactory, RawEvent, RawEventInjector, RawKind,
    ServiceState, WatcherConfig, WatcherError, WatcherService,
};

const DEBOUNCE: Duration = Duration::from_millis(200);

async fn running_service() -> (WatcherService, RawEventInjector) {
    let factory = ManualBackendFactory::new();
    let injector = factory.injector();
    let config = WatcherConfig::new().with_debounce(DEBOUNCE);
    let service = WatcherService::with_backend(config, factory).unwrap();
    service.start().await.unwrap();
    (service, injector)
}

fn collect(service: &WatcherService) -> mpsc::UnboundedReceiver<ChangeEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _sub = service.on_change(move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for change event")
        .expect("listener channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_secs(2), rx.recv()).await {
        panic!("unexpected change event: {event:?}");
    }
}

fn file_in(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, "initial").unwrap();
    dunce::canonicalize(path).unwrap()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn burst_of_modifications_yields_one_event() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "x.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let _handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    for _ in 0..20 {
        assert!(injector.send(RawEvent::change(RawKind::Modified, &file)));
    }

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Modified);
    assert_eq!(event.path, file);
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn remove_then_create_collapses_to_modified() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "swap.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let handle = service.watch(dir.path(), ChangeKinds::all()).await.unwrap();
    injector.send(RawEvent::change(RawKind::Removed, &file));
    injector.send(RawEvent::change(RawKind::Created, &file));

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Modified);
    assert_quiet(&mut rx).await;
    assert!(service.is_active(&handle).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn every_subscriber_receives_each_event() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "shared.txt");
    let (service, injector) = running_service().await;
    let mut receivers: Vec<_> = (0..3).map(|_| collect(&service)).collect();

    let _handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &file));

    for rx in &mut receivers {
        let event = next_event(rx).await;
        assert_eq!(event.path, file);
    }
    assert_eq!(service.stats().await.delivered_events, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn listeners_are_called_in_registration_order() {
    let dir = TempDir::new().unwrap();
    let files: Vec<PathBuf> = (0..3).map(|i| file_in(&dir, &format!("o{i}.txt"))).collect();
    let (service, injector) = running_service().await;

    let calls = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..8 {
        let calls = Arc::clone(&calls);
        let _sub = service.on_change(move |_| {
            calls.lock().unwrap().push(tag);
            Ok(())
        });
    }
    let mut last = collect(&service);

    let _handle = service.watch(dir.path(), ChangeKinds::all()).await.unwrap();
    for file in &files {
        injector.send(RawEvent::change(RawKind::Modified, file));
    }
    for _ in &files {
        next_event(&mut last).await;
    }

    let expected: Vec<usize> = files.iter().flat_map(|_| 0..8).collect();
    assert_eq!(*calls.lock().unwrap(), expected);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failing_listeners_do_not_stop_delivery() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "fragile.txt");
    let (service, injector) = running_service().await;

    let _failing = service.on_change(|_| anyhow::bail!("listener rejected event"));
    let _panicking = service.on_change(|_| panic!("listener blew up"));
    let mut rx = collect(&service);

    let _handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &file));
    next_event(&mut rx).await;

    injector.send(RawEvent::change(RawKind::Modified, &file));
    next_event(&mut rx).await;

    // Both failing listeners are still registered and fail once per event.
    timeout(Duration::from_secs(5), async {
        while service.stats().await.listener_failures < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener failures were not recorded");

    let stats = service.stats().await;
    assert_eq!(stats.subscribers, 3);
    assert_eq!(stats.listener_failures, 4);
    assert_eq!(stats.state, ServiceState::Running);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unsubscribed_listener_receives_nothing() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "quiet.txt");
    let (service, injector) = running_service().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = service.on_change(move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    let mut other = collect(&service);
    assert!(sub.unsubscribe());

    let _handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &file));

    next_event(&mut other).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn kinds_filter_drops_uninteresting_changes() {
    let dir = TempDir::new().unwrap();
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let _handle = service.watch(dir.path(), ChangeKind::Removed).await.unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    injector.send(RawEvent::change(RawKind::Created, root.join("new.txt")));
    injector.send(RawEvent::change(RawKind::Removed, root.join("old.txt")));

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Removed);
    assert_eq!(event.path, root.join("old.txt"));
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn excluded_paths_never_reach_listeners() {
    let dir = TempDir::new().unwrap();
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let _handle = service.watch(dir.path(), ChangeKinds::all()).await.unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    injector.send(RawEvent::change(RawKind::Modified, root.join(".git/index")));
    injector.send(RawEvent::change(RawKind::Modified, root.join("notes.md.swp")));

    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn vanished_target_is_released() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "y.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let handle = service.watch(&file, ChangeKinds::all()).await.unwrap();
    std::fs::remove_file(&file).unwrap();
    injector.send(RawEvent::change(RawKind::Removed, &file));

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Removed);
    assert!(!service.is_active(&handle).await);
    assert!(injector.watched_paths().is_empty());

    let err = assert_err!(service.unwatch(&handle).await);
    assert!(matches!(err, WatcherError::AlreadyReleased(id) if id == handle.id()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn vanished_target_is_reported_whatever_kinds_were_asked() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "z.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    std::fs::remove_file(&file).unwrap();
    injector.send(RawEvent::change(RawKind::Removed, &file));

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Removed);
    assert_eq!(event.path, file);
    assert!(!service.is_active(&handle).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn replaced_target_is_watched_again() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "saved.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let handle = service.watch(&file, ChangeKind::Modified).await.unwrap();
    // The old file went away but a new one already sits at the path.
    std::fs::write(&file, "replacement").unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &file));
    injector.send(RawEvent::change(RawKind::Removed, &file));

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Modified);
    assert_eq!(event.path, file);
    assert!(service.is_active(&handle).await);
    assert_eq!(injector.watched_paths(), vec![file.clone()]);

    injector.send(RawEvent::change(RawKind::Modified, &file));
    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Modified);
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn backend_error_on_missing_path_reports_removal() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "gone.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let handle = service.watch(&file, ChangeKinds::all()).await.unwrap();
    std::fs::remove_file(&file).unwrap();
    injector.send(RawEvent::Error {
        message: "watch lost".to_string(),
        paths: vec![file.clone()],
    });

    let event = next_event(&mut rx).await;
    assert_eq!(event.kind, ChangeKind::Removed);
    assert!(!service.is_active(&handle).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stop_all_discards_pending_events() {
    let dir = TempDir::new().unwrap();
    let file = file_in(&dir, "late.txt");
    let (service, injector) = running_service().await;
    let mut rx = collect(&service);

    let _handle = service.watch(&file, ChangeKinds::all()).await.unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &file));
    // Let the pump pick the notification up, but not flush it.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let report = assert_ok!(service.stop_all().await);
    assert_eq!(report.released_handles, 1);
    assert_eq!(report.discarded_events, 1);
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_discards_events_queued_behind_a_listener() {
    let dir = TempDir::new().unwrap();
    let a = file_in(&dir, "a.txt");
    let b = file_in(&dir, "b.txt");

    let factory = ManualBackendFactory::new();
    let injector = factory.injector();
    let config = WatcherConfig::new()
        .with_debounce(Duration::from_millis(50))
        .with_listener_timeout(Duration::from_secs(5));
    let service = WatcherService::with_backend(config, factory).unwrap();
    service.start().await.unwrap();

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate = Mutex::new(gate_rx);
    let _blocking = service.on_change(move |event| {
        entered_tx.send(event.path.clone())?;
        let _ = gate.lock().unwrap().recv();
        Ok(())
    });

    let _a = service.watch(&a, ChangeKinds::all()).await.unwrap();
    let _b = service.watch(&b, ChangeKinds::all()).await.unwrap();
    injector.send(RawEvent::change(RawKind::Modified, &a));
    let entered = timeout(Duration::from_secs(5), entered_rx.recv()).await.unwrap();
    assert_eq!(entered, Some(a.clone()));

    // Past its window, so `b` waits behind the blocked call.
    injector.send(RawEvent::change(RawKind::Modified, &b));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(service.stats().await.pending_events, 0);

    let stopping = tokio::spawn({
        let service = service.clone();
        async move { service.stop_all().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished(), "stop_all returned while a call was running");
    gate_tx.send(()).unwrap();

    let report = timeout(Duration::from_secs(5), stopping)
        .await
        .expect("stop_all did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(report.discarded_events, 1);

    service.start().await.unwrap();
    let late = timeout(Duration::from_millis(500), entered_rx.recv()).await;
    assert!(late.is_err(), "discarded event was delivered: {late:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn handles_track_watch_minus_unwatch() {
    let dir = TempDir::new().unwrap();
    let files: Vec<PathBuf> = (0..6).map(|i| file_in(&dir, &format!("f{i}.txt"))).collect();
    let (service, injector) = running_service().await;

    let mut handles = Vec::new();
    for file in &files {
        handles.push(service.watch(file, ChangeKinds::all()).await.unwrap());
    }
    // Second handle on a path that is already watched.
    handles.push(service.watch(&files[0], ChangeKind::Modified).await.unwrap());

    for handle in handles.iter().step_by(2) {
        service.unwatch(handle).await.unwrap();
    }

    let expected: Vec<_> = handles.iter().skip(1).step_by(2).map(|h| h.id()).collect();
    assert_eq!(service.active_handles().await, expected);

    let mut watched: Vec<PathBuf> = handles
        .iter()
        .skip(1)
        .step_by(2)
        .map(|h| h.path().to_path_buf())
        .collect();
    watched.sort();
    assert_eq!(injector.watched_paths(), watched);
}
