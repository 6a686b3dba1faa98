mod common;

use common::{ServeOptions, TestServer, registry, test_body, test_config, until_terminal};
use segdl_engine::{DownloadEvent, DownloadRequest, SessionStatus};
use tempfile::TempDir;

#[tokio::test]
async fn four_connections_merge_in_order() {
    let body = test_body(1000);
    let server = TestServer::start(body.clone(), ServeOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("out.bin");

    let registry = registry(test_config());
    let mut events = registry.subscribe();
    let id = registry
        .add_download(DownloadRequest::new(server.url(), &target).with_connections(4))
        .await
        .unwrap();

    let seen = until_terminal(&mut events, &id).await;
    assert!(matches!(seen.first(), Some(DownloadEvent::Started { segments: 4, .. })));
    assert!(matches!(seen.last(), Some(DownloadEvent::Completed { .. })));

    assert_eq!(std::fs::read(&target).unwrap(), body);
    let mut ranges = server.ranges();
    ranges.sort();
    assert_eq!(
        ranges,
        vec!["bytes=0-249", "bytes=250-499", "bytes=500-749", "bytes=750-999"]
    );

    let snapshot = registry.get(&id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.downloaded, 1000);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(snapshot.file_name, "out.bin");
    assert!(snapshot.finished_at.is_some());

    // Only the merged file remains.
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn merged_file_matches_body_for_any_connection_count() {
    let body = test_body(64 * 1024 + 7);
    let options = ServeOptions {
        chunk_size: 1500,
        ..ServeOptions::default()
    };
    let server = TestServer::start(body.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let registry = registry(test_config());

    for connections in [1, 3, 7, 16] {
        let target = dir.path().join(format!("out_{connections}.bin"));
        let mut events = registry.subscribe();
        let id = registry
            .add_download(DownloadRequest::new(server.url(), &target).with_connections(connections))
            .await
            .unwrap();
        until_terminal(&mut events, &id).await;

        assert_eq!(
            std::fs::read(&target).unwrap(),
            body,
            "{connections} connections"
        );
        assert_eq!(registry.get(&id).unwrap().segments, connections);
    }
}

#[tokio::test]
async fn session_total_is_sum_of_progress_increments() {
    let body = test_body(20_000);
    let server = TestServer::start(body.clone(), ServeOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let registry = registry(test_config());
    let mut events = registry.subscribe();

    let id = registry
        .add_download(DownloadRequest::new(server.url(), dir.path().join("f")).with_connections(5))
        .await
        .unwrap();
    let seen = until_terminal(&mut events, &id).await;

    let totals: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress { progress, .. } => Some(progress.downloaded),
            _ => None,
        })
        .collect();
    assert!(!totals.is_empty());
    assert!(totals.windows(2).all(|w| w[0] <= w[1]), "totals never go back");
    assert_eq!(*totals.last().unwrap(), 20_000);
}

#[tokio::test]
async fn server_without_ranges_gets_a_single_stream() {
    let body = test_body(5000);
    let server = TestServer::start(body.clone(), ServeOptions::without_ranges()).await;
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("single.bin");
    let registry = registry(test_config());
    let mut events = registry.subscribe();

    let id = registry
        .add_download(DownloadRequest::new(server.url(), &target).with_connections(8))
        .await
        .unwrap();
    let seen = until_terminal(&mut events, &id).await;

    assert!(matches!(seen.first(), Some(DownloadEvent::Started { segments: 1, .. })));
    assert!(matches!(seen.last(), Some(DownloadEvent::Completed { .. })));
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert!(server.ranges().is_empty(), "no Range header in single-stream mode");
    assert_eq!(server.gets(), 1);

    let snapshot = registry.get(&id).unwrap();
    assert!(!snapshot.supports_ranges);
    assert_eq!(snapshot.segments, 1);
}

#[tokio::test]
async fn ignored_range_fails_the_segment() {
    let server = TestServer::start(
        test_body(1000),
        ServeOptions {
            honour_ranges: false,
            ..ServeOptions::default()
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("f.bin");
    let registry = registry(test_config());
    let mut events = registry.subscribe();

    let id = registry
        .add_download(DownloadRequest::new(server.url(), &target).with_connections(2))
        .await
        .unwrap();
    let seen = until_terminal(&mut events, &id).await;

    match seen.last() {
        Some(DownloadEvent::Error { message, segment, .. }) => {
            assert!(message.contains("Range"), "{message}");
            assert!(segment.is_some());
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(!target.exists());
    assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Error);
}

#[tokio::test]
async fn large_connection_counts_are_taken_as_given() {
    let body = test_body(1000);
    let server = TestServer::start(body.clone(), ServeOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("f");
    let registry = registry(test_config());
    let mut events = registry.subscribe();

    let id = registry
        .add_download(DownloadRequest::new(server.url(), &target).with_connections(40))
        .await
        .unwrap();
    let seen = until_terminal(&mut events, &id).await;
    assert!(matches!(seen.last(), Some(DownloadEvent::Completed { .. })));

    let snapshot = registry.get(&id).unwrap();
    assert_eq!(snapshot.connections, 40);
    assert_eq!(snapshot.segments, 40);
    assert_eq!(std::fs::read(&target).unwrap(), body);
}

#[tokio::test]
async fn requests_above_the_limit_are_clamped() {
    let body = test_body(4096);
    let server = TestServer::start(body.clone(), ServeOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.max_connections = Some(3);
    let registry = registry(config);
    let mut events = registry.subscribe();

    let id = registry
        .add_download(DownloadRequest::new(server.url(), dir.path().join("f")).with_connections(50))
        .await
        .unwrap();
    until_terminal(&mut events, &id).await;

    let snapshot = registry.get(&id).unwrap();
    assert_eq!(snapshot.connections, 3);
    assert_eq!(snapshot.segments, 3);
}

#[tokio::test]
async fn sessions_for_the_same_url_are_independent() {
    let body = test_body(3000);
    let server = TestServer::start(body.clone(), ServeOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let registry = registry(test_config());
    let mut events = registry.subscribe();

    let a = registry
        .add_download(DownloadRequest::new(server.url(), dir.path().join("a")))
        .await
        .unwrap();
    let b = registry
        .add_download(DownloadRequest::new(server.url(), dir.path().join("b")))
        .await
        .unwrap();
    assert_ne!(a, b);

    until_terminal(&mut events, &a).await;
    let mut events = registry.subscribe();
    if registry.get(&b).unwrap().status != SessionStatus::Completed {
        until_terminal(&mut events, &b).await;
    }

    let listed: Vec<_> = registry.list_sessions().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![a, b]);
    assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), body);
    assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), body);
}
