use futures_util::future::join_all;
use mediacache::disk_guard::MB;
use mediacache::{
    AssetConfig, Cache, CacheError, CacheSettings, CancellationToken, StaticSpaceProbe,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type TestCache = Cache<AssetConfig>;

const PLENTY: u64 = 1024 * 1024 * MB;

async fn create_test_cache(max_items: usize, free: u64) -> (TempDir, TestCache) {
    let temp_dir = tempfile::tempdir().unwrap();
    let settings = CacheSettings::new(temp_dir.path(), max_items);
    let cache = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(free)))
        .await
        .unwrap();
    (temp_dir, cache)
}

async fn serve(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .expect(1)
        .mount(server)
        .await;
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

async fn wait_idle(cache: &TestCache) {
    for _ in 0..100 {
        if cache.stats().await.in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("downloads still in flight");
}

#[tokio::test]
async fn test_concurrent_requests_share_one_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"video-bytes".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());

    let results = join_all((0..5).map(|_| cache.ensure_cached("42", &url, "clip.mp4"))).await;

    let expected = temp_dir.path().join("media-42.mp4");
    for result in results {
        assert_eq!(result.unwrap(), expected);
    }
    assert_eq!(std::fs::read(&expected).unwrap(), b"video-bytes");
    assert_eq!(cache.stats().await.item_count, 1);
    assert_eq!(cache.stats().await.in_flight, 0);
}

#[tokio::test]
async fn test_cached_id_is_served_without_network() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", b"once").await;

    let (_temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());

    let first = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap();
    let second = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_failure_is_shared_by_every_caller() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/broken.mp4", server.uri());

    let results = join_all((0..3).map(|_| cache.ensure_cached("9", &url, "broken.mp4"))).await;
    for result in results {
        assert_eq!(result, Err(CacheError::Http { status: 500 }));
    }
    assert!(files_in(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_existing_file_gets_collision_suffix() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", b"new").await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    // Fichier présent sur disque mais inconnu de l'index
    std::fs::write(temp_dir.path().join("media-42.mp4"), b"old").unwrap();

    let url = format!("{}/clip.mp4", server.uri());
    let path = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap();

    assert_eq!(path, temp_dir.path().join("media-42 (1).mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), b"new");
    assert_eq!(
        std::fs::read(temp_dir.path().join("media-42.mp4")).unwrap(),
        b"old"
    );
}

#[tokio::test]
async fn test_disk_full_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, 100 * MB).await;
    let url = format!("{}/clip.mp4", server.uri());

    let err = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap_err();
    assert_eq!(
        err,
        CacheError::DiskFull {
            available: 100 * MB,
            required: 600 * MB,
        }
    );
    assert_eq!(err.code(), "DISK_FULL");
    assert!(files_in(temp_dir.path()).is_empty());
    assert_eq!(cache.stats().await.in_flight, 0);
}

#[tokio::test]
async fn test_announced_size_is_checked_before_writing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1000]))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let mut settings = CacheSettings::new(temp_dir.path(), 10);
    settings.estimated_size = 10;
    settings.safety_buffer = 0;
    settings.low_space_threshold = 0;
    // L'estimation passe, la taille annoncée par Content-Length non
    let cache = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(100)))
        .await
        .unwrap();
    let url = format!("{}/big.mp4", server.uri());

    let err = cache.ensure_cached("big", &url, "big.mp4").await.unwrap_err();
    assert_eq!(
        err,
        CacheError::DiskFull {
            available: 100,
            required: 1000,
        }
    );
    assert!(files_in(temp_dir.path()).is_empty());
    assert!(!cache.contains("big"));
}

#[tokio::test]
async fn test_ids_unusable_as_file_names_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());

    for id in ["a/b", "x\\..\\..\\evil", "../evil", "7 (1)", "a\tb", ""] {
        let err = cache.ensure_cached(id, &url, "clip.mp4").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ID", "{id:?}");
    }
    assert!(files_in(temp_dir.path()).is_empty());
    assert!(cache.entries().is_empty());
}

#[tokio::test]
async fn test_cached_id_survives_reopen() {
    let server = MockServer::start().await;
    serve(&server, "/clip.mp4", b"data").await;

    let temp_dir = tempfile::tempdir().unwrap();
    let url = format!("{}/clip.mp4", server.uri());
    let path = {
        let settings = CacheSettings::new(temp_dir.path(), 10);
        let cache = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(PLENTY)))
            .await
            .unwrap();
        cache.ensure_cached("7 (beta)", &url, "clip.mp4").await.unwrap()
    };

    let settings = CacheSettings::new(temp_dir.path(), 10);
    let reopened = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(PLENTY)))
        .await
        .unwrap();
    assert_eq!(reopened.get("7 (beta)").await, Some(path));
}

#[tokio::test]
async fn test_redirect_chain_is_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/b"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("Location", format!("{}/c", server.uri())),
        )
        .expect(1)
        .mount(&server)
        .await;
    serve(&server, "/c", b"final").await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let path = cache
        .ensure_cached("r", &format!("{}/a", server.uri()), "clip.mov")
        .await
        .unwrap();

    assert_eq!(path, temp_dir.path().join("media-r.mov"));
    assert_eq!(std::fs::read(&path).unwrap(), b"final");
}

#[tokio::test]
async fn test_redirect_loop_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let err = cache
        .ensure_cached("l", &format!("{}/loop", server.uri()), "clip.mp4")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TOO_MANY_REDIRECTS");
    assert!(files_in(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_http_404_leaves_no_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let err = cache
        .ensure_cached("m", &format!("{}/missing.mp4", server.uri()), "missing.mp4")
        .await
        .unwrap_err();

    assert_eq!(err, CacheError::Http { status: 404 });
    assert!(err.is_user_facing());
    assert!(files_in(temp_dir.path()).is_empty());
    assert!(!cache.contains("m"));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    let mut settings = CacheSettings::new(temp_dir.path(), 10);
    settings.timeout = Duration::from_secs(1);
    let cache = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(PLENTY)))
        .await
        .unwrap();

    let err = cache
        .ensure_cached("t", &format!("{}/slow.mp4", server.uri()), "slow.mp4")
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Timeout { secs: 1 });
    assert!(files_in(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_detaches_only_the_cancelling_caller() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"shared".to_vec())
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());
    let token = CancellationToken::new();

    let cancelling = cache.ensure_cached_with_cancel("c", &url, "clip.mp4", Some(&token));
    let patient = cache.ensure_cached("c", &url, "clip.mp4");
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };

    let (cancelled, kept, ()) = tokio::join!(cancelling, patient, trigger);
    assert_eq!(cancelled, Err(CacheError::Cancelled));
    assert_eq!(kept.unwrap(), temp_dir.path().join("media-c.mp4"));
}

#[tokio::test]
async fn test_cancel_of_sole_caller_aborts_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"never".to_vec())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let (temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());
    let token = CancellationToken::new();

    let request = cache.ensure_cached_with_cancel("c", &url, "clip.mp4", Some(&token));
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(request, trigger);

    assert_eq!(result, Err(CacheError::Cancelled));
    wait_idle(&cache).await;
    assert!(files_in(temp_dir.path()).is_empty());
    assert!(!cache.contains("c"));
}

#[tokio::test]
async fn test_cancel_by_id_rejects_every_caller() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"never".to_vec())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let (_temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());

    let first = cache.ensure_cached("c", &url, "clip.mp4");
    let second = cache.ensure_cached("c", &url, "clip.mp4");
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.progress("c").await.is_some());
        assert!(cache.cancel("c").await);
    };
    let (first, second, ()) = tokio::join!(first, second, trigger);

    assert_eq!(first, Err(CacheError::Cancelled));
    assert_eq!(second, Err(CacheError::Cancelled));
    assert!(!cache.cancel("c").await);
}

#[tokio::test]
async fn test_lru_eviction_after_insert() {
    let server = MockServer::start().await;
    for name in ["a", "b", "c", "d"] {
        serve(&server, &format!("/{name}.jpg"), name.as_bytes()).await;
    }

    let (temp_dir, cache) = create_test_cache(3, PLENTY).await;
    for name in ["a", "b", "c", "d"] {
        let url = format!("{}/{name}.jpg", server.uri());
        cache.ensure_cached(name, &url, "").await.unwrap();
    }

    let mut ids: Vec<String> = cache.entries().into_iter().map(|e| e.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["b", "c", "d"]);
    assert_eq!(
        files_in(temp_dir.path()),
        vec!["media-b.jpg", "media-c.jpg", "media-d.jpg"]
    );
}

#[tokio::test]
async fn test_hydrated_entry_needs_no_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::write(temp_dir.path().join("media-7.mp4"), b"cached").unwrap();

    let settings = CacheSettings::new(temp_dir.path(), 10);
    let cache = TestCache::open_with_probe(settings, Arc::new(StaticSpaceProbe::available(PLENTY)))
        .await
        .unwrap();

    let path = cache
        .ensure_cached("7", &format!("{}/7.mp4", server.uri()), "clip.mp4")
        .await
        .unwrap();
    assert_eq!(path, temp_dir.path().join("media-7.mp4"));
}

#[tokio::test]
async fn test_deleted_file_is_pruned_then_downloaded_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(2)
        .mount(&server)
        .await;

    let (_temp_dir, cache) = create_test_cache(10, PLENTY).await;
    let url = format!("{}/clip.mp4", server.uri());

    let path = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(cache.get("42").await, None);
    assert!(!cache.contains("42"));

    let again = cache.ensure_cached("42", &url, "clip.mp4").await.unwrap();
    assert_eq!(again, path);
    assert!(again.exists());
}
