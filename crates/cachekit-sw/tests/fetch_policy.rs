//! Cache-first fetch handling: hits, misses, revalidation and offline fallback.

mod support;

use std::time::Duration;

use cachekit_net::{Request, RequestMode};
use cachekit_sw::{
    CacheController, FetchEvent, ResponseSource, ServiceWorkerEvent, ServiceWorkerRegistration,
};
use http::Method;
use support::*;
use tokio::sync::mpsc;

const CACHE: &str = "test-cache-v1";

#[tokio::test]
async fn cache_hit_does_not_wait_for_network() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, mut rx) = active_controller(fetcher.clone(), caches.clone()).await;

    let release = fetcher.gate("/style.css", 200, "fresh css");
    let request = Request::get(url("/style.css"));

    let response = tokio::time::timeout(Duration::from_secs(1), controller.handle(&request))
        .await
        .expect("cache hit must not wait on the network")
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text(), body_for("/style.css", "v1"));

    // The refresh is still parked on the gate, so the cache is unchanged.
    assert_eq!(
        cached_body(&caches, CACHE, "/style.css").await,
        Some(body_for("/style.css", "v1").into_bytes())
    );

    release.notify_one();
    assert_eq!(
        next_revalidation(&mut rx).await,
        ServiceWorkerEvent::Revalidated {
            url: url("/style.css").to_string()
        }
    );
    assert_eq!(
        cached_body(&caches, CACHE, "/style.css").await,
        Some(b"fresh css".to_vec())
    );

    let again = controller.handle(&request).await.unwrap();
    assert_eq!(again.source, ResponseSource::Cache);
    assert_eq!(again.text(), "fresh css");
}

#[tokio::test]
async fn failed_revalidation_keeps_cached_entry() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, mut rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.fail("/index.html");
    let response = controller
        .handle(&Request::get(url("/index.html")))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), body_for("/index.html", "v1"));

    assert!(matches!(
        next_revalidation(&mut rx).await,
        ServiceWorkerEvent::RevalidationFailed { .. }
    ));
    assert_eq!(
        cached_body(&caches, CACHE, "/index.html").await,
        Some(body_for("/index.html", "v1").into_bytes())
    );
}

#[tokio::test]
async fn non_ok_revalidation_replaces_entry() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, mut rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.serve("/style.css", 404, "gone");
    let stale = controller.handle(&Request::get(url("/style.css"))).await.unwrap();
    assert_eq!(stale.status, 200);
    assert_eq!(stale.text(), body_for("/style.css", "v1"));

    assert_eq!(
        next_revalidation(&mut rx).await,
        ServiceWorkerEvent::Revalidated {
            url: url("/style.css").to_string()
        }
    );
    assert_eq!(cached_body(&caches, CACHE, "/style.css").await, Some(b"gone".to_vec()));

    let next = controller.handle(&Request::get(url("/style.css"))).await.unwrap();
    assert_eq!(next.status, 404);
    assert_eq!(next.source, ResponseSource::Cache);
}

#[tokio::test]
async fn revalidation_after_sweep_does_not_recreate_old_cache() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (v1, mut rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.serve("/images/avatar.png", 200, "old png");
    v1.handle(&Request::get(url("/images/avatar.png"))).await.unwrap();

    let release = fetcher.gate("/images/avatar.png", 200, "new png");
    let hit = v1.handle(&Request::get(url("/images/avatar.png"))).await.unwrap();
    assert_eq!(hit.source, ResponseSource::Cache);
    wait_for_calls(&fetcher, "/images/avatar.png", 2).await;

    fetcher.serve_manifest("v2");
    let (v2, _v2_rx) = CacheController::new(config("v2"), caches.clone(), fetcher.clone()).unwrap();
    v2.on_install().await.unwrap();
    v2.on_activate().await.unwrap();
    assert_eq!(caches.read().await.keys(), vec!["test-cache-v2"]);

    release.notify_one();
    match next_revalidation(&mut rx).await {
        ServiceWorkerEvent::RevalidationFailed { reason, .. } => {
            assert!(reason.contains("test-cache-v1"))
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(caches.read().await.keys(), vec!["test-cache-v2"]);
    assert!(cached_body(&caches, "test-cache-v2", "/images/avatar.png").await.is_none());
}

#[tokio::test]
async fn overlapping_revalidations_keep_last_completed() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, mut rx) = active_controller(fetcher.clone(), caches.clone()).await;
    let request = Request::get(url("/index.html"));
    let calls_before = fetcher.calls_to("/index.html");

    let first = fetcher.gate("/index.html", 200, "first refresh");
    controller.handle(&request).await.unwrap();
    wait_for_calls(&fetcher, "/index.html", calls_before + 1).await;

    let second = fetcher.gate("/index.html", 200, "second refresh");
    controller.handle(&request).await.unwrap();
    wait_for_calls(&fetcher, "/index.html", calls_before + 2).await;

    second.notify_one();
    assert!(matches!(
        next_revalidation(&mut rx).await,
        ServiceWorkerEvent::Revalidated { .. }
    ));
    assert_eq!(
        cached_body(&caches, CACHE, "/index.html").await,
        Some(b"second refresh".to_vec())
    );

    first.notify_one();
    assert!(matches!(
        next_revalidation(&mut rx).await,
        ServiceWorkerEvent::Revalidated { .. }
    ));
    assert_eq!(
        cached_body(&caches, CACHE, "/index.html").await,
        Some(b"first refresh".to_vec())
    );
}

#[tokio::test]
async fn miss_fetches_and_stores_ok_response() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.serve("/images/avatar.png", 200, "png bytes");
    let request = Request::get(url("/images/avatar.png"));

    let first = controller.handle(&request).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(first.text(), "png bytes");
    assert_eq!(
        cached_body(&caches, CACHE, "/images/avatar.png").await,
        Some(b"png bytes".to_vec())
    );

    let second = controller.handle(&request).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.text(), "png bytes");
}

#[tokio::test]
async fn miss_passes_through_non_ok_without_caching() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    let response = controller
        .handle(&Request::get(url("/missing.html")))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "Not Found");
    assert_eq!(response.source, ResponseSource::Network);
    assert!(cached_body(&caches, CACHE, "/missing.html").await.is_none());

    fetcher.serve("/created", 201, "created");
    let created = controller.handle(&Request::get(url("/created"))).await.unwrap();
    assert_eq!(created.status, 201);
    assert!(cached_body(&caches, CACHE, "/created").await.is_none());
}

#[tokio::test]
async fn offline_navigation_gets_offline_page() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.fail("/projects.html");
    let response = controller
        .handle(&Request::navigate(url("/projects.html")))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.text(), body_for("/offline.html", "v1"));
    assert!(cached_body(&caches, CACHE, "/projects.html").await.is_none());
}

#[tokio::test]
async fn offline_navigation_without_offline_page_gets_plain_text() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    caches
        .write()
        .await
        .get_mut(CACHE)
        .unwrap()
        .delete(&Method::GET, &url("/offline.html"));
    fetcher.fail("/projects.html");

    let response = controller
        .handle(&Request::navigate(url("/projects.html")))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "Offline");
    assert_eq!(response.source, ResponseSource::Fallback);
}

#[tokio::test]
async fn offline_subresource_gets_503() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.fail("/images/photo.jpg");
    let response = controller
        .handle(&Request::get(url("/images/photo.jpg")))
        .await
        .unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(response.text(), "Network error");
    assert_eq!(response.source, ResponseSource::Fallback);
    assert!(cached_body(&caches, CACHE, "/images/photo.jpg").await.is_none());
}

#[tokio::test]
async fn non_get_and_cross_origin_are_not_intercepted() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;
    let calls_after_install = fetcher.total_calls();
    let entries_after_install = caches.read().await.get(CACHE).unwrap().len();

    let post = Request::get(url("/api/tasks")).with_method(Method::POST);
    assert!(controller.handle(&post).await.is_none());

    // Cached path, but a different method never matches the GET entry.
    let head = Request::get(url("/style.css")).with_method(Method::HEAD);
    assert!(controller.handle(&head).await.is_none());

    let cross = Request::get(url::Url::parse("https://cdn.example.net/style.css").unwrap())
        .with_mode(RequestMode::NoCors);
    assert!(controller.handle(&cross).await.is_none());

    let other_port = Request::get(url::Url::parse("https://example.com:8443/style.css").unwrap());
    assert!(controller.handle(&other_port).await.is_none());

    assert_eq!(fetcher.total_calls(), calls_after_install);
    assert_eq!(
        caches.read().await.get(CACHE).unwrap().len(),
        entries_after_install
    );
}

#[tokio::test]
async fn fetch_before_activation_is_passed_through() {
    let fetcher = ScriptedFetcher::new();
    fetcher.serve_manifest("v1");
    let (controller, _rx) = CacheController::new(config("v1"), shared_storage(), fetcher.clone()).unwrap();

    let event = FetchEvent::new(Request::get(url("/style.css")));
    assert!(controller.on_fetch(&event).await.is_none());

    controller.on_install().await.unwrap();
    assert!(controller.on_fetch(&event).await.is_none());

    controller.on_activate().await.unwrap();
    assert!(controller.on_fetch(&event).await.is_some());
}

#[tokio::test]
async fn registration_without_active_worker_passes_through() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let registration = ServiceWorkerRegistration::new(url("/"), tx);
    let event = FetchEvent::from_client(Request::navigate(url("/")), "tab-1");
    assert!(registration.dispatch_fetch(&event).await.is_none());
}

#[tokio::test]
async fn concurrent_misses_are_not_coalesced() {
    let fetcher = ScriptedFetcher::new();
    let caches = shared_storage();
    let (controller, _rx) = active_controller(fetcher.clone(), caches.clone()).await;

    fetcher.serve("/scripts/extra.js", 200, "console.log(1)");
    let a = Request::get(url("/scripts/extra.js"));
    let b = Request::get(url("/scripts/extra.js"));
    let (ra, rb) = tokio::join!(controller.handle(&a), controller.handle(&b));

    assert_eq!(ra.unwrap().status, 200);
    assert_eq!(rb.unwrap().status, 200);
    assert_eq!(fetcher.calls_to("/scripts/extra.js"), 2);
    assert_eq!(caches.read().await.get(CACHE).unwrap().len(), MANIFEST.len() + 1);
}
