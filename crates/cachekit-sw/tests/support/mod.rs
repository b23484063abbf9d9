//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cachekit_net::{Fetcher, NetError, Request, Response};
use cachekit_sw::{CacheController, CacheStorage, ServiceWorkerEvent, WorkerConfig};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::{mpsc, Notify, RwLock};

pub const ORIGIN: &str = "https://example.com";

pub const MANIFEST: [&str; 4] = ["/", "/index.html", "/offline.html", "/style.css"];

#[derive(Clone)]
enum Route {
    Respond(u16, String),
    Fail,
    Gated(Arc<Notify>, u16, String),
}

/// In-memory network keyed by URL path. Unknown paths answer 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, status: u16, body: &str) {
        self.set(path, Route::Respond(status, body.to_string()));
    }

    pub fn fail(&self, path: &str) {
        self.set(path, Route::Fail);
    }

    /// Answer only after the returned `Notify` is signalled.
    pub fn gate(&self, path: &str, status: u16, body: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.set(path, Route::Gated(Arc::clone(&notify), status, body.to_string()));
        notify
    }

    /// Serve every manifest entry with a body naming its version.
    pub fn serve_manifest(&self, version: &str) {
        for path in MANIFEST {
            self.serve(path, 200, &body_for(path, version));
        }
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn set(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        self.calls.lock().unwrap().push(path.clone());
        let route = self.routes.lock().unwrap().get(&path).cloned();
        // Suspend like a real network call would.
        tokio::task::yield_now().await;

        let (status, body) = match route {
            Some(Route::Respond(status, body)) => (status, body),
            Some(Route::Fail) => {
                return Err(NetError::RequestFailed(format!("{} unreachable", path)))
            }
            Some(Route::Gated(notify, status, body)) => {
                notify.notified().await;
                (status, body)
            }
            None => (404, "Not Found".to_string()),
        };

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        Ok(Response::new(
            request.url.clone(),
            StatusCode::from_u16(status).unwrap(),
            headers,
            Bytes::from(body),
        ))
    }
}

pub fn body_for(path: &str, version: &str) -> String {
    format!("{} @ {}", path, version)
}

pub fn config(version: &str) -> WorkerConfig {
    WorkerConfig {
        app_prefix: "test".to_string(),
        version: version.to_string(),
        origin: ORIGIN.to_string(),
        offline_path: "/offline.html".to_string(),
        manifest: MANIFEST.iter().map(|p| p.to_string()).collect(),
        skip_waiting_on_install: true,
    }
}

pub fn url(path: &str) -> url::Url {
    url::Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn shared_storage() -> Arc<RwLock<CacheStorage>> {
    Arc::new(RwLock::new(CacheStorage::new()))
}

/// A controller that has run install and activate.
pub async fn active_controller(
    fetcher: Arc<ScriptedFetcher>,
    caches: Arc<RwLock<CacheStorage>>,
) -> (CacheController, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    fetcher.serve_manifest("v1");
    let (controller, rx) = CacheController::new(config("v1"), caches, fetcher).unwrap();
    controller.on_install().await.unwrap();
    controller.on_activate().await.unwrap();
    (controller, rx)
}

/// Next revalidation outcome, skipping lifecycle events.
pub async fn next_revalidation(
    rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>,
) -> ServiceWorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event @ ServiceWorkerEvent::Revalidated { .. })
                | Some(event @ ServiceWorkerEvent::RevalidationFailed { .. }) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no revalidation event within 5s")
}

/// Wait until `path` has been requested at least `count` times.
pub async fn wait_for_calls(fetcher: &ScriptedFetcher, path: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fetcher.calls_to(path) < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("fetch was never issued");
}

pub async fn cached_body(caches: &Arc<RwLock<CacheStorage>>, name: &str, path: &str) -> Option<Vec<u8>> {
    caches
        .read()
        .await
        .get(name)
        .and_then(|c| c.match_url(&http::Method::GET, &url(path)))
        .map(|e| e.body.clone())
}
