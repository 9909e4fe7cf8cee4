//! End-to-end runs of real services on both engine backends

use async_trait::async_trait;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use service_runtime::cache::ResponseCache;
use service_runtime::plugin::checksum;
use service_runtime::plugin::engine::{Binding, Engine, EngineError, EngineFactory, EngineRegistry};
use service_runtime::plugin::validator::COOKIE_REQUIRED_MESSAGE;
use service_runtime::plugin::{
    validate_structure, Capability, CodeLoader, ConfigKind, FetchError, FetchOutcome, LoadError, LoaderOptions,
    NoopUpdater, PageCursor, PageKey, RunError, RunStage, ServiceConfig, ServiceManifest, ServiceRunner,
    ValidationResult,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const FEED: &str = r#"
const POSTS = [1, 2, 3, 4, 5].map((n) => ({
    id: `post-${n}`,
    title: `Post ${n}`,
    author: { id: "alice", name: "Alice" },
    tags: n % 2 === 0 ? ["even"] : [],
    commentCount: n,
}));
const PAGE_SIZE = 2;

class DemoFeed extends PostFeature {
    getLatest(key) {
        const page = key ?? 0;
        const start = page * PAGE_SIZE;
        return {
            items: POSTS.slice(start, start + PAGE_SIZE),
            nextKey: start + PAGE_SIZE < POSTS.length ? page + 1 : null,
        };
    }

    getPost(id) {
        const post = POSTS.find((p) => p.id === id);
        if (!post) {
            const error = new Error(`no post ${id}`);
            error.name = "NotFound";
            throw error;
        }
        return post;
    }

    async getComments(postId, key) {
        return {
            items: [{ id: `${postId}-c1`, content: "first!", parentId: null }],
            nextKey: null,
        };
    }
}

class DemoUsers extends UserFeature {
    getUser(id) {
        return { id, name: id === "alice" ? "Alice" : id, url: `https://demo.test/u/${id}` };
    }
}

registerFeature(DemoFeed);
registerFeature(DemoUsers);
"#;

struct Fixture {
    dir: TempDir,
    loader: Arc<CodeLoader>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_cache(None)
    }

    fn with_cache(cache: Option<ResponseCache>) -> Self {
        let dir = TempDir::new().unwrap();
        let loader = CodeLoader::new(
            LoaderOptions {
                assets_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            cache,
        )
        .unwrap();
        Self {
            dir,
            loader: Arc::new(loader),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> String {
        std::fs::write(self.dir.path().join(name), bytes).unwrap();
        format!("asset://{}", name)
    }

    fn runner(&self, engine: &str) -> ServiceRunner {
        ServiceRunner::new(self.loader.clone(), Arc::new(EngineRegistry::builtin())).with_engine(engine)
    }
}

fn manifest(id: &str, main: &str, script: &[u8]) -> ServiceManifest {
    serde_json::from_value(json!({
        "id": id,
        "version": "1.0.0",
        "name": id,
        "main": main,
        "mainChecksums": checksum::compute(script),
    }))
    .unwrap()
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn known_good_script_fetches_latest_posts() {
    for engine in ["v8", "boa"] {
        let fixture = Fixture::new();
        let main = fixture.write("feed.js", FEED.as_bytes());

        let outcome = fixture
            .runner(engine)
            .run(
                manifest("feed", &main, FEED.as_bytes()),
                Arc::new(NoopUpdater),
                Arc::new(NoopUpdater),
                |session| async move { session.fetch_latest(None).await },
            )
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Success { value, is_remote } => {
                assert!(is_remote, "{}", engine);
                assert_eq!(value.items.len(), 2, "{}", engine);
                assert_eq!(value.items[0].title.as_deref(), Some("Post 1"));
                assert_eq!(value.items[1].tags, vec!["even".to_string()]);
                assert_eq!(value.next_key, Some(PageKey::from(1i64)));
            }
            other => panic!("{}: unexpected outcome {:?}", engine, other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_script_is_rejected_before_running() {
    let fixture = Fixture::new();
    let mut corrupted = FEED.as_bytes().to_vec();
    *corrupted.last_mut().unwrap() ^= 0x01;
    let main = fixture.write("feed.js", &corrupted);
    let pinned = manifest("feed", &main, FEED.as_bytes());

    let err = fixture.loader.load(&pinned.main_checksums, &main).await.unwrap_err();
    assert!(matches!(err, LoadError::Integrity(_)));

    let ran = Arc::new(AtomicUsize::new(0));
    let body_ran = ran.clone();
    let err = fixture
        .runner("v8")
        .run(pinned, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async move {
            body_ran.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Integrity(_)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn required_empty_cookie_gets_cookie_message() {
    let configs = vec![
        ServiceConfig::new("instance", ConfigKind::Url).with_value("https://demo.test"),
        ServiceConfig::new("session", ConfigKind::Cookies).required(),
        ServiceConfig::new("limit", ConfigKind::Number).with_value("25"),
    ];

    assert_eq!(
        validate_structure(&configs),
        vec![
            ValidationResult::Pass,
            ValidationResult::fail(COOKIE_REQUIRED_MESSAGE),
            ValidationResult::Pass,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn paging_terminates_and_is_idempotent() {
    let fixture = Fixture::new();
    let main = fixture.write("feed.js", FEED.as_bytes());

    let (ids, pages, again) = fixture
        .runner("boa")
        .run(
            manifest("feed", &main, FEED.as_bytes()),
            Arc::new(NoopUpdater),
            Arc::new(NoopUpdater),
            |session| async move {
                let mut cursor = PageCursor::new();
                let mut ids = Vec::new();
                while let Some(key) = cursor.next_request() {
                    let page = session.fetch_latest(key).await.into_result().unwrap();
                    ids.extend(page.items.iter().map(|p| p.id.clone()));
                    cursor.advance(&page);
                    assert!(cursor.pages() <= 10, "pagination did not terminate");
                }

                let first = session.fetch_latest(Some(PageKey::from(1i64))).await;
                let second = session.fetch_latest(Some(PageKey::from(1i64))).await;
                (ids, cursor.pages(), first == second)
            },
        )
        .await
        .unwrap();

    assert_eq!(ids, vec!["post-1", "post-2", "post-3", "post-4", "post-5"]);
    assert_eq!(pages, 3);
    assert!(again);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrapper_operations_classify_results() {
    let fixture = Fixture::new();
    let main = fixture.write("feed.js", FEED.as_bytes());

    fixture
        .runner("v8")
        .run(
            manifest("feed", &main, FEED.as_bytes()),
            Arc::new(NoopUpdater),
            Arc::new(NoopUpdater),
            |session| async move {
                let post = session.fetch_post("post-3").await.into_result().unwrap();
                assert_eq!(post.comment_count, Some(3));
                assert_eq!(post.author.unwrap().name.as_deref(), Some("Alice"));

                let comments = session.fetch_comments("post-3", None).await.into_result().unwrap();
                assert_eq!(comments.items[0].id, "post-3-c1");
                assert!(!comments.has_more());

                let user = session.fetch_user("alice").await.into_result().unwrap();
                assert_eq!(user.url.as_deref(), Some("https://demo.test/u/alice"));

                match session.fetch_post("missing").await {
                    FetchOutcome::Failure {
                        error: FetchError::Plugin { name, message },
                    } => {
                        assert_eq!(name, "NotFound");
                        assert_eq!(message, "no post missing");
                    }
                    other => panic!("unexpected {:?}", other),
                }

                assert!(matches!(
                    session.search("rust", None).await,
                    FetchOutcome::Failure {
                        error: FetchError::Unsupported { .. }
                    }
                ));
                assert!(matches!(
                    session.fetch_user_by_url("https://demo.test/u/bob").await,
                    FetchOutcome::Failure {
                        error: FetchError::Unsupported { .. }
                    }
                ));
                assert!(!session.is_registered(&Capability::Validate));
                assert!(matches!(
                    session.validate_configs(&[]).await,
                    Err(FetchError::FeatureAbsent { .. })
                ));
            },
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_code_is_cached() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = serve(Router::new().route(
        "/feed.js",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                FEED
            }
        }),
    ))
    .await;

    let cache_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(cache_dir.path().to_path_buf(), 1024 * 1024, None).unwrap();
    let fixture = Fixture::with_cache(Some(cache));
    let main = format!("http://{}/feed.js", addr);

    for _ in 0..2 {
        let outcome = fixture
            .runner("v8")
            .run(
                manifest("remote", &main, FEED.as_bytes()),
                Arc::new(NoopUpdater),
                Arc::new(NoopUpdater),
                |session| async move { session.fetch_latest(None).await },
            )
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_remote_code_is_not_cached() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = serve(Router::new().route(
        "/feed.js",
        get(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut tampered = FEED.to_string();
                    tampered.pop();
                    tampered.push('!');
                    tampered
                } else {
                    FEED.to_string()
                }
            }
        }),
    ))
    .await;

    let cache_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(cache_dir.path().to_path_buf(), 1024 * 1024, None).unwrap();
    let fixture = Fixture::with_cache(Some(cache.clone()));
    let main = format!("http://{}/feed.js", addr);
    let expected = checksum::compute(FEED.as_bytes());

    let err = fixture.loader.load(&expected, &main).await.unwrap_err();
    assert!(matches!(err, LoadError::Integrity(_)));
    assert!(cache.get(&main).await.unwrap().is_none());

    let source = fixture.loader.load(&expected, &main).await.unwrap();
    assert_eq!(source, FEED);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&main).await.unwrap().as_deref(), Some(FEED.as_bytes()));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_cached_code_is_refetched() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = serve(Router::new().route(
        "/feed.js",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                FEED
            }
        }),
    ))
    .await;

    let cache_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(cache_dir.path().to_path_buf(), 1024 * 1024, None).unwrap();
    let main = format!("http://{}/feed.js", addr);
    cache.put(&main, b"registerFeature(OldFeed);").await.unwrap();

    let fixture = Fixture::with_cache(Some(cache.clone()));
    let source = fixture
        .loader
        .load(&checksum::compute(FEED.as_bytes()), &main)
        .await
        .unwrap();

    assert_eq!(source, FEED);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&main).await.unwrap().as_deref(), Some(FEED.as_bytes()));
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_http_reaches_host_client() {
    const SCRIPT: &str = r#"
class ApiFeed extends PostFeature {
    getLatest(key) {
        const data = host.http.json(`${config.baseUrl}/api/posts`);
        host.log.info("fetched", data.posts.length, "posts");
        return { items: data.posts, nextKey: null };
    }
}
registerFeature(ApiFeed);
"#;
    let addr = serve(Router::new().route(
        "/api/posts",
        get(|| async { Json(json!({ "posts": [{ "id": "remote-1", "title": "From the API" }] })) }),
    ))
    .await;

    let fixture = Fixture::new();
    let main = fixture.write("api.js", SCRIPT.as_bytes());
    let mut service = manifest("api", &main, SCRIPT.as_bytes());
    service.configs = Some(vec![
        ServiceConfig::new("baseUrl", ConfigKind::Url).with_value(format!("http://{}", addr))
    ]);

    for engine in ["v8", "boa"] {
        let page = fixture
            .runner(engine)
            .run(service.clone(), Arc::new(NoopUpdater), Arc::new(NoopUpdater), |session| async move {
                session.fetch_latest(None).await
            })
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(page.items[0].id, "remote-1", "{}", engine);
        assert_eq!(page.next_key, None);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_guest_call_times_out() {
    const SCRIPT: &str = r#"
registerFeature(class Slow extends PostFeature {
    getLatest() {
        const end = Date.now() + 400;
        while (Date.now() < end) {}
        return { items: [], nextKey: null };
    }
});
"#;
    let fixture = Fixture::new();
    let main = fixture.write("slow.js", SCRIPT.as_bytes());

    let outcome = fixture
        .runner("v8")
        .with_call_timeout(Some(Duration::from_millis(50)))
        .run(
            manifest("slow", &main, SCRIPT.as_bytes()),
            Arc::new(NoopUpdater),
            Arc::new(NoopUpdater),
            |session| async move { session.fetch_latest(None).await },
        )
        .await
        .unwrap();

    assert_eq!(outcome.error(), Some(&FetchError::Timeout { millis: 50 }));
}

/// Engine that accepts any script and counts disposals
struct CountingEngine {
    disposed: bool,
    disposals: Arc<AtomicUsize>,
}

#[async_trait(?Send)]
impl Engine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn install_binding(&mut self, _name: &str, _binding: Binding) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&mut self, label: &'static str, source: &str) -> Result<(), EngineError> {
        if label == "<entry>" && source.contains("throw") {
            return Err(EngineError::guest("Error", "entry failed"));
        }
        Ok(())
    }

    fn read_global(&mut self, _name: &str) -> Result<Option<String>, EngineError> {
        Ok(None)
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

fn counting_runner(fixture: &Fixture, disposals: Arc<AtomicUsize>) -> ServiceRunner {
    let factory: EngineFactory = Arc::new(move || {
        Ok(Box::new(CountingEngine {
            disposed: false,
            disposals: disposals.clone(),
        }) as Box<dyn Engine>)
    });
    let mut engines = EngineRegistry::new("counting");
    engines.register("counting", factory);
    ServiceRunner::new(fixture.loader.clone(), Arc::new(engines))
}

#[tokio::test(flavor = "multi_thread")]
async fn session_is_disposed_on_every_exit_path() {
    let fixture = Fixture::new();
    let ok_main = fixture.write("ok.js", b"registerFeature(class A extends PostFeature {});");
    let bad_main = fixture.write("bad.js", b"throw new Error('boom');");
    let ok = manifest("ok", &ok_main, b"registerFeature(class A extends PostFeature {});");
    let bad = manifest("bad", &bad_main, b"throw new Error('boom');");

    let disposals = Arc::new(AtomicUsize::new(0));
    let runner = counting_runner(&fixture, disposals.clone());

    // success
    runner
        .run(ok.clone(), Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async {})
        .await
        .unwrap();
    assert_eq!(disposals.load(Ordering::SeqCst), 1);

    // entry script throws
    let err = runner
        .run(bad, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async {})
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Plugin { .. }));
    assert_eq!(disposals.load(Ordering::SeqCst), 2);

    // cancelled while the body runs
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let err = runner
        .run_with_cancel(
            ok.clone(),
            Arc::new(NoopUpdater),
            Arc::new(NoopUpdater),
            cancel,
            |_| async move {
                trigger.cancel();
                std::future::pending::<()>().await
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Cancelled(RunStage::Ready)));
    assert_eq!(disposals.load(Ordering::SeqCst), 3);

    // run future dropped mid-body
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    let dropped_runner = runner.clone();
    let task = tokio::spawn(async move {
        dropped_runner
            .run(ok, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async move {
                let _ = entered_tx.send(());
                std::future::pending::<()>().await
            })
            .await
    });
    entered_rx.await.unwrap();
    task.abort();
    let _ = task.await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while disposals.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dropped run did not dispose its session");
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_manifest_writes_respect_read_only_fields() {
    const SCRIPT: &str = r#"
const results = {};
for (const [field, value] of [["name", "Renamed"], ["id", "hijack"], ["mainChecksums", {}], ["bogus", 1]]) {
    try {
        manifest[field] = value;
        results[field] = "ok";
    } catch (e) {
        results[field] = e.name;
    }
}
globalThis.writeResults = results;
registerFeature(class Posts extends PostFeature {});
"#;
    let fixture = Fixture::new();
    let main = fixture.write("writer.js", SCRIPT.as_bytes());

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let updater = Arc::new(move |_: &ServiceManifest| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for engine in ["v8", "boa"] {
        let before = updates.load(Ordering::SeqCst);
        let (results, name): (Value, String) = fixture
            .runner(engine)
            .run(
                manifest("writer", &main, SCRIPT.as_bytes()),
                updater.clone(),
                Arc::new(NoopUpdater),
                |session| async move {
                    let results = session.evaluate_json("globalThis.writeResults").await.unwrap();
                    (results, session.manifest().name)
                },
            )
            .await
            .unwrap();

        assert_eq!(
            results,
            json!({
                "name": "ok",
                "id": "ReadOnlyFieldError",
                "mainChecksums": "ReadOnlyFieldError",
                "bogus": "UnknownFieldError",
            }),
            "{}",
            engine
        );
        assert_eq!(name, "Renamed");
        assert_eq!(updates.load(Ordering::SeqCst) - before, 1, "{}", engine);
    }
}
