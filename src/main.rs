//! Service Runtime CLI
//!
//! Installs, inspects and runs service plugins. Every command prints a JSON
//! document to stdout; failures print an error document and exit non-zero.

use service_runtime::cache::ResponseCache;
use service_runtime::core::config::{CliArgs, Command, Config};
use service_runtime::core::{ErrorResponse, Logger, ServiceError};
use service_runtime::plugin::{
    discover_bundled, Checksums, CodeLoader, ConfigUpdater, ConfigValidator, EngineRegistry,
    JsonManifestRepository, ManifestRepository, ManifestUpdater, PageKey, RepositoryUpdater,
    ServiceInstaller, ServiceManifest, ServiceRunner, ServiceSession,
};

use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct App {
    config: Config,
    loader: Arc<CodeLoader>,
    repository: Arc<JsonManifestRepository>,
    runner: ServiceRunner,
}

impl App {
    fn new(config: Config) -> Result<Self, ServiceError> {
        let cache = if config.cache.enabled {
            Some(ResponseCache::new(
                config.cache.dir.clone(),
                config.cache.max_bytes,
                config.cache.ttl(),
            )?)
        } else {
            None
        };

        let loader = Arc::new(CodeLoader::new(config.loader_options(), cache)?);
        let engines = Arc::new(EngineRegistry::builtin().with_default(&config.runtime.engine)?);
        let runner = ServiceRunner::new(loader.clone(), engines)
            .with_http_options(config.http_options())
            .with_call_timeout(config.runtime.call_timeout());
        let repository = Arc::new(JsonManifestRepository::new(config.storage.manifests_dir.clone()));

        Ok(Self {
            config,
            loader,
            repository,
            runner,
        })
    }

    fn installer(&self) -> ServiceInstaller {
        ServiceInstaller::new(self.loader.clone(), self.repository.clone())
            .with_validator(ConfigValidator::new(self.runner.clone()))
    }

    async fn manifest(&self, id: &str) -> Result<ServiceManifest, ServiceError> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Run `body` against an installed service, persisting guest updates
    async fn with_session<T, F, Fut>(&self, id: &str, body: F) -> Result<T, ServiceError>
    where
        F: FnOnce(ServiceSession) -> Fut,
        Fut: Future<Output = T>,
    {
        let manifest = self.manifest(id).await?;
        let (updater, writer) = RepositoryUpdater::spawn(self.repository.clone(), manifest.clone());

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling run");
                interrupt.cancel();
            }
        });

        let result = self
            .runner
            .run_with_cancel(
                manifest,
                updater.clone() as Arc<dyn ManifestUpdater>,
                updater as Arc<dyn ConfigUpdater>,
                cancel,
                body,
            )
            .await;

        ctrl_c.abort();
        // Flush pending manifest writes
        let _ = writer.await;

        Ok(result?)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn page_key(key: Option<String>) -> Option<PageKey> {
    key.and_then(|k| k.parse().ok())
}

async fn execute(app: &App, command: Command) -> Result<Value, ServiceError> {
    match command {
        Command::Checksum { file } => {
            let bytes = tokio::fs::read(&file).await?;
            to_json(&Checksums::compute(&bytes))
        }
        Command::Install { locator } => {
            let outcome = app.installer().install(&locator).await?;
            Ok(json!({
                "manifest": outcome.manifest,
                "previousVersion": outcome.previous_version,
                "validation": outcome.validation,
            }))
        }
        Command::List => to_json(&app.repository.list().await?),
        Command::Discover { install: false } => {
            to_json(&discover_bundled(&app.config.runtime.assets_dir).await?)
        }
        Command::Discover { install: true } => {
            let results = app.installer().install_bundled().await?;
            Ok(Value::Array(
                results
                    .into_iter()
                    .map(|(id, result)| match result {
                        Ok(outcome) => json!({ "id": id, "installed": outcome.manifest.version }),
                        Err(e) => json!({ "id": id, "error": e.to_string() }),
                    })
                    .collect(),
            ))
        }
        Command::Latest { id, key } => {
            let outcome = app
                .with_session(&id, |s| async move { s.fetch_latest(page_key(key)).await })
                .await?;
            to_json(&outcome)
        }
        Command::Post { id, post_id } => {
            let outcome = app
                .with_session(&id, |s| async move { s.fetch_post(&post_id).await })
                .await?;
            to_json(&outcome)
        }
        Command::Comments { id, post_id, key } => {
            let outcome = app
                .with_session(&id, |s| async move { s.fetch_comments(&post_id, page_key(key)).await })
                .await?;
            to_json(&outcome)
        }
        Command::Search { id, query, key } => {
            let outcome = app
                .with_session(&id, |s| async move { s.search(&query, page_key(key)).await })
                .await?;
            to_json(&outcome)
        }
        Command::User { id, user, url } => {
            let outcome = app
                .with_session(&id, |s| async move {
                    if url {
                        s.fetch_user_by_url(&user).await
                    } else {
                        s.fetch_user(&user).await
                    }
                })
                .await?;
            to_json(&outcome)
        }
        Command::UserPosts { id, user_id, key } => {
            let outcome = app
                .with_session(&id, |s| async move { s.fetch_user_posts(&user_id, page_key(key)).await })
                .await?;
            to_json(&outcome)
        }
        Command::Validate { id, plugin } => {
            let manifest = app.manifest(&id).await?;
            let configs = manifest.configs().to_vec();
            let results = ConfigValidator::new(app.runner.clone())
                .validate(&manifest, &configs, plugin)
                .await;
            Ok(Value::Array(
                configs
                    .iter()
                    .zip(results)
                    .map(|(config, result)| json!({ "key": config.key, "result": result }))
                    .collect(),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = match Config::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    debug!(
        engine = %config.runtime.engine,
        assets_dir = ?config.runtime.assets_dir,
        manifests_dir = ?config.storage.manifests_dir,
        cache = config.cache.enabled,
        "Configuration loaded"
    );

    let result = match App::new(config) {
        Ok(app) => execute(&app, args.command).await,
        Err(e) => Err(e),
    };

    let exit_code = match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            0
        }
        Err(e) => {
            let response = ErrorResponse::from_error(&e);
            println!("{}", serde_json::to_string_pretty(&response)?);
            1
        }
    };

    drop(logger);
    std::process::exit(exit_code);
}
