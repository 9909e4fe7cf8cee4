//! Host utilities exposed to guests
//!
//! `__http_request` is served by one helper thread per session that owns a
//! blocking client, so it can be called synchronously from inside an engine
//! turn. `__log` forwards guest log lines into tracing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::{Binding, HostError};

/// Options for guest HTTP requests
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Largest response body handed back to a guest
    pub max_response_bytes: u64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("service-runtime/", env!("CARGO_PKG_VERSION")).to_string(),
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Request made by guest code
#[derive(Debug, Clone, Deserialize)]
pub struct GuestRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response handed back to guest code. Non-2xx statuses are not errors.
#[derive(Debug, Clone, Serialize)]
pub struct GuestResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

fn network_error(e: impl std::fmt::Display) -> HostError {
    HostError::new("NetworkError", e.to_string())
}

fn perform(
    client: &reqwest::blocking::Client,
    options: &HttpOptions,
    request: GuestRequest,
) -> Result<GuestResponse, HostError> {
    let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
        .map_err(|_| HostError::type_error(format!("invalid HTTP method: {}", request.method)))?;
    let url = url::Url::parse(&request.url)
        .map_err(|e| HostError::type_error(format!("invalid URL '{}': {}", request.url, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(HostError::type_error(format!("unsupported URL scheme: {}", url.scheme())));
    }

    let mut builder = client.request(method, url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let resp = builder.send().map_err(network_error)?;

    if let Some(length) = resp.content_length() {
        if length > options.max_response_bytes {
            return Err(HostError::new(
                "ResponseTooLarge",
                format!("response of {} bytes exceeds {} bytes", length, options.max_response_bytes),
            ));
        }
    }

    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();
    let body = resp.text().map_err(network_error)?;
    if body.len() as u64 > options.max_response_bytes {
        return Err(HostError::new(
            "ResponseTooLarge",
            format!("response exceeds {} bytes", options.max_response_bytes),
        ));
    }

    Ok(GuestResponse {
        url: final_url,
        status,
        headers,
        body,
    })
}

type Reply = mpsc::SyncSender<Result<GuestResponse, HostError>>;

/// Session-scoped HTTP thread.
///
/// The blocking client owns its own runtime, which must not be created or
/// dropped on a thread that drives an async runtime, so it lives on a plain
/// thread that exits once the binding is dropped.
struct HttpWorker {
    service_id: String,
    options: HttpOptions,
    jobs: OnceLock<Result<mpsc::Sender<(GuestRequest, Reply)>, String>>,
}

impl HttpWorker {
    fn new(service_id: String, options: HttpOptions) -> Self {
        Self {
            service_id,
            options,
            jobs: OnceLock::new(),
        }
    }

    fn start(&self) -> Result<mpsc::Sender<(GuestRequest, Reply)>, String> {
        let (tx, rx) = mpsc::channel::<(GuestRequest, Reply)>();
        let options = self.options.clone();

        thread::Builder::new()
            .name(format!("http-{}", self.service_id))
            .spawn(move || {
                let client = reqwest::blocking::Client::builder()
                    .timeout(options.timeout)
                    .connect_timeout(options.connect_timeout)
                    .user_agent(options.user_agent.clone())
                    .build()
                    .map_err(network_error);

                for (request, reply) in rx {
                    let result = match &client {
                        Ok(client) => perform(client, &options, request),
                        Err(e) => Err(e.clone()),
                    };
                    let _ = reply.send(result);
                }
            })
            .map_err(|e| e.to_string())?;

        Ok(tx)
    }

    fn request(&self, request: GuestRequest) -> Result<GuestResponse, HostError> {
        let jobs = self
            .jobs
            .get_or_init(|| self.start())
            .as_ref()
            .map_err(|e| HostError::new("InternalError", format!("HTTP worker unavailable: {}", e)))?;

        let (reply, response) = mpsc::sync_channel(1);
        jobs.send((request, reply))
            .map_err(|_| HostError::new("InternalError", "HTTP worker stopped"))?;
        response
            .recv()
            .unwrap_or_else(|_| Err(HostError::new("InternalError", "HTTP worker stopped")))
    }
}

/// Binding for `__http_request(request)`
pub fn http_binding(service_id: String, options: HttpOptions) -> Binding {
    let worker = HttpWorker::new(service_id.clone(), options);

    Binding::function(move |args| {
        let request: GuestRequest = serde_json::from_value(args.get(0).cloned().unwrap_or(Value::Null))
            .map_err(|e| HostError::type_error(format!("invalid request: {}", e)))?;

        debug!(service = %service_id, method = %request.method, url = %request.url, "Guest HTTP request");

        let response = worker.request(request)?;

        debug!(service = %service_id, status = response.status, url = %response.url, "Guest HTTP response");
        serde_json::to_value(response).map_err(|e| HostError::new("InternalError", e.to_string()))
    })
}

/// Binding for `__log(level, message)`
pub fn log_binding(service_id: String) -> Binding {
    Binding::function(move |args| {
        let level = args.get(0).and_then(Value::as_str).unwrap_or("info");
        let message = match args.get(1) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        match level {
            "debug" => debug!(service = %service_id, "{}", message),
            "warn" => warn!(service = %service_id, "{}", message),
            "error" => error!(service = %service_id, "{}", message),
            _ => info!(service = %service_id, "{}", message),
        }
        Ok(Value::Null)
    })
}
