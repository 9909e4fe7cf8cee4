//! Service data model
//!
//! This module defines the manifest and configuration records that describe a
//! service, the domain objects a service produces, and the paging/outcome
//! wrappers the host hands to content consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::checksum::Checksums;

/// Unique identifier of an installed service
pub type ServiceId = String;

/// Version of the capability ABI this host implements.
///
/// A manifest is runnable when this value lies within its
/// `[min_api_version, max_api_version]` bounds.
pub const HOST_API_VERSION: u32 = 1;

/// Where a manifest came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSource {
    /// Shipped inside the application's bundled assets
    Builtin,
    /// Installed by the user from a file or URL
    #[default]
    User,
}

impl fmt::Display for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Builtin => write!(f, "builtin"),
            ServiceSource::User => write!(f, "user"),
        }
    }
}

/// Declarative metadata for a service plugin
///
/// Contains the identity, versioning, display metadata, configuration schema
/// and entry script pin of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    /// Service identifier (unique per installation)
    pub id: ServiceId,

    /// Identifier that stays stable across upgrades of the same service
    #[serde(default)]
    pub original_id: Option<String>,

    /// Service version (semantic versioning)
    pub version: String,

    /// Lowest host API version the service supports
    #[serde(default = "default_min_api_version")]
    pub min_api_version: u32,

    /// Highest host API version the service supports (open ended when absent)
    #[serde(default)]
    pub max_api_version: Option<u32>,

    /// Display name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Icon URL
    #[serde(default)]
    pub icon: Option<String>,

    /// Homepage of the content source
    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    /// Entry script locator (`asset://`, absolute path, `file://`, `http(s)://`)
    pub main: String,

    /// Digests of the entry script
    pub main_checksums: Checksums,

    /// Ordered configuration schema and current values
    #[serde(default)]
    pub configs: Option<Vec<ServiceConfig>>,

    /// Whether installs must run the service's own config validator
    #[serde(default)]
    pub force_config_validation: bool,

    #[serde(default)]
    pub source: ServiceSource,
}

fn default_min_api_version() -> u32 {
    1
}

impl ServiceManifest {
    /// Identifier used to match installs of the same service across upgrades
    pub fn stable_id(&self) -> &str {
        self.original_id.as_deref().unwrap_or(&self.id)
    }

    /// Check whether this service can run against the given host API version
    pub fn supports_api(&self, api_version: u32) -> bool {
        api_version >= self.min_api_version
            && self.max_api_version.map_or(true, |max| api_version <= max)
    }

    /// Configs declared by the service (empty when none)
    pub fn configs(&self) -> &[ServiceConfig] {
        self.configs.as_deref().unwrap_or(&[])
    }

    /// Look up a config by key
    pub fn config(&self, key: &str) -> Option<&ServiceConfig> {
        self.configs().iter().find(|c| c.key == key)
    }
}

/// Kind of a configuration entry
///
/// Values are always stored as strings; the kind decides how the string is
/// interpreted and validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigKind {
    Boolean,
    Number,
    Text,
    Url,
    /// Single choice among declared options
    Option {
        #[serde(default)]
        options: Option<Vec<ConfigOption>>,
    },
    /// Cookie jar captured from a login flow
    Cookies,
    /// Cookie jar plus the user agent it was captured with
    CookiesUserAgent,
}

impl ConfigKind {
    /// Cookie kinds are filled by a login flow rather than typed by the user
    pub fn is_cookie(&self) -> bool {
        matches!(self, ConfigKind::Cookies | ConfigKind::CookiesUserAgent)
    }
}

/// Selectable option of an [`ConfigKind::Option`] config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOption {
    pub name: String,
    pub value: String,
}

/// A single configuration entry of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Key the service reads the value by
    pub key: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(flatten)]
    pub kind: ConfigKind,

    /// Current value
    #[serde(default)]
    pub value: Option<String>,
}

impl ServiceConfig {
    /// Create a config entry with no value
    pub fn new(key: impl Into<String>, kind: ConfigKind) -> Self {
        Self {
            key: key.into(),
            name: None,
            description: None,
            required: false,
            kind,
            value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Whether the value is missing or blank
    pub fn is_empty(&self) -> bool {
        self.value.as_deref().map_or(true, |v| v.trim().is_empty())
    }
}

/// Opaque pagination token defined by the service
///
/// `None` in a request means "first page". A `next_key` of `None` in a result
/// is the only end-of-data signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageKey {
    Number(serde_json::Number),
    Text(String),
}

impl From<&str> for PageKey {
    fn from(value: &str) -> Self {
        PageKey::Text(value.to_string())
    }
}

impl From<i64> for PageKey {
    fn from(value: i64) -> Self {
        PageKey::Number(value.into())
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKey::Number(n) => write!(f, "{}", n),
            PageKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for PageKey {
    type Err = std::convert::Infallible;

    /// Integers become numeric keys, anything else a text key
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(n) => PageKey::from(n),
            Err(_) => PageKey::Text(s.to_string()),
        })
    }
}

/// One page of results plus the key of the next page, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,

    #[serde(default)]
    pub next_key: Option<PageKey>,
}

impl<T> PagedResult<T> {
    pub fn has_more(&self) -> bool {
        self.next_key.is_some()
    }
}

/// Host-side pagination walker
///
/// Starts at the first page, feeds back each result's `next_key`, and stops
/// for good once a page arrives without one.
#[derive(Debug, Clone, Default)]
pub struct PageCursor {
    next: Option<PageKey>,
    started: bool,
    exhausted: bool,
    pages: usize,
}

impl PageCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for the next request, or `None` when pagination has ended.
    ///
    /// The outer option is the termination signal; the inner one is the key
    /// itself (`None` for the first page).
    pub fn next_request(&self) -> Option<Option<PageKey>> {
        if self.exhausted {
            None
        } else if !self.started {
            Some(None)
        } else {
            Some(self.next.clone())
        }
    }

    /// Record a received page
    pub fn advance<T>(&mut self, page: &PagedResult<T>) {
        if self.exhausted {
            return;
        }
        self.started = true;
        self.pages += 1;
        self.next = page.next_key.clone();
        if self.next.is_none() {
            self.exhausted = true;
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of pages recorded so far
    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// A user (author) on the content source
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub avatar: Option<String>,

    #[serde(default)]
    pub bio: Option<String>,

    /// Profile URL on the content source
    #[serde(default)]
    pub url: Option<String>,
}

/// Media attached to a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    /// `image`, `video`, `audio` or a service specific kind
    #[serde(rename = "type", default = "default_media_kind")]
    pub kind: String,

    pub url: String,

    #[serde(default)]
    pub thumbnail: Option<String>,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,
}

fn default_media_kind() -> String {
    "image".to_string()
}

/// A post (item of a feed)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Body text (HTML or Markdown, rendering is up to the consumer)
    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub author: Option<User>,

    #[serde(default)]
    pub media: Vec<Media>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub comment_count: Option<u64>,

    #[serde(default)]
    pub like_count: Option<u64>,

    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A comment on a post
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub author: Option<User>,

    /// Parent comment for threaded sources
    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub reply_count: Option<u64>,

    #[serde(default)]
    pub like_count: Option<u64>,

    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-field verdict of the config validator pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ValidationResult {
    Pass,
    Fail(String),
}

impl ValidationResult {
    pub fn fail(reason: impl Into<String>) -> Self {
        ValidationResult::Fail(reason.into())
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationResult::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> serde_json::Value {
        serde_json::json!({
            "id": "example-feed",
            "originalId": "example-feed",
            "version": "1.2.0",
            "minApiVersion": 1,
            "maxApiVersion": 3,
            "name": "Example Feed",
            "main": "asset://services/example/main.js",
            "mainChecksums": {
                "md5": "a", "sha1": "b", "sha256": "c", "sha512": "d"
            },
            "configs": [
                { "key": "nsfw", "type": "boolean", "value": "false" },
                { "key": "sort", "type": "option", "required": true,
                  "options": [{ "name": "Hot", "value": "hot" }], "value": "hot" },
                { "key": "session", "type": "cookies_user_agent" }
            ]
        })
    }

    #[test]
    fn test_manifest_deserialization() {
        let manifest: ServiceManifest = serde_json::from_value(manifest_json()).unwrap();

        assert_eq!(manifest.id, "example-feed");
        assert_eq!(manifest.source, ServiceSource::User);
        assert_eq!(manifest.configs().len(), 3);
        assert_eq!(manifest.configs()[0].kind, ConfigKind::Boolean);
        assert!(manifest.configs()[2].kind.is_cookie());
        match &manifest.config("sort").unwrap().kind {
            ConfigKind::Option { options } => assert_eq!(options.as_ref().unwrap()[0].value, "hot"),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_manifest_serialization_keeps_camel_case() {
        let manifest: ServiceManifest = serde_json::from_value(manifest_json()).unwrap();
        let json = serde_json::to_value(&manifest).unwrap();

        assert_eq!(json["mainChecksums"]["sha256"], "c");
        assert_eq!(json["configs"][1]["type"], "option");
        assert_eq!(json["minApiVersion"], 1);
    }

    #[test]
    fn test_supports_api() {
        let mut manifest: ServiceManifest = serde_json::from_value(manifest_json()).unwrap();
        assert!(manifest.supports_api(1));
        assert!(manifest.supports_api(3));
        assert!(!manifest.supports_api(4));

        manifest.max_api_version = None;
        assert!(manifest.supports_api(40));
        manifest.min_api_version = 5;
        assert!(!manifest.supports_api(4));
    }

    #[test]
    fn test_page_key_shapes() {
        let number: PageKey = serde_json::from_str("42").unwrap();
        let text: PageKey = serde_json::from_str("\"t3_abc\"").unwrap();

        assert_eq!(number, PageKey::from(42i64));
        assert_eq!(text, PageKey::from("t3_abc"));
        assert_eq!("17".parse::<PageKey>().unwrap(), PageKey::from(17i64));
        assert_eq!("after:9".parse::<PageKey>().unwrap(), PageKey::from("after:9"));
    }

    #[test]
    fn test_paged_result_without_next_key() {
        let page: PagedResult<Post> =
            serde_json::from_value(serde_json::json!({ "items": [{ "id": "1" }] })).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more());
    }

    #[test]
    fn test_page_cursor_stops_after_last_page() {
        let mut cursor = PageCursor::new();
        assert_eq!(cursor.next_request(), Some(None));

        cursor.advance(&PagedResult::<Post> { items: vec![], next_key: Some(PageKey::from(2i64)) });
        assert_eq!(cursor.next_request(), Some(Some(PageKey::from(2i64))));

        // An empty page with a next key still continues
        cursor.advance(&PagedResult::<Post> { items: vec![], next_key: Some(PageKey::from(3i64)) });
        assert_eq!(cursor.next_request(), Some(Some(PageKey::from(3i64))));

        cursor.advance(&PagedResult::<Post> {
            items: vec![Post { id: "x".into(), ..Default::default() }],
            next_key: None,
        });
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.next_request(), None);

        // Late pages are ignored
        cursor.advance(&PagedResult::<Post> { items: vec![], next_key: Some(PageKey::from(9i64)) });
        assert_eq!(cursor.next_request(), None);
        assert_eq!(cursor.pages(), 3);
    }

    #[test]
    fn test_validation_result_json() {
        let json = serde_json::to_value(ValidationResult::fail("bad")).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "fail", "reason": "bad" }));
    }
}
