//! Feature registry
//!
//! Maps capability tags to the concrete feature a service registered for
//! them. Instances are created lazily, at most once per capability, and live
//! only as long as the session that owns the registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Base classes guests may extend but never register directly
pub const RESERVED_FEATURES: [&str; 4] = ["Feature", "PostFeature", "UserFeature", "ValidateFeature"];

/// Capability a feature provides
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Capability {
    /// Post fetching (`PostFeature`)
    Post,
    /// User fetching (`UserFeature`)
    User,
    /// Config validation (`ValidateFeature`)
    Validate,
    /// Service specific capability, named after the direct `Feature` subclass
    Custom(String),
}

impl Capability {
    /// Tag used on the guest side
    pub fn tag(&self) -> String {
        match self {
            Capability::Post => "post".to_string(),
            Capability::User => "user".to_string(),
            Capability::Validate => "validate".to_string(),
            Capability::Custom(name) => format!("custom:{}", name),
        }
    }

    /// Parse a guest-side tag; unknown plain tags become custom capabilities
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "post" => Capability::Post,
            "user" => Capability::User,
            "validate" => Capability::Validate,
            other => Capability::Custom(other.strip_prefix("custom:").unwrap_or(other).to_string()),
        }
    }

    /// Base class a guest extends to provide this capability
    pub fn base_class(&self) -> &'static str {
        match self {
            Capability::Post => "PostFeature",
            Capability::User => "UserFeature",
            Capability::Validate => "ValidateFeature",
            Capability::Custom(_) => "Feature",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.tag()
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Capability::from_tag(&tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("{0} is a reserved capability and cannot be registered directly")]
    Reserved(String),

    #[error("No feature registered for capability '{0}'")]
    NotRegistered(Capability),
}

/// A capability handle bound to one session
pub trait Feature: Send + Sync + fmt::Debug {
    fn capability(&self) -> &Capability;

    /// Name of the concrete class or type implementing the capability
    fn class_name(&self) -> &str;
}

/// Feature implemented by guest code and invoked through the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFeature {
    capability: Capability,
    class_name: String,
}

impl GuestFeature {
    pub fn new(capability: Capability, class_name: impl Into<String>) -> Self {
        Self {
            capability,
            class_name: class_name.into(),
        }
    }
}

impl Feature for GuestFeature {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    fn class_name(&self) -> &str {
        &self.class_name
    }
}

pub type FeatureFactory = Box<dyn Fn() -> Arc<dyn Feature> + Send + Sync>;

struct Registration {
    class_name: String,
    factory: FeatureFactory,
    instance: OnceLock<Arc<dyn Feature>>,
}

/// Per-session capability table
#[derive(Default)]
pub struct FeatureRegistry {
    entries: HashMap<Capability, Registration>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class_name` as the provider of `capability`.
    ///
    /// Reserved base classes are rejected. A later registration for the same
    /// capability replaces the earlier one, including any instance already
    /// created from it.
    pub fn register(
        &mut self,
        capability: Capability,
        class_name: &str,
        factory: FeatureFactory,
    ) -> Result<(), FeatureError> {
        if RESERVED_FEATURES.contains(&class_name) {
            return Err(FeatureError::Reserved(class_name.to_string()));
        }

        debug!(capability = %capability, class = class_name, "Registered feature");
        self.entries.insert(
            capability,
            Registration {
                class_name: class_name.to_string(),
                factory,
                instance: OnceLock::new(),
            },
        );
        Ok(())
    }

    /// Register a guest class, with a [`GuestFeature`] handle as its instance
    pub fn register_guest(&mut self, capability: Capability, class_name: &str) -> Result<(), FeatureError> {
        let handle = GuestFeature::new(capability.clone(), class_name);
        self.register(capability, class_name, Box::new(move || Arc::new(handle.clone())))
    }

    pub fn is_registered(&self, capability: &Capability) -> bool {
        self.entries.contains_key(capability)
    }

    /// Class registered for a capability
    pub fn class_name(&self, capability: &Capability) -> Option<&str> {
        self.entries.get(capability).map(|r| r.class_name.as_str())
    }

    /// Instance for a capability, creating it on first request
    pub fn get_or_create(&self, capability: &Capability) -> Result<Arc<dyn Feature>, FeatureError> {
        let registration = self
            .entries
            .get(capability)
            .ok_or_else(|| FeatureError::NotRegistered(capability.clone()))?;

        Ok(registration
            .instance
            .get_or_init(|| (registration.factory)())
            .clone())
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities: Vec<Capability> = self.entries.keys().cloned().collect();
        capabilities.sort_by_key(|c| c.tag());
        capabilities
    }
}

impl fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(c, r)| (c.tag(), &r.class_name)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(counter: Arc<AtomicUsize>, name: &'static str) -> FeatureFactory {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(GuestFeature::new(Capability::Post, name))
        })
    }

    #[test]
    fn test_reserved_classes_rejected_at_registration() {
        let mut registry = FeatureRegistry::new();
        for name in RESERVED_FEATURES {
            let err = registry.register_guest(Capability::Post, name).unwrap_err();
            assert_eq!(err, FeatureError::Reserved(name.to_string()));
        }
        assert!(!registry.is_registered(&Capability::Post));
    }

    #[test]
    fn test_lazy_singleton_per_capability() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut registry = FeatureRegistry::new();
        registry
            .register(Capability::Post, "RedditPosts", counting_factory(created.clone(), "RedditPosts"))
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let first = registry.get_or_create(&Capability::Post).unwrap();
        let second = registry.get_or_create(&Capability::Post).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(first.class_name(), "RedditPosts");
    }

    #[test]
    fn test_lookup_by_capability_resolves_concrete_class() {
        let mut registry = FeatureRegistry::new();
        registry.register_guest(Capability::User, "MastodonUsers").unwrap();

        let feature = registry.get_or_create(&Capability::User).unwrap();
        assert_eq!(feature.capability(), &Capability::User);
        assert_eq!(feature.class_name(), "MastodonUsers");
    }

    #[test]
    fn test_missing_capability() {
        let registry = FeatureRegistry::new();
        assert_eq!(
            registry.get_or_create(&Capability::Validate).unwrap_err(),
            FeatureError::NotRegistered(Capability::Validate)
        );
    }

    #[test]
    fn test_reregistration_replaces_instance() {
        let mut registry = FeatureRegistry::new();
        registry.register_guest(Capability::Post, "First").unwrap();
        let first = registry.get_or_create(&Capability::Post).unwrap();

        registry.register_guest(Capability::Post, "Second").unwrap();
        let second = registry.get_or_create(&Capability::Post).unwrap();

        assert_eq!(first.class_name(), "First");
        assert_eq!(second.class_name(), "Second");
        assert_eq!(registry.capabilities(), vec![Capability::Post]);
    }

    #[test]
    fn test_capability_tags() {
        for capability in [
            Capability::Post,
            Capability::User,
            Capability::Validate,
            Capability::Custom("Trending".into()),
        ] {
            assert_eq!(Capability::from_tag(&capability.tag()), capability);
        }
        assert_eq!(
            serde_json::to_value(Capability::Custom("Trending".into())).unwrap(),
            serde_json::json!("custom:Trending")
        );
        assert_eq!(Capability::Validate.base_class(), "ValidateFeature");
    }
}
