//! Model catalog: the registry of backends that can be dispatched to.
//!
//! Epistemic foundation:
//! - K_i: The catalog is built once at startup and never mutated
//! - K_i: Lookup is by unique model name
//! - B_i: A catalogued model has its credential configured (checked on demand)
//! - I^R: User configures extra models via `[[models]]`

use crate::client::CredentialStore;
use crate::models::{Config, EvalmuxError, ModelDescriptor, ProtocolFamily, Result};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

const CHAT_STREAM_V1_URL: &str = "https://chat.hkchat.app/goapi/v1/chat/stream";
const CHAT_STREAM_V2_URL: &str = "https://test.hkchat.app/goapi/v1/chat/stream";
const COPILOT_PROD_URL: &str = "https://copilot.hkgai.org/copilot/api/instruction/completion";
const COPILOT_TEST_URL: &str =
    "https://copilot-test.hkgai.org/copilot/api/instruction/completion";
const COPILOT_NET_URL: &str = "https://copilot.hkgai.net/copilot/api/instruction/completion";
const JUDGE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent";

/// Availability of one catalogued model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelAvailability {
    pub name: String,
    pub family: ProtocolFamily,
    pub credential_key: String,
    pub available: bool,
}

/// Immutable registry of model descriptors.
///
/// Keeps insertion order for listings; lookup goes through a hash index.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    descriptors: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Build a catalog from descriptors. Later entries replace earlier ones of
    /// the same name.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut catalog = Self {
            descriptors: Vec::new(),
            index: HashMap::new(),
        };
        for descriptor in descriptors {
            match catalog.index.get(&descriptor.name) {
                Some(&pos) => catalog.descriptors[pos] = descriptor,
                None => {
                    catalog
                        .index
                        .insert(descriptor.name.clone(), catalog.descriptors.len());
                    catalog.descriptors.push(descriptor);
                }
            }
        }
        catalog
    }

    /// The built-in backends.
    pub fn builtin() -> Self {
        Self::from_descriptors(builtin_descriptors())
    }

    /// Built-in backends merged with the config's `[[models]]`.
    pub fn from_config(config: &Config) -> Self {
        let builtin = if config.replace_builtin_models {
            Vec::new()
        } else {
            builtin_descriptors()
        };
        let catalog = Self::from_descriptors(builtin.into_iter().chain(config.models.iter().cloned()));
        debug!(models = catalog.len(), "Model catalog built");
        catalog
    }

    /// Descriptor for `name`, if catalogued.
    pub fn resolve(&self, name: &str) -> Option<&ModelDescriptor> {
        self.index.get(name).map(|&pos| &self.descriptors[pos])
    }

    /// Protocol family of `name`, if catalogued.
    pub fn protocol_family_of(&self, name: &str) -> Option<ProtocolFamily> {
        self.resolve(name).map(|d| d.family)
    }

    /// Whether `name` is catalogued and its credential is present in `store`.
    pub fn credential_available(&self, name: &str, store: &dyn CredentialStore) -> bool {
        self.resolve(name)
            .is_some_and(|d| store.get(&d.credential_key).is_some())
    }

    /// Availability of every catalogued model, in catalog order.
    pub fn available_models(&self, store: &dyn CredentialStore) -> Vec<ModelAvailability> {
        self.descriptors
            .iter()
            .map(|d| ModelAvailability {
                name: d.name.clone(),
                family: d.family,
                credential_key: d.credential_key.clone(),
                available: store.get(&d.credential_key).is_some(),
            })
            .collect()
    }

    /// Check that `name` is catalogued and usable.
    pub fn validate_model(&self, name: &str, store: &dyn CredentialStore) -> Result<()> {
        let descriptor = self
            .resolve(name)
            .ok_or_else(|| EvalmuxError::UnsupportedModel(name.to_string()))?;

        if store.get(&descriptor.credential_key).is_none() {
            return Err(EvalmuxError::MissingCredential {
                model: name.to_string(),
                credential_key: descriptor.credential_key.clone(),
            });
        }
        Ok(())
    }

    /// Check a selection of models, stopping at the first problem.
    pub fn validate_models(&self, names: &[String], store: &dyn CredentialStore) -> Result<()> {
        names
            .iter()
            .try_for_each(|name| self.validate_model(name, store))
    }

    /// Names of fan-out models, in catalog order.
    pub fn fan_out_models(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter(|d| d.family.is_fan_out())
            .map(|d| d.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.iter()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_descriptors() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::event_stream("HKGAI-V1", CHAT_STREAM_V1_URL, "ARK_API_KEY_HKGAI_V1"),
        ModelDescriptor::event_stream("HKGAI-V2", CHAT_STREAM_V2_URL, "ARK_API_KEY_HKGAI_V2"),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-PROD",
            COPILOT_PROD_URL,
            "HKGAI-V1",
            "COPILOT_COOKIE_PROD",
        ),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-Thinking-PROD",
            COPILOT_PROD_URL,
            "HKGAI-V1-Thinking",
            "COPILOT_COOKIE_PROD",
        ),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-TEST",
            COPILOT_TEST_URL,
            "HKGAI-V1",
            "COPILOT_COOKIE_TEST",
        ),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-Thinking-TEST",
            COPILOT_TEST_URL,
            "HKGAI-V1-Thinking",
            "COPILOT_COOKIE_TEST",
        ),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-NET",
            COPILOT_NET_URL,
            "HKGAI-V1",
            "COPILOT_COOKIE_NET",
        ),
        ModelDescriptor::delta_stream(
            "HKGAI-V1-Thinking-NET",
            COPILOT_NET_URL,
            "HKGAI-V1-Thinking",
            "COPILOT_COOKIE_NET",
        ),
        ModelDescriptor::judge("gemini-pro", JUDGE_URL, "gemini-pro", "GOOGLE_API_KEY"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StaticCredentials;

    #[test]
    fn builtin_catalog_resolves_families() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(catalog.len(), 9);
        assert_eq!(
            catalog.protocol_family_of("HKGAI-V1"),
            Some(ProtocolFamily::EventStream)
        );
        assert_eq!(
            catalog.protocol_family_of("HKGAI-V1-Thinking-NET"),
            Some(ProtocolFamily::DeltaStream)
        );
        assert_eq!(
            catalog.protocol_family_of("gemini-pro"),
            Some(ProtocolFamily::JudgeRest)
        );
        assert!(catalog.resolve("nonexistent-model").is_none());
        assert!(!catalog.fan_out_models().contains(&"gemini-pro"));
    }

    #[test]
    fn credential_availability_uses_store() {
        let catalog = ModelCatalog::builtin();
        let store = StaticCredentials::new().with("COPILOT_COOKIE_PROD", "c=1");

        assert!(catalog.credential_available("HKGAI-V1-PROD", &store));
        assert!(catalog.credential_available("HKGAI-V1-Thinking-PROD", &store));
        assert!(!catalog.credential_available("HKGAI-V1-TEST", &store));
        assert!(!catalog.credential_available("nonexistent-model", &store));

        let listing = catalog.available_models(&store);
        assert_eq!(listing.iter().filter(|m| m.available).count(), 2);
        assert_eq!(listing[0].name, "HKGAI-V1");
    }

    #[test]
    fn validation_reports_first_problem() {
        let catalog = ModelCatalog::builtin();
        let store = StaticCredentials::new().with("ARK_API_KEY_HKGAI_V1", "k");

        assert!(catalog.validate_model("HKGAI-V1", &store).is_ok());
        assert!(matches!(
            catalog.validate_model("HKGAI-V2", &store),
            Err(EvalmuxError::MissingCredential { credential_key, .. })
                if credential_key == "ARK_API_KEY_HKGAI_V2"
        ));
        assert!(matches!(
            catalog.validate_models(&["HKGAI-V1".into(), "nope".into()], &store),
            Err(EvalmuxError::UnsupportedModel(name)) if name == "nope"
        ));
    }

    #[test]
    fn config_models_replace_builtin_entries() {
        let mut config = Config::default();
        config.models.push(ModelDescriptor::event_stream(
            "HKGAI-V1",
            "http://localhost:1/stream",
            "LOCAL",
        ));
        let catalog = ModelCatalog::from_config(&config);
        assert_eq!(catalog.len(), 9);
        assert_eq!(
            catalog.resolve("HKGAI-V1").unwrap().endpoint,
            "http://localhost:1/stream"
        );

        config.replace_builtin_models = true;
        assert_eq!(ModelCatalog::from_config(&config).len(), 1);
    }
}
