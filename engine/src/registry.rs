// Process-wide notification registry
//
// Populated through `RegistryBuilder` at startup, then frozen into a
// read-only `NotificationRegistry` shared behind an `Arc`.

use crate::definition::{NotificationDefinition, NotificationSpec};
use crate::errors::DefinitionError;
use config::{Config, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

/// Layout of a notifications file
#[derive(Debug, Default, Deserialize)]
struct NotificationsFile {
    #[serde(default)]
    notifications: Vec<NotificationSpec>,
}

/// Mutable registry used during startup
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: BTreeMap<String, Arc<NotificationDefinition>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; names are unique
    pub fn register(&mut self, definition: NotificationDefinition) -> Result<&mut Self, DefinitionError> {
        let name = definition.name().to_string();
        if self.definitions.contains_key(&name) {
            return Err(DefinitionError::DuplicateName(name));
        }
        self.definitions.insert(name, Arc::new(definition));
        Ok(self)
    }

    /// Register every definition declared in a notifications file
    ///
    /// The format is inferred from the extension (TOML, YAML or JSON). Returns
    /// the number of definitions loaded.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize, DefinitionError> {
        let file: NotificationsFile = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        let count = file.notifications.len();
        for spec in file.notifications {
            self.register(NotificationDefinition::try_from(spec)?)?;
        }

        info!(count, "Notification definitions loaded");
        Ok(count)
    }

    pub fn build(self) -> NotificationRegistry {
        NotificationRegistry {
            definitions: self.definitions,
        }
    }
}

/// Read-only registry of notification definitions keyed by name
#[derive(Debug, Clone, Default)]
pub struct NotificationRegistry {
    definitions: BTreeMap<String, Arc<NotificationDefinition>>,
}

impl NotificationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<NotificationDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &NotificationDefinition> {
        self.definitions.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use crate::trigger::Trigger;
    use chrono::Duration;
    use std::io::Write;

    fn definition(name: &str) -> NotificationDefinition {
        NotificationDefinition::builder(name)
            .backends(["email"])
            .template("default", "a.html")
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut builder = RegistryBuilder::new();
        builder.register(definition("welcome")).unwrap();
        builder.register(definition("digest")).unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("welcome").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["digest", "welcome"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(definition("welcome")).unwrap();
        let result = builder.register(definition("welcome"));
        assert!(matches!(result, Err(DefinitionError::DuplicateName(name)) if name == "welcome"));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[notifications]]
name = "welcome"
backends = ["email"]
templates = {{ default = "welcome.html" }}

[[notifications]]
name = "reminder"
backends = ["email", "webhook"]
templates = {{ default = "reminder.txt", email = "reminder.html" }}
scope = {{ type = "context_field", context_key = "user_id", lookup_field = "id" }}
trigger = {{ type = "delayed", delay_seconds = 172800, at_hour = 18, at_minute = 0 }}
"#
        )
        .unwrap();

        let mut builder = RegistryBuilder::new();
        let count = builder.load_file(file.path()).unwrap();
        assert_eq!(count, 2);

        let registry = builder.build();
        let reminder = registry.get("reminder").unwrap();
        assert!(matches!(reminder.scope(), Scope::ContextField { .. }));
        match reminder.trigger() {
            Trigger::Delayed(delayed) => assert_eq!(delayed.delay, Duration::days(2)),
            other => panic!("Expected delayed trigger, got {:?}", other),
        }
        assert_eq!(reminder.template_for("webhook").unwrap(), "reminder.txt");
    }

    #[test]
    fn test_load_file_rejects_invalid_definition() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[notifications]]
name = "broken"
backends = ["email"]
templates = {{ email = "a.html" }}
"#
        )
        .unwrap();

        let mut builder = RegistryBuilder::new();
        let result = builder.load_file(file.path());
        assert!(matches!(result, Err(DefinitionError::MissingDefaultTemplate(_))));
    }
}
