// Notification definitions: the declarative unit combining scope, trigger,
// backends and templates

use crate::errors::{DefinitionError, DispatchError, NotificationError};
use crate::scope::{Scope, ScopeFilter};
use crate::template::{ContextBuilder, TemplateMap};
use crate::trigger::Trigger;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// NotificationDefinition is immutable once built
#[derive(Clone)]
pub struct NotificationDefinition {
    name: String,
    scope: Scope,
    trigger: Trigger,
    backends: Vec<String>,
    templates: TemplateMap,
    filter_scope: Option<Arc<dyn ScopeFilter>>,
    context_builder: Option<Arc<dyn ContextBuilder>>,
}

impl fmt::Debug for NotificationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDefinition")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("trigger", &self.trigger)
            .field("backends", &self.backends)
            .field("templates", &self.templates)
            .field("filter_scope", &self.filter_scope.is_some())
            .field("context_builder", &self.context_builder.is_some())
            .finish()
    }
}

impl NotificationDefinition {
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn templates(&self) -> &TemplateMap {
        &self.templates
    }

    pub fn filter_scope(&self) -> Option<&dyn ScopeFilter> {
        self.filter_scope.as_deref()
    }

    pub fn context_builder(&self) -> Option<&dyn ContextBuilder> {
        self.context_builder.as_deref()
    }

    /// Template identifier for `backend`, falling back to `"default"`
    pub fn template_for(&self, backend: &str) -> Result<&str, DispatchError> {
        self.templates
            .resolve(backend)
            .ok_or_else(|| DispatchError::NoTemplateConfigured(backend.to_string()))
    }

    /// Check a schedule-time backend override: non-empty subset of `backends`
    pub fn validate_backend_override(&self, requested: &[String]) -> Result<(), NotificationError> {
        if requested.is_empty() {
            return Err(NotificationError::InvalidBackendOverride {
                notification: self.name.clone(),
                reason: "backend override cannot be empty".to_string(),
            });
        }

        let unknown: Vec<&str> = requested
            .iter()
            .filter(|b| !self.backends.contains(*b))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(NotificationError::InvalidBackendOverride {
                notification: self.name.clone(),
                reason: format!("backends not declared by the notification: {}", unknown.join(", ")),
            });
        }

        Ok(())
    }

    /// Backends to dispatch on at fire time, in definition order
    ///
    /// The override is intersected with the current definition, so backends
    /// removed by a redefinition after scheduling are skipped.
    pub fn effective_backends(&self, requested: Option<&[String]>) -> Vec<String> {
        match requested {
            None => self.backends.clone(),
            Some(requested) => self
                .backends
                .iter()
                .filter(|b| requested.contains(*b))
                .cloned()
                .collect(),
        }
    }
}

/// Builder for [`NotificationDefinition`]
pub struct DefinitionBuilder {
    name: String,
    scope: Scope,
    trigger: Trigger,
    backends: Vec<String>,
    templates: TemplateMap,
    filter_scope: Option<Arc<dyn ScopeFilter>>,
    context_builder: Option<Arc<dyn ContextBuilder>>,
}

impl DefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Scope::default(),
            trigger: Trigger::default(),
            backends: Vec::new(),
            templates: TemplateMap::new(),
            filter_scope: None,
            context_builder: None,
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backends = backends.into_iter().map(Into::into).collect();
        self
    }

    pub fn templates(mut self, templates: TemplateMap) -> Self {
        self.templates = templates;
        self
    }

    pub fn template(mut self, key: impl Into<String>, template_id: impl Into<String>) -> Self {
        self.templates = self.templates.with(key, template_id);
        self
    }

    pub fn filter_scope(mut self, filter: impl ScopeFilter + 'static) -> Self {
        self.filter_scope = Some(Arc::new(filter));
        self
    }

    pub fn context_builder(mut self, builder: impl ContextBuilder + 'static) -> Self {
        self.context_builder = Some(Arc::new(builder));
        self
    }

    pub fn build(self) -> Result<NotificationDefinition, DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }

        if self.backends.is_empty() {
            return Err(DefinitionError::NoBackends(self.name));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.as_str()) {
                return Err(DefinitionError::DuplicateBackend {
                    notification: self.name.clone(),
                    backend: backend.clone(),
                });
            }
        }

        if !self.templates.has_default() {
            return Err(DefinitionError::MissingDefaultTemplate(self.name));
        }

        self.trigger
            .validate()
            .map_err(|source| DefinitionError::InvalidTrigger {
                notification: self.name.clone(),
                source,
            })?;

        Ok(NotificationDefinition {
            name: self.name,
            scope: self.scope,
            trigger: self.trigger,
            backends: self.backends,
            templates: self.templates,
            filter_scope: self.filter_scope,
            context_builder: self.context_builder,
        })
    }
}

/// Declarative form of a definition, as read from the notifications file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub name: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub trigger: Trigger,
    pub backends: Vec<String>,
    pub templates: TemplateMap,
}

impl TryFrom<NotificationSpec> for NotificationDefinition {
    type Error = DefinitionError;

    fn try_from(spec: NotificationSpec) -> Result<Self, Self::Error> {
        NotificationDefinition::builder(spec.name)
            .scope(spec.scope)
            .trigger(spec.trigger)
            .backends(spec.backends)
            .templates(spec.templates)
            .build()
    }
}
