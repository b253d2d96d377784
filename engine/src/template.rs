// Template resolution and render context building

use crate::errors::DispatchError;
use crate::models::{Context, Recipient, RenderContext, RECIPIENT_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Key of the fallback template used by backends with no entry of their own
pub const DEFAULT_TEMPLATE_KEY: &str = "default";

/// Mapping from backend name (or `"default"`) to template identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateMap(BTreeMap<String, String>);

impl TemplateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with only the fallback template
    pub fn with_default(template_id: impl Into<String>) -> Self {
        Self::new().with(DEFAULT_TEMPLATE_KEY, template_id)
    }

    pub fn with(mut self, key: impl Into<String>, template_id: impl Into<String>) -> Self {
        self.0.insert(key.into(), template_id.into());
        self
    }

    pub fn has_default(&self) -> bool {
        self.0.contains_key(DEFAULT_TEMPLATE_KEY)
    }

    /// Template for `backend`, falling back to the default entry
    pub fn resolve(&self, backend: &str) -> Option<&str> {
        self.0
            .get(backend)
            .or_else(|| self.0.get(DEFAULT_TEMPLATE_KEY))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for TemplateMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// ContextBuilder customizes the render context of a notification
///
/// Implementations are expected to start from [`default_render_context`] and
/// add or overwrite keys, so the recipient stays available to templates.
/// Closures with the matching signature implement the trait.
pub trait ContextBuilder: Send + Sync {
    fn build(
        &self,
        recipient: &Recipient,
        backend: &str,
        context: &Context,
    ) -> Result<RenderContext, DispatchError>;
}

impl<F> ContextBuilder for F
where
    F: Fn(&Recipient, &str, &Context) -> Result<RenderContext, DispatchError> + Send + Sync,
{
    fn build(
        &self,
        recipient: &Recipient,
        backend: &str,
        context: &Context,
    ) -> Result<RenderContext, DispatchError> {
        self(recipient, backend, context)
    }
}

/// Copy of `context` with the recipient injected under `"recipient"`
///
/// A `"recipient"` key already present in the context is overwritten.
pub fn default_render_context(recipient: &Recipient, context: &Context) -> RenderContext {
    let mut render_context = context.clone();
    render_context.insert(RECIPIENT_KEY.to_string(), recipient_value(recipient));
    render_context
}

fn recipient_value(recipient: &Recipient) -> Value {
    let mut fields = recipient.attributes.clone();
    fields.insert("id".to_string(), Value::String(recipient.id.clone()));
    Value::Object(fields)
}

/// Build the render context for one (recipient, backend) pair
pub fn build_render_context(
    notification: &str,
    builder: Option<&dyn ContextBuilder>,
    recipient: &Recipient,
    backend: &str,
    context: &Context,
) -> Result<RenderContext, DispatchError> {
    let Some(builder) = builder else {
        return Ok(default_render_context(recipient, context));
    };

    let render_context = builder.build(recipient, backend, context)?;
    if !render_context.contains_key(RECIPIENT_KEY) {
        warn!(
            notification = %notification,
            recipient_id = %recipient.id,
            backend = %backend,
            "Custom context builder dropped the recipient key"
        );
    }
    Ok(render_context)
}
