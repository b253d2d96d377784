// Rendering: template identifier + render context -> content
//
// `TeraRenderer` renders Tera templates. Variables missing from the render
// context fail the render, and templates whose id ends in `.html`, `.htm` or
// `.xml` escape every interpolated value.

use crate::errors::RenderError;
use crate::models::RenderContext;
use async_trait::async_trait;
use std::error::Error as StdError;
use std::path::Path;
use tera::Tera;
use tracing::{debug, info, instrument};

const AUTOESCAPE_SUFFIXES: [&str; 3] = [".html", ".htm", ".xml"];

/// Renderer turns a template identifier and a render context into content
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, template_id: &str, context: &RenderContext) -> Result<String, RenderError>;
}

/// Renderer over a set of Tera templates
#[derive(Debug, Clone)]
pub struct TeraRenderer {
    tera: Tera,
}

impl Default for TeraRenderer {
    fn default() -> Self {
        Self { tera: engine() }
    }
}

fn engine() -> Tera {
    let mut tera = Tera::default();
    tera.autoescape_on(AUTOESCAPE_SUFFIXES.to_vec());
    tera
}

impl TeraRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a renderer from `(id, body)` pairs
    pub fn from_templates<I, K, V>(templates: I) -> Result<Self, RenderError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tera = engine();
        tera.add_raw_templates(templates)
            .map_err(|e| RenderError::LoadFailed(error_chain(&e)))?;
        Ok(Self { tera })
    }

    /// Load every file under `dir`; a template's id is its path relative to
    /// `dir`, with `/` separators
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, RenderError> {
        let root = dir.as_ref();
        if !root.is_dir() {
            return Err(RenderError::LoadFailed(format!(
                "{}: not a directory",
                root.display()
            )));
        }

        let glob = format!("{}/**/*", root.display());
        let mut tera = Tera::new(&glob).map_err(|e| RenderError::LoadFailed(error_chain(&e)))?;
        tera.autoescape_on(AUTOESCAPE_SUFFIXES.to_vec());

        let renderer = Self { tera };
        info!(count = renderer.len(), "Templates loaded");
        Ok(renderer)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tera.get_template_names().any(|name| name == id)
    }

    pub fn len(&self) -> usize {
        self.tera.get_template_names().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Renderer for TeraRenderer {
    #[instrument(skip(self, context), fields(template_id = %template_id))]
    async fn render(&self, template_id: &str, context: &RenderContext) -> Result<String, RenderError> {
        if !self.contains(template_id) {
            return Err(RenderError::TemplateNotFound(template_id.to_string()));
        }

        let failed = |e: tera::Error| RenderError::Failed {
            template_id: template_id.to_string(),
            reason: error_chain(&e),
        };
        let context = tera::Context::from_serialize(context).map_err(failed)?;
        let rendered = self.tera.render(template_id, &context).map_err(failed)?;

        debug!(len = rendered.len(), "Template rendered");
        Ok(rendered)
    }
}

/// Tera keeps the useful part of a failure (the undefined variable, the
/// parse position) in the source chain
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::fs;

    fn context(value: Value) -> RenderContext {
        value.as_object().cloned().unwrap()
    }

    fn renderer(id: &str, body: &str) -> TeraRenderer {
        TeraRenderer::from_templates([(id, body)]).unwrap()
    }

    #[tokio::test]
    async fn test_render_nested_values() {
        let renderer = renderer(
            "welcome.txt",
            "Hi {{ recipient.name }}, order #{{ order.id }} ({{ order.items.0 }})",
        );
        let ctx = context(json!({
            "recipient": {"id": "u1", "name": "Alice"},
            "order": {"id": 42, "items": ["book"]}
        }));

        let rendered = renderer.render("welcome.txt", &ctx).await.unwrap();
        assert_eq!(rendered, "Hi Alice, order #42 (book)");
    }

    #[tokio::test]
    async fn test_html_templates_escape_values() {
        let renderer = renderer("welcome.html", "<p>Welcome, {{ recipient.name }}!</p>");
        let ctx = context(json!({"recipient": {"name": "<script>alert(1)</script>"}}));

        let rendered = renderer.render("welcome.html", &ctx).await.unwrap();
        assert!(!rendered.contains("<script>"));
        assert!(rendered.starts_with("<p>Welcome, &lt;script&gt;alert(1)&lt;"));
    }

    #[tokio::test]
    async fn test_text_templates_are_not_escaped() {
        let renderer = renderer("note.txt", "{{ a }}");
        let rendered = renderer
            .render("note.txt", &context(json!({"a": "<b>&"})))
            .await
            .unwrap();
        assert_eq!(rendered, "<b>&");
    }

    #[tokio::test]
    async fn test_undefined_variable_fails_render() {
        let renderer = renderer("t", "{{ a }} {{ missing }}");
        let err = renderer
            .render("t", &context(json!({"a": 1})))
            .await
            .unwrap_err();
        match err {
            RenderError::Failed { template_id, reason } => {
                assert_eq!(template_id, "t");
                assert!(reason.contains("missing"), "reason was {reason}");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let renderer = TeraRenderer::new();
        let err = renderer.render("nope", &RenderContext::new()).await.unwrap_err();
        assert!(matches!(err, RenderError::TemplateNotFound(_)));
    }

    #[test]
    fn test_invalid_template_is_rejected_at_load() {
        let result = TeraRenderer::from_templates([("t", "{{ unclosed")]);
        assert!(matches!(result, Err(RenderError::LoadFailed(_))));
    }

    #[test]
    fn test_from_dir_uses_relative_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("email")).unwrap();
        fs::write(dir.path().join("welcome.txt"), "hello {{ recipient.id }}").unwrap();
        fs::write(dir.path().join("email").join("welcome.html"), "<p>hi</p>").unwrap();

        let renderer = TeraRenderer::from_dir(dir.path()).unwrap();
        assert_eq!(renderer.len(), 2);
        assert!(renderer.contains("welcome.txt"));
        assert!(renderer.contains("email/welcome.html"));
    }

    #[test]
    fn test_from_missing_dir_fails() {
        let result = TeraRenderer::from_dir("/nonexistent/templates");
        assert!(matches!(result, Err(RenderError::LoadFailed(_))));
    }
}
