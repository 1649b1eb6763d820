//! Prompt rendering for the fix-generation tool.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::json;

use crate::source::WorkItem;

const TEMPLATE_NAME: &str = "fix";

/// Renders the configured handlebars prompt for an item.
///
/// Available variables: `number`, `title`, `repository`, `labels`.
pub struct PromptRenderer {
    templates: Handlebars<'static>,
}

impl PromptRenderer {
    /// Compile `template`.
    pub fn new(template: &str) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        // Prompts are plain text, not HTML
        templates.register_escape_fn(handlebars::no_escape);
        templates
            .register_template_string(TEMPLATE_NAME, template)
            .context("Invalid prompt template")?;
        Ok(Self { templates })
    }

    pub fn render(&self, item: &WorkItem) -> Result<String> {
        let data = json!({
            "number": item.id,
            "title": item.title,
            "repository": item.repository,
            "labels": item.labels.iter().collect::<Vec<_>>(),
        });
        self.templates
            .render(TEMPLATE_NAME, &data)
            .context("Failed to render prompt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_default_style_prompt() {
        let renderer = PromptRenderer::new(
            "Please fix GitHub issue #{{number}}: {{title}}. Run any necessary tests to verify your fix.",
        )
        .unwrap();
        let item = WorkItem::new("api", 17, "Parser drops <tags> & quotes");

        assert_eq!(
            renderer.render(&item).unwrap(),
            "Please fix GitHub issue #17: Parser drops <tags> & quotes. Run any necessary tests to verify your fix."
        );
    }

    #[test]
    fn test_render_with_labels() {
        let renderer =
            PromptRenderer::new("{{repository}}#{{number}} [{{#each labels}}{{this}};{{/each}}]")
                .unwrap();
        let item = WorkItem::new("api", 3, "x").with_label("bug").with_label("p1");
        assert_eq!(renderer.render(&item).unwrap(), "api#3 [bug;p1;]");
    }

    #[test]
    fn test_unknown_variable_fails_in_strict_mode() {
        let renderer = PromptRenderer::new("{{body}}").unwrap();
        assert!(renderer.render(&WorkItem::new("api", 1, "x")).is_err());
    }

    #[test]
    fn test_invalid_template_rejected() {
        assert!(PromptRenderer::new("{{#if number}}unclosed").is_err());
    }
}
