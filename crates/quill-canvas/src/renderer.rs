//! Content Rendering
//!
//! Turns element content into HTML fragments: markdown through
//! pulldown-cmark, code through syntect.

use pulldown_cmark::{html, Options, Parser};
use syntect::highlighting::ThemeSet;
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;

use crate::document::ElementKind;

/// Renderer for element content
pub struct ContentRenderer {
    /// Syntax highlighting syntax set
    syntax_set: SyntaxSet,
    /// Syntax highlighting theme set
    theme_set: ThemeSet,
    /// Default theme name
    theme_name: String,
}

impl ContentRenderer {
    /// Create a new renderer with default settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            theme_set: ThemeSet::load_defaults(),
            theme_name: "InspiredGitHub".to_string(),
        }
    }

    /// Set the syntax highlighting theme
    #[must_use]
    pub fn with_theme(mut self, theme_name: impl Into<String>) -> Self {
        self.theme_name = theme_name.into();
        self
    }

    /// Render markdown to HTML
    #[must_use]
    pub fn render_markdown(&self, markdown: &str) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_FOOTNOTES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);

        let parser = Parser::new_ext(markdown, options);
        let mut html_output = String::new();
        html::push_html(&mut html_output, parser);

        html_output
    }

    /// Render code with syntax highlighting
    #[must_use]
    pub fn render_code(&self, code: &str, language: &str) -> String {
        let syntax = self
            .syntax_set
            .find_syntax_by_extension(language)
            .or_else(|| self.syntax_set.find_syntax_by_token(language))
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());

        let Some(theme) = self
            .theme_set
            .themes
            .get(&self.theme_name)
            .or_else(|| self.theme_set.themes.values().next())
        else {
            return plain_code_block(code);
        };

        highlighted_html_for_string(code, &self.syntax_set, syntax, theme)
            .unwrap_or_else(|_| plain_code_block(code))
    }

    /// Render a chart specification as a preformatted block.
    ///
    /// Valid JSON is pretty-printed; anything else (e.g. a partially
    /// revealed spec) is shown verbatim.
    #[must_use]
    pub fn render_chart(&self, spec: &str) -> String {
        let body = serde_json::from_str::<serde_json::Value>(spec)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| spec.to_string());
        format!(r#"<pre class="chart"><code>{}</code></pre>"#, html_escape(&body))
    }

    /// Render content according to the element kind
    #[must_use]
    pub fn render(&self, kind: &ElementKind, content: &str) -> String {
        match kind {
            ElementKind::Document => self.render_markdown(content),
            ElementKind::Code { language } => self.render_code(content, language),
            ElementKind::Chart { .. } => self.render_chart(content),
        }
    }
}

impl Default for ContentRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContentRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRenderer")
            .field("theme_name", &self.theme_name)
            .finish_non_exhaustive()
    }
}

fn plain_code_block(code: &str) -> String {
    format!("<pre><code>{}</code></pre>", html_escape(code))
}

/// Escape HTML special characters
pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
