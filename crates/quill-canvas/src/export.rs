//! Export
//!
//! Serializes one version, or the whole cumulative document, to Markdown or
//! standalone HTML.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::delta_for_version;
use crate::document::{CanvasElement, ElementKind};
use crate::error::{Error, Result};
use crate::renderer::{html_escape, ContentRenderer};
use crate::versions::VersionStore;

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Markdown; code and charts are fenced
    #[default]
    Markdown,
    /// Standalone HTML document
    Html,
}

impl ExportFormat {
    /// File extension without the dot
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Html => "html",
        }
    }

    /// MIME type
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Markdown => "text/markdown; charset=utf-8",
            Self::Html => "text/html; charset=utf-8",
        }
    }
}

/// Which text of a version to export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    /// Only what the version added
    Delta,
    /// Full content as of the version
    #[default]
    Cumulative,
}

/// A rendered export, ready to be written or sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDocument {
    /// Element ID
    pub element_id: Uuid,
    /// Exported version
    pub version: u32,
    /// Output format
    pub format: ExportFormat,
    /// Exported text scope
    pub scope: ExportScope,
    /// Suggested file name
    pub file_name: String,
    /// MIME type
    pub content_type: String,
    /// File body
    pub body: String,
}

/// Builds [`ExportedDocument`]s from the version store
#[derive(Debug, Default)]
pub struct ExportAdapter {
    renderer: ContentRenderer,
}

impl ExportAdapter {
    /// Create an adapter with the default renderer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom renderer
    #[must_use]
    pub fn with_renderer(mut self, renderer: ContentRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Export one version
    pub fn export_version(
        &self,
        store: &VersionStore,
        element_id: Uuid,
        version: u32,
        scope: ExportScope,
        format: ExportFormat,
    ) -> Result<ExportedDocument> {
        let element = store.get_element(element_id)?;
        let target = store.active_version(element_id, version)?;

        let text = match scope {
            ExportScope::Cumulative => target.content,
            ExportScope::Delta => {
                let active: Vec<_> = element.active_versions().cloned().collect();
                delta_for_version(&active, version)
                    .map(|d| d.text)
                    .ok_or(Error::VersionNotFound {
                        element_id,
                        version,
                    })?
            }
        };
        Ok(self.build(&element, version, scope, &text, format))
    }

    /// Export the latest active version's full content
    pub fn export_all(
        &self,
        store: &VersionStore,
        element_id: Uuid,
        format: ExportFormat,
    ) -> Result<ExportedDocument> {
        let element = store.get_element(element_id)?;
        let latest = element
            .latest_active()
            .ok_or(Error::EmptyElement(element_id))?;
        let (version, content) = (latest.version, latest.content.clone());
        Ok(self.build(&element, version, ExportScope::Cumulative, &content, format))
    }

    fn build(
        &self,
        element: &CanvasElement,
        version: u32,
        scope: ExportScope,
        text: &str,
        format: ExportFormat,
    ) -> ExportedDocument {
        let body = match format {
            ExportFormat::Markdown => markdown_body(&element.kind, text),
            ExportFormat::Html => self.html_body(element, text),
        };
        ExportedDocument {
            element_id: element.id,
            version,
            format,
            scope,
            file_name: file_name(&element.title, version, scope, format),
            content_type: format.content_type().to_string(),
            body,
        }
    }

    fn html_body(&self, element: &CanvasElement, text: &str) -> String {
        let fragment = self.renderer.render(&element.kind, text);
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n</head>\n<body>\n<article class=\"canvas-{kind}\">\n{fragment}</article>\n</body>\n</html>\n",
            title = html_escape(&element.title),
            kind = element.kind.as_str(),
        )
    }
}

fn markdown_body(kind: &ElementKind, text: &str) -> String {
    match kind {
        ElementKind::Document => {
            let mut body = text.to_string();
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body
        }
        ElementKind::Code { language } => fenced(language, text),
        ElementKind::Chart { .. } => fenced("json", text),
    }
}

/// Fence long enough not to collide with backtick runs inside `text`
fn fenced(info: &str, text: &str) -> String {
    let longest = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest.max(2) + 1);
    let newline = if text.ends_with('\n') { "" } else { "\n" };
    format!("{fence}{info}\n{text}{newline}{fence}\n")
}

fn file_name(title: &str, version: u32, scope: ExportScope, format: ExportFormat) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "canvas" } else { slug };
    let suffix = match scope {
        ExportScope::Cumulative => "",
        ExportScope::Delta => "-delta",
    };
    format!("{slug}-v{version}{suffix}.{}", format.extension())
}
