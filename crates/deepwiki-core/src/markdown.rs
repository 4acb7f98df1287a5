//! Markdown heading utilities.
//!
//! ATX headings only (`#` through `######`), with optional explicit
//! anchors (`## Install {#setup}`). Headings inside fenced code blocks
//! are ignored.

use std::sync::LazyLock;

use regex::Regex;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6})\s+(.+?)(?:\s+\{#([^}]+)\})?\s*$").expect("valid heading regex")
});

/// A heading and the byte range of its line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub title: String,
    /// Explicit `{#id}` anchor, if any.
    pub anchor: Option<String>,
    /// Offset of the first byte of the heading line.
    pub line_start: usize,
    /// Offset just past the heading line, including its newline.
    pub line_end: usize,
}

impl Heading {
    /// The explicit anchor, or a slug of the title when there is no
    /// anchor or it is blank.
    pub fn id(&self) -> String {
        match self.anchor.as_deref().map(str::trim) {
            Some(anchor) if !anchor.is_empty() => anchor.to_string(),
            _ => slugify(&self.title),
        }
    }
}

pub fn extract_headings(text: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut fence: Option<&str> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim_start();

        if let Some(marker) = fence {
            if trimmed.starts_with(marker) {
                fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            fence = Some("```");
            continue;
        }
        if trimmed.starts_with("~~~") {
            fence = Some("~~~");
            continue;
        }

        let Some(caps) = HEADING_RE.captures(content) else {
            continue;
        };
        let title = caps[2].trim().trim_end_matches('#').trim_end().to_string();
        if title.is_empty() {
            continue;
        }
        headings.push(Heading {
            level: caps[1].len() as u8,
            title,
            anchor: caps.get(3).map(|m| m.as_str().to_string()),
            line_start,
            line_end: offset,
        });
    }

    headings
}

/// Lower-case, strip punctuation, and hyphenate whitespace.
///
/// ```rust
/// use deepwiki_core::markdown::slugify;
///
/// assert_eq!(slugify("Getting Started!"), "getting-started");
/// assert_eq!(slugify("  API -- v2  "), "api-v2");
/// ```
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

/// Markdown bullet list of headings up to `max_level`.
pub fn toc_markdown(headings: &[Heading], max_level: u8) -> String {
    headings
        .iter()
        .filter(|h| h.level <= max_level)
        .map(|h| {
            format!(
                "{}- [{}](#{})",
                "  ".repeat(h.level.saturating_sub(1) as usize),
                h.title,
                h.id()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_levels_titles_and_anchors() {
        let text = "# Widgets\n\nIntro\n\n## Install {#setup}\nSteps\n### Linux ##\n";
        let h = extract_headings(text);
        assert_eq!(h.len(), 3);
        assert_eq!((h[0].level, h[0].title.as_str()), (1, "Widgets"));
        assert_eq!(h[1].anchor.as_deref(), Some("setup"));
        assert_eq!(h[1].id(), "setup");
        assert_eq!(h[2].title, "Linux");
        assert_eq!(&text[h[1].line_start..h[1].line_end], "## Install {#setup}\n");
    }

    #[test]
    fn ignores_headings_in_fenced_code() {
        let text = "# Real\n```sh\n# not a heading\n```\n~~~\n## also not\n~~~\n## Also real\n";
        let titles: Vec<String> = extract_headings(text).into_iter().map(|h| h.title).collect();
        assert_eq!(titles, vec!["Real", "Also real"]);
    }

    #[test]
    fn requires_space_after_hashes() {
        assert!(extract_headings("#hashtag\n####### seven\n").is_empty());
    }

    #[test]
    fn slug_edge_cases() {
        assert_eq!(slugify("Hello, World"), "hello-world");
        assert_eq!(slugify("snake_case name"), "snake_case-name");
        assert_eq!(slugify("!!!"), "section");
        assert_eq!(slugify("Überblick"), "überblick");
    }

    #[test]
    fn blank_anchor_falls_back_to_the_title() {
        let h = extract_headings("## Install {# }\n## !!!\n## Setup {#setup}\n");
        let ids: Vec<String> = h.iter().map(Heading::id).collect();
        assert_eq!(ids, vec!["install", "section", "setup"]);
    }

    #[test]
    fn toc_indents_by_level() {
        let h = extract_headings("# A\n## B\n#### Deep\n");
        assert_eq!(toc_markdown(&h, 3), "- [A](#a)\n  - [B](#b)");
    }
}
