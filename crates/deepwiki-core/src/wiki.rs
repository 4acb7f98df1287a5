//! Wiki synthesis from a repository's indexed documents.
//!
//! The README's headings form the primary table of contents. Every other
//! document becomes one top-level node titled by its first `#` heading
//! (or its path), with its own headings nested beneath. Each ToC node gets
//! exactly one Markdown section, holding the text between its heading and
//! the next heading that is itself a node.
//!
//! Ids are slugs made unique with `-1`, `-2`, ... suffixes in traversal
//! order (README first, then documents by path), so the same input always
//! yields the same wiki.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::markdown::{extract_headings, slugify, Heading};
use crate::models::{Document, TocNode, WikiSection};

/// Deepest heading level that becomes its own ToC node.
pub const DEFAULT_MAX_LEVEL: u8 = 3;

const OVERVIEW: &str = "Overview";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedWiki {
    pub toc: Vec<TocNode>,
    pub sections: Vec<WikiSection>,
}

#[derive(Default)]
struct IdAllocator {
    used: HashSet<String>,
}

impl IdAllocator {
    fn alloc(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "section" } else { base };
        let mut candidate = base.to_string();
        let mut n = 0;
        while self.used.contains(&candidate) {
            n += 1;
            candidate = format!("{base}-{n}");
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

/// A node in document order, before nesting.
struct FlatNode {
    level: u8,
    id: String,
    title: String,
    path: String,
    body: String,
}

pub struct WikiSynthesizer {
    max_level: u8,
}

impl Default for WikiSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVEL)
    }
}

impl WikiSynthesizer {
    pub fn new(max_level: u8) -> Self {
        Self {
            max_level: max_level.clamp(1, 6),
        }
    }

    pub fn synthesize(&self, documents: &[Document]) -> Result<SynthesizedWiki> {
        if documents.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot build a wiki from an empty document set".into(),
            ));
        }

        let readme = documents.iter().find(|d| is_readme(&d.path));
        let mut others: Vec<&Document> = documents
            .iter()
            .filter(|d| readme.map_or(true, |r| r.id != d.id))
            .collect();
        others.sort_by(|a, b| a.path.cmp(&b.path));

        let mut ids = IdAllocator::default();
        let mut flat = Vec::new();
        if let Some(readme) = readme {
            self.readme_nodes(readme, &mut ids, &mut flat);
        }
        for doc in others {
            self.document_nodes(doc, &mut ids, &mut flat);
        }

        let sections = flat
            .iter()
            .map(|n| WikiSection {
                id: n.id.clone(),
                title: n.title.clone(),
                level: n.level,
                path: n.path.clone(),
                markdown: render_section(n, documents),
            })
            .collect();
        let toc = nest(
            flat.into_iter()
                .map(|n| TocNode {
                    id: n.id,
                    title: n.title,
                    level: n.level,
                    children: Vec::new(),
                })
                .collect(),
        );

        Ok(SynthesizedWiki { toc, sections })
    }

    fn headings(&self, text: &str) -> Vec<Heading> {
        extract_headings(text)
            .into_iter()
            .filter(|h| h.level <= self.max_level)
            .collect()
    }

    fn readme_nodes(&self, doc: &Document, ids: &mut IdAllocator, out: &mut Vec<FlatNode>) {
        let text = &doc.text;
        let headings = self.headings(text);
        let Some(first) = headings.first() else {
            out.push(FlatNode {
                level: 1,
                id: ids.alloc(&slugify(OVERVIEW)),
                title: OVERVIEW.to_string(),
                path: doc.path.clone(),
                body: text.clone(),
            });
            return;
        };

        let preamble = &text[..first.line_start];
        if !preamble.trim().is_empty() {
            out.push(FlatNode {
                level: 1,
                id: ids.alloc(&slugify(OVERVIEW)),
                title: OVERVIEW.to_string(),
                path: doc.path.clone(),
                body: preamble.to_string(),
            });
        }

        // Shift levels so the shallowest README heading sits at the top.
        let base = headings.iter().map(|h| h.level).min().unwrap_or(1);
        for (i, h) in headings.iter().enumerate() {
            let end = headings.get(i + 1).map_or(text.len(), |n| n.line_start);
            out.push(FlatNode {
                level: h.level - base + 1,
                id: ids.alloc(&h.id()),
                title: h.title.clone(),
                path: doc.path.clone(),
                body: text[h.line_end..end].to_string(),
            });
        }
    }

    fn document_nodes(&self, doc: &Document, ids: &mut IdAllocator, out: &mut Vec<FlatNode>) {
        let text = &doc.text;
        let headings = self.headings(text);
        let title_heading = headings.iter().position(|h| h.level == 1);
        let nested: Vec<&Heading> = headings
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != title_heading)
            .map(|(_, h)| h)
            .collect();

        let (title, base_id) = match title_heading {
            Some(i) => (headings[i].title.clone(), headings[i].id()),
            None => (doc.path.clone(), slugify(&doc.path.replace(['/', '.'], " "))),
        };
        let intro_end = nested.first().map_or(text.len(), |h| h.line_start);
        let intro_start = match title_heading {
            Some(i) if headings[i].line_end <= intro_end => headings[i].line_end,
            _ => 0,
        };
        out.push(FlatNode {
            level: 1,
            id: ids.alloc(&base_id),
            title,
            path: doc.path.clone(),
            body: text[intro_start..intro_end].to_string(),
        });

        for (i, h) in nested.iter().enumerate() {
            let end = nested.get(i + 1).map_or(text.len(), |n| n.line_start);
            out.push(FlatNode {
                level: h.level.max(2),
                id: ids.alloc(&h.id()),
                title: h.title.clone(),
                path: doc.path.clone(),
                body: text[h.line_end..end].to_string(),
            });
        }
    }
}

/// Convenience wrapper using the default heading depth.
pub fn synthesize(documents: &[Document]) -> Result<SynthesizedWiki> {
    WikiSynthesizer::default().synthesize(documents)
}

fn is_readme(path: &str) -> bool {
    !path.contains('/') && path.to_ascii_lowercase().starts_with("readme")
}

fn render_section(node: &FlatNode, documents: &[Document]) -> String {
    let mut md = format!("{} {}\n\n", "#".repeat(node.level.min(6) as usize), node.title);
    let body = node.body.trim();
    if !body.is_empty() {
        md.push_str(body);
        md.push_str("\n\n");
    }
    let url = documents
        .iter()
        .find(|d| d.path == node.path)
        .and_then(Document::url);
    match url {
        Some(url) => md.push_str(&format!("_Source: [{}]({})_\n", node.path, url)),
        None => md.push_str(&format!("_Source: {}_\n", node.path)),
    }
    md
}

/// Nest nodes in document order by level: each node becomes a child of
/// the nearest preceding node with a smaller level.
fn nest(nodes: Vec<TocNode>) -> Vec<TocNode> {
    fn attach(stack: &mut [TocNode], roots: &mut Vec<TocNode>, node: TocNode) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    let mut roots = Vec::new();
    let mut stack: Vec<TocNode> = Vec::new();
    for node in nodes {
        while stack.last().is_some_and(|top| top.level >= node.level) {
            if let Some(done) = stack.pop() {
                attach(&mut stack, &mut roots, done);
            }
        }
        stack.push(node);
    }
    while let Some(done) = stack.pop() {
        attach(&mut stack, &mut roots, done);
    }
    roots
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{Metadata, RepoRef};

    fn doc(path: &str, text: &str) -> Document {
        let repo = RepoRef::parse("acme/widgets").unwrap();
        Document::new(
            &repo,
            path,
            text.to_string(),
            Metadata::new(path).with("url", format!("https://github.com/acme/widgets/blob/main/{path}")),
            Utc::now(),
        )
    }

    fn ids(nodes: &[TocNode]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn readme_headings_form_the_tree() {
        let readme = doc(
            "README.md",
            "[![ci](badge)](ci)\n\n# Widgets\n\nA widget toolkit.\n\n## Install\n\nRun it.\n\n### Linux\n\napt\n\n## Usage\n\nUse it.\n",
        );
        let wiki = synthesize(&[readme]).unwrap();
        assert_eq!(ids(&wiki.toc), vec!["overview", "widgets"]);
        assert_eq!(ids(&wiki.toc[1].children), vec!["install", "usage"]);
        assert_eq!(ids(&wiki.toc[1].children[0].children), vec!["linux"]);
        assert_eq!(wiki.sections.len(), 5);

        let install = &wiki.sections[2];
        assert_eq!(install.id, "install");
        assert!(install.markdown.starts_with("## Install\n\nRun it."));
        assert!(!install.markdown.contains("apt"));
        assert!(install
            .markdown
            .ends_with("_Source: [README.md](https://github.com/acme/widgets/blob/main/README.md)_\n"));
    }

    #[test]
    fn readme_without_headings_is_single_overview() {
        let wiki = synthesize(&[doc("README.md", "Just some words.\n")]).unwrap();
        assert_eq!(wiki.toc.len(), 1);
        assert_eq!(wiki.toc[0].title, "Overview");
        assert!(wiki.toc[0].children.is_empty());
        assert_eq!(wiki.sections.len(), 1);
        assert!(wiki.sections[0].markdown.contains("Just some words."));
    }

    #[test]
    fn other_documents_become_top_level_nodes() {
        let docs = vec![
            doc("docs/guide.md", "# Guide\n\nHello.\n\n## Setup\n\nSteps.\n"),
            doc("README.md", "# Widgets\n\n## Setup\n\nReadme setup.\n"),
            doc("docs/faq.md", "No headings here.\n"),
        ];
        let wiki = synthesize(&docs).unwrap();
        assert_eq!(ids(&wiki.toc), vec!["widgets", "docs-faq-md", "guide"]);
        assert_eq!(wiki.toc[1].title, "docs/faq.md");
        // The guide's "Setup" collides with the README's and gets a suffix.
        assert_eq!(ids(&wiki.toc[2].children), vec!["setup-1"]);

        let guide = wiki.sections.iter().find(|s| s.id == "guide").unwrap();
        assert!(guide.markdown.starts_with("# Guide\n\nHello."));
        assert!(!guide.markdown.contains("Steps."));
    }

    #[test]
    fn every_toc_node_has_one_section() {
        let docs = vec![
            doc("README.md", "# A\n## B\n## B\n### C\n#### too deep\n"),
            doc("CONTRIBUTING.md", "# Contributing\n## B\n"),
        ];
        let wiki = synthesize(&docs).unwrap();
        let total: usize = wiki.toc.iter().map(TocNode::count).sum();
        assert_eq!(total, wiki.sections.len());
        let mut section_ids: Vec<&str> = wiki.sections.iter().map(|s| s.id.as_str()).collect();
        let before = section_ids.len();
        section_ids.sort();
        section_ids.dedup();
        assert_eq!(section_ids.len(), before, "ids must be unique");
        let c = wiki.sections.iter().find(|s| s.id == "c").unwrap();
        assert!(c.markdown.contains("too deep"));
    }

    #[test]
    fn punctuation_only_headings_get_section_ids() {
        let readme = doc("README.md", "# Widgets\n## !!!\nOne.\n## ???\nTwo.\n## {#}\n");
        let wiki = synthesize(&[readme]).unwrap();
        let section_ids: Vec<&str> = wiki.sections.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(section_ids, vec!["widgets", "section", "section-1", "section-2"]);
        assert_eq!(ids(&wiki.toc[0].children), vec!["section", "section-1", "section-2"]);
        assert!(wiki.sections[1].markdown.contains("One."));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let docs = vec![
            doc("README.md", "# W\n## Install\n"),
            doc("docs/b.md", "# B\n"),
            doc("docs/a.md", "# A\n## Install\n"),
        ];
        let a = synthesize(&docs).unwrap();
        let mut reversed = docs.clone();
        reversed.reverse();
        let b = synthesize(&reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_document_set_is_rejected() {
        assert!(synthesize(&[]).is_err());
    }
}
