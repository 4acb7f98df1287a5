//! Grounded answer generation.
//!
//! [`AnswerGenerator`] takes a question plus retrieved chunks and produces
//! an [`Answer`] whose sources are exactly the chunks the text relies on.
//!
//! In [`GenerationMode::Generative`] the model sees numbered context
//! blocks and must cite them as `[n]`. Only blocks that are actually cited
//! become sources, in first-citation order and with their text verbatim.
//! A reply that declares insufficiency, or cites nothing valid, is
//! replaced by the fixed insufficient-context response, so an answer is
//! never returned without grounding.
//!
//! [`GenerationMode::RetrievalOnly`] skips the model and returns the
//! relevant chunks themselves.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Provenance, ScoredChunk};

/// Response text when the indexed content cannot support an answer.
pub const INSUFFICIENT_CONTEXT: &str =
    "I could not find enough information in this repository's indexed documentation to answer that question.";

/// Token the model is told to emit when the context is insufficient.
pub const INSUFFICIENT_MARKER: &str = "INSUFFICIENT_CONTEXT";

/// Default minimum similarity for a chunk to count as relevant.
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.25;

const SYSTEM_PROMPT: &str = "You answer questions about a software repository using only the \
numbered context blocks you are given. Cite every claim with the number of the block it comes \
from, like [1] or [2]. Do not use outside knowledge. If the blocks do not contain the answer, \
reply with exactly INSUFFICIENT_CONTEXT and nothing else.";

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid citation regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Generative,
    RetrievalOnly,
}

/// A chat-style completion model.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete `prompt` under `system` instructions. Fails with
    /// `ModelUnavailable` when the model cannot be reached.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    /// Model-written text backed by cited sources.
    Grounded,
    /// Relevant chunks returned without synthesis.
    RetrievalOnly,
    /// Nothing relevant enough to answer from.
    InsufficientContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChunk {
    pub content: String,
    pub provenance: Provenance,
    pub score: f32,
}

impl SourceChunk {
    fn from_scored(hit: &ScoredChunk) -> Self {
        Self {
            content: hit.chunk.text.clone(),
            provenance: hit.provenance(),
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceChunk>,
    pub outcome: AnswerOutcome,
}

impl Answer {
    pub fn insufficient() -> Self {
        Self {
            text: INSUFFICIENT_CONTEXT.to_string(),
            sources: Vec::new(),
            outcome: AnswerOutcome::InsufficientContext,
        }
    }
}

pub struct AnswerGenerator {
    mode: GenerationMode,
    model: Option<Arc<dyn AnswerModel>>,
    threshold: f32,
}

impl AnswerGenerator {
    /// Generative mode requires a model.
    pub fn new(
        mode: GenerationMode,
        model: Option<Arc<dyn AnswerModel>>,
        threshold: f32,
    ) -> Result<Self> {
        if mode == GenerationMode::Generative && model.is_none() {
            return Err(Error::InvalidArgument(
                "generative mode needs an answer model; configure one or use retrieval_only".into(),
            ));
        }
        Ok(Self {
            mode,
            model,
            threshold,
        })
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub async fn generate(&self, question: &str, retrieved: &[ScoredChunk]) -> Result<Answer> {
        let relevant: Vec<&ScoredChunk> = retrieved
            .iter()
            .filter(|c| c.score >= self.threshold)
            .collect();
        if relevant.is_empty() {
            return Ok(Answer::insufficient());
        }

        let model = match (self.mode, &self.model) {
            (GenerationMode::Generative, Some(model)) => model,
            _ => return Ok(retrieval_only_answer(&relevant)),
        };

        let prompt = build_prompt(question, &relevant);
        let reply = model.complete(SYSTEM_PROMPT, &prompt).await?;
        let reply = reply.trim();
        if reply.contains(INSUFFICIENT_MARKER) {
            return Ok(Answer::insufficient());
        }

        let sources: Vec<SourceChunk> = parse_citations(reply)
            .into_iter()
            .filter(|n| (1..=relevant.len()).contains(n))
            .map(|n| SourceChunk::from_scored(relevant[n - 1]))
            .collect();
        if sources.is_empty() {
            return Ok(Answer::insufficient());
        }

        Ok(Answer {
            text: reply.to_string(),
            sources,
            outcome: AnswerOutcome::Grounded,
        })
    }
}

fn retrieval_only_answer(relevant: &[&ScoredChunk]) -> Answer {
    let mut text = String::from("Most relevant passages:\n");
    for (i, hit) in relevant.iter().enumerate() {
        text.push_str(&format!(
            "[{}] {} (bytes {}-{})\n",
            i + 1,
            hit.chunk.path,
            hit.chunk.start,
            hit.chunk.end
        ));
    }
    Answer {
        text,
        sources: relevant.iter().map(|h| SourceChunk::from_scored(h)).collect(),
        outcome: AnswerOutcome::RetrievalOnly,
    }
}

/// Render the user prompt with one numbered block per chunk.
pub fn build_prompt(question: &str, relevant: &[&ScoredChunk]) -> String {
    let mut prompt = String::from("Context:\n\n");
    for (i, hit) in relevant.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (source: {})\n{}\n\n",
            i + 1,
            hit.chunk.path,
            hit.chunk.text.trim()
        ));
    }
    prompt.push_str(&format!("Question: {}\n", question.trim()));
    prompt
}

/// Citation numbers in first-seen order, without duplicates.
pub fn parse_citations(text: &str) -> Vec<usize> {
    let mut seen = HashSet::new();
    CITATION_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .filter(|n| seen.insert(*n))
        .collect()
}
