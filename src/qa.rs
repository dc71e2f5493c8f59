//! Retrieval-augmented question answering.
//!
//! Retrieves the best chunks for a question, packs them into a bounded
//! prompt, and asks the completion service for an answer. If the service
//! is unreachable, times out, or returns nothing, the answer degrades to the
//! most relevant excerpts with a notice and zero confidence.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::App;
use crate::completion::Completer;
use crate::config::{CompletionConfig, RetrievalConfig};
use crate::error::{Error, Result};
use crate::models::{IndexFilter, SearchHit};
use crate::search::{excerpt, SearchService};

const NO_CONTEXT_ANSWER: &str =
    "I couldn't find relevant information in the knowledge base to answer your question.";
const FALLBACK_NOTICE: &str =
    "The completion service is unavailable; showing the most relevant excerpts instead.";
const FALLBACK_EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    /// Generated by the completion service from retrieved context.
    Synthesized,
    /// Built from excerpts because the completion service failed.
    Fallback,
    /// Nothing relevant was retrieved.
    NoContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    /// Best supporting similarity in `[0, 1]`; 0 for fallback and no-context answers.
    pub confidence: f32,
    pub sources: Vec<SearchHit>,
    pub mode: AnswerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

pub struct QaSynthesizer {
    search: SearchService,
    completer: Arc<dyn Completer>,
    threshold: f32,
    max_context_chars: usize,
    timeout: Duration,
}

impl QaSynthesizer {
    pub fn new(
        search: SearchService,
        completer: Arc<dyn Completer>,
        retrieval: &RetrievalConfig,
        completion: &CompletionConfig,
    ) -> Self {
        Self {
            search,
            completer,
            threshold: retrieval.qa_threshold,
            max_context_chars: completion.max_context_chars,
            timeout: Duration::from_secs(completion.timeout_secs),
        }
    }

    /// Answer `question` from at most `context_limit` retrieved chunks.
    ///
    /// Retrieval failures are returned as errors; completion failures are not.
    pub async fn answer(&self, question: &str, context_limit: usize) -> Result<Answer> {
        let hits = self
            .search
            .search(question, context_limit, self.threshold, &IndexFilter::default())
            .await?;

        if hits.is_empty() {
            return Ok(Answer {
                question: question.to_string(),
                answer: NO_CONTEXT_ANSWER.to_string(),
                confidence: 0.0,
                sources: hits,
                mode: AnswerMode::NoContext,
                notice: None,
            });
        }

        let prompt = build_prompt(question, &hits, self.max_context_chars);
        let completion =
            match tokio::time::timeout(self.timeout, self.completer.complete(&prompt)).await {
                Ok(result) => result,
                Err(_) => Err(Error::CompletionUnavailable(format!(
                    "timed out after {:?}",
                    self.timeout
                ))),
            };

        match completion {
            Ok(text) if !text.trim().is_empty() => {
                let confidence = hits[0].score.clamp(0.0, 1.0);
                info!(completer = self.completer.name(), sources = hits.len(), confidence, "answered question");
                Ok(Answer {
                    question: question.to_string(),
                    answer: text.trim().to_string(),
                    confidence,
                    sources: hits,
                    mode: AnswerMode::Synthesized,
                    notice: None,
                })
            }
            other => {
                match other {
                    Err(e) => warn!(error = %e, "completion unavailable, using fallback"),
                    Ok(_) => warn!("completion returned an empty answer, using fallback"),
                }
                Ok(fallback_answer(question, hits))
            }
        }
    }
}

fn fallback_answer(question: &str, hits: Vec<SearchHit>) -> Answer {
    let best = &hits[0].text;
    let mut answer = format!(
        "Based on the available information: {}",
        excerpt(best, FALLBACK_EXCERPT_CHARS)
    );
    if best.chars().count() > FALLBACK_EXCERPT_CHARS {
        answer.push_str(" [Content truncated]");
    }
    Answer {
        question: question.to_string(),
        answer,
        confidence: 0.0,
        sources: hits,
        mode: AnswerMode::Fallback,
        notice: Some(FALLBACK_NOTICE.to_string()),
    }
}

/// Pack sources into the prompt until `max_context_chars` is reached. The
/// first source is always included, truncated if necessary.
pub fn build_prompt(question: &str, hits: &[SearchHit], max_context_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0;
    for hit in hits {
        let part = format!("Source: {}\n{}\n", hit.source, hit.text);
        let len = part.chars().count();
        if used + len > max_context_chars {
            if parts.is_empty() {
                parts.push(part.chars().take(max_context_chars).collect());
            }
            break;
        }
        used += len;
        parts.push(part);
    }
    let context = parts.join("\n---\n");

    format!(
        "Based on the following context from the knowledge base, please answer the question accurately and concisely.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Instructions:\n\
         - Only use information from the provided context\n\
         - If the context doesn't contain enough information, say so clearly\n\
         - Be specific and cite relevant details from the context\n\
         - Keep your answer concise and focused\n\n\
         Answer:",
        context, question
    )
}

/// CLI entry point for `kb ask`.
pub async fn run_ask(app: &App, question: &str, context_limit: usize) -> anyhow::Result<()> {
    let answer = app
        .qa
        .answer(question, context_limit)
        .await
        .context("question answering failed")?;

    if let Some(ref notice) = answer.notice {
        println!("note: {}", notice);
    }
    println!("{}", answer.answer);
    println!();
    println!("confidence: {:.2} ({:?})", answer.confidence, answer.mode);
    if !answer.sources.is_empty() {
        println!("sources:");
        for hit in &answer.sources {
            println!("  [{:.2}] {} #{}", hit.score, hit.source, hit.chunk_index);
        }
    }
    Ok(())
}
