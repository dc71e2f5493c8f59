//! Knowledge-base completeness assessment.
//!
//! For a topic and a list of required aspects, searches `"<topic> <aspect>"`
//! for each aspect and classifies coverage by the best score:
//!
//! | Best score | Coverage |
//! |------------|----------|
//! | ≥ `similarity_threshold` | `covered` |
//! | ≥ `partial_threshold` | `partial` |
//! | otherwise | `missing` |
//!
//! Completeness is the fraction of aspects that are not missing.

use anyhow::Context;
use serde::Serialize;
use tracing::debug;

use crate::app::App;
use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::models::{IndexFilter, SearchHit};
use crate::search::SearchService;

const EVIDENCE_PER_ASPECT: usize = 5;
const TOPIC_SAMPLE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Coverage {
    Covered,
    Partial,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct AspectCoverage {
    pub aspect: String,
    pub coverage: Coverage,
    pub best_score: f32,
    pub evidence: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub topic: String,
    /// Fraction of aspects not `missing`, in `[0, 1]`.
    pub completeness: f32,
    pub aspects: Vec<AspectCoverage>,
    /// Chunks relevant to the topic itself.
    pub topic_hits: usize,
    pub recommendations: Vec<String>,
    /// Common aspects for this kind of topic, offered when none were given.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggested_aspects: Vec<String>,
}

impl Assessment {
    pub fn aspects_with(&self, coverage: Coverage) -> Vec<&str> {
        self.aspects
            .iter()
            .filter(|a| a.coverage == coverage)
            .map(|a| a.aspect.as_str())
            .collect()
    }
}

pub struct CompletenessAssessor {
    search: SearchService,
    covered_threshold: f32,
    partial_threshold: f32,
}

impl CompletenessAssessor {
    pub fn new(search: SearchService, retrieval: &RetrievalConfig) -> Self {
        Self {
            search,
            covered_threshold: retrieval.similarity_threshold,
            partial_threshold: retrieval.partial_threshold,
        }
    }

    pub async fn assess(&self, topic: &str, required_aspects: &[String]) -> Result<Assessment> {
        let filter = IndexFilter::default();
        let topic_hits = self
            .search
            .search(topic, TOPIC_SAMPLE, self.partial_threshold, &filter)
            .await?
            .len();

        let mut aspects = Vec::with_capacity(required_aspects.len());
        for aspect in required_aspects {
            let query = format!("{} {}", topic, aspect);
            let evidence = self
                .search
                .search(&query, EVIDENCE_PER_ASPECT, self.partial_threshold, &filter)
                .await?;
            let best_score = evidence.first().map(|h| h.score).unwrap_or(0.0);
            let coverage = if evidence.is_empty() {
                Coverage::Missing
            } else if best_score >= self.covered_threshold {
                Coverage::Covered
            } else {
                Coverage::Partial
            };
            debug!(topic, aspect = %aspect, best_score, ?coverage, "assessed aspect");
            aspects.push(AspectCoverage {
                aspect: aspect.clone(),
                coverage,
                best_score,
                evidence,
            });
        }

        let completeness = if aspects.is_empty() {
            1.0
        } else {
            let present = aspects
                .iter()
                .filter(|a| a.coverage != Coverage::Missing)
                .count();
            present as f32 / aspects.len() as f32
        };

        let suggested_aspects = if required_aspects.is_empty() {
            suggested_aspects(topic)
        } else {
            Vec::new()
        };

        let mut assessment = Assessment {
            topic: topic.to_string(),
            completeness,
            aspects,
            topic_hits,
            recommendations: Vec::new(),
            suggested_aspects,
        };
        assessment.recommendations = recommendations(&assessment);
        Ok(assessment)
    }
}

/// Common aspects for a topic, picked by keywords in the topic.
pub fn suggested_aspects(topic: &str) -> Vec<String> {
    let lower = topic.to_lowercase();
    let aspects: &[&str] = if lower.contains("api") {
        &[
            "authentication",
            "endpoints",
            "parameters",
            "responses",
            "rate limiting",
            "error codes",
            "examples",
        ]
    } else if ["security", "auth", "encrypt"].iter().any(|w| lower.contains(w)) {
        &[
            "authentication",
            "authorization",
            "encryption",
            "vulnerabilities",
            "best practices",
            "compliance",
            "monitoring",
        ]
    } else {
        &[
            "definition",
            "examples",
            "best practices",
            "troubleshooting",
            "configuration",
            "installation",
            "usage",
            "limitations",
        ]
    };
    aspects.iter().map(|a| a.to_string()).collect()
}

fn recommendations(assessment: &Assessment) -> Vec<String> {
    let mut out = Vec::new();
    let topic = &assessment.topic;

    if assessment.topic_hits == 0 {
        out.push(format!("Add foundational documentation about {}", topic));
    } else if assessment.topic_hits < 3 {
        out.push(format!("Expand documentation coverage for {}", topic));
    }

    let missing = assessment.aspects_with(Coverage::Missing);
    if !missing.is_empty() {
        let first: Vec<&str> = missing.into_iter().take(3).collect();
        out.push(format!(
            "Consider adding information about: {}",
            first.join(", ")
        ));
    }

    let partial = assessment.aspects_with(Coverage::Partial);
    if !partial.is_empty() {
        out.push(format!("Deepen existing coverage of: {}", partial.join(", ")));
    }

    if assessment.topic_hits > 0 {
        out.push("Ensure existing documentation is up-to-date and comprehensive".to_string());
    }
    out.push("Consider adding practical examples and use cases".to_string());
    out
}

/// CLI entry point for `kb assess`.
pub async fn run_assess(app: &App, topic: &str, aspects: &[String]) -> anyhow::Result<()> {
    let assessment = app
        .assessor
        .assess(topic, aspects)
        .await
        .context("assessment failed")?;

    println!("assess \"{}\"", assessment.topic);
    println!("  completeness: {:.2}", assessment.completeness);
    println!("  topic matches: {}", assessment.topic_hits);
    for aspect in &assessment.aspects {
        println!(
            "  {:<8} {} (best {:.2})",
            format!("{:?}", aspect.coverage).to_lowercase(),
            aspect.aspect,
            aspect.best_score
        );
    }
    if !assessment.suggested_aspects.is_empty() {
        println!(
            "  suggested aspects: {}",
            assessment.suggested_aspects.join(", ")
        );
    }
    println!("recommendations:");
    for rec in &assessment.recommendations {
        println!("  - {}", rec);
    }
    Ok(())
}
