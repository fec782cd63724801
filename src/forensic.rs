//! Forensic trail: one JSONL record per terminal routing outcome.
//!
//! The record is evidence for later review: what came in, what was
//! decided, and why. It carries a capped excerpt of the text, never the
//! full document body and never request payloads. Emission must not take
//! the pipeline down, so write failures are logged and swallowed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::ai_fallback::AiAudit;
use crate::canonical::VatBreakdown;
use crate::models::{RoutingOutcome, TextMetrics};

const EXCERPT_MAX_CHARS: usize = 400;

#[derive(Debug, Serialize)]
pub struct ForensicBundle {
    pub correlation_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub original_name: String,
    pub fingerprint: String,
    #[serde(flatten)]
    pub outcome: RoutingOutcome,
    pub reasons: Vec<String>,
    pub metrics: TextMetrics,
    pub excerpt: String,
    /// Per-rate VAT totals of the document, empty for outcomes decided
    /// before line items existed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vat_breakdown: Vec<VatBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_audit: Option<AiAudit>,
}

impl ForensicBundle {
    pub fn new(
        original_name: impl Into<String>,
        fingerprint: impl Into<String>,
        outcome: RoutingOutcome,
        reasons: Vec<String>,
        metrics: TextMetrics,
        text: &str,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            original_name: original_name.into(),
            fingerprint: fingerprint.into(),
            outcome,
            reasons,
            metrics,
            excerpt: excerpt(text),
            vat_breakdown: Vec::new(),
            ai_audit: None,
        }
    }

    pub fn with_vat_breakdown(mut self, breakdown: Vec<VatBreakdown>) -> Self {
        self.vat_breakdown = breakdown;
        self
    }

    pub fn with_ai_audit(mut self, audit: Option<AiAudit>) -> Self {
        self.ai_audit = audit;
        self
    }
}

/// First 400 characters of the text, whitespace-collapsed.
pub fn excerpt(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(EXCERPT_MAX_CHARS)
        .collect()
}

/// Append-only JSONL sink.
pub struct ForensicSink {
    path: PathBuf,
}

impl ForensicSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Failure is logged, never propagated.
    pub fn emit(&self, bundle: &ForensicBundle) {
        if let Err(err) = self.try_emit(bundle) {
            tracing::error!(
                correlation_id = %bundle.correlation_id,
                error = %err,
                "failed to append forensic record"
            );
        }
    }

    fn try_emit(&self, bundle: &ForensicBundle) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(bundle)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
