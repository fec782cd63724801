//! Pipeline orchestrator: consumes intake events and drives each file to
//! a terminal outcome.
//!
//! Stages per file: fingerprint, dedupe, extract, parse, canonicalize,
//! enrich, gate, route. Any failure before the gate decision routes the
//! file to quarantine with the failure as the reason; nothing is ever
//! deleted. A forensic record is emitted for every terminal outcome
//! before it is reported.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::ai_fallback::{merge_extraction, AiAudit, AiClient};
use crate::canonical::{canonicalize_document, vat_breakdown};
use crate::config::{Config, ExtractionConfig};
use crate::extract::TextExtractor;
use crate::file_ops::safe_move;
use crate::forensic::{ForensicBundle, ForensicSink};
use crate::gate::{decide, GateDecision};
use crate::hash::{fingerprint_file, Fingerprint};
use crate::models::{CandidateDocument, DocType, IntakeEvent, RoutingOutcome};
use crate::parser::{self, build_candidate};
use crate::registry::{LookupError, RegistryClient, RegistryTransport};
use crate::storage::{FileStatus, StoragePort};

pub struct Processor<S: StoragePort, R: RegistryTransport> {
    storage: S,
    extractor: Arc<dyn TextExtractor>,
    registry: RegistryClient<R>,
    ai: Option<AiClient>,
    sink: ForensicSink,
    extraction: ExtractionConfig,
    output_dir: PathBuf,
    quarantine_dir: PathBuf,
    duplicate_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes its fingerprint from the in-flight set when the pipeline run
/// ends, on any path out of `process`.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .remove(&self.key);
    }
}

impl<S: StoragePort, R: RegistryTransport> Processor<S, R> {
    pub fn new(
        storage: S,
        extractor: Arc<dyn TextExtractor>,
        registry: RegistryClient<R>,
        ai: Option<AiClient>,
        config: &Config,
    ) -> Self {
        let output_dir = config.paths.output.clone();
        Self {
            storage,
            extractor,
            registry,
            ai,
            sink: ForensicSink::new(config.paths.forensic_log.clone()),
            extraction: config.extraction.clone(),
            quarantine_dir: output_dir.join(&config.paths.quarantine_dir_name),
            duplicate_dir: output_dir.join(&config.paths.duplicate_dir_name),
            output_dir,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Consumer loop over the intake channel.
    pub async fn run(&self, mut rx: mpsc::Receiver<IntakeEvent>) -> Result<()> {
        while let Some(event) = rx.recv().await {
            let path = event.path.clone();
            match self.process(event).await {
                Ok(outcome) => {
                    tracing::info!(path = %path.display(), ?outcome, "file processed");
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "pipeline failure");
                }
            }
        }
        Ok(())
    }

    /// Drive one file to its terminal outcome. Events carrying content
    /// that is already in flight wait for that run to finish, then
    /// proceed themselves (normally straight into the duplicate path);
    /// no event is ever dropped.
    pub async fn process(&self, event: IntakeEvent) -> Result<RoutingOutcome> {
        let original_name = event
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let fingerprint = match fingerprint_file(&event.path) {
            Ok(fp) => fp,
            Err(err) => {
                let outcome = self
                    .quarantine(
                        &event.path,
                        &original_name,
                        None,
                        "",
                        vec![format!("failed to read file: {}", err)],
                        None,
                        None,
                    )
                    .await?;
                return Ok(outcome);
            }
        };

        let _guard = loop {
            {
                let mut set = self.in_flight.lock().expect("in-flight set poisoned");
                if set.insert(fingerprint.0.clone()) {
                    break InFlightGuard {
                        set: &self.in_flight,
                        key: fingerprint.0.clone(),
                    };
                }
            }
            // Same content is being processed right now; once it reaches
            // a terminal state this event runs and dedupes against it.
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        };

        // Content-level dedupe before any extraction work.
        if let Some(existing) = self.storage.find_by_fingerprint(&fingerprint).await? {
            let outcome = self
                .duplicate(&event.path, &original_name, &fingerprint, existing.id, None)
                .await?;
            return Ok(outcome);
        }

        let file_id = self
            .storage
            .record_file(
                &fingerprint,
                &original_name,
                &event.path,
                1,
                event.discovered_at,
            )
            .await?;

        let pages = match self.extractor.extract(&event.path).await {
            Ok(pages) if !pages.is_empty() => pages,
            Ok(_) => {
                let outcome = self
                    .quarantine(
                        &event.path,
                        &original_name,
                        Some(file_id),
                        &fingerprint.0,
                        vec!["no text extracted".to_string()],
                        None,
                        None,
                    )
                    .await?;
                return Ok(outcome);
            }
            Err(err) => {
                let outcome = self
                    .quarantine(
                        &event.path,
                        &original_name,
                        Some(file_id),
                        &fingerprint.0,
                        vec![format!("text extraction failed: {}", err)],
                        None,
                        None,
                    )
                    .await?;
                return Ok(outcome);
            }
        };

        let mut doc = build_candidate(pages);
        canonicalize_document(&mut doc, &self.extraction);
        self.apply_receipt_fallbacks(&mut doc, &fingerprint);

        let ai_audit = self.maybe_run_ai_fallback(&mut doc).await;

        // Business-key dedupe catches re-exports of the same document
        // from a different file (new scan, different resolution).
        if let (Some(tax_id), Some(doc_number), Some(issue_date)) =
            (&doc.supplier_tax_id, &doc.doc_number, doc.issue_date)
        {
            if let Some(original_id) = self
                .storage
                .find_by_business_key(tax_id, doc_number, &issue_date.to_string())
                .await?
            {
                self.storage
                    .mark_file(file_id, FileStatus::Duplicate, None, None)
                    .await?;
                let outcome = self
                    .duplicate(
                        &event.path,
                        &original_name,
                        &fingerprint,
                        original_id,
                        Some(&doc),
                    )
                    .await?;
                return Ok(outcome);
            }
        }

        let lookup = self.enrich(&doc).await;

        match decide(&doc, &lookup) {
            GateDecision::Commit { supplier } => {
                let document_id = match self.storage.commit_document(file_id, &doc, &supplier).await
                {
                    Ok(id) => id,
                    Err(err) => {
                        // Storage failure still leaves a forensic trace,
                        // then propagates.
                        self.sink.emit(&ForensicBundle::new(
                            original_name.clone(),
                            fingerprint.0.clone(),
                            RoutingOutcome::Quarantined {
                                reasons: vec![format!("storage commit failed: {}", err)],
                            },
                            doc.review_reasons.clone(),
                            crate::quality::summarize(
                                &doc.pages
                                    .iter()
                                    .map(|p| (p.text.clone(), p.quality))
                                    .collect::<Vec<_>>(),
                            ),
                            &doc.full_text(),
                        ));
                        return Err(err).context("Failed to commit document");
                    }
                };

                let dest_dir = self.commit_dir(&doc);
                let moved = safe_move(&event.path, &dest_dir, &original_name)?;
                self.storage
                    .mark_file(file_id, FileStatus::Committed, None, Some(&moved))
                    .await?;

                let outcome = RoutingOutcome::Committed { document_id };
                self.emit(&original_name, &fingerprint.0, &outcome, &doc, ai_audit);
                Ok(outcome)
            }
            GateDecision::Quarantine { reasons } => {
                for reason in &reasons {
                    doc.push_reason(reason.clone());
                }
                let outcome = self
                    .quarantine(
                        &event.path,
                        &original_name,
                        Some(file_id),
                        &fingerprint.0,
                        reasons,
                        Some(&doc),
                        ai_audit,
                    )
                    .await?;
                Ok(outcome)
            }
        }
    }

    /// Receipts routinely lack formal identifiers. Synthesize stable
    /// stand-ins so dedupe and the audit trail still work; the gate will
    /// hold back anything carrying a placeholder supplier id.
    fn apply_receipt_fallbacks(&self, doc: &mut CandidateDocument, fingerprint: &Fingerprint) {
        if doc.doc_type != DocType::Receipt {
            return;
        }
        if doc.supplier_tax_id.is_none() {
            if let Some(name) = parser::guess_supplier_name(&doc.full_text()) {
                doc.supplier_tax_id = Some(parser::pseudo_tax_id(&name));
                doc.push_reason(format!("supplier tax id synthesized from name '{}'", name));
            }
        }
        if doc.doc_number.is_none() {
            doc.doc_number = Some(parser::synthetic_doc_number(
                &fingerprint.0,
                doc.issue_date,
                doc.total_with_vat,
            ));
            doc.push_reason("document number synthesized".to_string());
        }
    }

    /// Run the model fallback when the offline parse came up short.
    /// Failures leave the candidate untouched apart from a review reason.
    async fn maybe_run_ai_fallback(&self, doc: &mut CandidateDocument) -> Option<AiAudit> {
        let client = self.ai.as_ref()?;
        if doc.confidence >= self.extraction.min_confidence {
            return None;
        }
        match client.extract(&doc.full_text()).await {
            Ok((extraction, audit)) => {
                merge_extraction(doc, &extraction);
                canonicalize_document(doc, &self.extraction);
                Some(audit)
            }
            Err(err) => {
                tracing::warn!(error = %err, "extraction fallback failed");
                doc.push_reason(format!("extraction fallback failed: {}", err));
                None
            }
        }
    }

    async fn enrich(
        &self,
        doc: &CandidateDocument,
    ) -> Result<Option<crate::models::SupplierRecord>, LookupError> {
        match &doc.supplier_tax_id {
            Some(tax_id) if !parser::is_pseudo_tax_id(tax_id) => {
                self.registry.lookup(tax_id).await
            }
            _ => Ok(None),
        }
    }

    fn commit_dir(&self, doc: &CandidateDocument) -> PathBuf {
        match doc.issue_date {
            Some(date) => self.output_dir.join(date.format("%Y/%m").to_string()),
            None => self.output_dir.join("undated"),
        }
    }

    async fn duplicate(
        &self,
        src: &Path,
        original_name: &str,
        fingerprint: &Fingerprint,
        original_id: i64,
        doc: Option<&CandidateDocument>,
    ) -> Result<RoutingOutcome> {
        // A waited-out event for the same path finds the file already
        // moved by the first run; the record is still written.
        if src.exists() {
            safe_move(src, &self.duplicate_dir, original_name)?;
        }
        let outcome = RoutingOutcome::Duplicate { original_id };
        match doc {
            Some(doc) => self.emit(original_name, &fingerprint.0, &outcome, doc, None),
            None => self.sink.emit(&ForensicBundle::new(
                original_name,
                fingerprint.0.clone(),
                outcome.clone(),
                vec![],
                Default::default(),
                "",
            )),
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn quarantine(
        &self,
        src: &Path,
        original_name: &str,
        file_id: Option<i64>,
        fingerprint: &str,
        reasons: Vec<String>,
        doc: Option<&CandidateDocument>,
        ai_audit: Option<AiAudit>,
    ) -> Result<RoutingOutcome> {
        // An unreadable or already-vanished source cannot be moved; the
        // quarantine record still gets written.
        let moved = if src.exists() {
            Some(safe_move(src, &self.quarantine_dir, original_name)?)
        } else {
            None
        };
        if let Some(file_id) = file_id {
            self.storage
                .mark_file(
                    file_id,
                    FileStatus::Quarantined,
                    Some(&reasons.join("; ")),
                    moved.as_deref(),
                )
                .await?;
        }

        let outcome = RoutingOutcome::Quarantined {
            reasons: reasons.clone(),
        };
        match doc {
            Some(doc) => {
                self.sink.emit(
                    &ForensicBundle::new(
                        original_name,
                        fingerprint,
                        outcome.clone(),
                        doc.review_reasons.clone(),
                        crate::quality::summarize(
                            &doc.pages
                                .iter()
                                .map(|p| (p.text.clone(), p.quality))
                                .collect::<Vec<_>>(),
                        ),
                        &doc.full_text(),
                    )
                    .with_vat_breakdown(vat_breakdown(&doc.items))
                    .with_ai_audit(ai_audit),
                );
            }
            None => self.sink.emit(&ForensicBundle::new(
                original_name,
                fingerprint,
                outcome.clone(),
                reasons,
                Default::default(),
                "",
            )),
        }
        Ok(outcome)
    }

    fn emit(
        &self,
        original_name: &str,
        fingerprint: &str,
        outcome: &RoutingOutcome,
        doc: &CandidateDocument,
        ai_audit: Option<AiAudit>,
    ) {
        self.sink.emit(
            &ForensicBundle::new(
                original_name,
                fingerprint,
                outcome.clone(),
                doc.review_reasons.clone(),
                crate::quality::summarize(
                    &doc.pages
                        .iter()
                        .map(|p| (p.text.clone(), p.quality))
                        .collect::<Vec<_>>(),
                ),
                &doc.full_text(),
            )
            .with_vat_breakdown(vat_breakdown(&doc.items))
            .with_ai_audit(ai_audit),
        );
    }
}
