//! Core data models used throughout docpipe.
//!
//! These types represent the files, candidate documents, and supplier
//! records that flow through the ingestion pipeline, plus the terminal
//! routing outcome of each intake event.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// A file discovered by the watcher, not yet claimed by the processor.
#[derive(Debug, Clone)]
pub struct IntakeEvent {
    pub path: PathBuf,
    pub discovered_at: DateTime<Utc>,
}

/// Where the text of a page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    /// Embedded text layer of a PDF. Materially higher fidelity than OCR.
    Embedded,
    /// Optical character recognition over a rendered page image.
    Ocr,
}

/// Raw text of one page plus its provenance and quality score.
#[derive(Debug, Clone)]
pub struct PageText {
    pub page_no: usize,
    pub text: String,
    pub source: PageSource,
    /// Quality score in [0, 1]; see [`crate::quality`].
    pub quality: f64,
}

/// One parsed line item. After canonicalization `unit_price` is always
/// VAT-exclusive and `line_total` is always VAT-inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    /// Unit price, net (without VAT). `None` until derivable.
    pub unit_price: Option<f64>,
    /// Line total, gross (with VAT). `None` until derivable.
    pub line_total: Option<f64>,
    /// VAT rate in percent (e.g. 21.0). `None` when the document omits it.
    pub vat_rate: Option<f64>,
}

/// Invoice vs receipt. Receipts get more lenient header requirements
/// (synthetic document numbers, pseudo supplier ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Invoice,
    Receipt,
}

/// A structured document candidate owned by one in-flight pipeline run.
///
/// `review_reasons` is an append-only audit trail: every correction,
/// ambiguity, and missing field is recorded here, never silently dropped.
#[derive(Debug, Clone)]
pub struct CandidateDocument {
    pub pages: Vec<PageText>,
    pub doc_type: DocType,
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub bank_account: Option<String>,
    pub issue_date: Option<NaiveDate>,
    /// Grand total with VAT, from the document header.
    pub total_with_vat: Option<f64>,
    pub currency: String,
    pub items: Vec<LineItem>,
    pub review_reasons: Vec<String>,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// Aggregated text quality over chosen page texts, in [0, 1].
    pub text_quality: f64,
}

impl CandidateDocument {
    pub fn push_reason(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.review_reasons.contains(&reason) {
            self.review_reasons.push(reason);
        }
    }

    /// Concatenated text of all pages, page order preserved.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Supplier identity fetched from the external registry.
///
/// Completeness is re-evaluated per lookup via [`SupplierRecord::is_complete`];
/// it is never cached as a boolean.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierRecord {
    /// Normalized tax identifier.
    pub tax_id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub legal_form: Option<String>,
    pub vat_payer: Option<bool>,
    pub synced_at: DateTime<Utc>,
}

impl SupplierRecord {
    /// A supplier is complete iff every identity field is populated.
    pub fn is_complete(&self) -> bool {
        !self.tax_id.trim().is_empty()
            && self.name.as_deref().is_some_and(|s| !s.trim().is_empty())
            && self
                .address
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
            && self
                .legal_form
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
            && self.vat_payer.is_some()
    }
}

/// Terminal state of one intake event. Closed so every consumer must
/// handle all three routes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// Document committed to production storage.
    Committed { document_id: i64 },
    /// Identical or business-key-equal document already stored.
    Duplicate { original_id: i64 },
    /// Routed to the quarantine directory for manual review.
    Quarantined { reasons: Vec<String> },
}

/// Aggregate text metrics attached to the forensic record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TextMetrics {
    pub pages: usize,
    pub pages_nonempty: usize,
    pub chars_total: usize,
    pub ratio_printable: f64,
    pub ratio_letters: f64,
    pub ratio_replacement: f64,
    pub quality: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn complete_supplier() -> SupplierRecord {
        SupplierRecord {
            tax_id: "25063677".to_string(),
            name: Some("Rohlik.cz s.r.o.".to_string()),
            address: Some("Sokolovská 100, Praha".to_string()),
            legal_form: Some("s.r.o.".to_string()),
            vat_payer: Some(true),
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn supplier_complete_when_all_fields_populated() {
        assert!(complete_supplier().is_complete());
    }

    #[test]
    fn supplier_incomplete_when_any_field_missing() {
        let mut s = complete_supplier();
        s.name = None;
        assert!(!s.is_complete());

        let mut s = complete_supplier();
        s.address = Some("  ".to_string());
        assert!(!s.is_complete());

        let mut s = complete_supplier();
        s.legal_form = None;
        assert!(!s.is_complete());

        let mut s = complete_supplier();
        s.vat_payer = None;
        assert!(!s.is_complete());
    }

    #[test]
    fn push_reason_deduplicates() {
        let mut doc = CandidateDocument {
            pages: vec![],
            doc_type: DocType::Invoice,
            supplier_tax_id: None,
            doc_number: None,
            bank_account: None,
            issue_date: None,
            total_with_vat: None,
            currency: "CZK".to_string(),
            items: vec![],
            review_reasons: vec![],
            confidence: 0.0,
            text_quality: 0.0,
        };
        doc.push_reason("missing total");
        doc.push_reason("missing total");
        assert_eq!(doc.review_reasons.len(), 1);
    }
}
