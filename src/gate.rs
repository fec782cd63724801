//! Completeness gate: the single place that decides commit vs quarantine.
//!
//! Pure function over the canonicalized candidate and the supplier lookup
//! result. Policy is strict: a document only reaches production storage
//! with a verified, fully populated supplier record and all header fields
//! present. There is no best-effort route; anything less goes to
//! quarantine for manual review. A reconciliation mismatch on its own is
//! a review reason, not a quarantine cause.

use crate::models::{CandidateDocument, SupplierRecord};
use crate::parser::is_pseudo_tax_id;
use crate::registry::LookupError;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Candidate may be committed, attributed to this supplier.
    Commit { supplier: SupplierRecord },
    /// Candidate must be routed to quarantine.
    Quarantine { reasons: Vec<String> },
}

/// Decide the route for a canonicalized candidate.
///
/// All failing conditions are collected, not short-circuited, so the
/// quarantine record names everything an operator has to fix.
pub fn decide(
    doc: &CandidateDocument,
    lookup: &Result<Option<SupplierRecord>, LookupError>,
) -> GateDecision {
    let mut reasons = Vec::new();

    match &doc.supplier_tax_id {
        None => reasons.push("supplier tax id missing".to_string()),
        Some(tax_id) if is_pseudo_tax_id(tax_id) => {
            // Synthetic ids identify a file, not a legal entity.
            reasons.push(format!("supplier tax id {} is a placeholder", tax_id));
        }
        Some(_) => {}
    }

    let supplier = match lookup {
        Err(err) => {
            reasons.push(format!("supplier lookup failed: {}", err));
            None
        }
        Ok(None) => {
            reasons.push("supplier not found in registry".to_string());
            None
        }
        Ok(Some(supplier)) => {
            if !supplier.is_complete() {
                for (field, present) in [
                    ("name", supplier.name.as_deref().is_some_and(|s| !s.trim().is_empty())),
                    ("address", supplier.address.as_deref().is_some_and(|s| !s.trim().is_empty())),
                    ("legal form", supplier.legal_form.as_deref().is_some_and(|s| !s.trim().is_empty())),
                    ("vat payer flag", supplier.vat_payer.is_some()),
                ] {
                    if !present {
                        reasons.push(format!("supplier record incomplete: {} missing", field));
                    }
                }
            }
            Some(supplier)
        }
    };

    if doc.doc_number.is_none() {
        reasons.push("document number missing".to_string());
    }
    if doc.issue_date.is_none() {
        reasons.push("issue date missing".to_string());
    }
    if doc.total_with_vat.is_none() {
        reasons.push("grand total missing".to_string());
    }
    if doc.items.is_empty() {
        reasons.push("no line items".to_string());
    }

    if !reasons.is_empty() {
        return GateDecision::Quarantine { reasons };
    }

    // reasons is empty, so the lookup returned a complete supplier.
    GateDecision::Commit {
        supplier: supplier.cloned().expect("complete lookup"),
    }
}

impl GateDecision {
    pub fn is_commit(&self) -> bool {
        matches!(self, GateDecision::Commit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use crate::models::DocType;

    fn supplier() -> SupplierRecord {
        SupplierRecord {
            tax_id: "25063677".to_string(),
            name: Some("Rohlik.cz s.r.o.".to_string()),
            address: Some("Sokolovská 100, Praha".to_string()),
            legal_form: Some("s.r.o.".to_string()),
            vat_payer: Some(true),
            synced_at: Utc::now(),
        }
    }

    fn complete_doc() -> CandidateDocument {
        CandidateDocument {
            pages: vec![],
            doc_type: DocType::Invoice,
            supplier_tax_id: Some("25063677".to_string()),
            doc_number: Some("2024-0042".to_string()),
            bank_account: None,
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 12),
            total_with_vat: Some(121.0),
            currency: "CZK".to_string(),
            items: vec![crate::models::LineItem {
                description: "zboží".to_string(),
                quantity: 1.0,
                unit_price: Some(100.0),
                line_total: Some(121.0),
                vat_rate: Some(21.0),
            }],
            review_reasons: vec![],
            confidence: 0.9,
            text_quality: 0.8,
        }
    }

    #[test]
    fn complete_candidate_with_verified_supplier_commits() {
        let d = decide(&complete_doc(), &Ok(Some(supplier())));
        assert!(d.is_commit());
    }

    #[test]
    fn pseudo_tax_id_quarantines_even_with_complete_supplier() {
        let mut doc = complete_doc();
        doc.supplier_tax_id = Some("NOICO-abc1234567".to_string());
        let d = decide(&doc, &Ok(Some(supplier())));
        match d {
            GateDecision::Quarantine { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("placeholder")));
            }
            _ => panic!("expected quarantine"),
        }
    }

    #[test]
    fn lookup_failure_quarantines() {
        let d = decide(
            &complete_doc(),
            &Err(LookupError::Transport("timed out".to_string())),
        );
        assert!(!d.is_commit());
    }

    #[test]
    fn registry_not_found_quarantines() {
        let d = decide(&complete_doc(), &Ok(None));
        assert!(!d.is_commit());
    }

    #[test]
    fn each_missing_supplier_field_quarantines() {
        for strip in 0..4 {
            let mut s = supplier();
            match strip {
                0 => s.name = None,
                1 => s.address = Some("  ".to_string()),
                2 => s.legal_form = None,
                _ => s.vat_payer = None,
            }
            let d = decide(&complete_doc(), &Ok(Some(s)));
            assert!(!d.is_commit(), "stripped field {} must quarantine", strip);
        }
    }

    #[test]
    fn missing_header_fields_collect_reasons() {
        let mut doc = complete_doc();
        doc.doc_number = None;
        doc.total_with_vat = None;
        doc.items.clear();
        match decide(&doc, &Ok(Some(supplier()))) {
            GateDecision::Quarantine { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("document number")));
                assert!(reasons.iter().any(|r| r.contains("grand total")));
                assert!(reasons.iter().any(|r| r.contains("line items")));
            }
            _ => panic!("expected quarantine"),
        }
    }

    #[test]
    fn review_reasons_alone_do_not_quarantine() {
        let mut doc = complete_doc();
        doc.push_reason("item sum 100.00 does not reconcile with total 121.00");
        assert!(decide(&doc, &Ok(Some(supplier()))).is_commit());
    }
}
