//! Canonicalization of parsed line items and totals.
//!
//! Parsed items arrive partial: a receipt line has a gross total but no
//! net unit price, an invoice row may have the opposite. This module
//! derives the missing side from the VAT rate, normalizes rounding
//! (2 decimals for totals, 4 for unit prices), and reconciles the item
//! sum against the header total. Every correction is appended to the
//! candidate's review reasons; nothing is silently rewritten.

use crate::config::ExtractionConfig;
use crate::models::{CandidateDocument, LineItem};
use serde::Serialize;
use std::collections::BTreeMap;

/// Round to 2 decimal places, half away from zero. Used for all totals.
pub fn r2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Round to 4 decimal places. Used for unit prices, where 2 decimals
/// lose too much on fractional quantities.
pub fn r4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Net, VAT and gross totals for one VAT rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VatBreakdown {
    pub rate: f64,
    pub net: f64,
    pub vat: f64,
    pub gross: f64,
}

/// Normalize one item in place, returning the corrections applied.
///
/// Zero or negative quantity is coerced to 1. A VAT rate outside 0–100 %
/// is a misparse and is discarded before any arithmetic uses it (a rate
/// of -100 would otherwise divide by zero). When the VAT rate is known
/// the missing price side is derived from the other; both sides present
/// are left alone even if they disagree, the document-level
/// reconciliation will flag that.
pub fn canonicalize_item(item: &mut LineItem) -> Vec<String> {
    let mut reasons = Vec::new();

    if item.quantity <= 0.0 {
        reasons.push(format!(
            "item '{}': quantity {} coerced to 1",
            item.description, item.quantity
        ));
        item.quantity = 1.0;
    }

    if let Some(rate) = item.vat_rate {
        if !(0.0..=100.0).contains(&rate) {
            reasons.push(format!(
                "item '{}': vat rate {} out of range, discarded",
                item.description, rate
            ));
            item.vat_rate = None;
        }
    }

    let rate = item.vat_rate.unwrap_or(0.0);
    if item.vat_rate.is_none() {
        reasons.push(format!(
            "item '{}': vat rate missing, assumed 0 %",
            item.description
        ));
    }
    let factor = 1.0 + rate / 100.0;

    match (item.unit_price, item.line_total) {
        (Some(unit), None) => {
            item.line_total = Some(r2(unit * item.quantity * factor));
        }
        (None, Some(total)) => {
            item.unit_price = Some(r4(total / item.quantity / factor));
        }
        (None, None) => {
            reasons.push(format!(
                "item '{}': no price recognized",
                item.description
            ));
        }
        (Some(_), Some(_)) => {}
    }

    if let Some(unit) = item.unit_price {
        item.unit_price = Some(r4(unit));
    }
    if let Some(total) = item.line_total {
        item.line_total = Some(r2(total));
    }

    reasons
}

/// Gross sum over items that carry a line total.
pub fn items_gross_sum(items: &[LineItem]) -> f64 {
    r2(items.iter().filter_map(|i| i.line_total).sum())
}

/// True when the item sum matches the header total within tolerance.
/// The effective tolerance is the larger of the absolute and relative
/// bounds, so small receipts and large invoices both get a sane band.
pub fn sums_reconcile(total: f64, item_sum: f64, cfg: &ExtractionConfig) -> bool {
    let tolerance = cfg
        .sum_tolerance_abs
        .max(total.abs() * cfg.sum_tolerance_rel);
    (total - item_sum).abs() <= tolerance
}

/// Per-rate VAT breakdown over canonicalized items. Items without a rate
/// are grouped under 0 %.
pub fn vat_breakdown(items: &[LineItem]) -> Vec<VatBreakdown> {
    // BTreeMap keyed by rate in basis points keeps the output ordered
    // and avoids hashing f64.
    let mut by_rate: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for item in items {
        let Some(gross) = item.line_total else {
            continue;
        };
        let rate = item.vat_rate.unwrap_or(0.0);
        let net = gross / (1.0 + rate / 100.0);
        let entry = by_rate.entry((rate * 100.0).round() as i64).or_default();
        entry.0 += net;
        entry.1 += gross;
    }
    by_rate
        .into_iter()
        .map(|(rate_bp, (net, gross))| {
            let net = r2(net);
            let gross = r2(gross);
            VatBreakdown {
                rate: rate_bp as f64 / 100.0,
                net,
                vat: r2(gross - net),
                gross,
            }
        })
        .collect()
}

/// Canonicalize a whole candidate: fix every item, then reconcile the
/// header total against the item sum.
///
/// Never fails. A missing header total is backfilled from the item sum;
/// a mismatch outside tolerance stays as parsed and is recorded as a
/// review reason for the completeness gate.
pub fn canonicalize_document(doc: &mut CandidateDocument, cfg: &ExtractionConfig) {
    let mut reasons = Vec::new();
    for item in &mut doc.items {
        reasons.extend(canonicalize_item(item));
    }
    for reason in reasons {
        doc.push_reason(reason);
    }

    let item_sum = items_gross_sum(&doc.items);
    let items_priced = doc.items.iter().any(|i| i.line_total.is_some());

    match doc.total_with_vat {
        None if items_priced => {
            doc.total_with_vat = Some(item_sum);
            doc.push_reason("grand total derived from item sum");
        }
        Some(total) if items_priced && !sums_reconcile(total, item_sum, cfg) => {
            doc.push_reason(format!(
                "item sum {:.2} does not reconcile with total {:.2}",
                item_sum, total
            ));
        }
        _ => {}
    }

    if let Some(total) = doc.total_with_vat {
        doc.total_with_vat = Some(r2(total));
    }
}

/// True when the document's item sum reconciles with its header total.
/// Documents without priced items or without a total do not reconcile.
pub fn document_reconciles(doc: &CandidateDocument, cfg: &ExtractionConfig) -> bool {
    let Some(total) = doc.total_with_vat else {
        return false;
    };
    if !doc.items.iter().any(|i| i.line_total.is_some()) {
        return false;
    }
    sums_reconcile(total, items_gross_sum(&doc.items), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::candidate_from_text;

    fn item(qty: f64, unit: Option<f64>, total: Option<f64>, rate: Option<f64>) -> LineItem {
        LineItem {
            description: "test item".to_string(),
            quantity: qty,
            unit_price: unit,
            line_total: total,
            vat_rate: rate,
        }
    }

    #[test]
    fn derives_gross_from_net() {
        let mut i = item(2.0, Some(100.0), None, Some(21.0));
        let reasons = canonicalize_item(&mut i);
        assert_eq!(i.line_total, Some(242.0));
        assert!(reasons.is_empty());
    }

    #[test]
    fn derives_net_from_gross() {
        let mut i = item(2.0, None, Some(242.0), Some(21.0));
        canonicalize_item(&mut i);
        assert_eq!(i.unit_price, Some(100.0));
    }

    #[test]
    fn zero_quantity_coerced_with_reason() {
        let mut i = item(0.0, Some(50.0), None, Some(0.0));
        let reasons = canonicalize_item(&mut i);
        assert_eq!(i.quantity, 1.0);
        assert_eq!(i.line_total, Some(50.0));
        assert!(reasons.iter().any(|r| r.contains("coerced to 1")));
    }

    #[test]
    fn out_of_range_vat_rate_is_discarded() {
        // A -100 % rate would make the net/gross factor zero.
        let mut i = item(1.0, None, Some(300.0), Some(-100.0));
        let reasons = canonicalize_item(&mut i);
        assert_eq!(i.vat_rate, None);
        assert_eq!(i.unit_price, Some(300.0));
        assert!(i.unit_price.unwrap().is_finite());
        assert!(reasons.iter().any(|r| r.contains("out of range")));

        let mut j = item(1.0, Some(100.0), None, Some(850.0));
        canonicalize_item(&mut j);
        assert_eq!(j.vat_rate, None);
        assert_eq!(j.line_total, Some(100.0));
    }

    #[test]
    fn tolerance_is_max_of_abs_and_rel() {
        let cfg = ExtractionConfig::default();
        // Small document: the 2.00 absolute band applies.
        assert!(sums_reconcile(10.0, 11.5, &cfg));
        assert!(!sums_reconcile(10.0, 12.5, &cfg));
        // Large document: the 3 % relative band is wider.
        assert!(sums_reconcile(10_000.0, 10_250.0, &cfg));
        assert!(!sums_reconcile(10_000.0, 10_400.0, &cfg));
    }

    #[test]
    fn missing_total_backfilled_from_items() {
        let mut doc = candidate_from_text("nothing");
        doc.items = vec![
            item(1.0, None, Some(100.0), Some(21.0)),
            item(1.0, None, Some(21.5), Some(21.0)),
        ];
        let cfg = ExtractionConfig::default();
        canonicalize_document(&mut doc, &cfg);
        assert_eq!(doc.total_with_vat, Some(121.5));
        assert!(doc
            .review_reasons
            .iter()
            .any(|r| r.contains("derived from item sum")));
        assert!(document_reconciles(&doc, &cfg));
    }

    #[test]
    fn mismatch_recorded_not_rewritten() {
        let mut doc = candidate_from_text("nothing");
        doc.total_with_vat = Some(500.0);
        doc.items = vec![item(1.0, None, Some(100.0), Some(21.0))];
        let cfg = ExtractionConfig::default();
        canonicalize_document(&mut doc, &cfg);
        assert_eq!(doc.total_with_vat, Some(500.0));
        assert!(doc
            .review_reasons
            .iter()
            .any(|r| r.contains("does not reconcile")));
        assert!(!document_reconciles(&doc, &cfg));
    }

    #[test]
    fn breakdown_groups_by_rate() {
        let items = vec![
            item(1.0, None, Some(121.0), Some(21.0)),
            item(1.0, None, Some(121.0), Some(21.0)),
            item(1.0, None, Some(112.0), Some(12.0)),
        ];
        let b = vat_breakdown(&items);
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].rate, 12.0);
        assert_eq!(b[0].net, 100.0);
        assert_eq!(b[1].rate, 21.0);
        assert_eq!(b[1].gross, 242.0);
        assert_eq!(b[1].vat, 42.0);
    }
}
