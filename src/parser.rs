//! Pattern-rule field extraction over raw page text.
//!
//! Turns OCR/embedded text into header fields and raw line items.
//! Unresolved fields stay `None` — they are never defaulted to zero;
//! the canonicalizer and the completeness gate decide what to do with
//! the gaps.

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::{CandidateDocument, DocType, LineItem, PageSource, PageText};

/// Header fields plus raw items parsed from one page's text.
#[derive(Debug, Clone, Default)]
pub struct ParsedFields {
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub bank_account: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub total_with_vat: Option<f64>,
    pub currency: Option<String>,
    pub items: Vec<LineItem>,
}

static TAX_ID_LABELED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:IČO?|ICO|Tax\s*ID)\s*[:#]?\s*(\d{8})\b").unwrap());
static TAX_ID_BARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{8})\b").unwrap());

static DOC_NUMBER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)Č[ií]slo\s+faktury\s*[: ]\s*([\w-]+)").unwrap(),
        Regex::new(r"(?i)DAŇOVÝ\s+DOKLAD\s+č\.?\s*([\w-]+)").unwrap(),
        Regex::new(r"(?i)Invoice\s+(?:no|number)\.?\s*[: ]?\s*([\w-]+)").unwrap(),
        Regex::new(r"(?i)\bVS\s*[: ]\s*(\d{3,})\b").unwrap(),
    ]
});

static BANK_ACCOUNT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\bIBAN\s*[: ]\s*([A-Z]{2}\d{2}[A-Z0-9 ]{10,})").unwrap(),
        Regex::new(r"(?i)\bÚčet\s*[: ]\s*(\d{6,}-?\d{2,}/\d{4})").unwrap(),
        Regex::new(r"\b(\d{6,}-?\d{2,}/\d{4})\b").unwrap(),
    ]
});

static ISSUE_DATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)Datum\s+vystaven[ií]\s*[: ]\s*(\d{1,2}[./]\d{1,2}[./]\d{2,4})").unwrap(),
        Regex::new(r"(?i)(?:Issue\s+date|Datum)\s*[: ]\s*(\d{1,2}[./]\d{1,2}[./]\d{2,4})").unwrap(),
        Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap(),
        Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").unwrap(),
    ]
});

static TOTAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)CELKEM\s+K\s+ÚHRADĚ\s*\n?\s*(-?[\d\s]+[.,]\d{2})").unwrap(),
        Regex::new(r"(?i)Celkem\s+k\s+úhradě\s*[: ]\s*(-?[\d\s]+[.,]\d{2})").unwrap(),
        Regex::new(r"(?i)Total\s+(?:due|amount)\s*[: ]\s*(-?[\d\s]+[.,]\d{2})").unwrap(),
        Regex::new(r"(?i)Cena\s+celkem\s*[: ]?\s*(-?[\d\s]+[.,]\d{2})").unwrap(),
        Regex::new(r"(?i)K\s+zaplacení\s+celkem\s+(?:CZK|EUR)?\s*(-?[\d\s]+[.,]\d{2})").unwrap(),
    ]
});

// Tabular item line: <name> <qty> [ks|x] <unit> Kč <vat> % ... <total> Kč
static ITEM_TABULAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<name>.+?)\s+(?P<qty>-?\d+(?:[.,]\d+)?)\s*(?:ks|x)?\s+(?P<unit>\d[\d\s]*[.,]\d{2})\s*(?:Kč|CZK|EUR)\s+(?P<vat>\d{1,2})\s*%\s+.*?(?P<total>-?\d[\d\s]*[.,]\d{2})\s*(?:Kč|CZK|EUR)\s*$",
    )
    .unwrap()
});

// Receipt continuation line: "2 x 5,60 ... 11,20"
static ITEM_RECEIPT_QTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<qty>\d+(?:[.,]\d+)?)\s*[xX]\s*(?P<unit>\d[\d\s]*[.,]\d{2}).*?(?P<total>\d[\d\s]*[.,]\d{2})\s*[A-Z]?\s*$",
    )
    .unwrap()
});
static ITEM_RECEIPT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-ZÁČĎÉĚÍŇÓŘŠŤÚŮÝŽ0-9 .,'/-]{3,}$").unwrap());
static RECEIPT_NAME_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Celkem|DPH|Datum|Děkujeme|Kč|EUR|IBAN)").unwrap());

/// Normalize common OCR digit confusions inside an amount token before
/// numeric parsing: O→0, l/I→1, S→5, B→8.
pub fn normalize_ocr_digits(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            'O' | 'o' => '0',
            'l' | 'I' => '1',
            'S' | 's' => '5',
            'B' => '8',
            c => c,
        })
        .collect()
}

/// Parse a human-formatted amount ("1 234,56", "1234.56") to f64.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = normalize_ocr_digits(raw)
        .replace('\u{a0}', "")
        .replace(' ', "")
        .replace(',', ".");
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

fn find_first(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|p| p.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    for fmt in ["%d.%m.%Y", "%d/%m/%Y", "%d.%m.%y", "%Y-%m-%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

/// Parse header fields and raw line items out of one text block.
pub fn parse_fields(text: &str) -> ParsedFields {
    let supplier_tax_id = TAX_ID_LABELED
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            TAX_ID_BARE
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        });

    let doc_number = find_first(&DOC_NUMBER, text);
    let bank_account = find_first(&BANK_ACCOUNT, text).map(|s| s.replace(' ', ""));
    let issue_date = find_first(&ISSUE_DATE, text).and_then(|s| parse_date(&s));
    let total_with_vat = find_first(&TOTAL, text).and_then(|s| parse_amount(&s));

    let currency = if text.contains("Kč") || text.contains("CZK") {
        Some("CZK".to_string())
    } else if text.contains("EUR") || text.contains('€') {
        Some("EUR".to_string())
    } else {
        None
    };

    let mut items = parse_tabular_items(text);
    if items.is_empty() {
        items = parse_receipt_items(text);
    }

    ParsedFields {
        supplier_tax_id,
        doc_number,
        bank_account,
        issue_date,
        total_with_vat,
        currency,
        items,
    }
}

fn parse_tabular_items(text: &str) -> Vec<LineItem> {
    let mut items = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.len() < 6 {
            continue;
        }
        if let Some(c) = ITEM_TABULAR.captures(line) {
            let qty = parse_amount(&c["qty"]).unwrap_or(1.0);
            let vat = parse_amount(&c["vat"]);
            let unit = parse_amount(&c["unit"]);
            let total = parse_amount(&c["total"]);
            items.push(LineItem {
                description: c["name"].trim().to_string(),
                quantity: qty,
                unit_price: unit,
                line_total: total,
                vat_rate: vat,
            });
        }
    }
    items
}

fn parse_receipt_items(text: &str) -> Vec<LineItem> {
    let mut items = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match pending_name.take() {
            None => {
                if ITEM_RECEIPT_NAME.is_match(line) && !RECEIPT_NAME_NOISE.is_match(line) {
                    pending_name = Some(line.to_string());
                }
            }
            Some(name) => {
                if let Some(c) = ITEM_RECEIPT_QTY.captures(line) {
                    let qty = parse_amount(&c["qty"]).unwrap_or(1.0);
                    let unit = parse_amount(&c["unit"]);
                    let total = parse_amount(&c["total"]);
                    items.push(LineItem {
                        description: name,
                        quantity: qty,
                        // Receipt unit prices are gross; the canonicalizer
                        // derives the net side from the VAT rate.
                        unit_price: unit,
                        line_total: total,
                        vat_rate: None,
                    });
                }
            }
        }
    }
    items
}

/// Token-based invoice/receipt classification. Defaults to invoice, the
/// stricter route.
pub fn classify_doc_type(text: &str) -> DocType {
    let t = text.to_uppercase();
    if ["FAKTURA", "DAŇOVÝ DOKLAD", "DANOVY DOKLAD", "INVOICE"]
        .iter()
        .any(|k| t.contains(k))
    {
        return DocType::Invoice;
    }
    if ["ÚČTENKA", "UCTENKA", "POKLADNA", "KASA", "DĚKUJEME", "DEKUJEME"]
        .iter()
        .any(|k| t.contains(k))
    {
        return DocType::Receipt;
    }
    DocType::Invoice
}

/// True for synthetic supplier ids that must never reach production
/// storage via the gate.
pub fn is_pseudo_tax_id(tax_id: &str) -> bool {
    let t = tax_id.trim().to_uppercase();
    t.starts_with("NOICO-") || t.starts_with("PSEUDO") || t.starts_with("UNKNOWN")
}

/// Deterministic pseudo id for retail receipts that carry no tax id.
pub fn pseudo_tax_id(supplier_name: &str) -> String {
    let base = supplier_name.trim().to_uppercase();
    let digest = Sha256::digest(base.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("NOICO-{}", &hex[..10])
}

/// Stable synthetic document number for receipts: fingerprint prefix plus
/// date and total in cents when known.
pub fn synthetic_doc_number(
    fingerprint: &str,
    issue_date: Option<NaiveDate>,
    total_with_vat: Option<f64>,
) -> String {
    let mut parts = vec![fingerprint.chars().take(12).collect::<String>()];
    if let Some(d) = issue_date {
        parts.push(d.format("%Y%m%d").to_string());
    }
    if let Some(t) = total_with_vat {
        parts.push(((t * 100.0).round() as i64).to_string());
    }
    format!("R-{}", parts.join("-"))
}

/// Heuristic supplier-name guess for receipts: first plausible line near
/// the top that is not boilerplate.
pub fn guess_supplier_name(text: &str) -> Option<String> {
    static NOISE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(daňov|doklad|účtenk|uctenk|datum|celkem|prodej|platba|dph|iban|swift)")
            .unwrap()
    });
    for line in text.lines().take(30) {
        let line = line.trim();
        if line.is_empty() || NOISE.is_match(line) {
            continue;
        }
        if line.chars().filter(|c| c.is_alphabetic()).count() < 3 {
            continue;
        }
        return Some(line.chars().take(80).collect::<String>().trim().to_string());
    }
    None
}

/// Build a candidate document from extracted pages: parse each page,
/// keep the first non-empty value per header field, concatenate items,
/// and score extraction confidence.
pub fn build_candidate(pages: Vec<PageText>) -> CandidateDocument {
    let mut fields = ParsedFields::default();
    for page in &pages {
        let parsed = parse_fields(&page.text);
        if fields.supplier_tax_id.is_none() {
            fields.supplier_tax_id = parsed.supplier_tax_id;
        }
        if fields.doc_number.is_none() {
            fields.doc_number = parsed.doc_number;
        }
        if fields.bank_account.is_none() {
            fields.bank_account = parsed.bank_account;
        }
        if fields.issue_date.is_none() {
            fields.issue_date = parsed.issue_date;
        }
        if fields.total_with_vat.is_none() {
            fields.total_with_vat = parsed.total_with_vat;
        }
        if fields.currency.is_none() {
            fields.currency = parsed.currency;
        }
        fields.items.extend(parsed.items);
    }

    let full_text = pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let doc_type = classify_doc_type(&full_text);

    let mut reasons = Vec::new();
    let mut confidence: f64 = 0.0;
    if fields.supplier_tax_id.is_some() {
        confidence += 0.25;
    } else {
        reasons.push("supplier tax id not found".to_string());
    }
    if fields.doc_number.is_some() {
        confidence += 0.15;
    } else {
        reasons.push("document number not found".to_string());
    }
    if fields.issue_date.is_some() {
        confidence += 0.15;
    } else {
        reasons.push("issue date not found".to_string());
    }
    if fields.total_with_vat.is_some() {
        confidence += 0.25;
    } else {
        reasons.push("grand total not found".to_string());
    }
    if !fields.items.is_empty() {
        confidence += 0.20;
    } else {
        reasons.push("no line items recognized".to_string());
    }

    let metrics = crate::quality::summarize(
        &pages
            .iter()
            .map(|p| (p.text.clone(), p.quality))
            .collect::<Vec<_>>(),
    );

    CandidateDocument {
        pages,
        doc_type,
        supplier_tax_id: fields.supplier_tax_id,
        doc_number: fields.doc_number,
        bank_account: fields.bank_account,
        issue_date: fields.issue_date,
        total_with_vat: fields.total_with_vat,
        currency: fields.currency.unwrap_or_else(|| "CZK".to_string()),
        items: fields.items,
        review_reasons: reasons,
        confidence: confidence.min(1.0),
        text_quality: metrics.quality,
    }
}

/// Convenience for tests and one-shot parsing: single page of embedded text.
pub fn candidate_from_text(text: &str) -> CandidateDocument {
    let quality = crate::quality::quality_score(text);
    build_candidate(vec![PageText {
        page_no: 1,
        text: text.to_string(),
        source: PageSource::Embedded,
        quality,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE_TEXT: &str = "FAKTURA - daňový doklad\n\
        Číslo faktury: 2024-0042\n\
        IČO: 25063677\n\
        Datum vystavení: 12.03.2024\n\
        Rohlík premium 2 ks 100,00 Kč 21 % sleva 242,00 Kč\n\
        Mléko plnotučné 4 x 25,00 Kč 21 % akce 121,00 Kč\n\
        CELKEM K ÚHRADĚ 363,00 Kč\n";

    #[test]
    fn parses_invoice_header() {
        let c = candidate_from_text(INVOICE_TEXT);
        assert_eq!(c.supplier_tax_id.as_deref(), Some("25063677"));
        assert_eq!(c.doc_number.as_deref(), Some("2024-0042"));
        assert_eq!(
            c.issue_date,
            NaiveDate::from_ymd_opt(2024, 3, 12)
        );
        assert_eq!(c.total_with_vat, Some(363.0));
        assert_eq!(c.currency, "CZK");
        assert_eq!(c.doc_type, DocType::Invoice);
    }

    #[test]
    fn parses_tabular_items() {
        let c = candidate_from_text(INVOICE_TEXT);
        assert_eq!(c.items.len(), 2);
        assert_eq!(c.items[0].quantity, 2.0);
        assert_eq!(c.items[0].vat_rate, Some(21.0));
        assert_eq!(c.items[0].line_total, Some(242.0));
    }

    #[test]
    fn missing_fields_stay_none_with_reasons() {
        let c = candidate_from_text("nothing useful here");
        assert!(c.total_with_vat.is_none());
        assert!(c.issue_date.is_none());
        assert!(c
            .review_reasons
            .iter()
            .any(|r| r.contains("grand total")));
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn amount_parsing_handles_ocr_confusions() {
        assert_eq!(parse_amount("1 234,56"), Some(1234.56));
        assert_eq!(parse_amount("12O,5O"), Some(120.50));
        assert_eq!(parse_amount("l5,00"), Some(15.0));
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn receipt_classification_and_pseudo_id() {
        assert_eq!(classify_doc_type("ÚČTENKA\nDěkujeme"), DocType::Receipt);
        let id = pseudo_tax_id("Albert");
        assert!(id.starts_with("NOICO-"));
        assert_eq!(id, pseudo_tax_id("albert "));
        assert!(is_pseudo_tax_id(&id));
        assert!(!is_pseudo_tax_id("25063677"));
    }

    #[test]
    fn synthetic_number_is_stable() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 12);
        let a = synthetic_doc_number("abcdef0123456789", d, Some(363.0));
        let b = synthetic_doc_number("abcdef0123456789", d, Some(363.0));
        assert_eq!(a, b);
        assert_eq!(a, "R-abcdef012345-20240312-36300");
    }
}
