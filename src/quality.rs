//! Text-quality scoring for extracted page text.
//!
//! Drives the embedded-vs-OCR page choice: embedded PDF text that scores
//! below the configured threshold is considered garbage (scanner cover
//! sheets, broken encodings) and the page is re-read via OCR instead.

use crate::models::TextMetrics;

/// Per-page character statistics.
#[derive(Debug, Clone, Default)]
pub struct PageQuality {
    pub chars_total: usize,
    pub chars_non_ws: usize,
    pub chars_printable: usize,
    pub chars_letters: usize,
    pub chars_digits: usize,
    pub replacement_chars: usize,
    pub lines_nonempty: usize,
    pub avg_line_len: f64,
}

pub fn compute_page_quality(text: &str) -> PageQuality {
    let chars_total = text.chars().count();
    let chars_non_ws = text.chars().filter(|c| !c.is_whitespace()).count();
    let chars_printable = text.chars().filter(|c| !c.is_control()).count();
    let chars_letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let chars_digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    let replacement_chars = text.chars().filter(|&c| c == '\u{fffd}').count();

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let avg_line_len = if lines.is_empty() {
        0.0
    } else {
        lines.iter().map(|l| l.chars().count()).sum::<usize>() as f64 / lines.len() as f64
    };

    PageQuality {
        chars_total,
        chars_non_ws,
        chars_printable,
        chars_letters,
        chars_digits,
        replacement_chars,
        lines_nonempty: lines.len(),
        avg_line_len,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Score a page text in [0, 1]. Empty or replacement-riddled text scores
/// near zero; prose-like text with a healthy letter ratio scores high.
pub fn quality_score(text: &str) -> f64 {
    let q = compute_page_quality(text);
    if q.chars_non_ws == 0 {
        return 0.0;
    }

    let letters = ratio(q.chars_letters, q.chars_non_ws);
    let printable = ratio(q.chars_printable, q.chars_total.max(1));
    let replacement = ratio(q.replacement_chars, q.chars_total.max(1));
    // Very short fragments cannot be trusted regardless of their ratios.
    let volume = (q.chars_non_ws as f64 / 200.0).min(1.0);

    let score = 0.45 * letters + 0.30 * printable + 0.25 * volume - 2.0 * replacement;
    score.clamp(0.0, 1.0)
}

/// Aggregate per-page qualities into document-level metrics, with the
/// overall quality weighted by chosen text length.
pub fn summarize(pages: &[(String, f64)]) -> TextMetrics {
    if pages.is_empty() {
        return TextMetrics::default();
    }

    let mut chars_total = 0usize;
    let mut printable = 0usize;
    let mut letters = 0usize;
    let mut non_ws = 0usize;
    let mut replacement = 0usize;
    let mut pages_nonempty = 0usize;
    let mut weighted = 0.0f64;
    let mut weight = 0.0f64;

    for (text, score) in pages {
        let q = compute_page_quality(text);
        chars_total += q.chars_total;
        printable += q.chars_printable;
        letters += q.chars_letters;
        non_ws += q.chars_non_ws;
        replacement += q.replacement_chars;
        if q.chars_non_ws > 0 {
            pages_nonempty += 1;
        }
        let w = q.chars_non_ws.max(1) as f64;
        weighted += score * w;
        weight += w;
    }

    TextMetrics {
        pages: pages.len(),
        pages_nonempty,
        chars_total,
        ratio_printable: ratio(printable, chars_total),
        ratio_letters: ratio(letters, non_ws),
        ratio_replacement: ratio(replacement, chars_total),
        quality: if weight > 0.0 { weighted / weight } else { 0.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_scores_zero() {
        assert_eq!(quality_score(""), 0.0);
        assert_eq!(quality_score("   \n\t "), 0.0);
    }

    #[test]
    fn prose_scores_higher_than_garbage() {
        let prose = "Faktura za dodané zboží a služby dle smlouvy.\n".repeat(8);
        let garbage = "\u{fffd}\u{fffd}x\u{fffd}9\u{fffd}\u{fffd}\n".repeat(8);
        assert!(quality_score(&prose) > 0.6);
        assert!(quality_score(&garbage) < 0.2);
        assert!(quality_score(&prose) > quality_score(&garbage));
    }

    #[test]
    fn summarize_weights_by_length() {
        let long_good = ("dobrý dlouhý text faktury ".repeat(40), 0.9);
        let short_bad = ("x".to_string(), 0.1);
        let m = summarize(&[long_good, short_bad]);
        assert!(m.quality > 0.8);
        assert_eq!(m.pages, 2);
        assert_eq!(m.pages_nonempty, 2);
    }
}
