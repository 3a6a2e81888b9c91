//! Mixed-script word counting for report size budgets.
//!
//! CJK characters count individually; ASCII alphanumeric runs count as one
//! word each. This matches how report budgets are expressed for
//! mixed-language content.

/// Fraction of the target a report may deviate by and still be in budget.
pub const SIZE_TOLERANCE: f64 = 0.05;

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}')
}

/// Count CJK characters plus ASCII alphanumeric word runs.
pub fn count_words(text: &str) -> usize {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let ascii_words = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .count();
    cjk + ascii_words
}

/// Whether `count` is within ±5% of `limit`. `None` means no budget applies.
pub fn within_tolerance(count: usize, limit: Option<u32>) -> bool {
    match limit {
        None => true,
        Some(limit) => {
            let limit = limit as f64;
            let lower = (limit * (1.0 - SIZE_TOLERANCE)) as usize;
            let upper = (limit * (1.0 + SIZE_TOLERANCE)) as usize;
            (lower..=upper).contains(&count)
        }
    }
}
