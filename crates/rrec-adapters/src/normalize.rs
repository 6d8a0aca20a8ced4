//! Tolerant parsers for spreadsheet cells.
//!
//! Every function here is total: malformed input degrades to an empty value
//! (`None`, `""`, `false`, [`Gender::Unknown`]) and never panics.

use std::str::FromStr;

use chrono::{Datelike, Duration, Local, NaiveDate};
use rrec_core::{Gender, YearMonth, PHONE_MAX_LEN};
use rust_decimal::Decimal;

/// Markers that make [`parse_boolean`] return true when found anywhere in a cell.
pub const PRESENT_MARKERS: [&str; 10] = [
    "○", "〇", "◯", "有", "あり", "済", "✓", "✔", "yes", "true",
];

fn is_phone_separator(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '-' | '‐' | '‑' | '‒' | '–' | '—' | '―' | '−' | '－' | 'ー' | 'ｰ'
        )
}

/// Folds full-width digits and `＋` to ASCII.
fn fold_width(c: char) -> char {
    match c {
        '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
        '＋' => '+',
        other => other,
    }
}

/// Folds full-width digits, strips whitespace (full-width included) and
/// hyphen variants, then caps the result at [`PHONE_MAX_LEN`] characters.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars()
        .map(fold_width)
        .filter(|c| !is_phone_separator(*c))
        .take(PHONE_MAX_LEN)
        .collect()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_date_in_year(raw, Local::now().year())
}

/// Like [`parse_date`], with `current_year` used for bare `M/D` cells.
pub fn parse_date_in_year(raw: &str, current_year: i32) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    let token = token.split(['(', '（']).next()?.trim_end_matches('日');
    if token.is_empty() {
        return None;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return parse_compact_date(token);
    }

    let dashed = token.contains('-');
    let unified: String = token
        .chars()
        .map(|c| match c {
            '年' | '月' | '.' | '-' => '/',
            other => other,
        })
        .collect();
    let parts: Vec<&str> = unified.split('/').collect();
    if parts
        .iter()
        .any(|p| p.is_empty() || p.len() > 4 || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    let nums: Vec<u32> = parts.iter().map(|p| p.parse().ok()).collect::<Option<_>>()?;
    let widths: Vec<usize> = parts.iter().map(|p| p.len()).collect();

    match (widths.as_slice(), nums.as_slice()) {
        ([m, d], [month, day]) if *m <= 2 && *d <= 2 => ymd(current_year, *month, *day),
        ([4, _, _], [year, month, day]) => ymd(*year as i32, *month, *day),
        ([_, _, 4], [month, day, year]) => ymd(*year as i32, *month, *day),
        // YY-M-D whatever the separator; slashed text that is no valid YY/M/D
        // date falls back to M/D/YY.
        ([a, b, c], [first, second, third]) if *a <= 2 && *b <= 2 && *c <= 2 => {
            ymd(pivot_year(*first), *second, *third).or_else(|| {
                (!dashed)
                    .then(|| ymd(pivot_year(*third), *first, *second))
                    .flatten()
            })
        }
        _ => None,
    }
}

/// Two-digit years: below 50 are 2000s, 50 and above are 1900s.
pub fn pivot_year(two_digit: u32) -> i32 {
    if two_digit < 50 {
        2000 + two_digit as i32
    } else {
        1900 + two_digit as i32
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `YYYYMMDD`, or a spreadsheet serial day number (days since 1899-12-30).
fn parse_compact_date(digits: &str) -> Option<NaiveDate> {
    match digits.len() {
        8 => {
            let year = digits[0..4].parse().ok()?;
            let month = digits[4..6].parse().ok()?;
            let day = digits[6..8].parse().ok()?;
            ymd(year, month, day)
        }
        5 => {
            let serial: i64 = digits.parse().ok()?;
            if !(20_000..=80_000).contains(&serial) {
                return None;
            }
            ymd(1899, 12, 30)?.checked_add_signed(Duration::days(serial))
        }
        _ => None,
    }
}

/// Reads a year-month marker such as `2025/3`, `2025-03`, `2025年3月` or `202503`.
pub fn parse_year_month(raw: &str) -> Option<YearMonth> {
    let token = raw.split_whitespace().next()?.trim_end_matches('月');
    if token.len() == 6 && token.chars().all(|c| c.is_ascii_digit()) {
        return YearMonth::new(token[0..4].parse().ok()?, token[4..6].parse().ok()?);
    }
    let unified: String = token
        .chars()
        .map(|c| match c {
            '年' | '.' | '-' | '月' => '/',
            other => other,
        })
        .collect();
    let mut parts = unified.split('/');
    let year = parts.next().filter(|y| y.len() == 4)?.parse().ok()?;
    let month = parts.next().filter(|m| !m.is_empty() && m.len() <= 2)?.parse().ok()?;
    YearMonth::new(year, month)
}

/// Strips thousands separators and currency artifacts before parsing.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            !c.is_whitespace() && !matches!(c, ',' | '，' | '¥' | '￥' | '円' | '$' | '\\')
        })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// True only when the cell contains one of [`PRESENT_MARKERS`]. Anything else,
/// including explicit "no" markers, is false.
pub fn parse_boolean(raw: &str) -> bool {
    let lowered = raw.to_lowercase();
    PRESENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn parse_gender(raw: &str) -> Gender {
    match raw.trim().to_lowercase().as_str() {
        "男" | "男性" | "m" | "male" => Gender::Male,
        "女" | "女性" | "f" | "female" => Gender::Female,
        "その他" | "other" => Gender::Other,
        _ => Gender::Unknown,
    }
}

pub fn parse_age(raw: &str) -> Option<i32> {
    let digits = raw.trim().trim_end_matches('歳').trim();
    digits
        .parse::<i32>()
        .ok()
        .filter(|age| (0..=120).contains(age))
}

/// Collapses runs of whitespace (full-width included) into one ASCII space.
pub fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn phone_strips_separators_and_full_width_spaces() {
        assert_eq!(normalize_phone("090-1234-5678"), "09012345678");
        assert_eq!(normalize_phone(" 090　1234 5678 "), "09012345678");
        assert_eq!(normalize_phone("090ー1234－5678"), "09012345678");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn phone_is_truncated_to_column_width() {
        let long = "0".repeat(30);
        assert_eq!(normalize_phone(&long).len(), PHONE_MAX_LEN);
    }

    #[test]
    fn phone_normalization_is_idempotent() {
        for raw in [
            "090-1234-5678",
            "  ",
            "+81 90 1234 5678",
            "０９０－１２３４－５６７８",
            "12345678901234567890123-45",
            "tel: 03 (1234) 5678",
        ] {
            let once = normalize_phone(raw);
            assert_eq!(normalize_phone(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn full_width_phones_match_their_ascii_spelling() {
        assert_eq!(normalize_phone("０９０－１２３４－５６７８"), "09012345678");
        assert_eq!(normalize_phone("090-1234-5678"), "09012345678");
        assert_eq!(normalize_phone("＋８１ ９０ １２３４ ５６７８"), "+819012345678");
    }

    #[test]
    fn dates_accept_the_source_formats() {
        assert_eq!(parse_date("2025/1/15"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("2025-01-15"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("1/15/2025"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("2025年1月15日"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("2025.1.15"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("2025/1/15 10:30"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("2025/1/15(水)"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("20250115"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("45672"), Some(date(2025, 1, 15)));
    }

    #[test]
    fn bare_month_day_uses_the_current_year() {
        assert_eq!(parse_date_in_year("3/1", 2025), Some(date(2025, 3, 1)));
        assert_eq!(parse_date("12/31").map(|d| d.year()), Some(Local::now().year()));
    }

    #[test]
    fn two_digit_years_pivot_at_fifty() {
        assert_eq!(parse_date("99-3-1"), Some(date(1999, 3, 1)));
        assert_eq!(parse_date("05-3-1"), Some(date(2005, 3, 1)));
        assert_eq!(parse_date("49-3-1"), Some(date(2049, 3, 1)));
        assert_eq!(parse_date("50-3-1"), Some(date(1950, 3, 1)));
        assert_eq!(parse_date("3/1/99"), Some(date(1999, 3, 1)));
        assert_eq!(parse_date("05/3/1"), parse_date("05-3-1"));
        assert_eq!(parse_date("99/3/1"), Some(date(1999, 3, 1)));
        assert_eq!(parse_date("1/15/25"), Some(date(2025, 1, 15)));
        assert_eq!(parse_date("1-15-25"), None);
    }

    #[test]
    fn date_parsing_is_total() {
        for raw in [
            "",
            "   ",
            "abc",
            "2025/13/40",
            "2/30",
            "99999999999999999999",
            "1/2/3/4",
            "//",
            "-",
            "２０２５/1/1",
            "2025/1/",
            "年月日",
            "(",
            "0",
            "12345",
        ] {
            assert_eq!(parse_date(raw), None, "unexpected date for {raw:?}");
        }
    }

    #[test]
    fn year_month_markers() {
        let march = YearMonth::new(2025, 3);
        assert_eq!(parse_year_month("2025/3"), march);
        assert_eq!(parse_year_month("2025-03"), march);
        assert_eq!(parse_year_month("2025年3月"), march);
        assert_eq!(parse_year_month("202503"), march);
        assert_eq!(parse_year_month("2025/3/20"), march);
        assert_eq!(parse_year_month("3月"), None);
        assert_eq!(parse_year_month("2025/13"), None);
        assert_eq!(parse_year_month(""), None);
    }

    #[test]
    fn amounts_strip_separators_and_currency() {
        assert_eq!(parse_amount("300,000"), Some(Decimal::from(300_000)));
        assert_eq!(parse_amount("¥1,200"), Some(Decimal::from(1_200)));
        assert_eq!(parse_amount("45,000円"), Some(Decimal::from(45_000)));
        assert_eq!(parse_amount(" 12 000 "), Some(Decimal::from(12_000)));
        assert_eq!(parse_amount("-500"), Some(Decimal::from(-500)));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("未定"), None);
        assert_eq!(parse_amount("TBD"), None);
    }

    #[test]
    fn booleans_are_true_only_for_present_markers() {
        assert!(parse_boolean("○"));
        assert!(parse_boolean("免許あり"));
        assert!(parse_boolean("YES"));
        assert!(!parse_boolean(""));
        assert!(!parse_boolean("×"));
        assert!(!parse_boolean("なし"));
        assert!(!parse_boolean("no"));
        assert!(!parse_boolean("不明"));
    }

    #[test]
    fn genders() {
        assert_eq!(parse_gender("男性"), Gender::Male);
        assert_eq!(parse_gender("Female"), Gender::Female);
        assert_eq!(parse_gender(""), Gender::Unknown);
        assert_eq!(parse_gender("?"), Gender::Unknown);
    }

    #[test]
    fn ages_and_text() {
        assert_eq!(parse_age("34歳"), Some(34));
        assert_eq!(parse_age("abc"), None);
        assert_eq!(parse_age("400"), None);
        assert_eq!(clean_text("  山田　太郎 "), Some("山田 太郎".to_string()));
        assert_eq!(clean_text("　"), None);
    }
}
