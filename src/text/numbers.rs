//! Spoken-form expansion of numbers for English text.
//!
//! Handles thousands separators, dollar/pound amounts, decimals, ordinals
//! (`1st`, `22nd`) and plain integers.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static COMMA_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9][0-9,]+[0-9])").unwrap());
static DECIMAL_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+\.[0-9]+)").unwrap());
static POUNDS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"£([0-9,]*[0-9]+)").unwrap());
static DOLLARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$([0-9.,]*[0-9]+)").unwrap());
static ORDINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)(st|nd|rd|th)").unwrap());
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];
const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];
const SCALES: [(u64, &str); 4] = [
    (1_000_000_000_000, "trillion"),
    (1_000_000_000, "billion"),
    (1_000_000, "million"),
    (1_000, "thousand"),
];

/// Expand every number in `text` to words.
pub fn normalize_numbers(text: &str) -> String {
    let text = COMMA_NUMBER.replace_all(text, |c: &Captures| c[1].replace(',', ""));
    let text = POUNDS.replace_all(&text, |c: &Captures| format!("{} pounds", &c[1]));
    let text = DOLLARS.replace_all(&text, |c: &Captures| expand_dollars(&c[1]));
    let text = DECIMAL_NUMBER.replace_all(&text, |c: &Captures| c[1].replace('.', " point "));
    let text = ORDINAL.replace_all(&text, |c: &Captures| match c[1].parse::<u64>() {
        Ok(n) => ordinal_to_words(n),
        Err(_) => c[0].to_string(),
    });
    let text = NUMBER.replace_all(&text, |c: &Captures| match c[0].parse::<u64>() {
        Ok(n) => number_to_words(n),
        // Too long for u64: read digit by digit.
        Err(_) => c[0]
            .chars()
            .filter_map(|d| d.to_digit(10))
            .map(|d| ONES[d as usize])
            .collect::<Vec<_>>()
            .join(" "),
    });
    text.into_owned()
}

fn expand_dollars(amount: &str) -> String {
    let mut parts = amount.split('.');
    let dollars: u64 = parts
        .next()
        .and_then(|d| d.replace(',', "").parse().ok())
        .unwrap_or(0);
    let cents: u64 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    let unit = |n: u64, one: &str, many: &str| {
        format!("{} {}", number_to_words(n), if n == 1 { one } else { many })
    };
    match (dollars, cents) {
        (0, 0) => "zero dollars".to_string(),
        (d, 0) => unit(d, "dollar", "dollars"),
        (0, c) => unit(c, "cent", "cents"),
        (d, c) => format!("{}, {}", unit(d, "dollar", "dollars"), unit(c, "cent", "cents")),
    }
}

/// Cardinal number in words, e.g. `1999` → `one thousand nine hundred ninety nine`.
pub fn number_to_words(n: u64) -> String {
    if n < 20 {
        return ONES[n as usize].to_string();
    }

    let mut words = Vec::new();
    let mut remaining = n;
    for (scale, name) in SCALES {
        if remaining >= scale {
            words.push(below_thousand(remaining / scale));
            words.push(name.to_string());
            remaining %= scale;
        }
    }
    if remaining > 0 {
        words.push(below_thousand(remaining));
    }
    words.join(" ")
}

fn below_thousand(n: u64) -> String {
    let mut words = Vec::new();
    if n >= 100 {
        words.push(format!("{} hundred", ONES[(n / 100) as usize]));
    }
    let rest = n % 100;
    if rest >= 20 {
        let tens = TENS[(rest / 10) as usize];
        match rest % 10 {
            0 => words.push(tens.to_string()),
            d => words.push(format!("{tens} {}", ONES[d as usize])),
        }
    } else if rest > 0 {
        words.push(ONES[rest as usize].to_string());
    }
    words.join(" ")
}

/// Ordinal in words, e.g. `22` → `twenty second`.
pub fn ordinal_to_words(n: u64) -> String {
    let cardinal = number_to_words(n);
    let (head, last) = match cardinal.rsplit_once(' ') {
        Some((head, last)) => (format!("{head} "), last.to_string()),
        None => (String::new(), cardinal.clone()),
    };
    let last = match last.as_str() {
        "one" => "first".to_string(),
        "two" => "second".to_string(),
        "three" => "third".to_string(),
        "five" => "fifth".to_string(),
        "eight" => "eighth".to_string(),
        "nine" => "ninth".to_string(),
        "twelve" => "twelfth".to_string(),
        w if w.ends_with('y') => format!("{}ieth", &w[..w.len() - 1]),
        w => format!("{w}th"),
    };
    format!("{head}{last}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinals() {
        assert_eq!(number_to_words(0), "zero");
        assert_eq!(number_to_words(42), "forty two");
        assert_eq!(number_to_words(100), "one hundred");
        assert_eq!(number_to_words(1999), "one thousand nine hundred ninety nine");
        assert_eq!(number_to_words(2_000_005), "two million five");
    }

    #[test]
    fn ordinals() {
        assert_eq!(ordinal_to_words(1), "first");
        assert_eq!(ordinal_to_words(22), "twenty second");
        assert_eq!(ordinal_to_words(30), "thirtieth");
        assert_eq!(ordinal_to_words(11), "eleventh");
    }

    #[test]
    fn normalize_mixed_text() {
        assert_eq!(normalize_numbers("$3.50"), "three dollars, fifty cents");
        assert_eq!(normalize_numbers("1,000 men"), "one thousand men");
        assert_eq!(normalize_numbers("the 3rd of May"), "the third of May");
        assert_eq!(normalize_numbers("2.5"), "two point five");
    }
}
