//! Text cleaners run before symbol lookup.
//!
//! - `basic`: lowercase + whitespace collapse
//! - `transliteration`: ASCII folding + basic
//! - `english`: ASCII folding, lowercase, number and abbreviation expansion

use std::sync::LazyLock;

use regex::Regex;

use super::numbers::normalize_numbers;
use crate::{Error, Result};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static ABBREVIATIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        ("mrs", "misess"),
        ("mr", "mister"),
        ("dr", "doctor"),
        ("st", "saint"),
        ("co", "company"),
        ("jr", "junior"),
        ("maj", "major"),
        ("gen", "general"),
        ("drs", "doctors"),
        ("rev", "reverend"),
        ("lt", "lieutenant"),
        ("hon", "honorable"),
        ("sgt", "sergeant"),
        ("capt", "captain"),
        ("esq", "esquire"),
        ("ltd", "limited"),
        ("col", "colonel"),
        ("ft", "fort"),
    ]
    .into_iter()
    .map(|(abbr, full)| (Regex::new(&format!(r"(?i)\b{abbr}\.")).unwrap(), full))
    .collect()
});

/// Named cleaner pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleaner {
    Basic,
    Transliteration,
    English,
}

impl Cleaner {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "basic" | "basic_cleaners" => Ok(Self::Basic),
            "transliteration" | "transliteration_cleaners" => Ok(Self::Transliteration),
            "english" | "english_cleaners" => Ok(Self::English),
            other => Err(Error::Config(format!("unknown text cleaner '{other}'"))),
        }
    }

    pub fn clean(self, text: &str) -> String {
        match self {
            Self::Basic => collapse_whitespace(&text.to_lowercase()),
            Self::Transliteration => collapse_whitespace(&to_ascii(text).to_lowercase()),
            Self::English => {
                let text = to_ascii(text).to_lowercase();
                let text = normalize_numbers(&text);
                let text = expand_abbreviations(&text);
                collapse_whitespace(&text)
            }
        }
    }
}

fn expand_abbreviations(text: &str) -> String {
    ABBREVIATIONS
        .iter()
        .fold(text.to_string(), |acc, (re, full)| re.replace_all(&acc, *full).into_owned())
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").into_owned()
}

/// Fold common Latin-1 and typographic characters to ASCII, drop the rest.
fn to_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let folded = match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
            'è' | 'é' | 'ê' | 'ë' => "e",
            'È' | 'É' | 'Ê' | 'Ë' => "E",
            'ì' | 'í' | 'î' | 'ï' => "i",
            'Ì' | 'Í' | 'Î' | 'Ï' => "I",
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
            'ù' | 'ú' | 'û' | 'ü' => "u",
            'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
            'ç' => "c",
            'Ç' => "C",
            'ñ' => "n",
            'Ñ' => "N",
            'ß' => "ss",
            'æ' => "ae",
            'Æ' => "AE",
            '‘' | '’' => "'",
            '“' | '”' => "\"",
            '–' | '—' => "-",
            '…' => "...",
            '\u{a0}' => " ",
            _ => "",
        };
        out.push_str(folded);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_cleaner_expands() {
        let cleaned = Cleaner::English.clean("Dr. Smith paid  $5 on the 2nd.");
        assert_eq!(cleaned, "doctor smith paid five dollars on the second.");
    }

    #[test]
    fn transliteration_folds_accents() {
        assert_eq!(Cleaner::Transliteration.clean("Café  Ünïcode"), "cafe unicode");
    }

    #[test]
    fn unknown_cleaner_rejected() {
        assert!(Cleaner::parse("german").is_err());
        assert_eq!(Cleaner::parse("english_cleaners").unwrap(), Cleaner::English);
    }
}
