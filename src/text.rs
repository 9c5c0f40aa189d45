//! Text front end: cleaners + symbol lookup.
//!
//! Plain text goes through a [`Cleaner`]; segments in curly braces are read as
//! space-separated ARPAbet phonemes, e.g. `Turn left on {HH AW1 S S T AH0 N} Street.`
//!
//! - [`symbols`] — symbol inventory and id mapping
//! - [`cleaners`] — text normalization pipelines
//! - [`numbers`] — number expansion used by the English cleaner

pub mod cleaners;
pub mod numbers;
pub mod symbols;

pub use cleaners::Cleaner;
pub use symbols::{EOS_ID, PAD_ID, num_symbols};

use crate::{Error, Result};

/// Convert text to a symbol id sequence terminated by EOS.
///
/// Unknown characters are dropped. Fails on unbalanced braces and on text
/// that contains no known symbol at all.
pub fn text_to_sequence(text: &str, cleaner: Cleaner) -> Result<Vec<u32>> {
    if text.trim().is_empty() {
        return Err(Error::InvalidInput("empty text".into()));
    }
    let mut sequence = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        match rest.find(['{', '}']) {
            None => {
                push_text(&mut sequence, rest, cleaner);
                break;
            }
            Some(open) if rest[open..].starts_with('}') => {
                return Err(Error::InvalidInput(format!(
                    "unbalanced '}}' in {text:?}"
                )));
            }
            Some(open) => {
                push_text(&mut sequence, &rest[..open], cleaner);
                let after = &rest[open + 1..];
                let close = after.find('}').ok_or_else(|| {
                    Error::InvalidInput(format!("unclosed '{{' in {text:?}"))
                })?;
                let phonemes = &after[..close];
                if phonemes.contains('{') {
                    return Err(Error::InvalidInput(format!("nested '{{' in {text:?}")));
                }
                for phoneme in phonemes.split_whitespace() {
                    if let Some(id) = symbols::symbol_id(&format!("@{phoneme}")) {
                        sequence.push(id);
                    }
                }
                rest = &after[close + 1..];
            }
        }
    }

    if sequence.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no known symbols in {text:?}"
        )));
    }
    sequence.push(EOS_ID);
    Ok(sequence)
}

fn push_text(sequence: &mut Vec<u32>, text: &str, cleaner: Cleaner) {
    let cleaned = cleaner.clean(text);
    sequence.extend(
        cleaned
            .chars()
            .filter_map(|c| symbols::symbol_id(c.encode_utf8(&mut [0; 4]))),
    );
}

/// Convert ids back to a readable string (ARPAbet re-wrapped in braces).
pub fn sequence_to_text(sequence: &[u32]) -> String {
    let mut out = String::new();
    for symbol in sequence.iter().filter_map(|&id| symbols::id_symbol(id)) {
        match symbol.strip_prefix('@') {
            Some(phoneme) => {
                out.push('{');
                out.push_str(phoneme);
                out.push('}');
            }
            None => out.push_str(symbol),
        }
    }
    out.replace("}{", " ")
}

/// Validate an already-tokenized sequence before it reaches the encoder.
pub fn check_sequence(sequence: &[u32]) -> Result<()> {
    let n = num_symbols() as u32;
    let content = sequence.iter().filter(|&&id| id != PAD_ID && id != EOS_ID).count();
    if content == 0 {
        return Err(Error::InvalidInput("empty symbol sequence".into()));
    }
    if let Some(bad) = sequence.iter().find(|&&id| id >= n) {
        return Err(Error::InvalidInput(format!(
            "symbol id {bad} out of range (vocabulary {n})"
        )));
    }
    Ok(())
}
