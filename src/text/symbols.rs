//! Input symbol inventory.
//!
//! Id 0 is padding, id 1 is end-of-sequence. Characters follow, then the
//! ARPAbet phonemes prefixed with `@` so they never collide with letters.

use std::collections::HashMap;
use std::sync::LazyLock;

pub const PAD: &str = "_";
pub const EOS: &str = "~";

/// Id used to pad symbol sequences in a batch.
pub const PAD_ID: u32 = 0;
/// Id appended to every encoded sequence.
pub const EOS_ID: u32 = 1;

const CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!'\"(),-.:;? ";

/// CMUdict phoneme set (with stress markers).
const ARPABET: [&str; 84] = [
    "AA", "AA0", "AA1", "AA2", "AE", "AE0", "AE1", "AE2", "AH", "AH0", "AH1", "AH2", "AO", "AO0",
    "AO1", "AO2", "AW", "AW0", "AW1", "AW2", "AY", "AY0", "AY1", "AY2", "B", "CH", "D", "DH", "EH",
    "EH0", "EH1", "EH2", "ER", "ER0", "ER1", "ER2", "EY", "EY0", "EY1", "EY2", "F", "G", "HH",
    "IH", "IH0", "IH1", "IH2", "IY", "IY0", "IY1", "IY2", "JH", "K", "L", "M", "N", "NG", "OW",
    "OW0", "OW1", "OW2", "OY", "OY0", "OY1", "OY2", "P", "R", "S", "SH", "T", "TH", "UH", "UH0",
    "UH1", "UH2", "UW", "UW0", "UW1", "UW2", "V", "W", "Y", "Z", "ZH",
];

/// All symbols in id order.
pub static SYMBOLS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let mut symbols = vec![PAD.to_string(), EOS.to_string()];
    symbols.extend(CHARACTERS.chars().map(|c| c.to_string()));
    symbols.extend(ARPABET.iter().map(|p| format!("@{p}")));
    symbols
});

static SYMBOL_TO_ID: LazyLock<HashMap<&'static str, u32>> = LazyLock::new(|| {
    SYMBOLS
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i as u32))
        .collect()
});

/// Number of distinct input symbols (embedding table size).
pub fn num_symbols() -> usize {
    SYMBOLS.len()
}

/// Look up a symbol id. Returns `None` for unknown symbols.
pub fn symbol_id(symbol: &str) -> Option<u32> {
    SYMBOL_TO_ID.get(symbol).copied()
}

/// Look up the symbol for an id.
pub fn id_symbol(id: u32) -> Option<&'static str> {
    SYMBOLS.get(id as usize).map(|s| s.as_str())
}
