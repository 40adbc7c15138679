//! Text front-end: cleaning and symbol-id encoding.
//!
//! - [`cleaners`] — `basic_cleaners`, `english_cleaners`
//! - [`symbols`] — the fixed input vocabulary (`_` padding is id 0)

pub mod cleaners;
pub mod symbols;

use std::path::Path;

use crate::{Error, Result};

pub use symbols::{EOS_ID, PAD_ID, num_symbols};

/// Clean `text` and convert it to symbol ids, terminated by EOS.
///
/// Characters outside the symbol table are dropped. Text that leaves nothing
/// to say after cleaning is rejected, since the encoder cannot attend over an
/// empty sequence.
pub fn text_to_sequence(text: &str, cleaner_names: &[String]) -> Result<Vec<u32>> {
    let cleaned = cleaners::clean_text(text, cleaner_names)?;
    let mut sequence: Vec<u32> = cleaned.chars().filter_map(symbols::symbol_to_id).collect();
    if sequence.is_empty() {
        return Err(Error::InvalidInput(format!(
            "text {text:?} contains no speakable symbols"
        )));
    }
    sequence.push(EOS_ID);
    Ok(sequence)
}

/// Inverse of [`text_to_sequence`], for logging. Padding is skipped.
pub fn sequence_to_text(sequence: &[u32]) -> String {
    sequence
        .iter()
        .filter(|&&id| id != PAD_ID)
        .filter_map(|&id| symbols::id_to_symbol(id))
        .collect()
}

/// Write the symbol table, one symbol per line (space shown as `\s`).
pub fn write_symbol_table(path: impl AsRef<Path>) -> Result<()> {
    let mut out = String::new();
    for symbol in symbols::SYMBOLS.chars() {
        if symbol == ' ' {
            out.push_str("\\s");
        } else {
            out.push(symbol);
        }
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}
