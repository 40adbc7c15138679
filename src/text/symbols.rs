//! Input symbol table.
//!
//! Ids are positions in [`SYMBOLS`]: `_` (padding) is always id 0 so that a
//! zero-padded batch can be masked by comparing against [`PAD_ID`].

/// Padding symbol.
pub const PAD: char = '_';
/// End-of-sequence symbol, appended to every encoded utterance.
pub const EOS: char = '~';

/// Id of [`PAD`].
pub const PAD_ID: u32 = 0;
/// Id of [`EOS`].
pub const EOS_ID: u32 = 1;

/// Every symbol the model knows, in id order.
pub const SYMBOLS: &str =
    "_~ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!'\"(),-.:;? ";

/// Vocabulary size (embedding table rows).
pub fn num_symbols() -> usize {
    SYMBOLS.len()
}

/// Id for a symbol, or `None` if it is not in the table.
///
/// Padding and EOS are never produced from input text.
pub fn symbol_to_id(symbol: char) -> Option<u32> {
    if symbol == PAD || symbol == EOS {
        return None;
    }
    // All symbols are ASCII, so byte offset == char index.
    SYMBOLS.find(symbol).map(|i| i as u32)
}

/// Symbol for an id, or `None` if out of range.
pub fn id_to_symbol(id: u32) -> Option<char> {
    SYMBOLS.as_bytes().get(id as usize).map(|&b| b as char)
}
