//! Byte-level codec (ByT5 style): one symbol per UTF-8 byte, shifted past the
//! special tokens, terminated by END.

use crate::error::{ProverError, Result};

/// One discrete vocabulary id.
pub type Symbol = u32;

pub const PAD_TOKEN_ID: Symbol = 0;
pub const END_TOKEN_ID: Symbol = 1;
pub const UNK_TOKEN_ID: Symbol = 2;
/// The decoder is primed with PAD, as T5-family models are.
pub const DECODER_START_TOKEN_ID: Symbol = PAD_TOKEN_ID;
/// PAD, END, UNK.
pub const NUM_SPECIAL_TOKENS: Symbol = 3;
/// Ordinary content symbols: one per byte value.
pub const NUM_VALID_TOKENS: Symbol = 256;
/// Width of the logits row produced by the decoder (padded beyond the valid range).
pub const VOCAB_SIZE: usize = 384;

/// Reversible mapping between text and symbol ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCodec {
    /// Bytes `>= alphabet_size` are rejected by `encode`.
    alphabet_size: u16,
}

impl Default for ByteCodec {
    fn default() -> Self {
        Self::byt5()
    }
}

impl ByteCodec {
    /// All 256 byte values are content symbols.
    pub fn byt5() -> Self {
        Self { alphabet_size: 256 }
    }

    /// Restricts input to 7-bit ASCII; anything else is `UnsupportedSymbol`.
    pub fn ascii() -> Self {
        Self { alphabet_size: 128 }
    }

    /// Number of byte values accepted by `encode`.
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size as usize
    }

    /// True for symbols that stand for a byte.
    pub fn is_content(symbol: Symbol) -> bool {
        (NUM_SPECIAL_TOKENS..NUM_SPECIAL_TOKENS + NUM_VALID_TOKENS).contains(&symbol)
    }

    /// Encodes `text` and appends END.
    pub fn encode(&self, text: &str) -> Result<Vec<Symbol>> {
        let mut tokens = self.encode_unterminated(text)?;
        tokens.push(END_TOKEN_ID);
        Ok(tokens)
    }

    /// Encodes `text` without the END terminator (used for forced target prefixes).
    pub fn encode_unterminated(&self, text: &str) -> Result<Vec<Symbol>> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::with_capacity(bytes.len() + 1);
        for (position, &byte) in bytes.iter().enumerate() {
            if byte as u16 >= self.alphabet_size {
                return Err(ProverError::UnsupportedSymbol { byte, position });
            }
            tokens.push(byte as Symbol + NUM_SPECIAL_TOKENS);
        }
        Ok(tokens)
    }

    /// Inverse of `encode`. A single trailing END is stripped; END anywhere
    /// else, or any non-content symbol, is `MalformedSequence`.
    pub fn decode(&self, tokens: &[Symbol]) -> Result<String> {
        let body = match tokens.split_last() {
            Some((&END_TOKEN_ID, rest)) => rest,
            _ => tokens,
        };

        let mut bytes = Vec::with_capacity(body.len());
        for (position, &symbol) in body.iter().enumerate() {
            if !Self::is_content(symbol) {
                return Err(ProverError::MalformedSequence { symbol, position });
            }
            bytes.push((symbol - NUM_SPECIAL_TOKENS) as u8);
        }
        Ok(String::from_utf8(bytes)?)
    }
}
