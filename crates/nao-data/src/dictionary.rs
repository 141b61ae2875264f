use std::collections::HashMap;
use std::path::Path;

use nao_types::{DataError, NaoResult, EOS, EOS_ID, PAD, PAD_ID, UNK, UNK_ID};
use serde::{Deserialize, Serialize};

/// Vocabulary mapping with fixed special-token ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    symbols: Vec<String>,
    indices: HashMap<String, u32>,
}

impl Dictionary {
    /// Dictionary holding only the special tokens.
    pub fn new() -> Self {
        let mut dict = Self {
            symbols: Vec::new(),
            indices: HashMap::new(),
        };
        for special in [PAD, EOS, UNK] {
            dict.add_symbol(special);
        }
        debug_assert_eq!(dict.index(PAD), PAD_ID);
        debug_assert_eq!(dict.index(EOS), EOS_ID);
        debug_assert_eq!(dict.index(UNK), UNK_ID);
        dict
    }

    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dict = Self::new();
        for symbol in symbols {
            dict.add_symbol(symbol.as_ref());
        }
        dict
    }

    /// Load a dictionary file: one symbol per line, optionally followed by a count.
    pub fn load<P: AsRef<Path>>(path: P) -> NaoResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let text = std::fs::read_to_string(path)?;
        let mut dict = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let symbol = parts.next().unwrap_or_default();
            if let Some(count) = parts.next() {
                count.parse::<u64>().map_err(|e| DataError::ParseError {
                    message: format!("{}:{}: bad count '{}': {}", path.display(), lineno + 1, count, e),
                })?;
            }
            dict.add_symbol(symbol);
        }
        tracing::debug!("Loaded dictionary {} with {} symbols", path.display(), dict.len());
        Ok(dict)
    }

    /// Add a symbol if absent and return its id.
    pub fn add_symbol(&mut self, symbol: &str) -> u32 {
        if let Some(&id) = self.indices.get(symbol) {
            return id;
        }
        let id = self.symbols.len() as u32;
        self.symbols.push(symbol.to_string());
        self.indices.insert(symbol.to_string(), id);
        id
    }

    pub fn index(&self, symbol: &str) -> u32 {
        self.indices.get(symbol).copied().unwrap_or(UNK_ID)
    }

    pub fn symbol(&self, id: u32) -> &str {
        self.symbols
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK)
    }

    /// Join ids into a sentence, stopping at EOS and skipping padding.
    pub fn string(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != EOS_ID)
            .filter(|&&id| id != PAD_ID)
            .map(|&id| self.symbol(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn pad(&self) -> u32 {
        PAD_ID
    }

    pub fn eos(&self) -> u32 {
        EOS_ID
    }

    pub fn unk(&self) -> u32 {
        UNK_ID
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}
