use nao_types::EOS_ID;

use crate::dictionary::Dictionary;

/// Whitespace tokenizer.
pub struct Tokenizer;

impl Tokenizer {
    /// Split on whitespace, map to ids and append EOS.
    pub fn tokenize(line: &str, dict: &Dictionary) -> Vec<u32> {
        let mut ids: Vec<u32> = line.split_whitespace().map(|w| dict.index(w)).collect();
        ids.push(EOS_ID);
        ids
    }

    /// Like [`Tokenizer::tokenize`] but grows the dictionary with unseen words.
    pub fn tokenize_adding(line: &str, dict: &mut Dictionary) -> Vec<u32> {
        let mut ids: Vec<u32> = line.split_whitespace().map(|w| dict.add_symbol(w)).collect();
        ids.push(EOS_ID);
        ids
    }

    /// Undo BPE segmentation, e.g. `"hel@@ lo"` -> `"hello"`.
    pub fn remove_bpe(sentence: &str, bpe_symbol: Option<&str>) -> String {
        match bpe_symbol {
            Some(symbol) => {
                let joined = sentence.replace(symbol, "");
                joined.trim_end_matches(symbol.trim_end()).to_string()
            }
            None => sentence.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::UNK_ID;

    #[test]
    fn appends_eos() {
        let dict = Dictionary::from_symbols(["a", "b"]);
        assert_eq!(Tokenizer::tokenize(" a  b c ", &dict), vec![3, 4, UNK_ID, EOS_ID]);
        assert_eq!(Tokenizer::tokenize("", &dict), vec![EOS_ID]);
    }

    #[test]
    fn tokenize_adding_grows_dictionary() {
        let mut dict = Dictionary::new();
        let ids = Tokenizer::tokenize_adding("x y x", &mut dict);
        assert_eq!(ids, vec![3, 4, 3, EOS_ID]);
        assert_eq!(dict.len(), 5);
    }

    #[test]
    fn removes_bpe() {
        assert_eq!(Tokenizer::remove_bpe("hel@@ lo wor@@ ld", Some("@@ ")), "hello world");
        assert_eq!(Tokenizer::remove_bpe("plain", None), "plain");
    }
}
