//! Word-level tokenizer with Gemma-style special ids.
//!
//! Good enough to drive the reference model end to end; a production
//! deployment plugs a SentencePiece tokenizer in behind [`Tokenizer`].

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "<eos>";
pub const BOS_TOKEN: &str = "<bos>";
pub const UNK_TOKEN: &str = "<unk>";
pub const IMAGE_TOKEN: &str = "<image>";
pub const NEWLINE_TOKEN: &str = "\n";

pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> String;

    fn bos_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    fn image_token_id(&self) -> u32;

    fn newline_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    reverse_vocab: HashMap<u32, String>,
}

impl WordTokenizer {
    /// Reserved ids: pad 0, eos 1, bos 2, unk 3, image 4, newline 5.
    const SPECIAL_TOKENS: [&'static str; 6] = [
        PAD_TOKEN,
        EOS_TOKEN,
        BOS_TOKEN,
        UNK_TOKEN,
        IMAGE_TOKEN,
        NEWLINE_TOKEN,
    ];

    pub fn new(vocab_size: usize) -> Self {
        let common_words = [
            "the", "a", "an", "is", "in", "on", "of", "and", "with", "to", "at", "by", "from",
            "this", "that", "there", "are", "was", "it", "its", "image", "picture", "photo",
            "describe", "describe:", "caption", "caption:", "what", "where", "how", "many", "who",
            "color", "red", "green", "blue", "white", "black", "yellow", "brown", "gray", "dog",
            "cat", "car", "tree", "sky", "water", "building", "person", "man", "woman", "child",
            "table", "street", "grass", "road", "house", "window", "door", "sitting", "standing",
            "walking", "large", "small", "bright", "dark", "near", "next", "front", "behind",
            "left", "right", "top", "bottom", "background", "two", "three", "one", "some", "shows",
        ];
        Self::from_words(common_words.iter().copied(), vocab_size)
    }

    /// Build a vocabulary from `words`, after the reserved special ids.
    pub fn from_words<'a>(words: impl IntoIterator<Item = &'a str>, vocab_size: usize) -> Self {
        let mut vocab = HashMap::new();
        let mut reverse_vocab = HashMap::new();

        for (id, token) in Self::SPECIAL_TOKENS.iter().enumerate() {
            vocab.insert(token.to_string(), id as u32);
            reverse_vocab.insert(id as u32, token.to_string());
        }

        let mut next_id = Self::SPECIAL_TOKENS.len();
        for word in words {
            if next_id >= vocab_size {
                break;
            }
            let word = word.to_lowercase();
            if vocab.contains_key(&word) {
                continue;
            }
            vocab.insert(word.clone(), next_id as u32);
            reverse_vocab.insert(next_id as u32, word);
            next_id += 1;
        }

        Self {
            vocab,
            reverse_vocab,
        }
    }

    /// Load a JSON array of words.
    pub fn from_vocab_file(path: impl AsRef<Path>, vocab_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
        let words: Vec<String> = serde_json::from_str(&blob)
            .with_context(|| format!("failed to parse vocabulary {}", path.display()))?;
        Ok(Self::from_words(words.iter().map(String::as_str), vocab_size))
    }

    fn id(&self, token: &str) -> u32 {
        self.vocab[token]
    }

    fn is_special(&self, id: u32) -> bool {
        (id as usize) < Self::SPECIAL_TOKENS.len()
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let unk = self.id(UNK_TOKEN);
        text.split_whitespace()
            .map(|word| *self.vocab.get(&word.to_lowercase()).unwrap_or(&unk))
            .collect()
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> String {
        ids.iter()
            .filter(|&&id| !(skip_special_tokens && self.is_special(id)))
            .filter_map(|id| self.reverse_vocab.get(id))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn bos_token_id(&self) -> u32 {
        self.id(BOS_TOKEN)
    }

    fn eos_token_id(&self) -> u32 {
        self.id(EOS_TOKEN)
    }

    fn image_token_id(&self) -> u32 {
        self.id(IMAGE_TOKEN)
    }

    fn newline_token_id(&self) -> u32 {
        self.id(NEWLINE_TOKEN)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_ids_follow_gemma_layout() {
        let tok = WordTokenizer::new(256);
        assert_eq!(tok.eos_token_id(), 1);
        assert_eq!(tok.bos_token_id(), 2);
        assert_eq!(tok.image_token_id(), 4);
        assert_eq!(tok.newline_token_id(), 5);
    }

    #[test]
    fn encode_decode_known_words() {
        let tok = WordTokenizer::new(256);
        let ids = tok.encode("Describe the image");
        assert_eq!(ids.len(), 3);
        assert_eq!(tok.decode(&ids, true), "describe the image");
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tok = WordTokenizer::new(256);
        assert_eq!(tok.encode("zebra"), vec![3]);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tok = WordTokenizer::new(256);
        let mut ids = vec![tok.bos_token_id()];
        ids.extend(tok.encode("a dog"));
        ids.push(tok.eos_token_id());
        assert_eq!(tok.decode(&ids, true), "a dog");
        assert_eq!(tok.decode(&ids, false), "<bos> a dog <eos>");
    }

    #[test]
    fn vocab_size_caps_words() {
        let tok = WordTokenizer::new(8);
        assert_eq!(tok.vocab_size(), 8);
    }

    #[test]
    fn loads_vocab_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vocab.json");
        fs::write(&path, r#"["sun", "moon", "Sun"]"#).expect("write");

        let tok = WordTokenizer::from_vocab_file(&path, 64).expect("load");
        assert_eq!(tok.vocab_size(), 8);
        assert_eq!(tok.encode("sun moon"), vec![6, 7]);
    }
}
