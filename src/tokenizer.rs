//! Token encode/decode capability
//!
//! [`TokenCodec`] is implemented for HuggingFace `tokenizers::Tokenizer`; the
//! mock module provides a whitespace codec for tests.

use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::debug;

/// Encode prompts and decode single token ids
pub trait TokenCodec: Send + Sync {
    /// Encode `text`, including the model's special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode one id; unknown ids come back as `<id>`
    fn decode(&self, id: u32) -> String;

    /// Decode every id independently
    fn decode_each(&self, ids: &[u32]) -> Vec<String> {
        ids.iter().map(|&id| self.decode(id)).collect()
    }
}

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, id: u32) -> String {
        // `decode` drops ids missing from the vocabulary instead of failing
        if (**self).id_to_token(id).is_none() {
            return format!("<{id}>");
        }
        (**self)
            .decode(&[id], false)
            .unwrap_or_else(|_| format!("<{id}>"))
    }
}

/// Download `tokenizer.json` for `model_id` from the HuggingFace hub
pub fn load_hub_tokenizer(model_id: &str) -> Result<Tokenizer> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    let path = repo
        .get("tokenizer.json")
        .with_context(|| format!("Failed to download tokenizer.json for {model_id}"))?;
    debug!("Tokenizer for {} at {}", model_id, path.display());
    load_tokenizer_file(&path)
}

/// Load a tokenizer from a local `tokenizer.json`
pub fn load_tokenizer_file(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Letters;

    impl TokenCodec for Letters {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, id: u32) -> String {
            char::from_u32(id)
                .map(String::from)
                .unwrap_or_else(|| format!("<{id}>"))
        }
    }

    #[test]
    fn test_decode_each_is_per_token() {
        let codec = Letters;
        let ids = codec.encode("ab").unwrap();
        assert_eq!(codec.decode_each(&ids), vec!["a", "b"]);
        assert_eq!(codec.decode(0xD800), "<55296>");
    }

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "the": 1, "cat": 2, "sat": 3},
            "unk_token": "<unk>"
        }
    }"#;

    #[test]
    fn test_hub_tokenizer_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, WORD_LEVEL).unwrap();
        let tokenizer = load_tokenizer_file(&path).unwrap();

        let ids = TokenCodec::encode(&tokenizer, "the cat sat").unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(TokenCodec::encode(&tokenizer, "the dog").unwrap(), vec![1, 0]);
        assert_eq!(tokenizer.decode_each(&ids), vec!["the", "cat", "sat"]);
        assert_eq!(TokenCodec::decode(&tokenizer, 99), "<99>");
    }

    #[test]
    fn test_missing_tokenizer_file_is_error() {
        let err = load_tokenizer_file(Path::new("/nonexistent/tokenizer.json")).unwrap_err();
        assert!(err.to_string().contains("Tokenizer error"));
    }
}
