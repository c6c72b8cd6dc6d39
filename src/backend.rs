use serde_json::{Map, Value};
use std::fmt;

/// Inference server hosting the model, as reported by the `owned_by` field
/// of `/v1/models`.
///
/// vLLM and SGLang expose the same OpenAI-compatible API but disagree on the
/// names of a few sampling options. Requests are rewritten to the names the
/// hosting backend understands before they are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Vllm,
    Sglang,
    /// Any other owner string; options pass through untouched
    Other(String),
}

// Option names per backend flavor
const VLLM_REGEX: &str = "guided_regex";
const VLLM_MAX_TOKENS: &str = "max_tokens";
const SGLANG_REGEX: &str = "regex";
const SGLANG_MAX_TOKENS: &str = "max_new_tokens";

impl Backend {
    pub fn from_owner(owned_by: &str) -> Self {
        match owned_by {
            "vllm" => Backend::Vllm,
            "sglang" => Backend::Sglang,
            other => Backend::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Sglang => "sglang",
            Backend::Other(name) => name,
        }
    }

    /// Key under which this backend expects the generation length limit.
    pub fn max_tokens_key(&self) -> &'static str {
        match self {
            Backend::Sglang => SGLANG_MAX_TOKENS,
            _ => VLLM_MAX_TOKENS,
        }
    }

    /// Key under which this backend expects a constrained-decoding regex.
    pub fn regex_key(&self) -> &'static str {
        match self {
            Backend::Sglang => SGLANG_REGEX,
            _ => VLLM_REGEX,
        }
    }

    /// Rewrite option names spelled for the other backend into this
    /// backend's spelling. Unknown backends are left alone.
    ///
    /// A renamed key replaces any value already stored under the target name.
    pub fn translate_options(&self, mut options: Map<String, Value>) -> Map<String, Value> {
        match self {
            Backend::Vllm => {
                rename(&mut options, SGLANG_REGEX, VLLM_REGEX);
                rename(&mut options, SGLANG_MAX_TOKENS, VLLM_MAX_TOKENS);
            }
            Backend::Sglang => {
                rename(&mut options, VLLM_REGEX, SGLANG_REGEX);
                rename(&mut options, VLLM_MAX_TOKENS, SGLANG_MAX_TOKENS);
            }
            Backend::Other(_) => {}
        }
        options
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn rename(options: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = options.remove(from) {
        options.insert(to.to_string(), value);
    }
}
