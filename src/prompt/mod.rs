//! Prompt parsing: free command text into a structured generation request.
//!
//! Grammar, after the command alias has been stripped by the front end:
//!
//! ```text
//! [--upscale | --seed <n> | --seed=<n>]* positive prompt [:: negative prompt]
//! ```
//!
//! Flags must precede the prompt body; the first token that is not a
//! recognised flag starts the body. Forbidden terms are removed from the
//! user's negative text, then the configured quality tags are appended
//! literally to both halves.

use crate::config::GenerationConfig;
use crate::error::ParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Separator between the positive and the negative prompt.
pub const NEGATIVE_SEPARATOR: &str = "::";

const UPSCALE_FLAG: &str = "--upscale";
const SEED_FLAG: &str = "--seed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectRatio {
    Square,
    Portrait,
    Landscape,
}

impl AspectRatio {
    /// Map a command alias to its aspect ratio.
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias {
            "generate" => Some(Self::Square),
            "generateport" => Some(Self::Portrait),
            "generateland" => Some(Self::Landscape),
            _ => None,
        }
    }

    pub fn alias(self) -> &'static str {
        match self {
            Self::Square => "generate",
            Self::Portrait => "generateport",
            Self::Landscape => "generateland",
        }
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Square => write!(f, "square"),
            Self::Portrait => write!(f, "portrait"),
            Self::Landscape => write!(f, "landscape"),
        }
    }
}

/// Immutable description of one image job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub aspect: AspectRatio,
    /// Hires.fix in the same backend call
    pub upscale: bool,
    /// `None` lets the backend pick a random seed
    pub seed: Option<u64>,
    pub positive: String,
    pub negative: String,
}

impl GenerationRequest {
    /// Same request with the upscale flag forced on and the given seed pinned.
    pub fn upscaled(&self, seed: u64) -> Self {
        Self {
            upscale: true,
            seed: Some(seed),
            ..self.clone()
        }
    }

    /// Same request with the seed cleared so the backend rolls a new one.
    pub fn rerolled(&self) -> Self {
        Self {
            seed: None,
            ..self.clone()
        }
    }
}

/// Configuration-supplied literals applied to every parsed prompt.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    positive_suffix: String,
    negative_suffix: String,
    forbidden: Option<Regex>,
}

impl PromptTemplate {
    pub fn new(positive_suffix: &str, negative_suffix: &str, forbidden_terms: &[String]) -> Self {
        let alternatives: Vec<String> = forbidden_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect();
        let forbidden = if alternatives.is_empty() {
            None
        } else {
            // Escaped literals joined by `|` always form a valid pattern.
            Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).ok()
        };

        Self {
            positive_suffix: positive_suffix.trim().to_string(),
            negative_suffix: negative_suffix.trim().to_string(),
            forbidden,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(
            &config.positive_suffix,
            &config.negative_suffix,
            &config.forbidden_negative_terms,
        )
    }

    /// Parse the text that followed `alias`.
    pub fn parse(&self, alias: &str, raw: &str) -> Result<GenerationRequest, ParseError> {
        let aspect = AspectRatio::from_alias(alias)
            .ok_or_else(|| ParseError::UnknownAlias(alias.to_string()))?;
        let (flags, body) = split_flags(raw)?;

        let (user_positive, user_negative) = match body.split_once(NEGATIVE_SEPARATOR) {
            Some((pos, neg)) => (pos.trim(), neg.trim()),
            None => (body.trim(), ""),
        };
        if user_positive.is_empty() {
            return Err(ParseError::EmptyPrompt);
        }

        let positive = join_tags(&[user_positive, &self.positive_suffix]);
        let negative = join_tags(&[&self.strip_forbidden(user_negative), &self.negative_suffix]);

        Ok(GenerationRequest {
            aspect,
            upscale: flags.upscale,
            seed: flags.seed,
            positive,
            negative,
        })
    }

    fn strip_forbidden(&self, text: &str) -> String {
        match &self.forbidden {
            Some(re) => tidy_tags(&re.replace_all(text, "")),
            None => text.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    upscale: bool,
    seed: Option<u64>,
}

/// Consume leading flags; returns them with the untouched remainder.
fn split_flags(raw: &str) -> Result<(Flags, &str), ParseError> {
    let mut flags = Flags::default();
    let mut rest = raw.trim_start();

    loop {
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        let after = rest[token_end..].trim_start();

        if token == UPSCALE_FLAG {
            flags.upscale = true;
            rest = after;
        } else if let Some(value) = token.strip_prefix("--seed=") {
            flags.seed = Some(parse_seed(value)?);
            rest = after;
        } else if token == SEED_FLAG {
            let value_end = after.find(char::is_whitespace).unwrap_or(after.len());
            let value = &after[..value_end];
            if value.is_empty() {
                return Err(ParseError::MissingSeed);
            }
            flags.seed = Some(parse_seed(value)?);
            rest = after[value_end..].trim_start();
        } else {
            return Ok((flags, rest));
        }
    }
}

fn parse_seed(value: &str) -> Result<u64, ParseError> {
    if value.is_empty() {
        return Err(ParseError::MissingSeed);
    }
    value
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidSeed(value.to_string()))
}

fn join_tags(parts: &[&str]) -> String {
    tidy_tags(&parts.join(", "))
}

/// Collapse whitespace and drop empty comma-separated entries.
fn tidy_tags(text: &str) -> String {
    text.split(',')
        .map(|tag| tag.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PromptTemplate {
        PromptTemplate::new(
            "masterpiece, best quality",
            "lowres, watermark",
            &["child".to_string(), "loli".to_string()],
        )
    }

    #[test]
    fn alias_fixes_aspect_ratio() {
        let t = template();
        for (alias, aspect) in [
            ("generate", AspectRatio::Square),
            ("generateport", AspectRatio::Portrait),
            ("generateland", AspectRatio::Landscape),
        ] {
            let req = t.parse(alias, "a lighthouse").unwrap();
            assert_eq!(req.aspect, aspect);
            assert_eq!(req.aspect.alias(), alias);
        }
    }

    #[test]
    fn unknown_alias_is_rejected() {
        assert_eq!(
            template().parse("generatewide", "a cat"),
            Err(ParseError::UnknownAlias("generatewide".into()))
        );
    }

    #[test]
    fn seed_and_negative_prompt() {
        let req = template()
            .parse("generate", "--seed=12345 a cat :: blurry")
            .unwrap();
        assert_eq!(req.seed, Some(12345));
        assert!(!req.upscale);
        assert!(req.positive.contains("a cat"));
        assert!(req.positive.ends_with("masterpiece, best quality"));
        assert!(req.negative.contains("blurry"));
        assert!(req.negative.ends_with("lowres, watermark"));
    }

    #[test]
    fn seed_with_separate_value_and_upscale_in_any_order() {
        let t = template();
        let a = t.parse("generate", "--seed 7 --upscale a fox").unwrap();
        let b = t.parse("generate", "--upscale --seed 7 a fox").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seed, Some(7));
        assert!(a.upscale);
        assert!(a.positive.starts_with("a fox"));
    }

    #[test]
    fn flags_after_body_are_prompt_text() {
        let req = template().parse("generate", "a fox --upscale").unwrap();
        assert!(!req.upscale);
        assert!(req.positive.starts_with("a fox --upscale"));
    }

    #[test]
    fn empty_body_fails() {
        let t = template();
        assert_eq!(t.parse("generate", ""), Err(ParseError::EmptyPrompt));
        assert_eq!(
            t.parse("generate", "--upscale --seed=3"),
            Err(ParseError::EmptyPrompt)
        );
        assert_eq!(t.parse("generate", "  :: blurry"), Err(ParseError::EmptyPrompt));
    }

    #[test]
    fn non_integer_seed_fails() {
        let t = template();
        assert_eq!(
            t.parse("generate", "--seed=abc a cat"),
            Err(ParseError::InvalidSeed("abc".into()))
        );
        assert_eq!(
            t.parse("generate", "--seed -4 a cat"),
            Err(ParseError::InvalidSeed("-4".into()))
        );
        assert_eq!(t.parse("generate", "--seed"), Err(ParseError::MissingSeed));
        assert_eq!(t.parse("generate", "--seed= a cat"), Err(ParseError::MissingSeed));
    }

    #[test]
    fn only_first_separator_splits() {
        let req = template().parse("generate", "a :: b :: c").unwrap();
        assert!(req.positive.starts_with("a,"));
        assert!(req.negative.starts_with("b :: c"));
    }

    #[test]
    fn missing_separator_uses_suffix_only() {
        let req = template().parse("generate", "a quiet harbor").unwrap();
        assert_eq!(req.negative, "lowres, watermark");
    }

    #[test]
    fn forbidden_terms_are_removed_from_negative() {
        let req = template()
            .parse("generate", "a park :: Child, blurry, LOLI, children")
            .unwrap();
        assert!(!req.negative.to_lowercase().contains("loli"));
        assert!(!req.negative.split(", ").any(|t| t.eq_ignore_ascii_case("child")));
        // whole-word match only
        assert!(req.negative.contains("children"));
        assert!(req.negative.starts_with("blurry"));
    }

    #[test]
    fn configured_suffix_keeps_forbidden_terms() {
        let t = PromptTemplate::new(
            "masterpiece",
            "bad quality, ugly, child, loli",
            &["Child".to_string(), "Loli".to_string()],
        );
        let req = t.parse("generate", "a park").unwrap();
        assert_eq!(req.negative, "bad quality, ugly, child, loli");

        let req = t.parse("generate", "a park :: loli, blurry").unwrap();
        assert_eq!(req.negative, "blurry, bad quality, ugly, child, loli");
    }

    #[test]
    fn default_config_sends_safety_tags() {
        let t = PromptTemplate::from_config(&GenerationConfig::default());
        let req = t.parse("generate", "a park :: child").unwrap();
        assert!(req.negative.starts_with("bad quality"));
        assert!(req.negative.ends_with("ugly, child, loli"));
    }

    #[test]
    fn parse_is_deterministic() {
        let t = template();
        let a = t.parse("generateland", "--upscale dunes :: people");
        let b = t.parse("generateland", "--upscale dunes :: people");
        assert_eq!(a, b);
    }

    #[test]
    fn upscaled_and_rerolled_derivations() {
        let req = template().parse("generate", "a cat").unwrap();
        let up = req.upscaled(99);
        assert!(up.upscale);
        assert_eq!(up.seed, Some(99));
        assert_eq!(up.positive, req.positive);

        let re = up.rerolled();
        assert_eq!(re.seed, None);
        assert!(re.upscale);
    }

    #[test]
    fn empty_suffixes_do_not_leave_commas() {
        let t = PromptTemplate::new("", "", &[]);
        let req = t.parse("generate", "a cat").unwrap();
        assert_eq!(req.positive, "a cat");
        assert_eq!(req.negative, "");
    }
}
