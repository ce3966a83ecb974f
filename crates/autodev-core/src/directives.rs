//! Override directives embedded in issue descriptions.
//!
//! Operators can steer one execution by writing a directive into the issue
//! description. Only a bounded set of grammars is recognized:
//!
//! - bracketed tags: `[provider=openai]`, `[model=gpt-4o]`
//! - natural language: `use anthropic provider`, `use the gpt-4o model`
//!
//! Anything else is ignored, never guessed. A directive naming an unknown
//! provider is dropped rather than approximated.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use crate::providers::ProviderKind;

/// Parsed override, empty when the description carries no directive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideDirective {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
}

impl OverrideDirective {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none()
    }

    /// Parse directives out of an issue description.
    pub fn parse(description: &str) -> Self {
        let mut directive = Self::default();

        if let Some(value) = capture(bracket_provider_re(), description) {
            match value.parse::<ProviderKind>() {
                Ok(kind) => directive.provider = Some(kind),
                Err(_) => debug!(value, "unknown provider in directive ignored"),
            }
        }

        if let Some(value) = capture(bracket_model_re(), description) {
            directive.model = Some(value);
        }

        // Natural-language form fills whichever slot the bracketed form
        // left empty.
        for captures in natural_re().captures_iter(description) {
            let value = captures[1].to_string();
            match captures[2].to_lowercase().as_str() {
                "provider" if directive.provider.is_none() => match value.parse::<ProviderKind>() {
                    Ok(kind) => directive.provider = Some(kind),
                    Err(_) => debug!(value, "unknown provider in directive ignored"),
                },
                "model" if directive.model.is_none() => directive.model = Some(value),
                _ => {}
            }
        }

        directive
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack).map(|c| c[1].to_string())
}

fn bracket_provider_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[provider\s*=\s*([A-Za-z0-9._-]+)\s*\]").expect("valid regex"))
}

fn bracket_model_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[model\s*=\s*([A-Za-z0-9._:-]+)\s*\]").expect("valid regex"))
}

fn natural_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\buse\s+(?:the\s+)?([A-Za-z0-9._:-]+)\s+(provider|model)\b")
            .expect("valid regex")
    })
}

#[cfg(test)]
#[path = "directives_tests.rs"]
mod tests;
