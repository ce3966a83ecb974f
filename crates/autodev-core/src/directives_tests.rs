//! Tests for override directive parsing.

use super::*;

#[test]
fn empty_description_has_no_directive() {
    let directive = OverrideDirective::parse("Fix the login page.");
    assert!(directive.is_empty());
}

#[test]
fn bracketed_provider_parses() {
    let directive = OverrideDirective::parse("Fix it fast.\n\n[provider=openai]");
    assert_eq!(directive.provider, Some(ProviderKind::OpenAi));
    assert!(directive.model.is_none());
}

#[test]
fn bracketed_provider_accepts_aliases() {
    let directive = OverrideDirective::parse("[provider=claude]");
    assert_eq!(directive.provider, Some(ProviderKind::Anthropic));
}

#[test]
fn bracketed_model_parses() {
    let directive = OverrideDirective::parse("[model=gpt-4o] please");
    assert_eq!(directive.model.as_deref(), Some("gpt-4o"));
}

#[test]
fn both_tags_combine() {
    let directive = OverrideDirective::parse("[provider=ollama] [model=llama3:70b]");
    assert_eq!(directive.provider, Some(ProviderKind::Ollama));
    assert_eq!(directive.model.as_deref(), Some("llama3:70b"));
}

#[test]
fn natural_language_provider() {
    let directive = OverrideDirective::parse("Please use anthropic provider for this one.");
    assert_eq!(directive.provider, Some(ProviderKind::Anthropic));
}

#[test]
fn natural_language_model_with_article() {
    let directive = OverrideDirective::parse("Use the gpt-4o model here.");
    assert_eq!(directive.model.as_deref(), Some("gpt-4o"));
}

#[test]
fn bracketed_form_wins_over_natural() {
    let directive =
        OverrideDirective::parse("[provider=openai]\nAlso, use anthropic provider maybe?");
    assert_eq!(directive.provider, Some(ProviderKind::OpenAi));
}

#[test]
fn unknown_provider_is_ignored_not_guessed() {
    let directive = OverrideDirective::parse("[provider=sparklemotion]");
    assert!(directive.provider.is_none());

    let directive = OverrideDirective::parse("use sparklemotion provider");
    assert!(directive.provider.is_none());
}

#[test]
fn unrelated_brackets_are_ignored() {
    let directive = OverrideDirective::parse("[urgent] [repo=web] [something=else]");
    assert!(directive.is_empty());
}
