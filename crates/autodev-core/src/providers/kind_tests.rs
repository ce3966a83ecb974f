//! Tests for provider kinds and configuration.

use super::*;

#[test]
fn kind_round_trips_through_str() {
    for kind in ProviderKind::all() {
        let parsed: ProviderKind = kind.as_str().parse().unwrap();
        assert_eq!(parsed, *kind);
    }
}

#[test]
fn aliases_parse() {
    assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
    assert_eq!("gpt".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
    assert_eq!("local".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
    assert!("mystery".parse::<ProviderKind>().is_err());
}

#[test]
fn endpoint_falls_back_to_default() {
    let config = ProviderConfig {
        kind: ProviderKind::Anthropic,
        priority: 1,
        credential: "key".to_string(),
        endpoint: None,
        enabled: true,
        model: None,
    };
    assert_eq!(config.endpoint(), "https://api.anthropic.com/v1");

    let overridden = ProviderConfig {
        endpoint: Some("http://localhost:9999/v1".to_string()),
        ..config
    };
    assert_eq!(overridden.endpoint(), "http://localhost:9999/v1");
}

#[test]
fn config_deserializes_with_defaults() {
    let json = r#"{"type": "openai", "priority": 2, "credential": "sk-test"}"#;
    let config: ProviderConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.kind, ProviderKind::OpenAi);
    assert!(config.enabled);
    assert!(config.endpoint.is_none());
}
