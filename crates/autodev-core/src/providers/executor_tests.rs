//! Tests for the HTTP agent executor.

use super::*;
use crate::retry::{ErrorClass, RetryClassify};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn executor_for(server: &MockServer) -> HttpAgentExecutor {
    HttpAgentExecutor::new(ProviderConfig {
        kind: ProviderKind::OpenAi,
        priority: 1,
        credential: "sk-test".to_string(),
        endpoint: Some(server.uri()),
        enabled: true,
        model: Some("test-model".to_string()),
    })
}

fn context() -> ExecutionContext {
    ExecutionContext {
        issue_id: IssueId::new("ABC-7").unwrap(),
        session_id: SessionId::for_issue(&IssueId::new("ABC-7").unwrap()),
        worktree_path: PathBuf::from("/tmp/worktrees/abc-7"),
        timeout: Duration::from_secs(5),
    }
}

fn tool_call_response() -> serde_json::Value {
    serde_json::json!({
        "choices": [{
            "message": {
                "content": "Implemented the fix.",
                "tool_calls": [
                    {
                        "function": {
                            "name": "git_commit",
                            "arguments": "{\"sha\": \"0123456789abcdef\", \"message\": \"ABC-7: fix flaky retry\"}"
                        }
                    },
                    {
                        "function": {
                            "name": "write_file",
                            "arguments": "{\"path\": \"src/retry.rs\"}"
                        }
                    },
                    {
                        "function": {
                            "name": "edit_file",
                            "arguments": "{\"path\": \"src/lib.rs\"}"
                        }
                    }
                ]
            }
        }]
    })
}

#[tokio::test]
async fn collects_commits_and_touched_paths() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response()))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let result = executor
        .execute("Fix the flaky retry", &context(), None)
        .await
        .unwrap();

    assert_eq!(result.output, "Implemented the fix.");
    assert_eq!(result.commits.len(), 1);
    assert_eq!(result.commits[0].short_sha(), "0123456");
    assert!(result.commits[0].message.contains("ABC-7"));
    assert_eq!(result.files_touched, vec!["src/retry.rs", "src/lib.rs"]);
    assert_eq!(result.provider, ProviderKind::OpenAi);
}

#[tokio::test]
async fn captures_rate_limit_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(tool_call_response())
                .insert_header("x-ratelimit-limit", "1000")
                .insert_header("x-ratelimit-remaining", "997"),
        )
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    executor.execute("prompt", &context(), None).await.unwrap();

    let limits = executor.rate_limits().unwrap();
    assert_eq!(limits.limit, Some(1000));
    assert_eq!(limits.remaining, Some(997));
}

#[tokio::test]
async fn rate_limit_response_is_retryable_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let err = executor.execute("prompt", &context(), None).await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::ProviderUnavailable {
            status: Some(429),
            ..
        }
    ));
    assert_eq!(err.retry_hint(), Some(Duration::from_secs(2)));
    assert_eq!(err.error_class(), ErrorClass::Retryable);
}

#[tokio::test]
async fn hint_falls_back_to_the_message_without_a_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429).set_body_string("rate limited, retry after 3 seconds"),
        )
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let err = executor.execute("prompt", &context(), None).await.unwrap_err();

    // No Retry-After header arrived; the numeric match in the message wins.
    assert_eq!(err.retry_hint(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn auth_rejection_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let err = executor.execute("prompt", &context(), None).await.unwrap_err();

    assert!(matches!(err, ExecutorError::SessionFailed { .. }));
    assert_eq!(err.error_class(), ErrorClass::NonRetryable);
}

#[tokio::test]
async fn server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let err = executor.execute("prompt", &context(), None).await.unwrap_err();

    assert_eq!(err.error_class(), ErrorClass::Retryable);
}

#[tokio::test]
async fn timeout_cancels_and_reports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(tool_call_response())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let mut ctx = context();
    ctx.timeout = Duration::from_millis(100);

    let err = executor.execute("prompt", &ctx, None).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Timeout { .. }));
    assert_eq!(err.error_class(), ErrorClass::Retryable);
}

#[tokio::test]
async fn malformed_tool_arguments_are_skipped() {
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "choices": [{
            "message": {
                "content": "done",
                "tool_calls": [
                    { "function": { "name": "git_commit", "arguments": "not json" } },
                    { "function": { "name": "write_file", "arguments": "{\"path\": \"ok.rs\"}" } }
                ]
            }
        }]
    });
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let result = executor.execute("prompt", &context(), None).await.unwrap();

    assert!(result.commits.is_empty());
    assert_eq!(result.files_touched, vec!["ok.rs"]);
}

#[tokio::test]
async fn empty_choices_is_a_session_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let err = executor.execute("prompt", &context(), None).await.unwrap_err();
    assert!(matches!(err, ExecutorError::SessionFailed { .. }));
}

#[tokio::test]
async fn health_check_probes_with_one_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response()))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let probe = executor.health_check().await;
    assert!(probe.healthy);
    assert!(probe.error.is_none());
}

#[tokio::test]
async fn health_check_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let executor = executor_for(&server);
    let probe = executor.health_check().await;
    assert!(!probe.healthy);
    assert_eq!(probe.error.as_deref(), Some("HTTP 500"));
}
