//! Tests for the routing engine.

use super::*;

fn repo(id: &str) -> RepositoryConfig {
    RepositoryConfig {
        id: id.to_string(),
        path: PathBuf::from(format!("/srv/repos/{id}")),
        base_branch: "main".to_string(),
        labels: Vec::new(),
        projects: Vec::new(),
        teams: Vec::new(),
        provider: None,
        worktree_mode: None,
    }
}

fn issue(identifier: &str) -> IssueDescriptor {
    IssueDescriptor {
        id: format!("internal-{identifier}"),
        identifier: IssueId::new(identifier).unwrap(),
        title: "a task".to_string(),
        description: None,
        labels: Vec::new(),
        project: None,
        team: None,
        state: Some("Todo".to_string()),
    }
}

fn engine(repositories: Vec<RepositoryConfig>) -> RoutingEngine {
    RoutingEngine::new(repositories, LabelRules::default(), WorktreeMode::Fresh)
}

#[tokio::test]
async fn label_match_wins_over_project() {
    let mut by_label = repo("backend");
    by_label.labels = vec!["backend".to_string()];
    let mut by_project = repo("frontend");
    by_project.projects = vec!["Platform".to_string()];

    let engine = engine(vec![by_project, by_label]);

    let mut i = issue("ABC-1");
    i.labels = vec!["Backend".to_string()];
    i.project = Some("Platform".to_string());

    let route = engine.route(&i).await.unwrap();
    assert_eq!(route.repository.id, "backend");
}

#[tokio::test]
async fn project_substring_match_is_case_insensitive() {
    let mut by_project = repo("platform");
    by_project.projects = vec!["platform".to_string()];
    let engine = engine(vec![by_project]);

    let mut i = issue("ABC-2");
    i.project = Some("Core Platform Team".to_string());

    let route = engine.route(&i).await.unwrap();
    assert_eq!(route.repository.id, "platform");
}

#[tokio::test]
async fn team_match_applies_after_project() {
    let mut by_team = repo("infra");
    by_team.teams = vec!["SRE".to_string()];
    let engine = engine(vec![by_team]);

    let mut i = issue("ABC-3");
    i.team = Some("sre".to_string());

    let route = engine.route(&i).await.unwrap();
    assert_eq!(route.repository.id, "infra");
}

#[tokio::test]
async fn repo_tag_in_description_matches_by_id() {
    let engine = engine(vec![repo("api"), repo("web")]);

    let mut i = issue("ABC-4");
    i.description = Some("Please fix the login flow.\n\n[repo=web]".to_string());

    let route = engine.route(&i).await.unwrap();
    assert_eq!(route.repository.id, "web");
}

#[tokio::test]
async fn unmatched_issue_fails_no_match() {
    let engine = engine(vec![repo("api")]);

    let err = engine.route(&issue("ABC-5")).await.unwrap_err();
    assert!(matches!(err, AutodevError::NoMatch { .. }));
}

#[tokio::test]
async fn auto_label_sets_execute_now() {
    let mut target = repo("api");
    target.labels = vec!["api".to_string()];
    let engine = engine(vec![target]);

    let mut i = issue("ABC-6");
    i.labels = vec!["api".to_string(), "auto".to_string()];
    let route = engine.route(&i).await.unwrap();
    assert!(route.execute_now);

    let mut i = issue("ABC-7");
    i.labels = vec!["api".to_string()];
    let route = engine.route(&i).await.unwrap();
    assert!(!route.execute_now);
}

#[tokio::test]
async fn repository_mode_overrides_default() {
    let mut target = repo("api");
    target.labels = vec!["api".to_string()];
    target.worktree_mode = Some(WorktreeMode::BranchPerIssue);
    let engine = engine(vec![target]);

    let mut i = issue("ABC-8");
    i.labels = vec!["api".to_string()];

    let route = engine.route(&i).await.unwrap();
    assert_eq!(route.worktree_mode, WorktreeMode::BranchPerIssue);
}

#[tokio::test]
async fn route_is_cached_until_reload() {
    let mut target = repo("api");
    target.labels = vec!["api".to_string()];
    let engine = engine(vec![target]);

    let mut i = issue("ABC-9");
    i.labels = vec!["api".to_string()];

    engine.route(&i).await.unwrap();
    assert_eq!(engine.cached_routes().await, 1);

    // Second lookup serves the cache.
    engine.route(&i).await.unwrap();
    assert_eq!(engine.cached_routes().await, 1);

    // Reload drops the cache; the old repository no longer matches.
    engine
        .reload(vec![repo("other")], LabelRules::default(), WorktreeMode::Fresh)
        .await;
    assert_eq!(engine.cached_routes().await, 0);
    assert!(engine.route(&i).await.is_err());
}

#[test]
fn repo_tag_extraction() {
    assert_eq!(extract_repo_tag("[repo=web] fix it"), Some("web".to_string()));
    assert_eq!(extract_repo_tag("text [repo= api ] more"), Some("api".to_string()));
    assert_eq!(extract_repo_tag("[repo=]"), None);
    assert_eq!(extract_repo_tag("no tag"), None);
}

#[test]
fn worktree_mode_parses() {
    assert_eq!("fresh".parse::<WorktreeMode>().unwrap(), WorktreeMode::Fresh);
    assert_eq!("reuse".parse::<WorktreeMode>().unwrap(), WorktreeMode::Reuse);
    assert_eq!(
        "branch-per-issue".parse::<WorktreeMode>().unwrap(),
        WorktreeMode::BranchPerIssue
    );
    assert!("other".parse::<WorktreeMode>().is_err());
}
