#![cfg(unix)]

use grimoire::prelude::*;
use grimoire::{bootstrap, bootstrap_from_path, Readiness};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A catalog with a working local model, a crashing one and a hosted model
/// whose key is never set.
fn catalog(dir: &Path) -> String {
    let echo = script(
        dir,
        "echo.sh",
        r#"printf '%s Local says hi (%s tokens)\n' "$2" "$1""#,
    );
    let crash = script(dir, "crash.sh", "echo 'CUDA error: out of memory' >&2; exit 1");
    let weights = dir.join("model.gguf");
    std::fs::write(&weights, b"gguf").unwrap();

    format!(
        r#"
default_model = "default"

[providers.openai]
api_key_env = "GRIMOIRE_IT_UNSET_OPENAI_KEY"

[models.default]
name = "Local Echo"
backend = "local_process"
binary_path = "{echo}"
model_path = "{weights}"
args_template = ["{{max_tokens}}", "{{prompt}}"]
[models.default.parameters]
temperature = 0.7
max_tokens = 512

[models.crashy]
backend = "local_process"
binary_path = "{crash}"

[models.gpt]
name = "GPT-4o mini"
backend = "remote"
provider = "openai"
remote_model = "gpt-4o-mini"

[models.retired]
backend = "remote"
provider = "openai"
remote_model = "gpt-3.5-turbo"
enabled = false

[dispatcher]
request_timeout_secs = 30

[dispatcher.rate_limits.generation]
points = 100
window_seconds = 60
"#,
        echo = echo.display(),
        weights = weights.display(),
        crash = crash.display(),
    )
}

#[tokio::test]
async fn hello_scenario() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = bootstrap(&ModelCatalog::from_toml_str(&catalog(dir.path())).unwrap()).unwrap();

    let conversation = dispatcher
        .create_conversation(Some("default"), Metadata::new())
        .unwrap();
    let result = dispatcher
        .process_message(&conversation.id, "Hello", GenerationOptions::new())
        .await
        .unwrap();

    assert_eq!(result.conversation_id, conversation.id);
    assert_eq!(result.response, "Local says hi (512 tokens)");
    assert_eq!(
        dispatcher.get_conversation(&conversation.id).unwrap().messages.len(),
        2
    );
}

#[tokio::test]
async fn per_call_parameters_override_model_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = bootstrap(&ModelCatalog::from_toml_str(&catalog(dir.path())).unwrap()).unwrap();
    let conversation = dispatcher.create_conversation(None, Metadata::new()).unwrap();

    let result = dispatcher
        .process_message(
            &conversation.id,
            "Hello",
            GenerationOptions::new().with_parameters(ModelParameters::default().with_max_tokens(16)),
        )
        .await
        .unwrap();
    assert_eq!(result.response, "Local says hi (16 tokens)");
}

#[tokio::test]
async fn history_stays_even_across_failures() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = bootstrap(&ModelCatalog::from_toml_str(&catalog(dir.path())).unwrap()).unwrap();
    let conversation = dispatcher.create_conversation(Some("crashy"), Metadata::new()).unwrap();

    for _ in 0..3 {
        let err = dispatcher
            .process_message(&conversation.id, "Hello", GenerationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GrimoireError::ProcessFailed {
                exit_code: Some(1),
                ..
            }
        ));
    }

    let history = dispatcher.get_conversation(&conversation.id).unwrap();
    assert_eq!(history.messages.len(), 6);
    for pair in history.messages.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::System);
        assert!(pair[1].is_error());
        assert!(pair[1].content.contains("out of memory"));
    }
}

#[tokio::test]
async fn models_without_prerequisites_are_listed_but_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = bootstrap(&ModelCatalog::from_toml_str(&catalog(dir.path())).unwrap()).unwrap();

    let models = dispatcher.list_models();
    let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["crashy", "default", "gpt"]);

    let gpt = models.iter().find(|m| m.id == "gpt").unwrap();
    assert!(!gpt.ready);
    assert!(matches!(gpt.readiness, Readiness::NotInstalled(_)));

    assert!(matches!(
        dispatcher.create_conversation(Some("gpt"), Metadata::new()),
        Err(GrimoireError::ModelNotReady { .. })
    ));
    assert!(matches!(
        dispatcher.create_conversation(Some("retired"), Metadata::new()),
        Err(GrimoireError::ModelNotFound(_))
    ));
}

#[tokio::test]
async fn conversations_run_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(
        bootstrap(&ModelCatalog::from_toml_str(&catalog(dir.path())).unwrap()).unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let conversation = dispatcher.create_conversation(None, Metadata::new()).unwrap();
                for turn in 0..2 {
                    dispatcher
                        .process_message(
                            &conversation.id,
                            &format!("conversation {i} turn {turn}"),
                            GenerationOptions::new().with_caller(format!("user-{i}")),
                        )
                        .await
                        .unwrap();
                }
                conversation.id
            })
        })
        .collect();

    for handle in handles {
        let id = handle.await.unwrap();
        assert_eq!(dispatcher.get_conversation(&id).unwrap().messages.len(), 4);
    }
    assert_eq!(dispatcher.list_conversations(10).len(), 4);
    assert_eq!(dispatcher.list_conversations(2).len(), 2);
}

#[tokio::test]
async fn catalog_file_and_cleanup_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.toml");
    std::fs::write(&path, catalog(dir.path())).unwrap();

    let dispatcher = bootstrap_from_path(&path).unwrap();
    dispatcher.spawn_cleanup();
    let conversation = dispatcher.create_conversation(None, Metadata::new()).unwrap();

    assert_eq!(dispatcher.cleanup_old_conversations(Duration::from_secs(3600)), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.cleanup_old_conversations(Duration::ZERO), 1);
    assert!(dispatcher.get_conversation(&conversation.id).is_err());

    dispatcher.shutdown().await;
}
