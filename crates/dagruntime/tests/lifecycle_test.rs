mod common;

use common::{params, Harness};
use dagruntime::{
    EngineConfig, ExecutionId, ExecutionStatus, FlowError, InMemoryVersionStore, ParameterType,
    ParameterValidation, ResourceKind, TemplateParameter, Value, VersionStore, WorkflowDefinition,
    WorkflowEngine, WorkflowStep, WorkflowTemplate,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn single_output(output: &str) -> WorkflowDefinition {
    WorkflowDefinition::new("", "Single").with_step(WorkflowStep::task("s1", "echo").with_outputs([output]))
}

fn content_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "content-pipeline",
        "Content pipeline",
        json!({
            "name": "Content about ${topic}",
            "timeout_ms": "${timeout}",
            "variables": { "topic": "${topic}", "audience": "${audience}" },
            "steps": [
                { "id": "draft", "type": "task", "target": "echo", "inputs": ["topic"], "outputs": ["draft"] },
                {
                    "id": "review",
                    "type": "task",
                    "target": "echo",
                    "name": "Review ${topic} for ${audience}",
                    "inputs": ["draft"],
                    "outputs": ["reviewed"],
                    "dependencies": ["draft"]
                }
            ]
        }),
    )
    .with_category("content")
    .with_parameter(TemplateParameter::required("topic", ParameterType::String))
    .with_parameter(TemplateParameter::optional(
        "timeout",
        ParameterType::Number,
        Some(Value::from(30000i64)),
    ))
    .with_parameter(
        TemplateParameter::optional("audience", ParameterType::String, Some(Value::from("everyone")))
            .with_validation(ParameterValidation {
                allowed: Some(vec![Value::from("everyone"), Value::from("engineers")]),
                ..ParameterValidation::default()
            }),
    )
}

#[tokio::test]
async fn test_rollback_single_version_is_noop() {
    let harness = Harness::new();
    let engine = harness.engine();
    let created = engine.create_version("wf1", single_output("x"), None, None).await.unwrap();

    let restored = engine.rollback("wf1", 1, None).await.unwrap();

    assert_eq!(restored.version, 1);
    assert!(restored.is_active);
    assert_eq!(restored.definition, created.definition);
    assert_eq!(restored.created_at, created.created_at);
    assert_eq!(engine.list_versions("wf1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_changes_executed_version() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine
        .create_version("wf", single_output("old"), Some("first".to_string()), Some("alice".to_string()))
        .await
        .unwrap();
    engine.create_version("wf", single_output("new"), Some("second".to_string()), None).await.unwrap();

    let latest = engine.execute_workflow("wf", HashMap::new(), None).await.unwrap();
    assert_eq!(latest.version, 2);
    assert!(latest.step_results.contains_key("new"));

    engine.rollback("wf", 1, Some("regression in v2")).await.unwrap();
    assert_eq!(engine.get_version("wf", None).await.unwrap().unwrap().version, 1);

    let rolled_back = engine.execute_workflow("wf", HashMap::new(), None).await.unwrap();
    assert_eq!(rolled_back.version, 1);
    assert!(rolled_back.step_results.contains_key("old"));

    // An explicit version still runs even when it is not the active one.
    let pinned = engine.execute_workflow("wf", HashMap::new(), Some(2)).await.unwrap();
    assert_eq!(pinned.version, 2);

    let versions = engine.list_versions("wf").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].created_by.as_deref(), Some("alice"));
    assert_eq!(versions[1].changelog.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_execute_unknown_workflow_or_version() {
    let harness = Harness::new();
    let engine = harness.engine();

    let err = engine.execute_workflow("ghost", HashMap::new(), None).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NotFound {
            kind: ResourceKind::Workflow,
            ..
        }
    ));

    engine.create_version("wf", single_output("x"), None, None).await.unwrap();
    let err = engine.execute_workflow("wf", HashMap::new(), Some(9)).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NotFound {
            kind: ResourceKind::Version,
            ..
        }
    ));

    assert_eq!(engine.get_statistics().await.total_executions, 0);
}

#[tokio::test]
async fn test_invalid_definition_is_rejected_atomically() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.create_version("wf", single_output("x"), None, None).await.unwrap();

    let broken = WorkflowDefinition::new("wf", "Broken")
        .with_step(WorkflowStep::task("a", "echo"))
        .with_parallel_group(["a", "missing"]);
    let err = engine.create_version("wf", broken, None, None).await.unwrap_err();

    assert!(err.is_validation());
    let versions = engine.list_versions("wf").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].is_active);
}

#[tokio::test]
async fn test_instantiate_missing_required_parameter_is_atomic() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;
    engine
        .instantiate("content-pipeline", params([("topic", Value::from("rust"))]), Some("blog"))
        .await
        .unwrap();
    let before = engine.list_versions("blog").await.unwrap().len();

    let err = engine
        .instantiate("content-pipeline", HashMap::new(), Some("blog"))
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(engine.list_versions("blog").await.unwrap().len(), before);
}

#[tokio::test]
async fn test_instantiate_substitutes_every_placeholder() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;

    let version = engine
        .instantiate(
            "content-pipeline",
            params([("topic", Value::from("foo")), ("timeout", Value::from(500i64))]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(version.workflow_id, "content-pipeline");
    assert_eq!(version.version, 1);
    assert_eq!(
        version.changelog.as_deref(),
        Some("Instantiated from template 'content-pipeline'")
    );

    let definition = &version.definition;
    let serialized = serde_json::to_string(definition).unwrap();
    assert!(!serialized.contains("${"), "No placeholder should remain: {}", serialized);

    assert_eq!(definition.name, "Content about foo");
    assert_eq!(definition.timeout_ms, Some(500));
    assert_eq!(definition.variables["topic"], Value::from("foo"));
    assert_eq!(definition.variables["audience"], Value::from("everyone"));
    assert_eq!(definition.find_step("review").unwrap().name, "Review foo for everyone");

    let ctx = engine.execute_workflow("content-pipeline", HashMap::new(), None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.step_results["reviewed"], Value::from("foo"));
}

#[tokio::test]
async fn test_instantiate_rejects_invalid_parameters() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;

    let wrong_type = engine
        .instantiate("content-pipeline", params([("topic", Value::from(42i64))]), None)
        .await
        .unwrap_err();
    assert!(wrong_type.is_validation());

    let not_allowed = engine
        .instantiate(
            "content-pipeline",
            params([("topic", Value::from("rust")), ("audience", Value::from("robots"))]),
            None,
        )
        .await
        .unwrap_err();
    assert!(not_allowed.is_validation());

    let unknown = engine.instantiate("nope", HashMap::new(), None).await.unwrap_err();
    assert!(matches!(
        unknown,
        FlowError::NotFound {
            kind: ResourceKind::Template,
            ..
        }
    ));

    assert!(engine.list_versions("content-pipeline").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_template_listing() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;
    engine
        .register_template(
            WorkflowTemplate::new("alerts", "Alerts", json!({ "steps": [] })).with_category("ops"),
        )
        .await;

    let all: Vec<String> = engine.list_templates(None).await.into_iter().map(|t| t.id).collect();
    assert_eq!(all, vec!["alerts", "content-pipeline"]);

    let content = engine.list_templates(Some("content")).await;
    assert_eq!(content.len(), 1);
    assert_eq!(content[0].id, "content-pipeline");

    assert!(engine.get_template("alerts").await.is_some());
    assert!(engine.get_template("missing").await.is_none());
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let harness = Harness::new();
    let engine = harness.engine();

    let definition = WorkflowDefinition::new("slow", "Slow")
        .with_step(WorkflowStep::task("wait", "blocking"))
        .with_step(WorkflowStep::task("after", "echo").depends_on(["wait"]));
    engine.create_version("slow", definition, None, None).await.unwrap();

    let handle = engine.spawn_workflow("slow", HashMap::new(), None).await.unwrap();
    let execution_id = handle.execution_id;
    harness.started.notified().await;

    let live = engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(live.status, ExecutionStatus::Running);
    assert_eq!(live.current_step.as_deref(), Some("wait"));
    assert_eq!(engine.get_statistics().await.active_executions, 1);

    assert!(engine.cancel_execution(execution_id).await.unwrap());

    let ctx = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled execution should finish")
        .unwrap();

    assert_eq!(ctx.status, ExecutionStatus::Cancelled);
    assert!(ctx.end_time.is_some());
    assert!(ctx.error.is_none());
    assert!(!harness.journal.started("after"));

    // Evicted once terminal.
    assert!(engine.get_execution_status(execution_id).await.is_none());
    assert!(engine.cancel_execution(execution_id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_spawned_parallel_group_runs_to_completion() {
    let harness = Harness::new();
    let engine = harness.engine();

    let definition = WorkflowDefinition::new("fan", "Fan out")
        .with_step(WorkflowStep::task("x", "rendezvous").with_outputs(["x"]))
        .with_step(WorkflowStep::task("y", "rendezvous").with_outputs(["y"]))
        .with_step(WorkflowStep::task("z", "echo").with_inputs(["x"]).with_outputs(["z"]).depends_on(["x", "y"]))
        .with_parallel_group(["x", "y"]);
    engine.create_version("fan", definition, None, None).await.unwrap();

    let handle = engine.spawn_workflow("fan", HashMap::new(), None).await.unwrap();
    let ctx = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("spawned execution should finish")
        .unwrap();

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.step_results["z"], Value::from("x-result"));
    assert_eq!(engine.get_statistics().await.active_executions, 0);
}

#[tokio::test]
async fn test_cancel_unknown_execution() {
    let harness = Harness::new();
    let engine = harness.engine();

    let err = engine.cancel_execution(ExecutionId::new_v4()).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NotFound {
            kind: ResourceKind::Execution,
            ..
        }
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_and_clears_everything() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;
    engine
        .create_version("slow", WorkflowDefinition::new("slow", "Slow").with_step(WorkflowStep::task("wait", "blocking")), None, None)
        .await
        .unwrap();

    let handle = engine.spawn_workflow("slow", HashMap::new(), None).await.unwrap();
    harness.started.notified().await;

    engine.shutdown().await;

    let ctx = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("shutdown should end running executions")
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Cancelled);
    assert!(ctx.end_time.is_some());

    let stats = engine.get_statistics().await;
    assert_eq!(stats.total_workflows, 0);
    assert_eq!(stats.total_versions, 0);
    assert_eq!(stats.total_templates, 0);
    assert_eq!(stats.active_executions, 0);
    assert_eq!(stats.total_executions, 0);
    assert!(engine.get_version("slow", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_statistics_track_state() {
    let harness = Harness::new();
    let engine = harness.engine();
    engine.register_template(content_template()).await;

    engine.create_version("a", single_output("x"), None, None).await.unwrap();
    engine.create_version("a", single_output("y"), None, None).await.unwrap();
    engine.create_version("b", single_output("z"), None, None).await.unwrap();

    engine.execute_workflow("a", HashMap::new(), None).await.unwrap();
    engine.execute_workflow("b", HashMap::new(), None).await.unwrap();

    let stats = engine.get_statistics().await;
    assert_eq!(stats.total_workflows, 2);
    assert_eq!(stats.total_versions, 3);
    assert_eq!(stats.total_templates, 1);
    assert_eq!(stats.active_executions, 0);
    assert_eq!(stats.total_executions, 2);
}

#[tokio::test]
async fn test_engine_uses_injected_version_store() {
    let harness = Harness::new();
    let store = Arc::new(InMemoryVersionStore::new());
    store.create_version("seeded", single_output("x"), None, None).await.unwrap();

    let engine = WorkflowEngine::builder(Arc::new(harness.executors()))
        .version_store(store.clone())
        .build()
        .unwrap();

    let ctx = engine.execute_workflow("seeded", HashMap::new(), None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Completed);

    engine.create_version("seeded", single_output("y"), None, None).await.unwrap();
    assert_eq!(store.version_count().await, 2);
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let harness = Harness::new();
    let result = WorkflowEngine::builder(Arc::new(harness.executors()))
        .config(EngineConfig {
            event_buffer_size: 0,
            ..EngineConfig::default()
        })
        .build();

    assert!(matches!(result, Err(FlowError::Config(_))));
}
