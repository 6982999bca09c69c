mod common;

use common::{ScriptedRunner, pipeline, secret_scope};
use ferrule_core::run::EventKind;
use ferrule_scheduler::{RunController, TriggerEvent};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const SAMPLE: &str = include_str!("../../../pipelines/ci.yaml");

fn controller() -> RunController {
    RunController::new(
        pipeline(SAMPLE),
        Arc::new(ScriptedRunner::new()),
        secret_scope(&[]),
    )
}

#[test]
fn sample_plan_on_branch_push() {
    let plan = controller()
        .plan(&TriggerEvent::push("refs/heads/main"))
        .unwrap();

    assert!(plan.triggered);
    assert_eq!(plan.event, EventKind::Push);

    let ids: Vec<String> = plan.instances.iter().map(|i| i.id.to_string()).collect();
    assert_eq!(
        ids,
        vec![
            "codestyle",
            "lint",
            "compile",
            "docs",
            "compile-no-std",
            "test (rust=stable)",
            "test (rust=beta)",
            "test (rust=nightly)",
            "publish-crate",
        ]
    );

    let publish = plan.instances.last().unwrap();
    assert_eq!(publish.needs.len(), 3);
    assert_eq!(
        publish.condition.as_deref(),
        Some("startsWith(ref, 'refs/tags/v0')")
    );
    assert!(!publish.gate_open);
    assert!(plan.instances[..8].iter().all(|i| i.gate_open && i.condition.is_none()));
}

#[test]
fn sample_plan_on_release_tag_opens_publish_gate() {
    let plan = controller()
        .plan(&TriggerEvent::push("refs/tags/v0.3.1"))
        .unwrap();

    assert!(plan.triggered);
    assert!(plan.instances.last().unwrap().gate_open);

    let plan = controller()
        .plan(&TriggerEvent::push("refs/tags/v1.0.0"))
        .unwrap();
    assert!(!plan.instances.last().unwrap().gate_open);
}

#[test]
fn plan_serializes_for_display() {
    let plan = controller()
        .plan(&TriggerEvent::pull_request("refs/heads/feature"))
        .unwrap();
    let json = serde_json::to_value(&plan).unwrap();

    assert_eq!(json["event"], "pull_request");
    assert_eq!(json["instances"].as_array().map(Vec::len), Some(9));
    assert!(json["instances"][0].get("condition").is_none());
}
