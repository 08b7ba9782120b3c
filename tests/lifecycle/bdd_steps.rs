//! BDD step definitions for the instance lifecycle.

use std::future::Future;

use berth::backend::BackendError;
use berth::lifecycle::LifecycleError;
use berth::record::InstanceState;
use berth::registry::Registry;
use berth::test_support::BackendOp;
use berth::UpOptions;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{CommandResult, LifecycleContext, instance_id};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn block_on<F: Future>(future: F) -> Result<F::Output, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    Ok(runtime.block_on(future))
}

fn record<T>(lifecycle_context: &mut LifecycleContext, outcome: Result<T, LifecycleError>) {
    lifecycle_context.last = Some(match outcome {
        Ok(_) => CommandResult::Success,
        Err(err) => CommandResult::Failure(err.kind().as_str().to_owned()),
    });
}

#[given("a container project \"{name}\" forwarding port {port:u16}")]
fn container_project(lifecycle_context: &mut LifecycleContext, name: String, port: u16) {
    let ports = format!("{port}:80");
    lifecycle_context.add_plan(
        name.trim(),
        &[("INFRA_TYPE", "container"), ("PORTS", ports.as_str())],
    );
}

#[given("a provisioned container project \"{name}\"")]
fn provisioned_project(lifecycle_context: &mut LifecycleContext, name: String) {
    lifecycle_context.add_plan(
        name.trim(),
        &[
            ("INFRA_TYPE", "container"),
            ("PROVISIONING_PLAYBOOK", "site.yml"),
        ],
    );
}

#[given("the container backend is not installed")]
fn container_backend_missing(lifecycle_context: &mut LifecycleContext) {
    lifecycle_context.container.fail_next(
        BackendOp::Create,
        BackendError::ProviderUnavailable {
            provider: String::from("podman"),
            message: String::from("not installed"),
        },
    );
}

#[when("I bring \"{name}\" up")]
fn bring_up(lifecycle_context: &mut LifecycleContext, name: String) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let plan = lifecycle_context.plan(name.trim()).clone();
    let outcome = block_on(lifecycle.up(&plan, UpOptions::default()))?;
    record(lifecycle_context, outcome);
    Ok(())
}

#[when("I remove \"{name}\"")]
fn remove(lifecycle_context: &mut LifecycleContext, name: String) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let outcome = block_on(lifecycle.rm(&instance_id(name.trim()), false))?;
    record(lifecycle_context, outcome);
    Ok(())
}

#[when("I force-remove \"{name}\"")]
fn force_remove(lifecycle_context: &mut LifecycleContext, name: String) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let outcome = block_on(lifecycle.rm(&instance_id(name.trim()), true))?;
    record(lifecycle_context, outcome);
    Ok(())
}

#[when("I stop \"{name}\"")]
fn stop(lifecycle_context: &mut LifecycleContext, name: String) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let outcome = block_on(lifecycle.stop(&instance_id(name.trim()), false))?;
    record(lifecycle_context, outcome);
    Ok(())
}

#[then("the last command fails with \"{kind}\"")]
fn last_fails_with(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    match &lifecycle_context.last {
        Some(CommandResult::Failure(actual)) if actual == kind.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure {kind}, got {other:?}"
        ))),
    }
}

#[then("the last command succeeds")]
fn last_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.last {
        Some(CommandResult::Success) => Ok(()),
        other => Err(StepError::Assertion(format!("expected success, got {other:?}"))),
    }
}

#[then("the container backend created {count:usize} instance")]
fn container_created(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let created = lifecycle_context.container.count(BackendOp::Create);
    if created == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} create call(s), got {created}"
        )))
    }
}

#[then("the playbook ran {count:usize} time")]
fn playbook_ran(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let runs = lifecycle_context.provisioner.calls().len();
    if runs == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} provisioning run(s), got {runs}"
        )))
    }
}

#[then("the registry holds {count:usize} instance")]
fn registry_holds(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let records = lifecycle_context
        .registry
        .all()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if records.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} record(s), got {}",
            records.len()
        )))
    }
}

fn state_of(
    lifecycle_context: &LifecycleContext,
    name: &str,
) -> Result<Option<InstanceState>, StepError> {
    lifecycle_context
        .registry
        .get(&instance_id(name.trim()))
        .map(|record| record.map(|found| found.state))
        .map_err(|err| StepError::Assertion(err.to_string()))
}

fn expect_state(
    lifecycle_context: &LifecycleContext,
    name: &str,
    expected: Option<InstanceState>,
) -> Result<(), StepError> {
    let actual = state_of(lifecycle_context, name)?;
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to be {expected:?}, found {actual:?}"
        )))
    }
}

#[then("\"{name}\" is running")]
fn is_running(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    expect_state(lifecycle_context, &name, Some(InstanceState::Running))
}

#[then("\"{name}\" is stopped")]
fn is_stopped(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    expect_state(lifecycle_context, &name, Some(InstanceState::Stopped))
}

#[then("\"{name}\" is absent")]
fn is_absent(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    expect_state(lifecycle_context, &name, None)
}
