//! BDD scenarios for the instance lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Bringing a project up twice creates one instance"
)]
fn scenario_up_is_idempotent(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A second project on a taken port is refused"
)]
fn scenario_port_conflict(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Provisioning runs once per instance"
)]
fn scenario_provisioning_once(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Removing a running instance needs force"
)]
fn scenario_remove_needs_force(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failed create leaves nothing behind"
)]
fn scenario_failed_create(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Stopping twice is harmless"
)]
fn scenario_stop_twice(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
