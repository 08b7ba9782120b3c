//! Unit tests for the Podman backend.

use rstest::{fixture, rstest};

use super::*;
use crate::backend::BackendErrorKind;
use crate::plan::Protocol;
use crate::record::InstanceState;
use crate::test_support::{ScriptedRunner, plan_from_pairs, record_for};

struct Harness {
    runner: ScriptedRunner,
    backend: PodmanBackend<ScriptedRunner>,
}

#[fixture]
fn harness() -> Harness {
    let runner = ScriptedRunner::new();
    let backend = PodmanBackend::new(runner.clone(), "podman");
    Harness { runner, backend }
}

fn plan(extra: &[(&str, &str)]) -> InfrastructurePlan {
    let mut pairs = vec![("INFRA_TYPE", "container")];
    pairs.extend_from_slice(extra);
    plan_from_pairs("/projects/demo", &pairs).expect("valid plan")
}

fn commands(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .iter()
        .map(Invocation::command_string)
        .collect()
}

#[rstest]
#[tokio::test]
async fn create_runs_detached_container_with_limits_and_ports(harness: Harness) {
    harness.runner.push_output(Some(0), "podman version 5.2.0", "");
    harness.runner.push_failure(1);
    harness.runner.push_output(Some(0), "3f2a9c\n", "");
    harness.runner.push_output(Some(0), "10.88.0.7\n", "");
    let ports = [
        PortBinding {
            host: 8080,
            guest: 80,
            protocol: Protocol::Tcp,
            auto: false,
        },
        PortBinding {
            host: 20000,
            guest: 53,
            protocol: Protocol::Udp,
            auto: true,
        },
    ];

    let descriptor = harness
        .backend
        .create(&plan(&[("MEMORY", "1G"), ("CPUS", "2")]), &ports)
        .await
        .expect("created");

    assert_eq!(
        commands(&harness.runner),
        [
            "podman --version",
            "podman container exists demo",
            "podman run -d --name demo --hostname demo --memory 1024m --cpus 2 \
             -p 8080:80/tcp -p 20000:53/udp alpine:latest sleep infinity",
            "podman inspect -f {{.NetworkSettings.IPAddress}} demo",
        ]
    );
    assert_eq!(descriptor.host, "10.88.0.7");
    assert_eq!(descriptor.user, "root");
    assert_eq!(
        descriptor.target,
        ConnectionTarget::Container {
            name: String::from("demo")
        }
    );
}

#[test]
fn bridge_and_fixed_ip_are_passed_through() {
    let args = run_args(
        &plan(&[("NETWORK_MODE", "bridge"), ("IP_ADDRESS", "10.88.0.50"), ("IMAGE", "debian:12")]),
        &[],
    );
    let joined = args.join(" ");

    assert!(joined.contains("--network bridge --ip 10.88.0.50 debian:12 sleep infinity"), "{joined}");
}

#[rstest]
#[tokio::test]
async fn empty_address_falls_back_to_container_name(harness: Harness) {
    harness.runner.push_output(Some(0), "\n", "");
    let record = record_for(&plan(&[]), InstanceState::Running);

    let descriptor = harness.backend.connect(&record).await.expect("described");

    assert_eq!(descriptor.host, "demo");
}

#[rstest]
#[tokio::test]
async fn failed_run_cleans_up_partial_container(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_failure(1);
    harness
        .runner
        .push_output(Some(125), "", "Error: writing blob: no space left on device");
    harness.runner.push_success();

    let err = harness
        .backend
        .create(&plan(&[]), &[])
        .await
        .expect_err("run fails");

    assert_eq!(err.kind(), BackendErrorKind::InsufficientHostResources);
    assert_eq!(
        commands(&harness.runner).last().map(String::as_str),
        Some("podman rm -f demo")
    );
}

#[rstest]
#[tokio::test]
async fn existing_container_with_the_name_is_left_alone(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_success();

    let err = harness
        .backend
        .create(&plan(&[]), &[])
        .await
        .expect_err("name taken");

    assert_eq!(err.kind(), BackendErrorKind::NameInUse);
    assert_eq!(
        commands(&harness.runner),
        ["podman --version", "podman container exists demo"]
    );
}

#[rstest]
#[tokio::test]
async fn name_clash_during_run_does_not_remove_the_other_container(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_failure(1);
    harness.runner.push_output(
        Some(125),
        "",
        "Error: creating container storage: the container name \"demo\" is already in use by 9c1e. \
         You have to remove that container to be able to reuse that name: that name is already in use",
    );

    let err = harness
        .backend
        .create(&plan(&[]), &[])
        .await
        .expect_err("name taken");

    assert_eq!(err.kind(), BackendErrorKind::NameInUse);
    let issued = commands(&harness.runner);
    assert!(
        issued.iter().all(|command| !command.starts_with("podman rm")),
        "{issued:?}"
    );
}

#[rstest]
#[tokio::test]
async fn missing_podman_is_provider_unavailable(harness: Harness) {
    harness.runner.push_spawn_error(true);

    let err = harness
        .backend
        .create(&plan(&[]), &[])
        .await
        .expect_err("probe fails");

    assert_eq!(err.kind(), BackendErrorKind::ProviderUnavailable);
}

#[rstest]
#[case(false, "podman stop demo")]
#[case(true, "podman stop -t 0 demo")]
#[tokio::test]
async fn stop_respects_force(harness: Harness, #[case] force: bool, #[case] expected: &str) {
    harness.runner.push_success();
    let record = record_for(&plan(&[]), InstanceState::Running);

    harness.backend.stop(&record, force).await.expect("stopped");

    assert_eq!(commands(&harness.runner), [expected]);
}

#[rstest]
#[tokio::test]
async fn start_and_remove_address_the_container(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_success();
    harness.runner.push_success();
    let record = record_for(&plan(&[]), InstanceState::Stopped);

    harness.backend.start(&record).await.expect("started");
    harness.backend.remove(&record).await.expect("removed");

    assert_eq!(
        commands(&harness.runner),
        ["podman --version", "podman start demo", "podman rm -f demo"]
    );
}

#[rstest]
#[tokio::test]
async fn runner_timeout_is_backend_timeout(harness: Harness) {
    harness.runner.push_timeout(120);
    let record = record_for(&plan(&[]), InstanceState::Running);

    let err = harness.backend.stop(&record, false).await.expect_err("times out");

    assert_eq!(err.kind(), BackendErrorKind::Timeout);
}

#[rstest]
fn session_execs_a_shell(harness: Harness) {
    let record = record_for(&plan(&[]), InstanceState::Running);

    assert_eq!(
        harness.backend.session(&record, None).command_string(),
        "podman exec -it demo /bin/sh"
    );
    assert_eq!(
        harness.backend.session(&record, Some("id -u")).command_string(),
        "podman exec -it demo /bin/sh -c id -u"
    );
}
