//! Unit tests for the registry implementations.

use std::net::Ipv4Addr;
use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::plan::InstanceId;
use crate::record::InstanceState;
use crate::test_support::{plan_from_pairs, record_for};

fn id(raw: &str) -> InstanceId {
    InstanceId::parse(raw).expect("valid id")
}

fn running(name: &str, ports: &str) -> InstanceRecord {
    let plan = plan_from_pairs(
        &format!("/projects/{name}"),
        &[("INFRA_TYPE", "container"), ("PORTS", ports)],
    )
    .expect("valid plan");
    record_for(&plan, InstanceState::Running)
}

struct FileFixture {
    _tmp: TempDir,
    path: Utf8PathBuf,
    registry: FileRegistry,
}

#[fixture]
fn file_registry() -> FileFixture {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("state").join("registry.json"))
        .expect("utf8 path");
    let policy = LockPolicy {
        timeout: Duration::from_millis(300),
        stale_after: Duration::from_secs(120),
        retry_every: Duration::from_millis(10),
    };
    let registry = FileRegistry::new(path.clone(), policy);
    FileFixture {
        _tmp: tmp,
        path,
        registry,
    }
}

#[rstest]
fn missing_file_reads_as_empty(file_registry: FileFixture) {
    assert!(file_registry.registry.all().expect("read").is_empty());
    assert!(!file_registry.path.exists(), "reads must not create the file");
}

#[rstest]
fn records_survive_a_new_handle(file_registry: FileFixture) {
    file_registry
        .registry
        .upsert(&id("demo"), |_| running("demo", "8080:80"))
        .expect("upsert");

    let reopened = FileRegistry::new(file_registry.path.clone(), LockPolicy::default());
    let record = reopened.get(&id("demo")).expect("read").expect("present");

    assert_eq!(record.state, InstanceState::Running);
    assert_eq!(record.networking.ports.len(), 1);
}

#[rstest]
fn document_has_version_and_instances(file_registry: FileFixture) {
    file_registry
        .registry
        .upsert(&id("demo"), |_| running("demo", ""))
        .expect("upsert");

    let text = std::fs::read_to_string(&file_registry.path).expect("read document");
    let json: serde_json::Value = serde_json::from_str(&text).expect("json");

    assert_eq!(json["version"], 1);
    assert_eq!(json["instances"]["demo"]["id"], "demo");
}

#[rstest]
fn lock_file_is_released(file_registry: FileFixture) {
    file_registry
        .registry
        .upsert(&id("demo"), |_| running("demo", ""))
        .expect("upsert");

    let lock = file_registry.path.with_file_name("registry.json.lock");
    assert!(!lock.exists(), "lock should be removed after the transaction");
}

#[rstest]
fn corrupt_document_fails_closed_and_is_preserved(file_registry: FileFixture) {
    std::fs::create_dir_all(file_registry.path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&file_registry.path, "{ not json").expect("write garbage");

    let err = file_registry.registry.get(&id("demo")).expect_err("corrupt");
    assert!(matches!(err, RegistryError::Corrupt { .. }), "got {err}");

    let upsert = file_registry
        .registry
        .upsert(&id("demo"), |_| running("demo", ""));
    assert!(matches!(upsert, Err(RegistryError::Corrupt { .. })));

    let text = std::fs::read_to_string(&file_registry.path).expect("read");
    assert_eq!(text, "{ not json", "corrupt document must not be rewritten");
}

#[rstest]
fn unknown_version_is_corrupt(file_registry: FileFixture) {
    std::fs::create_dir_all(file_registry.path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&file_registry.path, r#"{"version":9,"instances":{}}"#).expect("write");

    let err = file_registry.registry.all().expect_err("unsupported version");
    assert!(err.to_string().contains("version 9"), "got {err}");
}

#[rstest]
fn held_lock_times_out(file_registry: FileFixture) {
    let lock = file_registry.path.with_file_name("registry.json.lock");
    std::fs::create_dir_all(lock.parent().expect("parent")).expect("mkdir");
    let fresh = format!("other-token {} 1\n", chrono::Utc::now().to_rfc3339());
    std::fs::write(&lock, fresh).expect("write lock");

    let err = file_registry.registry.all().expect_err("lock is held");

    assert!(matches!(err, RegistryError::LockTimeout { .. }), "got {err}");
    assert!(lock.exists(), "a live lock must not be broken");
}

#[rstest]
fn stale_lock_is_broken(file_registry: FileFixture) {
    let lock = file_registry.path.with_file_name("registry.json.lock");
    std::fs::create_dir_all(lock.parent().expect("parent")).expect("mkdir");
    let old = chrono::Utc::now() - chrono::Duration::hours(1);
    std::fs::write(&lock, format!("dead-token {} 1\n", old.to_rfc3339())).expect("write lock");

    assert!(file_registry.registry.all().expect("stale lock broken").is_empty());
}

#[test]
fn fresh_lock_that_replaced_a_stale_one_is_kept() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = Dir::open_ambient_dir(
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path"),
        ambient_authority(),
    )
    .expect("open dir");
    let old = chrono::Utc::now() - chrono::Duration::hours(1);
    let stale = format!("dead-token {} 1\n", old.to_rfc3339());
    let fresh = format!("live-token {} 2\n", chrono::Utc::now().to_rfc3339());
    dir.write("registry.json.lock", &fresh).expect("write lock");

    assert!(!super::file::break_stale_lock(&dir, "registry.json.lock", &stale));

    assert_eq!(dir.read_to_string("registry.json.lock").expect("lock kept"), fresh);
    let leftovers = std::fs::read_dir(tmp.path()).expect("list").count();
    assert_eq!(leftovers, 1, "only the restored lock should remain");
}

#[test]
fn stale_lock_is_removed_when_unchanged() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = Dir::open_ambient_dir(
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path"),
        ambient_authority(),
    )
    .expect("open dir");
    let stale = "dead-token 2000-01-01T00:00:00+00:00 1\n";
    dir.write("registry.json.lock", stale).expect("write lock");

    assert!(super::file::break_stale_lock(&dir, "registry.json.lock", stale));
    assert_eq!(std::fs::read_dir(tmp.path()).expect("list").count(), 0);
}

#[test]
fn concurrent_upserts_from_threads_are_serialised() {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("registry.json")).expect("utf8 path");
    let policy = LockPolicy {
        timeout: Duration::from_secs(30),
        stale_after: Duration::from_secs(120),
        retry_every: Duration::from_millis(2),
    };
    let registry = FileRegistry::new(path, policy);
    let mut seed = running("demo", "");
    seed.resources.memory_mb = 0;
    registry.upsert(&id("demo"), |_| seed).expect("seed");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let handle = registry.clone();
            scope.spawn(move || {
                for _ in 0..10 {
                    handle
                        .upsert(&id("demo"), |current| {
                            let mut next = current.cloned().expect("seeded record");
                            next.resources.memory_mb += 1;
                            next
                        })
                        .expect("increment");
                }
            });
        }
    });

    let record = registry.get(&id("demo")).expect("read").expect("present");
    assert_eq!(record.resources.memory_mb, 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn waiting_for_the_lock_lets_other_tasks_run() {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("registry.json")).expect("utf8 path");
    let lock = path.with_file_name("registry.json.lock");
    let fresh = format!("other-token {} 1\n", chrono::Utc::now().to_rfc3339());
    std::fs::write(&lock, fresh).expect("write lock");
    let registry = FileRegistry::new(
        path,
        LockPolicy {
            timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
            retry_every: Duration::from_millis(10),
        },
    );

    let started = std::time::Instant::now();
    let waiter = tokio::spawn(async move { registry.all() });
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::remove_file(&lock)
    });

    release.await.expect("join").expect("lock released");
    let records = waiter.await.expect("join").expect("lock acquired after release");
    assert!(records.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[rstest]
fn failed_transaction_discards_changes(file_registry: FileFixture) {
    let outcome: Result<(), RegistryError> = file_registry.registry.transact(|set| {
        set.insert(running("demo", ""));
        Err(RegistryError::Io {
            path: Utf8PathBuf::from("x"),
            message: String::from("boom"),
        })
    });

    assert!(outcome.is_err());
    assert!(file_registry.registry.all().expect("read").is_empty());
}

#[test]
fn memory_registry_clones_share_state() {
    let registry = MemoryRegistry::new();
    let observer = registry.clone();

    registry
        .upsert(&id("demo"), |_| running("demo", ""))
        .expect("upsert");

    assert_eq!(observer.all().expect("read").len(), 1);
    assert_eq!(observer.remove(&id("demo")).expect("remove").map(|r| r.id), Some(id("demo")));
    assert!(registry.get(&id("demo")).expect("read").is_none());
}

#[test]
fn upsert_sees_current_value() {
    let registry = MemoryRegistry::with_records([running("demo", "")]);

    let updated = registry
        .upsert(&id("demo"), |current| {
            let mut next = current.cloned().expect("existing record");
            next.provisioned = true;
            next
        })
        .expect("upsert");

    assert!(updated.provisioned);
    assert!(registry.get(&id("demo")).expect("read").expect("present").provisioned);
}

#[test]
fn upsert_rejects_changed_id() {
    let registry = MemoryRegistry::new();

    let err = registry
        .upsert(&id("demo"), |_| running("other", ""))
        .expect_err("id mismatch");

    assert!(matches!(err, RegistryError::IdMismatch { .. }));
    assert!(registry.all().expect("read").is_empty());
}

#[test]
fn indexes_cover_ports_and_ips() {
    let mut with_ip = running("web", "8080:80,5353:53/udp");
    with_ip.networking.fixed_ip = Some(Ipv4Addr::new(10, 0, 0, 5));
    let set = RecordSet::from_records([with_ip, running("api", "9090:90")]);

    let ports = set.port_owners();
    assert_eq!(ports.get(&(8080, crate::plan::Protocol::Tcp)), Some(&id("web")));
    assert_eq!(ports.get(&(5353, crate::plan::Protocol::Udp)), Some(&id("web")));
    assert_eq!(ports.get(&(9090, crate::plan::Protocol::Tcp)), Some(&id("api")));
    assert_eq!(
        set.ip_owners().get(&Ipv4Addr::new(10, 0, 0, 5)),
        Some(&id("web"))
    );
}

#[test]
fn snapshot_is_detached() {
    let registry = MemoryRegistry::with_records([running("demo", "")]);
    let mut snapshot = registry.snapshot().expect("snapshot");

    snapshot.remove(&id("demo"));

    assert_eq!(registry.all().expect("read").len(), 1);
}
