//! Scratch projects and registry for driving the `berth` binary.

use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use escargot::CargoBuild;
use tempfile::TempDir;

#[expect(
    clippy::expect_used,
    reason = "test setup requires panic on build failure"
)]
static BERTH_BIN: LazyLock<escargot::CargoRun> = LazyLock::new(|| {
    CargoBuild::new()
        .bin("berth")
        .features("test-backdoors")
        .run()
        .expect("failed to build berth with test-backdoors feature")
});

/// A temporary home holding projects and the registry they share.
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}")),
        }
    }

    fn root(&self) -> &Utf8Path {
        Utf8Path::from_path(self.root.path()).unwrap_or_else(|| panic!("tempdir is not UTF-8"))
    }

    /// Creates `projects/<name>` with the given declarations.
    pub fn project(&self, name: &str, declarations: &str) -> Utf8PathBuf {
        let dir = self.root().join("projects").join(name);
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("create {dir}: {err}"));
        if !declarations.is_empty() {
            fs::write(dir.join(".env"), declarations)
                .unwrap_or_else(|err| panic!("write {dir}/.env: {err}"));
        }
        dir
    }

    pub fn registry_path(&self) -> Utf8PathBuf {
        self.root().join("state").join("registry.json")
    }

    /// `berth` run inside `project` against the scripted backend in `mode`.
    pub fn berth(&self, project: &Utf8Path, mode: &str) -> assert_cmd::Command {
        let mut cmd: assert_cmd::Command = BERTH_BIN.command().into();
        cmd.current_dir(project)
            .env("HOME", self.root())
            .env("XDG_CONFIG_HOME", self.root().join("config"))
            .env("XDG_DATA_HOME", self.root().join("data"))
            .env("BERTH_FAKE_BACKEND", mode)
            .env("BERTH_REGISTRY_PATH", self.registry_path())
            .env("BERTH_CHECK_HOST_MEMORY", "false")
            .env_remove("BERTH_CONFIG_PATH")
            .env_remove("BERTH_LOG");
        cmd
    }
}
