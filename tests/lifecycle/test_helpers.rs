//! Shared fixtures for lifecycle BDD scenarios.

use std::collections::BTreeMap;

use berth::backend::Backends;
use berth::lifecycle::Lifecycle;
use berth::plan::{InfraType, InfrastructurePlan, InstanceId};
use berth::registry::MemoryRegistry;
use berth::test_support::{ScriptedBackend, ScriptedProvisioner, plan_from_pairs};
use rstest::fixture;

pub type ScriptedLifecycle =
    Lifecycle<Backends<ScriptedBackend, ScriptedBackend>, ScriptedProvisioner, MemoryRegistry>;

#[derive(Clone, Debug)]
pub enum CommandResult {
    Success,
    Failure(String),
}

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub vm: ScriptedBackend,
    pub container: ScriptedBackend,
    pub provisioner: ScriptedProvisioner,
    pub registry: MemoryRegistry,
    pub plans: BTreeMap<String, InfrastructurePlan>,
    pub last: Option<CommandResult>,
}

impl LifecycleContext {
    /// Builds a lifecycle over the shared doubles; every clone observes the
    /// same calls and records.
    pub fn lifecycle(&self) -> ScriptedLifecycle {
        Lifecycle::new(
            Backends {
                vm: self.vm.clone(),
                container: self.container.clone(),
            },
            self.provisioner.clone(),
            self.registry.clone(),
        )
    }

    pub fn add_plan(&mut self, name: &str, pairs: &[(&str, &str)]) {
        let plan = plan_from_pairs(&format!("/projects/{name}"), pairs)
            .unwrap_or_else(|err| panic!("declarations for {name} should validate: {err:?}"));
        self.plans.insert(name.to_owned(), plan);
    }

    pub fn plan(&self, name: &str) -> &InfrastructurePlan {
        self.plans
            .get(name)
            .unwrap_or_else(|| panic!("scenario never declared project {name}"))
    }
}

pub fn instance_id(name: &str) -> InstanceId {
    InstanceId::parse(name).unwrap_or_else(|err| panic!("invalid id {name}: {err}"))
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        vm: ScriptedBackend::new(InfraType::Vm),
        container: ScriptedBackend::new(InfraType::Container),
        provisioner: ScriptedProvisioner::new(),
        registry: MemoryRegistry::new(),
        plans: BTreeMap::new(),
        last: None,
    }
}
