use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::catalog::{UNLOAD_SET, same_module, sysfs_name};
use crate::error::KmodError;
use crate::inspect::{ModuleInspector, ModuleRuntimeState};
use crate::loader::ModuleLoader;

/// Decides whether a loaded module still has consumers outside the pass.
pub trait BusyPolicy: Send + Sync {
    /// Why `state` cannot be removed, or `None` when it can. `unloading` holds
    /// the kernel names of every module removed in this pass.
    fn busy(&self, state: &ModuleRuntimeState, unloading: &BTreeSet<String>) -> Option<String>;
}

/// A module is busy when it has more references than holders that are
/// being removed alongside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependentCountPolicy;

impl DependentCountPolicy {
    pub fn removable_dependents(state: &ModuleRuntimeState, unloading: &BTreeSet<String>) -> usize {
        state
            .dependents
            .iter()
            .filter(|holder| unloading.contains(&sysfs_name(holder)))
            .count()
    }
}

impl BusyPolicy for DependentCountPolicy {
    fn busy(&self, state: &ModuleRuntimeState, unloading: &BTreeSet<String>) -> Option<String> {
        let removable = Self::removable_dependents(state, unloading);
        (state.reference_count as usize > removable)
            .then(|| format!("only {removable} held by modules being unloaded"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadOutcome {
    NothingLoaded,
    Unloaded(Vec<String>),
}

/// Loaded members of the unload set, holders ahead of what they hold.
#[derive(Debug, Clone, Default)]
pub struct UnloadPlan {
    states: Vec<ModuleRuntimeState>,
}

impl UnloadPlan {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn modules(&self) -> Vec<String> {
        self.states.iter().map(|state| state.name.clone()).collect()
    }
}

pub struct Unloader<'a> {
    inspector: &'a dyn ModuleInspector,
    loader: &'a dyn ModuleLoader,
    policy: &'a dyn BusyPolicy,
}

impl<'a> Unloader<'a> {
    pub fn new(
        inspector: &'a dyn ModuleInspector,
        loader: &'a dyn ModuleLoader,
        policy: &'a dyn BusyPolicy,
    ) -> Self {
        Unloader {
            inspector,
            loader,
            policy,
        }
    }

    /// Read live state for `modules` and order the loaded ones for removal.
    ///
    /// Fails with [`KmodError::Busy`] if any loaded module is held by
    /// something outside the pass.
    pub fn plan(&self, modules: &[&str]) -> Result<UnloadPlan, KmodError> {
        let mut loaded = Vec::new();
        for module in modules {
            let state = self.inspector.runtime_state(module)?;
            if state.loaded {
                loaded.push(state);
            }
        }

        let unloading: BTreeSet<String> = loaded.iter().map(|s| sysfs_name(&s.name)).collect();
        for state in &loaded {
            if let Some(reason) = self.policy.busy(state, &unloading) {
                warn!(
                    module = %state.name,
                    refs = state.reference_count,
                    %reason,
                    "Could not unload NVIDIA driver kernel modules, driver is in use"
                );
                return Err(KmodError::Busy {
                    module: state.name.clone(),
                    refs: state.reference_count,
                    reason,
                });
            }
        }

        Ok(UnloadPlan {
            states: dependency_order(loaded),
        })
    }

    /// Unload every loaded module of the driver's unload set.
    pub fn unload(&self) -> Result<UnloadOutcome, KmodError> {
        self.unload_modules(&UNLOAD_SET)
    }

    pub fn unload_modules(&self, modules: &[&str]) -> Result<UnloadOutcome, KmodError> {
        let plan = self.plan(modules)?;
        if plan.is_empty() {
            return Ok(UnloadOutcome::NothingLoaded);
        }
        let names = plan.modules();
        info!("Unloading NVIDIA driver kernel modules: {}", names.join(" "));
        self.loader.unload(&names)?;
        Ok(UnloadOutcome::Unloaded(names))
    }
}

/// Order so that every module comes after the modules holding it.
fn dependency_order(states: Vec<ModuleRuntimeState>) -> Vec<ModuleRuntimeState> {
    fn visit(
        index: usize,
        states: &[ModuleRuntimeState],
        visited: &mut Vec<bool>,
        order: &mut Vec<usize>,
    ) {
        if visited[index] {
            return;
        }
        visited[index] = true;
        for (other, candidate) in states.iter().enumerate() {
            let holds = states[index]
                .dependents
                .iter()
                .any(|holder| same_module(holder, &candidate.name));
            if holds {
                visit(other, states, visited, order);
            }
        }
        order.push(index);
    }

    let mut visited = vec![false; states.len()];
    let mut order = Vec::with_capacity(states.len());
    for index in 0..states.len() {
        visit(index, &states, &mut visited, &mut order);
    }

    let mut slots: Vec<Option<ModuleRuntimeState>> = states.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}
