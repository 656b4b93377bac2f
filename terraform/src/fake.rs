//! Scriptable stand-in for Terraform used by reconciler tests.

use crate::{
    BackendConfig, DeclarativeTool, OutputValue, PlanOutcome, TerraformError, TerraformResult,
    Variables,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct FakeState {
    tracked: BTreeSet<String>,
    outputs: BTreeMap<String, OutputValue>,
    plan: PlanOutcome,
    init_failures: u32,
    fail_plan: bool,
    fail_apply: bool,
    fail_destroy: bool,
    fail_state_list: bool,
    failing_imports: BTreeSet<String>,
    backend: Option<BackendConfig>,
    applied: bool,
    destroyed: bool,
    calls: Vec<String>,
}

/// In-memory [`DeclarativeTool`] that records every call.
#[derive(Debug)]
pub struct FakeTerraform {
    state: Mutex<FakeState>,
}

impl Default for FakeTerraform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTerraform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                tracked: BTreeSet::new(),
                outputs: BTreeMap::new(),
                plan: PlanOutcome::Changes,
                init_failures: 0,
                fail_plan: false,
                fail_apply: false,
                fail_destroy: false,
                fail_state_list: false,
                failing_imports: BTreeSet::new(),
                backend: None,
                applied: false,
                destroyed: false,
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn failed(command: &str) -> TerraformError {
        TerraformError::CommandFailed {
            command: command.to_string(),
            code: Some(1),
            stderr: format!("scripted {} failure", command),
        }
    }

    pub fn with_tracked(self, address: &str) -> Self {
        self.state().tracked.insert(address.to_string());
        self
    }

    pub fn with_output(self, name: &str, value: OutputValue) -> Self {
        self.state().outputs.insert(name.to_string(), value);
        self
    }

    pub fn with_plan(self, plan: PlanOutcome) -> Self {
        self.state().plan = plan;
        self
    }

    /// The first `times` init calls fail.
    pub fn failing_init(self, times: u32) -> Self {
        self.state().init_failures = times;
        self
    }

    pub fn failing_plan(self) -> Self {
        self.state().fail_plan = true;
        self
    }

    pub fn failing_apply(self) -> Self {
        self.state().fail_apply = true;
        self
    }

    pub fn failing_destroy(self) -> Self {
        self.state().fail_destroy = true;
        self
    }

    pub fn failing_state_list(self) -> Self {
        self.state().fail_state_list = true;
        self
    }

    pub fn failing_import(self, address: &str) -> Self {
        self.state().failing_imports.insert(address.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn backend(&self) -> Option<BackendConfig> {
        self.state().backend.clone()
    }

    pub fn is_tracked(&self, address: &str) -> bool {
        self.state().tracked.contains(address)
    }

    pub fn applied(&self) -> bool {
        self.state().applied
    }

    pub fn destroyed(&self) -> bool {
        self.state().destroyed
    }
}

#[async_trait]
impl DeclarativeTool for FakeTerraform {
    async fn init(
        &self,
        backend: Option<&BackendConfig>,
        reconfigure: bool,
    ) -> TerraformResult<()> {
        let mut state = self.state();
        state.calls.push(if reconfigure {
            "init -reconfigure".to_string()
        } else {
            "init".to_string()
        });

        if state.init_failures > 0 {
            state.init_failures -= 1;
            return Err(Self::failed("init"));
        }
        state.backend = backend.cloned();
        Ok(())
    }

    async fn plan(&self, _vars: &Variables) -> TerraformResult<PlanOutcome> {
        let mut state = self.state();
        state.calls.push("plan".to_string());
        if state.fail_plan {
            return Err(Self::failed("plan"));
        }
        Ok(state.plan)
    }

    async fn apply(&self, _vars: &Variables) -> TerraformResult<()> {
        let mut state = self.state();
        state.calls.push("apply".to_string());
        if state.fail_apply {
            return Err(Self::failed("apply"));
        }
        state.applied = true;
        Ok(())
    }

    async fn destroy(&self, _vars: &Variables) -> TerraformResult<()> {
        let mut state = self.state();
        state.calls.push("destroy".to_string());
        if state.fail_destroy {
            return Err(Self::failed("destroy"));
        }
        state.tracked.clear();
        state.destroyed = true;
        Ok(())
    }

    async fn state_list(&self) -> TerraformResult<Vec<String>> {
        let mut state = self.state();
        state.calls.push("state list".to_string());
        if state.fail_state_list {
            return Err(Self::failed("state list"));
        }
        Ok(state.tracked.iter().cloned().collect())
    }

    async fn import(&self, address: &str, id: &str, _vars: &Variables) -> TerraformResult<()> {
        let mut state = self.state();
        state.calls.push(format!("import {} {}", address, id));
        if state.failing_imports.contains(address) {
            return Err(Self::failed("import"));
        }
        if !state.tracked.insert(address.to_string()) {
            return Err(TerraformError::CommandFailed {
                command: "import".to_string(),
                code: Some(1),
                stderr: format!("Resource already managed by Terraform: {}", address),
            });
        }
        Ok(())
    }

    async fn outputs(&self) -> TerraformResult<BTreeMap<String, OutputValue>> {
        let mut state = self.state();
        state.calls.push("output".to_string());
        Ok(state.outputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_import_is_rejected() {
        let tf = FakeTerraform::new();
        let vars = Variables::new();

        tf.import("aws_ecr_repository.app", "app", &vars).await.unwrap();
        assert!(tf.is_tracked("aws_ecr_repository.app"));
        assert!(tf.import("aws_ecr_repository.app", "app", &vars).await.is_err());
    }

    #[tokio::test]
    async fn test_init_failures_are_consumed() {
        let tf = FakeTerraform::new().failing_init(1);

        assert!(tf.init(None, false).await.is_err());
        tf.init(None, true).await.unwrap();
        assert_eq!(tf.calls(), vec!["init", "init -reconfigure"]);
    }
}
