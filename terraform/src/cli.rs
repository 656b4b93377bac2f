//! Drives the `terraform` binary in one root module directory.

use crate::{
    BackendConfig, DeclarativeTool, OutputValue, PlanOutcome, TerraformError, TerraformResult,
    Variables,
};
use async_trait::async_trait;
use cloud::process::{CommandOutput, CommandRunner, CommandSpec};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Terraform runner for a single root module
pub struct TerraformCli<R> {
    runner: R,
    binary: String,
    working_dir: PathBuf,
}

impl<R: CommandRunner> TerraformCli<R> {
    pub fn new(runner: R, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: "terraform".to_string(),
            working_dir: working_dir.into(),
        }
    }

    /// Use a specific terraform binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .arg(subcommand)
            .cwd(&self.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
    }

    fn var_args(vars: &Variables) -> Vec<String> {
        vars.iter()
            .flat_map(|(name, value)| ["-var".to_string(), format!("{}={}", name, value)])
            .collect()
    }

    async fn run(&self, spec: CommandSpec) -> TerraformResult<CommandOutput> {
        debug!("Running: {}", spec);
        Ok(self.runner.run(&spec).await?)
    }

    async fn run_checked(&self, name: &str, spec: CommandSpec) -> TerraformResult<CommandOutput> {
        let output = self.run(spec).await?;
        if !output.is_success() {
            return Err(Self::failure(name, &output));
        }
        Ok(output)
    }

    fn failure(name: &str, output: &CommandOutput) -> TerraformError {
        TerraformError::CommandFailed {
            command: name.to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        }
    }
}

#[async_trait]
impl<R: CommandRunner> DeclarativeTool for TerraformCli<R> {
    async fn init(
        &self,
        backend: Option<&BackendConfig>,
        reconfigure: bool,
    ) -> TerraformResult<()> {
        let mut spec = self.command("init").args(["-input=false", "-no-color"]);
        if let Some(backend) = backend {
            spec = spec.args(backend.to_args());
        }
        if reconfigure {
            spec = spec.arg("-reconfigure");
        }

        info!(
            "terraform init in {} (reconfigure: {})",
            self.working_dir.display(),
            reconfigure
        );
        self.run_checked("init", spec).await.map(|_| ())
    }

    async fn plan(&self, vars: &Variables) -> TerraformResult<PlanOutcome> {
        let spec = self
            .command("plan")
            .args(["-input=false", "-no-color", "-detailed-exitcode"])
            .args(Self::var_args(vars));

        let output = self.run(spec).await?;
        PlanOutcome::from_exit_code(output.code).ok_or_else(|| Self::failure("plan", &output))
    }

    async fn apply(&self, vars: &Variables) -> TerraformResult<()> {
        let spec = self
            .command("apply")
            .args(["-input=false", "-no-color", "-auto-approve"])
            .args(Self::var_args(vars));
        self.run_checked("apply", spec).await.map(|_| ())
    }

    async fn destroy(&self, vars: &Variables) -> TerraformResult<()> {
        let spec = self
            .command("destroy")
            .args(["-input=false", "-no-color", "-auto-approve"])
            .args(Self::var_args(vars));
        self.run_checked("destroy", spec).await.map(|_| ())
    }

    async fn state_list(&self) -> TerraformResult<Vec<String>> {
        let spec = self.command("state").arg("list");
        let output = self.run_checked("state list", spec).await?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn import(&self, address: &str, id: &str, vars: &Variables) -> TerraformResult<()> {
        let spec = self
            .command("import")
            .args(["-input=false", "-no-color"])
            .args(Self::var_args(vars))
            .args([address, id]);
        self.run_checked("import", spec).await.map(|_| ())
    }

    async fn outputs(&self) -> TerraformResult<BTreeMap<String, OutputValue>> {
        let spec = self.command("output").arg("-json");
        let output = self.run_checked("output", spec).await?;

        if output.stdout.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud::process::ScriptedRunner;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.insert("environment".to_string(), "dev".to_string());
        vars.insert("region".to_string(), "us-east-1".to_string());
        vars
    }

    #[test]
    fn test_var_args() {
        let args = TerraformCli::<ScriptedRunner>::var_args(&vars());
        assert_eq!(
            args,
            vec!["-var", "environment=dev", "-var", "region=us-east-1"]
        );
    }

    #[tokio::test]
    async fn test_init_with_backend() {
        let runner = ScriptedRunner::new().on(&["init"], CommandOutput::success(""));
        let tf = TerraformCli::new(runner, "/work/infrastructure").with_binary("tofu");
        let backend = BackendConfig {
            bucket: "state".to_string(),
            lock_table: "locks".to_string(),
            region: "us-east-1".to_string(),
            key: "infrastructure/terraform.tfstate".to_string(),
        };

        tf.init(Some(&backend), true).await.unwrap();

        let calls = tf.runner().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "tofu");
        assert_eq!(calls[0].cwd, Some(PathBuf::from("/work/infrastructure")));
        assert!(calls[0].has_args(&["-backend-config=bucket=state", "-reconfigure"]));
        assert_eq!(calls[0].env.get("TF_IN_AUTOMATION"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_init_without_backend() {
        let runner = ScriptedRunner::new().on(&["init"], CommandOutput::success(""));
        let tf = TerraformCli::new(runner, "/work/bootstrap");

        tf.init(None, false).await.unwrap();

        let calls = tf.runner().calls();
        assert!(!calls[0].args.iter().any(|a| a.starts_with("-backend-config")));
        assert!(!calls[0].has_args(&["-reconfigure"]));
    }

    #[tokio::test]
    async fn test_plan_detailed_exit_codes() {
        let tf = TerraformCli::new(
            ScriptedRunner::new()
                .once(&["plan"], CommandOutput::failure(2, ""))
                .once(&["plan"], CommandOutput::success(""))
                .on(&["plan"], CommandOutput::failure(1, "Error: Invalid reference")),
            "/work",
        );

        assert_eq!(tf.plan(&vars()).await.unwrap(), PlanOutcome::Changes);
        assert_eq!(tf.plan(&vars()).await.unwrap(), PlanOutcome::NoChanges);
        let error = tf.plan(&vars()).await.unwrap_err();
        assert!(error.to_string().contains("Invalid reference"));
    }

    #[tokio::test]
    async fn test_apply_failure_is_reported() {
        let tf = TerraformCli::new(
            ScriptedRunner::new().on(
                &["apply"],
                CommandOutput::failure(1, "Error: creating ECR Repository: RepositoryAlreadyExistsException"),
            ),
            "/work",
        );

        match tf.apply(&vars()).await {
            Err(TerraformError::CommandFailed { command, code, stderr }) => {
                assert_eq!(command, "apply");
                assert_eq!(code, Some(1));
                assert!(stderr.contains("RepositoryAlreadyExistsException"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_list_parsing() {
        let tf = TerraformCli::new(
            ScriptedRunner::new().on(
                &["state", "list"],
                CommandOutput::success(
                    "aws_ecr_repository.app\nmodule.eks.aws_eks_cluster.this[0]\n\n",
                ),
            ),
            "/work",
        );

        let addresses = tf.state_list().await.unwrap();
        assert_eq!(
            addresses,
            vec![
                "aws_ecr_repository.app".to_string(),
                "module.eks.aws_eks_cluster.this[0]".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_import_argument_order() {
        let tf = TerraformCli::new(
            ScriptedRunner::new().on(&["import"], CommandOutput::success("Import successful!")),
            "/work",
        );

        tf.import("aws_ecr_repository.app", "neo4j-demos-app-dev", &vars())
            .await
            .unwrap();

        let call = &tf.runner().calls()[0];
        let n = call.args.len();
        assert_eq!(call.args[n - 2], "aws_ecr_repository.app");
        assert_eq!(call.args[n - 1], "neo4j-demos-app-dev");
        assert!(call.has_args(&["-var", "environment=dev"]));
    }

    #[tokio::test]
    async fn test_outputs() {
        let tf = TerraformCli::new(
            ScriptedRunner::new()
                .once(
                    &["output"],
                    CommandOutput::success(
                        r#"{"cluster_name": {"sensitive": false, "type": "string", "value": "neo4j-demos-dev"}}"#,
                    ),
                )
                .on(&["output"], CommandOutput::success("")),
            "/work",
        );

        let outputs = tf.outputs().await.unwrap();
        assert_eq!(outputs["cluster_name"].as_plain_string(), "neo4j-demos-dev");
        assert!(tf.outputs().await.unwrap().is_empty());
    }
}
