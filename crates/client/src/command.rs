//! Executor that shells out to a declarative backend CLI (`adc sync ...`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use keel_core::{Config, ExecutionError, ServerAddrError};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{ExecArgs, Executor, ExecutorError};

/// Error report printed by the CLI when some resources were rejected.
#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    failed_errors: Vec<ServerAddrError>,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    binary: PathBuf,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let timeout = std::env::var("KEEL_EXEC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));
        Self { binary: binary.into(), timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(mode: &str, config: &Config, args: &ExecArgs) -> Vec<String> {
        let mut out = vec![
            "sync".to_string(),
            "-f".to_string(),
            args.file_path.to_string_lossy().to_string(),
            "--backend".to_string(),
            mode.to_string(),
            "--server".to_string(),
            config.server_addrs.join(","),
        ];
        if !config.tls_verify {
            out.push("--tls-skip-verify".to_string());
        }
        for (k, v) in &args.labels {
            out.push("--label-selector".to_string());
            out.push(format!("{}={}", k, v));
        }
        for t in &args.resource_types {
            out.push("--include-resource-type".to_string());
            out.push(t.as_str().to_string());
        }
        out
    }
}

/// Map process output to a structured error when it carries a report.
fn parse_report(config: &Config, output: &[u8]) -> Option<ExecutionError> {
    let text = std::str::from_utf8(output).ok()?.trim();
    let report: Report = serde_json::from_str(text).ok()?;
    if report.failed_errors.is_empty() {
        return None;
    }
    Some(ExecutionError { config_name: config.name.clone(), failed_errors: report.failed_errors })
}

#[async_trait::async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, mode: &str, config: &Config, args: &ExecArgs) -> Result<(), ExecutorError> {
        let argv = Self::args(mode, config, args);
        debug!(binary = %self.binary.display(), config = %config.name, args = ?argv, "exec: spawn");
        let mut cmd = Command::new(&self.binary);
        cmd.args(&argv).env("ADC_TOKEN", &config.token).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", self.binary.display(), self.timeout))?
            .with_context(|| format!("spawning {}", self.binary.display()))?;
        if output.status.success() {
            return Ok(());
        }
        if let Some(e) = parse_report(config, &output.stdout).or_else(|| parse_report(config, &output.stderr)) {
            return Err(ExecutorError::Execution(e));
        }
        Err(ExecutorError::Other(anyhow!(
            "{} exited with {}: {}",
            self.binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Labels, ResourceType, ResourceTypes};

    fn cfg() -> Config {
        Config { name: "c1".into(), server_addrs: vec!["http://a:9180".into(), "http://b:9180".into()], token: "t".into(), tls_verify: false }
    }

    #[test]
    fn args_carry_scope() {
        let mut labels = Labels::new();
        labels.insert("k8s/name".into(), "r1".into());
        let args = ExecArgs {
            file_path: PathBuf::from("/tmp/x.json"),
            labels,
            resource_types: ResourceTypes::from_slice(&[ResourceType::Service]),
        };
        let argv = CommandExecutor::args("apisix", &cfg(), &args);
        assert_eq!(&argv[..3], &["sync", "-f", "/tmp/x.json"]);
        assert!(argv.contains(&"http://a:9180,http://b:9180".to_string()));
        assert!(argv.contains(&"--tls-skip-verify".to_string()));
        assert!(argv.contains(&"k8s/name=r1".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("service"));
        // token travels via env, never argv
        assert!(!argv.iter().any(|a| a == "t"));
    }

    #[test]
    fn report_parses_into_execution_error() {
        let out = br#"{"status":"failed","failed_errors":[{"server_addr":"http://a:9180","error":"partial","failed_statuses":[{"resource_type":"service","resource_id":"s1","reason":"bad upstream"}]}]}"#;
        let e = parse_report(&cfg(), out).unwrap();
        assert_eq!(e.config_name, "c1");
        assert_eq!(e.failed_errors[0].failed_statuses[0].resource_id, "s1");
        assert!(parse_report(&cfg(), b"panic: boom").is_none());
        assert!(parse_report(&cfg(), br#"{"failed_errors":[]}"#).is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_unknown_error() {
        let ex = CommandExecutor::new("/nonexistent/keel-adc").with_timeout(Duration::from_secs(2));
        let args = ExecArgs { file_path: PathBuf::from("/tmp/x.json"), labels: Labels::new(), resource_types: ResourceTypes::new() };
        let err = ex.execute("apisix", &cfg(), &args).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Other(_)));
    }
}
