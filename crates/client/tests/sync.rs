#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use keel_client::{ClientError, ExecArgs, Executor, ExecutorError, SyncClient};
use keel_core::{Config, ExecutionError, ResourceType, Resources, ServerAddrError, Service, SourceKey, Task};
use serde_json::json;

#[derive(Debug, Clone)]
struct Call {
    config: String,
    path: PathBuf,
    resources: Resources,
    resource_types: Vec<ResourceType>,
}

#[derive(Default)]
struct MockExecutor {
    calls: Mutex<Vec<Call>>,
    structured: HashMap<String, ExecutionError>,
    unknown: Vec<String>,
}

impl MockExecutor {
    fn failing(config: &str) -> Self {
        let err = ExecutionError {
            config_name: config.into(),
            failed_errors: vec![ServerAddrError { server_addr: format!("http://{}:9180", config), error: "connection refused".into(), failed_statuses: vec![] }],
        };
        Self { structured: HashMap::from([(config.to_string(), err)]), ..Default::default() }
    }

    fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, _mode: &str, config: &Config, args: &ExecArgs) -> Result<(), ExecutorError> {
        let raw = std::fs::read_to_string(&args.file_path).expect("resources file must exist during execute");
        let resources: Resources = serde_json::from_str(&raw).unwrap();
        self.calls.lock().unwrap().push(Call {
            config: config.name.clone(),
            path: args.file_path.clone(),
            resources,
            resource_types: args.resource_types.to_vec(),
        });
        if let Some(e) = self.structured.get(&config.name) {
            return Err(ExecutorError::Execution(e.clone()));
        }
        if self.unknown.contains(&config.name) {
            return Err(ExecutorError::Other(anyhow!("exit status 2")));
        }
        Ok(())
    }
}

fn cfg(name: &str) -> Config {
    Config { name: name.into(), server_addrs: vec![format!("http://{}:9180", name)], ..Default::default() }
}

fn route_task(name: &str, configs: &[&str]) -> Task {
    let key = SourceKey::new(name, "ns", "ApisixRoute");
    let resources = Resources { services: vec![Service { id: format!("svc-{}", name), name: name.into(), ..Default::default() }], ..Default::default() };
    Task::for_object(key, &[ResourceType::Service], resources).with_configs(configs.iter().map(|c| cfg(c)).collect())
}

fn rule_task(name: &str, plugins: serde_json::Value, configs: &[&str]) -> Task {
    let key = SourceKey::new(name, "ns", "ApisixGlobalRule");
    let global_rules = serde_json::from_value(plugins).unwrap();
    let resources = Resources { global_rules, ..Default::default() };
    Task::for_object(key, &[ResourceType::GlobalRule], resources).with_configs(configs.iter().map(|c| cfg(c)).collect())
}

fn by_name(names: &[&str]) -> BTreeMap<String, Config> {
    names.iter().map(|n| (n.to_string(), cfg(n))).collect()
}

#[tokio::test]
async fn sync_isolates_partial_failure() {
    let exec = Arc::new(MockExecutor::failing("c2"));
    let client = SyncClient::new(exec.clone(), "apisix");
    client.insert(&route_task("r1", &["c1", "c2", "c3"])).await.unwrap();

    let err = client.sync(&by_name(&["c1", "c2", "c3"])).await.unwrap_err();
    match &err {
        ClientError::Sync { failed, errors } => {
            assert_eq!(failed, &vec!["c2".to_string()]);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors["c2"].errors[0].config_name, "c2");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "failed to sync configs: c2");
    let called: Vec<String> = exec.calls().into_iter().map(|c| c.config).collect();
    assert_eq!(called, vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn sync_skips_configs_without_resources() {
    let exec = Arc::new(MockExecutor::default());
    let client = SyncClient::new(exec.clone(), "apisix");
    client.insert(&route_task("r1", &["c1"])).await.unwrap();
    client.sync(&by_name(&["c1", "empty"])).await.unwrap();
    assert_eq!(exec.calls().len(), 1);
    assert!(exec.calls()[0].resource_types.is_empty());
}

#[tokio::test]
async fn sync_merges_global_rules_across_objects() {
    let exec = Arc::new(MockExecutor::default());
    let client = SyncClient::new(exec.clone(), "apisix");
    client.insert(&rule_task("rule-a", json!({"a": 1}), &["c1"])).await.unwrap();
    client.insert(&rule_task("rule-b", json!({"b": 2}), &["c1"])).await.unwrap();
    client.sync(&by_name(&["c1"])).await.unwrap();
    let pushed = &exec.calls()[0].resources.global_rules;
    assert_eq!(serde_json::to_value(pushed).unwrap(), json!({"a": 1, "b": 2}));
}

#[tokio::test]
async fn update_recomputes_global_rules_per_config() {
    let exec = Arc::new(MockExecutor::default());
    let client = SyncClient::new(exec.clone(), "apisix");
    client.insert(&rule_task("rule-a", json!({"a": 1}), &["c1"])).await.unwrap();
    let b = rule_task("rule-b", json!({"b": 2}), &["c1", "c2"]);
    client.insert(&b).await.unwrap();
    client.update(&b).await.unwrap();
    let calls = exec.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(serde_json::to_value(&calls[0].resources.global_rules).unwrap(), json!({"a": 1, "b": 2}));
    assert_eq!(serde_json::to_value(&calls[1].resources.global_rules).unwrap(), json!({"b": 2}));
    // per-config files
    assert_ne!(calls[0].path, calls[1].path);
}

#[tokio::test]
async fn update_shares_one_file_and_removes_it() {
    let exec = Arc::new(MockExecutor::failing("c2"));
    let client = SyncClient::new(exec.clone(), "apisix");
    let err = client.update(&route_task("r1", &["c1", "c2"])).await.unwrap_err();
    assert!(matches!(err, ClientError::Execution(ref e) if e.errors.len() == 1));
    let calls = exec.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].path, calls[1].path);
    assert!(!calls[0].path.exists(), "temp file must be removed after the call");
    // update never touches the store
    assert!(client.with_store(|s| s.is_empty()).await);
}

#[tokio::test]
async fn unknown_errors_fail_the_config() {
    let exec = Arc::new(MockExecutor { unknown: vec!["c1".into()], ..Default::default() });
    let client = SyncClient::new(exec.clone(), "apisix");
    client.insert(&route_task("r1", &["c1"])).await.unwrap();
    let err = client.sync(&by_name(&["c1"])).await.unwrap_err();
    let errors = err.execution_errors();
    assert!(errors["c1"].errors.is_empty());
    assert_eq!(errors["c1"].unknown.len(), 1);
}

#[tokio::test]
async fn insert_aborts_without_rollback() {
    let exec = Arc::new(MockExecutor::default());
    let client = SyncClient::new(exec, "apisix");
    // c2 already holds svc-r1 for a different owner
    let mut squatter = route_task("r1", &["c2"]);
    squatter.key = Some(SourceKey::new("other", "ns", "ApisixRoute"));
    squatter.labels = SourceKey::new("other", "ns", "ApisixRoute").labels();
    client.insert(&squatter).await.unwrap();

    let err = client.insert(&route_task("r1", &["c1", "c2", "c3"])).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(_)));
    let (c1, c3) = client
        .with_store(|s| (s.get_resources("c1").is_some(), s.get_resources("c3").is_some()))
        .await;
    assert!(c1, "earlier config keeps its insert");
    assert!(!c3, "later configs are never reached");
}

#[tokio::test]
async fn remove_clears_store() {
    let exec = Arc::new(MockExecutor::default());
    let client = SyncClient::new(exec.clone(), "apisix");
    let t = route_task("r1", &["c1"]);
    client.insert(&t).await.unwrap();
    client.remove(&t).await.unwrap();
    client.sync(&by_name(&["c1"])).await.unwrap();
    assert!(exec.calls().is_empty());
}
