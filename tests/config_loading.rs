use std::io::Write;

use sluice::core::config::RuntimeConfig;
use sluice::flow::{FlowGraphBuilder, ProcessingNode};
use sluice::{FlowContext, FlowNodeStatus, Result, SluiceError};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[runtime]
flow_id = "orders"
default_demand = 16
event_capacity = 64

[retry]
max_attempts = 5
initial_backoff_ms = 50
max_backoff_ms = 2000

[store]
path = "/tmp/sluice-test/contexts.db"

[log]
filter = "sluice=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = RuntimeConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.flow_id, "orders");
    assert_eq!(config.runtime.default_demand, 16);
    assert_eq!(config.runtime.event_capacity, 64);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.initial_backoff_ms, 50);
    assert_eq!(config.retry.max_backoff_ms, 2000);
    assert_eq!(config.store.path.as_deref(), Some("/tmp/sluice-test/contexts.db"));
    assert_eq!(config.log.filter, "sluice=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SLUICE_TEST_FLOW_ID", "expanded-flow");

    let toml_content = r#"
[runtime]
flow_id = "${SLUICE_TEST_FLOW_ID}"
"#;

    let tmp = sluice_test_utils::write_config(toml_content).expect("write config");
    let config = RuntimeConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.runtime.flow_id, "expanded-flow");

    std::env::remove_var("SLUICE_TEST_FLOW_ID");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = sluice_test_utils::write_config("[runtime]\n").expect("write config");
    let config = RuntimeConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.flow_id, "default");
    assert_eq!(config.runtime.default_demand, 0);
    assert_eq!(config.runtime.event_capacity, 256);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff_ms, 100);
    assert_eq!(config.retry.max_backoff_ms, 10_000);
    assert!(config.store.path.is_none());
    assert_eq!(config.log.filter, "sluice=info,warn");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let result = RuntimeConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(SluiceError::ConfigNotFound(_))));
}

#[test]
fn test_invalid_values_rejected() {
    for content in [
        "[runtime]\ndefault_demand = -1\n",
        "[runtime]\nevent_capacity = 0\n",
        "[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n",
        "[runtime]\nflow_id = 7\n",
    ] {
        assert!(
            matches!(RuntimeConfig::parse(content), Err(SluiceError::Config(_))),
            "{}",
            content
        );
    }
}

#[test]
fn test_graph_from_config_uses_sqlite_store() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = dir.path().join("store").join("contexts.db");
    let config = RuntimeConfig::parse(&format!(
        "[runtime]\nflow_id = \"persisted\"\n\n[store]\npath = \"{}\"\n",
        db.display()
    ))
    .expect("parse config");

    let builder = FlowGraphBuilder::<String>::from_config(&config).expect("builder");
    let services = builder.services();
    let node = ProcessingNode::new(
        "upper",
        |ctx: &FlowContext<String>| -> Result<Vec<String>> { Ok(vec![ctx.data().to_uppercase()]) },
        services.clone(),
    );
    let graph = builder.node(node).entry("upper").build().expect("build graph");
    assert_eq!(graph.flow_id(), "persisted");

    let session = graph.start_session();
    graph.offer(&session, vec!["a".into(), "b".into()]).expect("offer");
    assert!(graph.finish(&session));

    let archived = services
        .repo
        .find_by_status(FlowNodeStatus::Archived)
        .expect("query store");
    assert_eq!(archived.len(), 2);
    assert!(db.exists());
}
