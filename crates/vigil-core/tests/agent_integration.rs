//! Whole-agent test: config file in, JSON lines out.

use std::time::Duration;

use serde_json::{json, Value};
use vigil_core::{Agent, AgentConfig};

#[test]
fn test_agent_delivers_results_to_file_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("report.jsonl");
    let config_path = dir.path().join("agent.json");

    let config = json!({
        "agent_name": "integration",
        "submit": {"type": "file", "path": report.to_str().unwrap(),
                    "capacity": 1, "timeout": 5.0},
        "perfmon": [{
            "name": "heartbeat", "type": "poll", "delay": 0.2, "priority": 1,
            "tasks": [{"method": "dummy", "text": "alive", "format": null,
                        "expect": "string", "timeout": 5.0, "retry": 1}]
        }]
    });
    std::fs::write(&config_path, config.to_string()).expect("write config");

    let config = AgentConfig::load(&config_path).expect("config load");
    let mut agent = Agent::from_config(&config).expect("agent build");
    agent.start();
    std::thread::sleep(Duration::from_millis(1200));
    agent.stop();

    let contents = std::fs::read_to_string(&report).expect("report readable");
    let lines: Vec<&str> = contents.lines().collect();
    assert!(
        lines.len() >= 2,
        "expected repeated deliveries, got {} line(s)",
        lines.len()
    );
    for line in lines {
        let envelope: Value = serde_json::from_str(line).expect("line is json");
        assert_eq!(envelope["cmd"], Value::String("result".into()));
        assert_eq!(envelope["name"], Value::String("heartbeat".into()));
        assert_eq!(envelope["value"], Value::String("alive".into()));
        assert_eq!(envelope["errno"], Value::from(0));
        assert!(envelope["submit_time"].is_string());
    }
}

#[test]
fn test_agent_rejects_config_missing_required_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("agent.json");
    std::fs::write(
        &config_path,
        json!({"agent_name": "broken", "perfmon": []}).to_string(),
    )
    .expect("write config");

    assert!(AgentConfig::load(&config_path).is_err());
}
