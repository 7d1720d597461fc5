use std::path::Path;
use std::time::Duration;

use relay_core::config::Config;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "pretty");
    assert_eq!(cfg.agent.interpreter, "python3");
    assert_eq!(cfg.agent.auto_dir, ".auto-claude");
    assert!(!cfg.execution.parallel_enabled);
    assert_eq!(cfg.execution.max_workers, 2);
    assert_eq!(cfg.execution.kill_grace(), Duration::from_secs(5));
    assert!(cfg.execution.auto_continue);
    assert!(cfg.execution.force_approval);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("run.py"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.agent.runner_script, cfg.agent.runner_script);
    assert_eq!(parsed.execution.kill_grace_secs, cfg.execution.kill_grace_secs);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[execution]
parallel_enabled = true
max_workers = 4
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert!(cfg.execution.parallel_enabled);
    assert_eq!(cfg.execution.max_workers, 4);
    // untouched keys keep their defaults
    assert_eq!(cfg.execution.kill_grace_secs, 5);
    assert_eq!(cfg.paths.specs_dir, "specs");
    cfg.validate().expect("config validates");
}

#[test]
fn zero_workers_fails_validation() {
    let mut cfg = Config::default();
    cfg.execution.max_workers = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_workers"));
}

#[test]
fn unknown_log_format_fails_validation() {
    let mut cfg = Config::default();
    cfg.general.log_format = "xml".into();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("log_format"));
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[agent]\ndev_mode = true\n").unwrap();

    let cfg = Config::load_from(&path).expect("load");
    assert!(cfg.agent.dev_mode);

    std::fs::write(&path, "[execution]\nkill_grace_secs = 0\n").unwrap();
    assert!(Config::load_from(&path).is_err());
}

#[test]
fn project_paths_derive_from_auto_dir() {
    let cfg = Config::default();
    let project = Path::new("/work/app");
    assert_eq!(
        cfg.specs_root(project),
        Path::new("/work/app/.auto-claude/specs")
    );
    assert_eq!(
        cfg.project_env_path(project),
        Path::new("/work/app/.auto-claude/.env")
    );
}
