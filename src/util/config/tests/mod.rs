//! 配置加载单元测试

use std::collections::HashMap;
use std::io::Write;

use crate::runtime::scheduler::SchedulerKind;
use crate::util::config::{ConfigError, RuntimeConfig, ENV_LOG, ENV_SCHEDULER, ENV_WORKERS};
use crate::util::logger::LogLevel;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.node_id, 0);
        assert_eq!(config.scheduler.kind, SchedulerKind::Inline);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_full_document() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [runtime]
            node_id = 3
            registry_shards = 16
            retain_completed_tasks = true

            [scheduler]
            kind = "work-stealing"
            num_workers = 6
            steal_batch = 8

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.node_id, 3);
        assert_eq!(config.runtime.registry_shards, 16);
        assert!(config.runtime.retain_completed_tasks);
        assert_eq!(config.scheduler.kind, SchedulerKind::WorkStealing);
        assert_eq!(config.scheduler.num_workers, 6);
        assert_eq!(config.scheduler.steal_batch, 8);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_unknown_scheduler_is_parse_error() {
        let err = RuntimeConfig::from_toml_str("[scheduler]\nkind = \"fifo\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RuntimeConfig::default()
            .with_node(5)
            .with_scheduler(SchedulerKind::Rayon)
            .with_workers(2);
        let text = config.to_toml_string().unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nkind = \"rayon\"\nnum_workers = 2").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.kind, SchedulerKind::Rayon);
        assert_eq!(config.scheduler.num_workers, 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

#[cfg(test)]
mod override_tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup(&[
                (ENV_WORKERS, "3"),
                (ENV_SCHEDULER, "work-stealing"),
                (ENV_LOG, "warn"),
            ]))
            .unwrap();
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.kind, SchedulerKind::WorkStealing);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_bad_override() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(lookup(&[(ENV_WORKERS, "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOverride {
                key: ENV_WORKERS,
                ..
            }
        ));
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let mut config = RuntimeConfig::default();
        config.apply_overrides(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }
}

#[cfg(test)]
mod validate_tests {
    use super::*;

    #[test]
    fn test_rejects_zero_workers() {
        let config = RuntimeConfig::default().with_workers(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_shards() {
        let mut config = RuntimeConfig::default();
        config.runtime.registry_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_node() {
        let config = RuntimeConfig::default().with_node(4096);
        assert!(config.validate().is_err());
        assert!(RuntimeConfig::default().with_node(4095).validate().is_ok());
    }
}
