//! Roster loading and validation.

use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ConnectorSettings, DispatchMode, RosterConfig};

/// Load and validate a roster file.
///
/// # Errors
///
/// Returns [`ConfigError`] on IO, parse, or semantic failure.
pub fn load_roster(path: &Path) -> ConfigResult<RosterConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_roster_str(&raw)
}

/// Parse and validate roster TOML from a string.
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or semantic failure.
pub fn load_roster_str(raw: &str) -> ConfigResult<RosterConfig> {
    let roster: RosterConfig = toml::from_str(raw)?;
    validate(&roster)?;
    Ok(roster)
}

fn validate(roster: &RosterConfig) -> ConfigResult<()> {
    if roster.butlers.is_empty() {
        return Err(ConfigError::Invalid("roster declares no butlers".to_string()));
    }

    let mut names = HashSet::new();
    let mut ports = HashSet::new();
    let mut schemas = HashSet::new();
    for butler in &roster.butlers {
        let name = butler.name.as_str();
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("butler name must be non-empty".to_string()));
        }
        if !names.insert(name) {
            return Err(ConfigError::Invalid(format!("duplicate butler name: {name}")));
        }
        if !ports.insert(butler.port) {
            return Err(ConfigError::Invalid(format!(
                "duplicate port {} (butler {name})",
                butler.port
            )));
        }
        if butler.schema.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("butler {name} has an empty schema")));
        }
        if !schemas.insert(butler.schema.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate schema {} (butler {name})",
                butler.schema
            )));
        }

        let mut schedule_names = HashSet::new();
        for schedule in &butler.schedules {
            if !schedule_names.insert(schedule.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "butler {name} declares schedule '{}' twice",
                    schedule.name
                )));
            }
            match schedule.dispatch_mode {
                DispatchMode::Prompt if schedule.prompt.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "schedule {name}/{} is prompt-mode but has no prompt",
                        schedule.name
                    )));
                },
                DispatchMode::Job if schedule.job_name.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "schedule {name}/{} is job-mode but has no job_name",
                        schedule.name
                    )));
                },
                _ => {},
            }
        }
    }

    if roster.switchboard().is_none() {
        return Err(ConfigError::Invalid(
            "roster must declare a 'switchboard' butler (ingest/registry owner)".to_string(),
        ));
    }
    if !names.contains("messenger") {
        warn!("roster declares no 'messenger' butler; channel egress will be unavailable");
    }

    Ok(())
}

impl ConnectorSettings {
    /// Resolve connector settings from `CONNECTOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] when `CONNECTOR_IDENTITY` is
    /// unset, or [`ConfigError::InvalidEnv`] for unparseable intervals.
    pub fn from_env() -> ConfigResult<Self> {
        let identity = std::env::var("CONNECTOR_IDENTITY")
            .map_err(|_| ConfigError::MissingEnv("CONNECTOR_IDENTITY".to_string()))?;
        let checkpoint_path = std::env::var("CONNECTOR_CHECKPOINT_PATH").ok().map(Into::into);
        let heartbeat_interval_s = env_u64("CONNECTOR_HEARTBEAT_INTERVAL_S", 120)?;
        let poll_interval_s = env_u64("CONNECTOR_POLL_INTERVAL_S", 30)?;
        Ok(Self {
            identity,
            checkpoint_path,
            heartbeat_interval_s,
            poll_interval_s,
        })
    }
}

fn env_u64(name: &str, default: u64) -> ConfigResult<u64> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            reason: format!("expected integer seconds, got '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdapterKind;

    const MINIMAL: &str = r#"
        [[butler]]
        name = "switchboard"
        port = 8350
        schema = "switchboard"
        description = "ingest, routing, registry"

        [[butler]]
        name = "health"
        port = 8351
        schema = "health"
        description = "weight, sleep, exercise tracking"

        [[butler.schedule]]
        name = "daily_summary"
        cron = "0 8 * * *"
        dispatch_mode = "prompt"
        prompt = "Summarize yesterday's health entries."
    "#;

    #[test]
    fn test_minimal_roster_parses() {
        let roster = load_roster_str(MINIMAL).unwrap();
        assert_eq!(roster.butlers.len(), 2);
        assert_eq!(roster.daemon.worker_count, 4);
        assert_eq!(roster.daemon.adapter, AdapterKind::ClaudeCode);
        let health = roster.butler(&"health".into()).unwrap();
        assert_eq!(health.schedules.len(), 1);
        assert_eq!(health.schedules[0].cron, "0 8 * * *");
    }

    #[test]
    fn test_daemon_overrides() {
        let raw = format!("[daemon]\nworker_count = 9\nadapter = \"codex\"\n{MINIMAL}");
        let roster = load_roster_str(&raw).unwrap();
        assert_eq!(roster.daemon.worker_count, 9);
        assert_eq!(roster.daemon.adapter, AdapterKind::Codex);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let raw = MINIMAL.replace("name = \"health\"", "name = \"switchboard\"");
        assert!(matches!(load_roster_str(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let raw = MINIMAL.replace("port = 8351", "port = 8350");
        assert!(matches!(load_roster_str(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_missing_switchboard() {
        let raw = MINIMAL.replace("name = \"switchboard\"", "name = \"reception\"");
        let err = load_roster_str(&raw).unwrap_err();
        assert!(err.to_string().contains("switchboard"));
    }

    #[test]
    fn test_rejects_prompt_schedule_without_prompt() {
        let raw = MINIMAL.replace("prompt = \"Summarize yesterday's health entries.\"", "");
        assert!(matches!(load_roster_str(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_job_schedule_without_job_name() {
        let raw = MINIMAL.replace("dispatch_mode = \"prompt\"", "dispatch_mode = \"job\"");
        assert!(matches!(load_roster_str(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let roster = load_roster(&path).unwrap();
        assert!(roster.switchboard().is_some());
    }
}
