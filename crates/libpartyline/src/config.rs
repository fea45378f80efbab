use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Shell command hosted in interactive mode when none is configured.
pub const DEFAULT_INTERACTIVE_COMMAND: &str = "claude";

/// Batch-mode default runs one short-lived agent invocation per merged
/// prompt; `{prompt_file}` is replaced with a temp file holding the prompt.
pub const DEFAULT_BATCH_COMMAND: &str = "cat {prompt_file} | claude";

/// How peer input reaches the hosted process.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Raw keystrokes relayed into a pseudo-terminal.
    Interactive,
    /// Discrete prompts coalesced by the debounce pipeline.
    Batch,
}

/// Host-side configuration: defaults, overridden by the config file,
/// overridden again by CLI flags.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PartyConfig {
    pub user: String,
    pub bind_host: String,
    pub port: u16,
    /// Address written into the invite instead of the bind address.
    pub public_host: Option<String>,
    pub public_port: Option<u16>,
    /// Shell command for the hosted process; per-mode default when unset.
    pub agent_command: Option<String>,
    pub mode: SessionMode,
    pub dedupe_window_secs: f64,
    pub min_prompts: usize,
    /// Suffix of an output line used to guess that a long-lived batch agent
    /// is idle again. Heuristic only.
    pub ready_marker: String,
    /// Working directory for the hosted process.
    pub project_dir: Option<PathBuf>,
    pub gemini_api_key: Option<String>,
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            user: default_username(),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            public_host: None,
            public_port: None,
            agent_command: None,
            mode: SessionMode::Interactive,
            dedupe_window_secs: 3.0,
            min_prompts: 1,
            ready_marker: ">".to_string(),
            project_dir: None,
            gemini_api_key: None,
        }
    }
}

impl PartyConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    /// The shell command to host, falling back to the per-mode default.
    pub fn resolved_command(&self) -> String {
        match &self.agent_command {
            Some(cmd) => cmd.clone(),
            None => match self.mode {
                SessionMode::Interactive => DEFAULT_INTERACTIVE_COMMAND.to_string(),
                SessionMode::Batch => DEFAULT_BATCH_COMMAND.to_string(),
            },
        }
    }

    /// Quiet period the debounce pipeline waits for before cutting a batch.
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs_f64(self.dedupe_window_secs.max(0.0))
    }

    /// Host and port that go into the invite string.
    pub fn invite_addr(&self) -> (String, u16) {
        let host = self
            .public_host
            .clone()
            .unwrap_or_else(|| self.bind_host.clone());
        let port = self.public_port.unwrap_or(self.port);
        (host, port)
    }
}

pub fn default_username() -> String {
    std::env::var("USER")
        .ok()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("partyline")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("partyline")
    } else {
        PathBuf::from("/tmp/partyline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = PartyConfig::default();
        assert_eq!(cfg.bind_host, "0.0.0.0");
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.mode, SessionMode::Interactive);
        assert_eq!(cfg.dedupe_window(), Duration::from_secs(3));
        assert_eq!(cfg.min_prompts, 1);
        assert_eq!(cfg.resolved_command(), DEFAULT_INTERACTIVE_COMMAND);
    }

    #[test]
    fn batch_default_command_has_prompt_file() {
        let cfg = PartyConfig {
            mode: SessionMode::Batch,
            ..Default::default()
        };
        assert!(cfg.resolved_command().contains("{prompt_file}"));
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let cfg: PartyConfig = toml::from_str(
            r#"
            port = 9100
            mode = "batch"
            min_prompts = 2
            dedupe_window_secs = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.mode, SessionMode::Batch);
        assert_eq!(cfg.min_prompts, 2);
        assert_eq!(cfg.dedupe_window(), Duration::from_millis(1500));
        // untouched fields keep their defaults
        assert_eq!(cfg.bind_host, "0.0.0.0");
    }

    #[test]
    fn explicit_command_wins_over_mode_default() {
        let cfg: PartyConfig = toml::from_str(r#"agent_command = "python3 repl.py""#).unwrap();
        assert_eq!(cfg.resolved_command(), "python3 repl.py");
    }

    #[test]
    fn invite_addr_prefers_public_fields() {
        let mut cfg = PartyConfig::default();
        assert_eq!(cfg.invite_addr(), ("0.0.0.0".to_string(), 8765));
        cfg.public_host = Some("203.0.113.7".to_string());
        cfg.public_port = Some(443);
        assert_eq!(cfg.invite_addr(), ("203.0.113.7".to_string(), 443));
    }

    #[test]
    fn negative_window_clamps_to_zero() {
        let cfg: PartyConfig = toml::from_str("dedupe_window_secs = -2.0").unwrap();
        assert_eq!(cfg.dedupe_window(), Duration::ZERO);
    }
}
