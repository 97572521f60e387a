//! Shell program and environment selection.

use settings::constants::terminal::FALLBACK_SHELL;
use settings::Config;

/// Program and arguments used to start a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    /// Resolve the shell from config, then `$SHELL`, then the platform default.
    pub fn from_config(config: &Config) -> Self {
        let program = resolve_program(config);
        let args = config
            .shell_args
            .clone()
            .unwrap_or_else(|| default_args(&program));
        Self { program, args }
    }
}

#[cfg(not(windows))]
fn resolve_program(config: &Config) -> String {
    if let Some(shell) = config.shell.as_deref().filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    match std::env::var("SHELL") {
        Ok(shell) if !shell.trim().is_empty() => shell,
        _ => FALLBACK_SHELL.to_string(),
    }
}

#[cfg(windows)]
fn resolve_program(config: &Config) -> String {
    if let Some(shell) = config.shell.as_deref().filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    match config.windows_shell.as_deref() {
        Some("pwsh") => "pwsh.exe".to_string(),
        Some("cmd") => "cmd.exe".to_string(),
        Some("powershell") | None => FALLBACK_SHELL.to_string(),
        Some(other) => {
            tracing::warn!("Unknown windows-shell '{}', using {}", other, FALLBACK_SHELL);
            FALLBACK_SHELL.to_string()
        }
    }
}

/// Login-shell flag for POSIX shells that understand it.
fn default_args(program: &str) -> Vec<String> {
    if cfg!(windows) {
        return Vec::new();
    }
    let name = std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program);
    match name {
        "bash" | "zsh" | "sh" | "fish" | "ksh" | "dash" => vec!["-l".to_string()],
        _ => Vec::new(),
    }
}

/// Line terminator appended to initial commands.
pub fn newline() -> &'static str {
    if cfg!(windows) {
        "\r\n"
    } else {
        "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn config_shell_wins() {
        let config = Config {
            shell: Some("/opt/bin/nu".into()),
            ..Config::default()
        };
        let shell = ShellCommand::from_config(&config);
        assert_eq!(shell.program, "/opt/bin/nu");
        assert!(shell.args.is_empty());
    }

    #[test]
    fn explicit_args_override_defaults() {
        let config = Config {
            shell: Some("/bin/bash".into()),
            shell_args: Some(vec!["--norc".into()]),
            ..Config::default()
        };
        assert_eq!(ShellCommand::from_config(&config).args, vec!["--norc"]);
    }

    #[cfg(unix)]
    #[test_case("/bin/zsh", true; "zsh")]
    #[test_case("/usr/local/bin/fish", true; "fish")]
    #[test_case("/usr/bin/python3", false; "not a shell")]
    fn login_flag_for_known_shells(program: &str, login: bool) {
        assert_eq!(default_args(program) == vec!["-l".to_string()], login);
    }

    #[test]
    fn blank_config_shell_is_ignored() {
        let config = Config {
            shell: Some("   ".into()),
            ..Config::default()
        };
        assert!(!ShellCommand::from_config(&config).program.trim().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unix_newline() {
        assert_eq!(newline(), "\n");
    }
}
