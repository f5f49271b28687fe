//! Host configuration.
//!
//! Everything is resolved from environment variables with platform defaults,
//! so the host runs without a config file:
//!
//! | Variable                 | Meaning                                  | Default                          |
//! |--------------------------|------------------------------------------|----------------------------------|
//! | `BEARINGPRO_CMD`         | command line of the local bearing server | `bearingpro` next to the host    |
//! | `TOOLHOST_TIMEOUT_SECS`  | per-call timeout in seconds (max 86400)  | 30                               |
//! | `TOOLHOST_LOG_DIR`       | directory of the host log file           | `<data dir>/toolhost/logs`       |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use crate::ipc::DEFAULT_TIMEOUT_SECS;

pub const BEARINGPRO_CMD_ENV: &str = "BEARINGPRO_CMD";
pub const TIMEOUT_ENV: &str = "TOOLHOST_TIMEOUT_SECS";
pub const LOG_DIR_ENV: &str = "TOOLHOST_LOG_DIR";

/// Largest accepted per-call timeout (one day).
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// How to start a tool server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; `None` inherits the caller's.
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Parse a command line such as `node "local servers/main.js" --stdio`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = split_command_line(line)?.into_iter();
        let program = words
            .next()
            .context("Server command line is empty")?;
        Ok(Self::new(program).args(words))
    }

    /// Human-readable form for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|word| {
                if word.is_empty() || word.contains(char::is_whitespace) {
                    format!("\"{}\"", word)
                } else {
                    word.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split a command line into words.
///
/// Whitespace separates words; single quotes keep text literally; double
/// quotes group text and honour `\"` and `\\`; outside quotes a backslash
/// escapes the next character.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => bail!("Unterminated escape in command line: {}", line),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    let next = chars
                        .next()
                        .with_context(|| format!("Unterminated escape in command line: {}", line))?;
                    current.push(next);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        bail!("Unterminated quote in command line: {}", line);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Resolved host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bearingpro: ServerCommand,
    pub timeout: Duration,
    pub log_dir: PathBuf,
}

impl HostConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bearingpro = match lookup(BEARINGPRO_CMD_ENV).filter(|v| !v.trim().is_empty()) {
            Some(line) => ServerCommand::parse(&line)
                .with_context(|| format!("Invalid {}", BEARINGPRO_CMD_ENV))?,
            None => default_bearingpro_command(),
        };

        let timeout = match lookup(TIMEOUT_ENV) {
            Some(value) => {
                parse_timeout(&value).with_context(|| format!("Invalid {}", TIMEOUT_ENV))?
            }
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let log_dir = lookup(LOG_DIR_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        Ok(Self {
            bearingpro,
            timeout,
            log_dir,
        })
    }

    /// Log file for the given day.
    pub fn log_file(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(log_file_name(date))
    }
}

fn parse_timeout(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a number of seconds", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        bail!("timeout must be a positive number of seconds, got {}", value);
    }
    if secs > MAX_TIMEOUT_SECS {
        bail!(
            "timeout must be at most {} seconds, got {}",
            MAX_TIMEOUT_SECS,
            value
        );
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("'{}' is not a representable timeout", value))
}

/// The `bearingpro` executable installed next to the running binary.
///
/// Falls back to a bare `bearingpro`, resolved through `PATH`.
pub fn default_bearingpro_command() -> ServerCommand {
    let name = format!("bearingpro{}", std::env::consts::EXE_SUFFIX);
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|path| path.exists());

    match sibling {
        Some(path) => ServerCommand::new(path.to_string_lossy()),
        None => ServerCommand::new(name),
    }
}

/// Resolve the default log directory.
///
/// Resolution order:
/// 1. `<platform data dir>/toolhost/logs` (`~/.local/share` on Linux)
/// 2. `./logs` (fallback)
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("toolhost").join("logs"))
        .unwrap_or_else(|| Path::new("logs").to_path_buf())
}

pub fn log_file_name(date: NaiveDate) -> String {
    format!("toolhost-{}.log", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_command_line("  node   main.js --stdio ").unwrap(),
            vec!["node", "main.js", "--stdio"]
        );
    }

    #[test]
    fn test_split_quotes_and_escapes() {
        assert_eq!(
            split_command_line(r#""C:/Program Files/node.exe" 'local servers/main.js' a\ b "x\"y" """#)
                .unwrap(),
            vec!["C:/Program Files/node.exe", "local servers/main.js", "a b", "x\"y", ""]
        );
    }

    #[test]
    fn test_split_rejects_unterminated_quote() {
        assert!(split_command_line("node 'main.js").is_err());
        assert!(split_command_line("node main.js\\").is_err());
    }

    #[test]
    fn test_parse_server_command() {
        let cmd =
            ServerCommand::parse("npx -y @modelcontextprotocol/server-filesystem /tmp").unwrap();
        assert_eq!(cmd.program, "npx");
        assert_eq!(cmd.args, vec!["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]);
        assert_eq!(cmd.cwd, None);
        assert!(ServerCommand::parse("   ").is_err());
    }

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = ServerCommand::new("node").arg("my server.js").arg("--fast");
        assert_eq!(cmd.display(), r#"node "my server.js" --fast"#);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = HostConfig::from_lookup(lookup_from(&[
            (BEARINGPRO_CMD_ENV, "node tools/bearingpro/main.js"),
            (TIMEOUT_ENV, "2.5"),
            (LOG_DIR_ENV, "/var/log/toolhost"),
        ]))
        .unwrap();

        assert_eq!(config.bearingpro.program, "node");
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/toolhost"));

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(
            config.log_file(date),
            PathBuf::from("/var/log/toolhost/toolhost-2026-10-19.log")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = HostConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.bearingpro.program.contains("bearingpro"));
        assert_eq!(config.log_dir, default_log_dir());
    }

    #[test]
    fn test_invalid_timeout() {
        for bad in ["0", "-3", "soon", "NaN", "inf", "1e30", "86400.5"] {
            let result = HostConfig::from_lookup(lookup_from(&[(TIMEOUT_ENV, bad)]));
            assert!(result.is_err(), "timeout {:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_timeout_upper_bound_is_accepted() {
        let config = HostConfig::from_lookup(lookup_from(&[(TIMEOUT_ENV, "86400")])).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(86_400));

        let config = HostConfig::from_lookup(lookup_from(&[(TIMEOUT_ENV, " 0.25 ")])).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}
