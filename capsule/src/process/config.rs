//! Process configuration.

use std::path::PathBuf;

use capsule_shared::constants::container::DEFAULT_CWD;
use capsule_shared::{TerminalSize, UserSpec};

use crate::error::ProcessError;

/// Identity a process runs as.
///
/// When `username` is set it is resolved against the container's passwd
/// data and overrides `uid`/`gid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub username: Option<String>,
}

impl User {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ..Self::default()
        }
    }

    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }
}

impl From<&User> for UserSpec {
    fn from(user: &User) -> Self {
        UserSpec {
            uid: user.uid,
            gid: user.gid,
            additional_gids: user.additional_gids.clone(),
        }
    }
}

/// Initial terminal window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleSize {
    pub rows: u32,
    pub cols: u32,
}

impl Default for ConsoleSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<ConsoleSize> for TerminalSize {
    fn from(size: ConsoleSize) -> Self {
        TerminalSize {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// What to run and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Program and arguments; `args[0]` is resolved through `PATH`.
    pub args: Vec<String>,
    /// `KEY=value` entries. Defaults are filled in at creation.
    pub env: Vec<String>,
    /// Absolute working directory inside the rootfs; empty means `/`.
    pub cwd: PathBuf,
    pub user: User,
    /// Run on a PTY. stdout and stderr are merged onto it.
    pub terminal: bool,
    pub console_size: Option<ConsoleSize>,
}

impl ProcessConfig {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    /// Reject configurations the guest could never run.
    pub fn validate(&self) -> Result<(), ProcessError> {
        match self.args.first() {
            None => return Err(ProcessError::InvalidConfig("args must not be empty".into())),
            Some(program) if program.is_empty() => {
                return Err(ProcessError::InvalidConfig("program must not be empty".into()));
            }
            _ => {}
        }
        if self.args.iter().chain(&self.env).any(|s| s.contains('\0')) {
            return Err(ProcessError::InvalidConfig(
                "args and env must not contain NUL bytes".into(),
            ));
        }
        if let Some(entry) = self.env.iter().find(|e| e.is_empty() || e.starts_with('=')) {
            return Err(ProcessError::InvalidConfig(format!(
                "malformed env entry {:?}",
                entry
            )));
        }
        if !self.cwd.as_os_str().is_empty() && !self.cwd.is_absolute() {
            return Err(ProcessError::InvalidConfig(format!(
                "cwd {} is not absolute",
                self.cwd.display()
            )));
        }
        if let Some(name) = &self.user.username {
            if name.is_empty() || name.contains(':') {
                return Err(ProcessError::InvalidConfig(format!("invalid username {:?}", name)));
            }
        }
        Ok(())
    }

    /// Working directory to send to the guest.
    pub(crate) fn cwd_or_default(&self) -> String {
        if self.cwd.as_os_str().is_empty() {
            DEFAULT_CWD.to_string()
        } else {
            self.cwd.to_string_lossy().into_owned()
        }
    }

    pub(crate) fn terminal_size(&self) -> Option<TerminalSize> {
        self.terminal
            .then(|| self.console_size.unwrap_or_default().into())
    }
}

impl From<&oci_spec::runtime::Process> for ProcessConfig {
    fn from(process: &oci_spec::runtime::Process) -> Self {
        let user = process.user();
        Self {
            args: process.args().clone().unwrap_or_default(),
            env: process.env().clone().unwrap_or_default(),
            cwd: process.cwd().clone(),
            user: User {
                uid: user.uid(),
                gid: user.gid(),
                additional_gids: user.additional_gids().clone().unwrap_or_default(),
                username: user.username().clone().filter(|name| !name.is_empty()),
            },
            terminal: process.terminal().unwrap_or(false),
            console_size: process.console_size().map(|size| ConsoleSize {
                rows: size.height() as u32,
                cols: size.width() as u32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{ProcessBuilder, UserBuilder};

    fn invalid(config: &ProcessConfig) -> bool {
        matches!(config.validate(), Err(ProcessError::InvalidConfig(_)))
    }

    #[test]
    fn test_validate() {
        assert!(ProcessConfig::new(["/bin/true"]).validate().is_ok());
        assert!(invalid(&ProcessConfig::default()));
        assert!(invalid(&ProcessConfig::new([""])));
        assert!(invalid(&ProcessConfig::new(["ls"]).cwd("relative/dir")));
        assert!(invalid(&ProcessConfig::new(["ls"]).env("", "x")));
        assert!(invalid(&ProcessConfig::new(["ls"]).user(User::named("a:b"))));
        assert!(invalid(&ProcessConfig::new(["echo", "a\0b"])));
    }

    #[test]
    fn test_defaults_sent_to_guest() {
        let config = ProcessConfig::new(["sh"]);
        assert_eq!(config.cwd_or_default(), "/");
        assert_eq!(config.terminal_size(), None);

        let config = config.terminal(true);
        assert_eq!(config.terminal_size(), Some(TerminalSize { rows: 24, cols: 80 }));
    }

    #[test]
    fn test_from_oci_process() {
        let user = UserBuilder::default()
            .uid(1u32)
            .gid(2u32)
            .additional_gids(vec![3u32])
            .build()
            .unwrap();
        let process = ProcessBuilder::default()
            .args(vec!["sleep".to_string(), "5".to_string()])
            .env(vec!["A=1".to_string()])
            .cwd("/srv")
            .terminal(true)
            .user(user)
            .build()
            .unwrap();

        let config = ProcessConfig::from(&process);
        assert_eq!(config.args, vec!["sleep", "5"]);
        assert_eq!(config.env, vec!["A=1"]);
        assert_eq!(config.cwd, PathBuf::from("/srv"));
        assert_eq!(config.user, User {
            uid: 1,
            gid: 2,
            additional_gids: vec![3],
            username: None,
        });
        assert!(config.terminal);
        assert!(config.validate().is_ok());
    }
}
