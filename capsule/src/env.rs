//! Environment resolution for container processes.
//!
//! Fills in `PATH`, `HOME` and `TERM` when the caller left them out.
//! Entries the caller did provide are never replaced.

use std::path::Path;

use async_trait::async_trait;
use capsule_shared::constants::env::{DEFAULT_PATH, DEFAULT_TERM};
use capsule_shared::{passwd, PasswdEntry};

use crate::error::{CapsuleResult, ProcessError};
use crate::portal::interfaces::AgentInterface;
use crate::process::User;

/// Source of account data for a container (its `/etc/passwd`).
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn by_uid(&self, uid: u32) -> CapsuleResult<Option<PasswdEntry>>;

    async fn by_name(&self, name: &str) -> CapsuleResult<Option<PasswdEntry>>;
}

// ============================================================================
// Lookups
// ============================================================================

/// Asks the guest agent, which reads `/etc/passwd` under the container rootfs.
#[derive(Clone)]
pub struct GuestIdentity {
    agent: AgentInterface,
    container_id: String,
}

impl GuestIdentity {
    pub fn new(agent: AgentInterface, container_id: impl Into<String>) -> Self {
        Self {
            agent,
            container_id: container_id.into(),
        }
    }
}

#[async_trait]
impl IdentityLookup for GuestIdentity {
    async fn by_uid(&self, uid: u32) -> CapsuleResult<Option<PasswdEntry>> {
        self.agent.clone().lookup_uid(&self.container_id, uid).await
    }

    async fn by_name(&self, name: &str) -> CapsuleResult<Option<PasswdEntry>> {
        self.agent.clone().lookup_name(&self.container_id, name).await
    }
}

/// Passwd entries held in memory.
#[derive(Debug, Clone, Default)]
pub struct PasswdFile {
    entries: Vec<PasswdEntry>,
}

impl PasswdFile {
    pub fn parse(contents: &str) -> Self {
        Self {
            entries: passwd::parse(contents),
        }
    }

    /// Load `<root>/etc/passwd`. A missing file yields no entries.
    pub fn load(root: &Path) -> CapsuleResult<Self> {
        let entries = passwd::read_from_root(root)
            .map_err(|e| ProcessError::InvalidConfig(format!("reading passwd: {}", e)))?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PasswdEntry] {
        &self.entries
    }
}

#[async_trait]
impl IdentityLookup for PasswdFile {
    async fn by_uid(&self, uid: u32) -> CapsuleResult<Option<PasswdEntry>> {
        Ok(passwd::find_by_uid(&self.entries, uid).cloned())
    }

    async fn by_name(&self, name: &str) -> CapsuleResult<Option<PasswdEntry>> {
        Ok(passwd::find_by_name(&self.entries, name).cloned())
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve a username into uid and primary gid.
///
/// Users without a name are returned unchanged. An unknown name is a
/// configuration error.
pub async fn resolve_user(user: &User, identity: &dyn IdentityLookup) -> CapsuleResult<User> {
    let Some(name) = user.username.as_deref() else {
        return Ok(user.clone());
    };

    let entry = identity
        .by_name(name)
        .await?
        .ok_or_else(|| ProcessError::InvalidConfig(format!("unknown user {:?}", name)))?;

    Ok(User {
        uid: entry.uid,
        gid: entry.gid,
        additional_gids: user.additional_gids.clone(),
        username: Some(entry.name),
    })
}

/// Build the final environment of a process running as `user`.
pub async fn resolve_environment(
    env: &[String],
    user: &User,
    terminal: bool,
    identity: &dyn IdentityLookup,
) -> CapsuleResult<Vec<String>> {
    let mut resolved = env.to_vec();

    if !has_key(env, "PATH") {
        resolved.push(format!("PATH={}", DEFAULT_PATH));
    }

    if !has_key(env, "HOME") {
        match identity.by_uid(user.uid).await? {
            Some(entry) if !entry.home.is_empty() => {
                resolved.push(format!("HOME={}", entry.home));
            }
            _ => tracing::debug!(uid = user.uid, "No passwd home, leaving HOME unset"),
        }
    }

    if terminal && !has_key(env, "TERM") {
        resolved.push(format!("TERM={}", DEFAULT_TERM));
    }

    Ok(resolved)
}

fn has_key(env: &[String], key: &str) -> bool {
    env.iter()
        .any(|entry| entry.split_once('=').map_or(entry.as_str(), |(k, _)| k) == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
nohome:x:7:7:nobody::/bin/false
";

    fn user(uid: u32) -> User {
        User {
            uid,
            gid: uid,
            ..User::default()
        }
    }

    fn get<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
        env.iter().find_map(|e| {
            let (k, v) = e.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    #[tokio::test]
    async fn test_defaults_injected() {
        let identity = PasswdFile::parse(PASSWD);
        let env = resolve_environment(&[], &user(1), false, &identity).await.unwrap();

        assert_eq!(get(&env, "PATH"), Some(DEFAULT_PATH));
        assert_eq!(get(&env, "HOME"), Some("/usr/sbin"));
        assert_eq!(get(&env, "TERM"), None);
    }

    #[tokio::test]
    async fn test_caller_entries_win() {
        let identity = PasswdFile::parse(PASSWD);
        let given = vec![
            "HOME=/custom".to_string(),
            "PATH=/opt/bin".to_string(),
            "TERM=vt100".to_string(),
        ];
        let env = resolve_environment(&given, &user(0), true, &identity).await.unwrap();

        assert_eq!(env, given);
    }

    #[tokio::test]
    async fn test_terminal_sets_term() {
        let identity = PasswdFile::default();
        let env = resolve_environment(&[], &user(0), true, &identity).await.unwrap();
        assert_eq!(get(&env, "TERM"), Some("xterm"));
    }

    #[tokio::test]
    async fn test_home_omitted_when_unknown() {
        let identity = PasswdFile::parse(PASSWD);
        for uid in [7, 4242] {
            let env = resolve_environment(&[], &user(uid), false, &identity).await.unwrap();
            assert_eq!(get(&env, "HOME"), None, "uid {}", uid);
        }
    }

    #[tokio::test]
    async fn test_entry_without_value_counts_as_set() {
        let identity = PasswdFile::parse(PASSWD);
        let given = vec!["HOME".to_string()];
        let env = resolve_environment(&given, &user(0), false, &identity).await.unwrap();
        assert_eq!(env.iter().filter(|e| e.starts_with("HOME")).count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_user_by_name() {
        let identity = PasswdFile::parse(PASSWD);
        let named = User {
            username: Some("daemon".to_string()),
            additional_gids: vec![20],
            ..User::default()
        };

        let resolved = resolve_user(&named, &identity).await.unwrap();
        assert_eq!((resolved.uid, resolved.gid), (1, 1));
        assert_eq!(resolved.additional_gids, vec![20]);

        let unknown = User {
            username: Some("ghost".to_string()),
            ..User::default()
        };
        let err = resolve_user(&unknown, &identity).await.unwrap_err();
        assert!(matches!(
            err,
            crate::CapsuleError::Process(ProcessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_passwd_file_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = PasswdFile::load(dir.path()).unwrap();
        assert!(file.entries().is_empty());
    }
}
