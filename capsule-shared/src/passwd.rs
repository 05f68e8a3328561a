//! `/etc/passwd` parsing.
//!
//! The guest answers identity lookups from the container's passwd file and
//! the host can parse one directly; both go through [`PasswdEntry`].

use std::path::Path;

use crate::protocol::PasswdRecord;

/// One account line: `name:password:uid:gid:gecos:home:shell`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

impl PasswdEntry {
    /// Parse a single line. Comments, blank lines and malformed entries
    /// yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[0].is_empty() {
            return None;
        }

        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }
}

impl From<PasswdEntry> for PasswdRecord {
    fn from(entry: PasswdEntry) -> Self {
        PasswdRecord {
            name: entry.name,
            uid: entry.uid,
            gid: entry.gid,
            home: entry.home,
            shell: entry.shell,
        }
    }
}

impl From<PasswdRecord> for PasswdEntry {
    fn from(record: PasswdRecord) -> Self {
        PasswdEntry {
            name: record.name,
            uid: record.uid,
            gid: record.gid,
            home: record.home,
            shell: record.shell,
        }
    }
}

/// Parse every valid entry of a passwd file's contents.
pub fn parse(contents: &str) -> Vec<PasswdEntry> {
    contents.lines().filter_map(PasswdEntry::parse_line).collect()
}

/// First entry with the given uid.
pub fn find_by_uid(entries: &[PasswdEntry], uid: u32) -> Option<&PasswdEntry> {
    entries.iter().find(|e| e.uid == uid)
}

/// First entry with the given name.
pub fn find_by_name<'a>(entries: &'a [PasswdEntry], name: &str) -> Option<&'a PasswdEntry> {
    entries.iter().find(|e| e.name == name)
}

/// Read and parse `<root>/etc/passwd`. A missing file is an empty database.
pub fn read_from_root(root: &Path) -> std::io::Result<Vec<PasswdEntry>> {
    let path = root.join("etc/passwd");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh
# system accounts
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
broken:x:notanumber:1::/nowhere:/bin/false

nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

    #[test]
    fn test_parse_skips_comments_and_malformed() {
        let entries = parse(PASSWD);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root", "daemon", "nobody"]);
    }

    #[test]
    fn test_lookup_by_uid_and_name() {
        let entries = parse(PASSWD);
        assert_eq!(find_by_uid(&entries, 1).unwrap().home, "/usr/sbin");
        assert_eq!(find_by_name(&entries, "nobody").unwrap().uid, 65534);
        assert!(find_by_uid(&entries, 4242).is_none());
        assert!(find_by_name(&entries, "broken").is_none());
    }

    #[test]
    fn test_read_from_root_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_from_root(dir.path()).unwrap().is_empty());

        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/passwd"), PASSWD).unwrap();
        assert_eq!(read_from_root(dir.path()).unwrap().len(), 3);
    }
}
