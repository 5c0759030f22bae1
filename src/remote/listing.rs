// 远程目录列表
use crate::remote::path;
use crate::ssh::transport::Transport;
use crate::utils::error::ListError;
use crate::utils::file::format_bytes;
use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
/// File type plus the three rwx triplets.
const MODE_MASK: u32 = S_IFMT | 0o777;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub permissions: u32,
    pub is_directory: bool,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

impl RemoteEntry {
    pub fn modified_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.modified)
    }

    /// `ls -l` style mode string, e.g. `drwxr-xr-x`.
    pub fn permissions_string(&self) -> String {
        let mut s = String::with_capacity(10);
        s.push(if self.is_directory {
            'd'
        } else if self.permissions & S_IFMT == S_IFLNK {
            'l'
        } else {
            '-'
        });

        for (i, c) in "rwxrwxrwx".chars().enumerate() {
            let bit = 1 << (8 - i);
            s.push(if self.permissions & bit != 0 { c } else { '-' });
        }
        s
    }

    pub fn formatted_size(&self) -> String {
        if self.is_directory {
            "--".to_string()
        } else {
            format_bytes(self.size)
        }
    }
}

/// 目录优先，其次按名称不区分大小写升序
pub fn compare_entries(a: &RemoteEntry, b: &RemoteEntry) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(compare_entries);
}

/// Reads `dir` in full. Either every entry is returned, sorted, or an error.
pub fn list(transport: &mut dyn Transport, dir: &str) -> Result<Vec<RemoteEntry>, ListError> {
    let raw = transport.read_dir(dir)?;

    let mut entries: Vec<RemoteEntry> = raw
        .into_iter()
        .filter(|e| e.name != "." && e.name != "..")
        .map(|e| {
            let is_directory = e.stat.is_dir || e.stat.permissions & S_IFMT == S_IFDIR;
            RemoteEntry {
                path: path::join(dir, &e.name),
                name: e.name,
                size: e.stat.size,
                permissions: e.stat.permissions & MODE_MASK,
                is_directory,
                modified: e.stat.modified,
            }
        })
        .collect();

    sort_entries(&mut entries);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_directory: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            path: format!("/x/{}", name),
            size: 0,
            permissions: if is_directory { 0o040755 } else { 0o100644 },
            is_directory,
            modified: 0,
        }
    }

    #[test]
    fn directories_first_then_case_insensitive_names() {
        let mut entries = vec![
            entry("b.txt", false),
            entry("Zeta", true),
            entry("A.txt", false),
            entry("alpha", true),
            entry("c.txt", false),
        ];
        sort_entries(&mut entries);

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "A.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn permission_strings() {
        assert_eq!(entry("d", true).permissions_string(), "drwxr-xr-x");
        assert_eq!(entry("f", false).permissions_string(), "-rw-r--r--");

        let mut link = entry("l", false);
        link.permissions = 0o120777;
        assert_eq!(link.permissions_string(), "lrwxrwxrwx");
    }

    #[test]
    fn directory_size_is_not_shown() {
        assert_eq!(entry("d", true).formatted_size(), "--");
        let mut file = entry("f", false);
        file.size = 2048;
        assert_eq!(file.formatted_size(), "2.0 KB");
    }
}
