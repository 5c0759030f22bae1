// 主机信任存储：以 known_hosts 文件为持久账本
use crate::config::ConnectionTarget;
use crate::utils::error::TrustError;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A server public key in SSH wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key_type: String,
    blob: Vec<u8>,
}

impl HostKey {
    pub fn new(key_type: &str, blob: Vec<u8>) -> Self {
        Self {
            key_type: key_type.to_string(),
            blob,
        }
    }

    /// 公钥 blob 以 `string key_type` 开头，直接从中读出类型
    pub fn from_blob(blob: Vec<u8>) -> Self {
        let key_type = parse_key_type(&blob).unwrap_or_else(|| "unknown".to_string());
        Self { key_type, blob }
    }

    pub fn from_base64(key_type: &str, encoded: &str) -> Option<Self> {
        STANDARD
            .decode(encoded)
            .ok()
            .map(|blob| Self::new(key_type, blob))
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.blob)
    }

    pub fn fingerprint(&self) -> HostFingerprint {
        let digest = Sha256::digest(&self.blob);
        HostFingerprint(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
    }
}

fn parse_key_type(blob: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4 + len)?;
    String::from_utf8(name.to_vec()).ok()
}

/// OpenSSH style `SHA256:<base64>` fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostFingerprint(String);

impl HostFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    /// The ledger holds a different key for this host.
    Changed { previous: HostFingerprint },
}

/// One comma separated item of the hosts field.
#[derive(Debug, Clone)]
enum HostPattern {
    Plain(String),
    /// `|1|base64(salt)|base64(hmac-sha1(salt, host))`, as written by `HashKnownHosts`.
    Hashed {
        raw: String,
        salt: Vec<u8>,
        hash: Vec<u8>,
    },
}

impl HostPattern {
    fn parse(field: &str) -> Option<Self> {
        if !field.starts_with('|') {
            return Some(HostPattern::Plain(field.to_string()));
        }
        // 只认识 |1| 格式
        let (salt, hash) = field.strip_prefix("|1|")?.split_once('|')?;
        Some(HostPattern::Hashed {
            raw: field.to_string(),
            salt: STANDARD.decode(salt).ok()?,
            hash: STANDARD.decode(hash).ok()?,
        })
    }

    fn as_str(&self) -> &str {
        match self {
            HostPattern::Plain(pattern) => pattern,
            HostPattern::Hashed { raw, .. } => raw,
        }
    }

    /// Exact identity, used when a host is taken off a shared line.
    fn is_exactly(&self, host: &str) -> bool {
        match self {
            HostPattern::Plain(pattern) => pattern == host,
            HostPattern::Hashed { salt, hash, .. } => hashed_host_matches(salt, hash, host),
        }
    }
}

fn hashed_host_matches(salt: &[u8], hash: &[u8], host: &str) -> bool {
    match Hmac::<Sha1>::new_from_slice(salt) {
        Ok(mut mac) => {
            mac.update(host.as_bytes());
            mac.verify_slice(hash).is_ok()
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    hosts: Vec<HostPattern>,
    key: HostKey,
    comment: Option<String>,
}

impl KnownHostEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let hosts = fields.next()?;
        // 带标记的行（@revoked 等）不参与匹配
        if hosts.starts_with('@') {
            return None;
        }
        let hosts = hosts
            .split(',')
            .map(HostPattern::parse)
            .collect::<Option<Vec<_>>>()?;
        let key_type = fields.next()?;
        let key = HostKey::from_base64(key_type, fields.next()?)?;
        let comment: Vec<&str> = fields.collect();

        Some(Self {
            hosts,
            key,
            comment: if comment.is_empty() {
                None
            } else {
                Some(comment.join(" "))
            },
        })
    }

    fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.hosts {
            match pattern {
                HostPattern::Plain(pattern) => {
                    if let Some(negated) = pattern.strip_prefix('!') {
                        if wildcard_match(negated, host) {
                            return false;
                        }
                    } else if wildcard_match(pattern, host) {
                        matched = true;
                    }
                }
                HostPattern::Hashed { salt, hash, .. } => {
                    if hashed_host_matches(salt, hash, host) {
                        matched = true;
                    }
                }
            }
        }
        matched
    }

    fn to_line(&self) -> String {
        let hosts: Vec<&str> = self.hosts.iter().map(HostPattern::as_str).collect();
        let mut line = format!(
            "{} {} {}",
            hosts.join(","),
            self.key.key_type(),
            self.key.to_base64()
        );
        if let Some(comment) = &self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }
}

enum LedgerLine {
    Entry(KnownHostEntry),
    /// 注释、空行以及无法解析的行，原样保留
    Verbatim(String),
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], t) || (!t.is_empty() && go(p, &t[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => go(&p[1..], &t[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}

/// Tracks which host identities have been accepted, backed by a
/// known_hosts style ledger (`host keytype base64-key` per line).
pub struct HostTrustStore {
    path: PathBuf,
    lines: Vec<LedgerLine>,
    presented: HashMap<String, HostKey>,
}

impl HostTrustStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrustError> {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(TrustError::Io { path, source }),
        };

        let lines: Vec<LedgerLine> = content
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return LedgerLine::Verbatim(line.to_string());
                }
                match KnownHostEntry::parse(trimmed) {
                    Some(entry) => LedgerLine::Entry(entry),
                    None => LedgerLine::Verbatim(line.to_string()),
                }
            })
            .collect();

        debug!("Loaded {} known_hosts lines from {}", lines.len(), path.display());

        Ok(Self {
            path,
            lines,
            presented: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> impl Iterator<Item = &KnownHostEntry> {
        self.lines.iter().filter_map(|line| match line {
            LedgerLine::Entry(entry) => Some(entry),
            LedgerLine::Verbatim(_) => None,
        })
    }

    /// Compares the key a host presented during negotiation with the ledger
    /// and remembers it so the caller can show or accept it.
    pub fn check(&mut self, host: &str, key: &HostKey) -> HostKeyStatus {
        self.presented.insert(host.to_string(), key.clone());

        let mut previous = None;
        for entry in self.entries().filter(|e| e.matches(host)) {
            if entry.key.blob() == key.blob() {
                return HostKeyStatus::Trusted;
            }
            previous.get_or_insert_with(|| entry.key.fingerprint());
        }

        match previous {
            Some(previous) => {
                warn!("Host key for {} does not match the accepted key {}", host, previous);
                HostKeyStatus::Changed { previous }
            }
            None => HostKeyStatus::Unknown,
        }
    }

    /// Fingerprint the target presented during the most recent negotiation.
    pub fn fingerprint_of(&self, target: &ConnectionTarget) -> Option<HostFingerprint> {
        self.presented.get(&target.host_id()).map(HostKey::fingerprint)
    }

    pub fn is_trusted(&self, host: &str) -> bool {
        self.entries().any(|e| e.matches(host))
    }

    /// Accepts the key `host` presented most recently.
    pub fn accept(&mut self, host: &str) -> Result<(), TrustError> {
        let key = self
            .presented
            .get(host)
            .cloned()
            .ok_or_else(|| TrustError::UnknownHost {
                host: host.to_string(),
            })?;
        self.accept_key(host, key)
    }

    pub fn accept_key(&mut self, host: &str, key: HostKey) -> Result<(), TrustError> {
        if self.entries().any(|e| e.matches(host) && e.key.blob() == key.blob()) {
            return Ok(());
        }

        // 旧密钥整行移除或从多主机行里摘掉该主机
        let mut rewritten = false;
        self.lines.retain_mut(|line| match line {
            LedgerLine::Entry(entry) if entry.matches(host) => {
                rewritten = true;
                entry.hosts.retain(|h| !h.is_exactly(host));
                !entry.hosts.is_empty()
            }
            _ => true,
        });

        let entry = KnownHostEntry {
            hosts: vec![HostPattern::Plain(host.to_string())],
            key,
            comment: None,
        };
        let line = entry.to_line();
        self.lines.push(LedgerLine::Entry(entry));

        if rewritten {
            self.persist_all()?;
        } else {
            self.append_line(&line)?;
        }
        info!("Accepted host key for {}", host);
        Ok(())
    }

    /// Forgets every accepted key and truncates the ledger.
    pub fn reset(&mut self) -> Result<(), TrustError> {
        self.lines.clear();
        self.presented.clear();
        if self.path.exists() {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|source| self.io_error(source))?;
        }
        info!("Cleared known hosts ledger {}", self.path.display());
        Ok(())
    }

    pub fn trusted_hosts(&self) -> Vec<(String, HostFingerprint)> {
        self.entries()
            .flat_map(|entry| {
                let fingerprint = entry.key.fingerprint();
                entry
                    .hosts
                    .iter()
                    .map(move |host| (host.as_str().to_string(), fingerprint.clone()))
            })
            .collect()
    }

    fn append_line(&self, line: &str) -> Result<(), TrustError> {
        self.ensure_parent()?;
        let needs_newline = fs::read(&self.path)
            .map(|bytes| !bytes.is_empty() && !bytes.ends_with(b"\n"))
            .unwrap_or(false);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        let prefix = if needs_newline { "\n" } else { "" };
        writeln!(file, "{}{}", prefix, line).map_err(|source| self.io_error(source))
    }

    fn persist_all(&self) -> Result<(), TrustError> {
        self.ensure_parent()?;
        let mut content = String::new();
        for line in &self.lines {
            match line {
                LedgerLine::Entry(entry) => content.push_str(&entry.to_line()),
                LedgerLine::Verbatim(raw) => content.push_str(raw),
            }
            content.push('\n');
        }
        fs::write(&self.path, content).map_err(|source| self.io_error(source))
    }

    fn ensure_parent(&self) -> Result<(), TrustError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
            }
        }
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> TrustError {
        TrustError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
