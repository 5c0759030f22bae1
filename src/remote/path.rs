// 远程路径处理（始终使用 `/` 分隔）

/// Appends `name` to `dir`, adding a separator only when needed.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of a remote path; the root is its own parent.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// 相对路径基于当前目录解析，空路径即当前目录，`~` 指向登录目录
pub fn resolve(cwd: &str, home: &str, path: &str) -> String {
    if path.is_empty() || path == "." {
        cwd.to_string()
    } else if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        join(home, rest)
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        join(cwd, path)
    }
}

pub fn file_name(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}
