// 本地文件工具
use anyhow::Result;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

pub fn calculate_md5<P: AsRef<Path>>(file_path: P) -> Result<String> {
    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = md5::Context::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.consume(&buffer[..bytes_read]);
    }

    let digest = hasher.compute();
    Ok(format!("{:x}", digest))
}

pub fn ensure_parent_dir<P: AsRef<Path>>(file_path: P) -> io::Result<()> {
    if let Some(parent) = file_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 按 1024 进制格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn md5_of_known_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        File::create(&path).unwrap().write_all(b"hello world").unwrap();

        assert_eq!(
            calculate_md5(&path).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn ensure_parent_dir_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a/b/c/file.bin");

        ensure_parent_dir(&target).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        ensure_parent_dir("file-in-cwd.bin").unwrap();
    }

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
