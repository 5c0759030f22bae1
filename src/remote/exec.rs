// 远程命令执行
use crate::ssh::transport::Transport;
use crate::utils::error::ExecError;
use log::debug;
use std::time::Duration;

/// Runs `command` on a one-shot channel and returns stdout and stderr merged.
pub fn run_command(
    transport: &mut dyn Transport,
    command: &str,
    timeout: Option<Duration>,
) -> Result<String, ExecError> {
    debug!("exec: {}", command);
    let output = transport.exec(command, timeout)?;
    debug!("exec returned {} bytes", output.len());
    Ok(output)
}

/// 单引号转义，用于把路径拼进远程 shell 命令
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r#"'\''"#))
}

/// Extracts the digest from `md5sum` output (`<hex>  <path>`).
pub fn parse_md5sum(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    if digest.len() == 32 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn md5sum_output_is_parsed() {
        assert_eq!(
            parse_md5sum("5EB63BBBE01EEED093CB22BB8F5ACDC3  /tmp/hello.txt\n").as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(parse_md5sum("md5sum: /nope: No such file or directory"), None);
        assert_eq!(parse_md5sum(""), None);
    }
}
