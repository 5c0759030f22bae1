// 上传功能：解析远程目标并打开两端
use crate::remote::path;
use crate::ssh::transport::Transport;
use crate::transfer::engine::Endpoints;
use crate::utils::error::{TransferError, TransportError};
use log::debug;
use std::fs::File;
use std::path::Path;

const FILE_MODE: i32 = 0o644;
const DIR_MODE: i32 = 0o755;

/// Opens the local file and creates (or truncates) the remote target.
pub fn open_upload(
    transport: &mut dyn Transport,
    local_path: &str,
    remote_path: &str,
) -> Result<Endpoints, TransferError> {
    let local = Path::new(local_path);
    let file = File::open(local)
        .map_err(|e| TransferError::LocalIoError(format!("{}: {}", local_path, e)))?;
    let metadata = file
        .metadata()
        .map_err(|e| TransferError::LocalIoError(format!("{}: {}", local_path, e)))?;
    if metadata.is_dir() {
        return Err(TransferError::LocalIoError(format!(
            "{}: is a directory",
            local_path
        )));
    }

    let target = get_target_file_path(transport, remote_path, local)?;
    debug!("Upload target resolved to {}", target);
    let writer = transport.open_write(&target, FILE_MODE)?;

    Ok(Endpoints {
        reader: Box::new(file),
        writer,
        total_size: Some(metadata.len()),
        destination: Some(target),
    })
}

/// 远程路径是已存在的目录时追加本地文件名；父目录缺失时逐级创建
fn get_target_file_path(
    transport: &mut dyn Transport,
    remote_path: &str,
    local_file: &Path,
) -> Result<String, TransferError> {
    match transport.stat(remote_path) {
        Ok(stat) if stat.is_dir => {
            let file_name = local_file
                .file_name()
                .ok_or_else(|| {
                    TransferError::LocalIoError(format!(
                        "Cannot determine file name of {}",
                        local_file.display()
                    ))
                })?
                .to_string_lossy();
            Ok(path::join(remote_path, &file_name))
        }
        Ok(_) => Ok(remote_path.to_string()),
        Err(TransportError::NotFound { .. }) => {
            ensure_remote_directory(transport, &path::parent(remote_path))?;
            Ok(remote_path.to_string())
        }
        Err(e) => Err(e.into()),
    }
}

fn ensure_remote_directory(transport: &mut dyn Transport, dir: &str) -> Result<(), TransferError> {
    // 找到第一个存在的祖先目录
    let mut missing = Vec::new();
    let mut current = dir.to_string();
    loop {
        match transport.stat(&current) {
            Ok(stat) if stat.is_dir => break,
            Ok(_) => {
                return Err(TransferError::RemoteIoError(format!(
                    "Path exists but is not a directory: {}",
                    current
                )))
            }
            Err(TransportError::NotFound { .. }) if current != "/" => {
                let parent = path::parent(&current);
                missing.push(current);
                current = parent;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for dir in missing.iter().rev() {
        debug!("Creating remote directory: {}", dir);
        if let Err(e) = transport.mkdir(dir, DIR_MODE) {
            // 可能已被并发创建
            match transport.stat(dir) {
                Ok(stat) if stat.is_dir => {}
                _ => return Err(e.into()),
            }
        }
    }
    Ok(())
}
