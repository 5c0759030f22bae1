// 下载功能：解析本地目标并打开两端
use crate::remote::path;
use crate::ssh::transport::Transport;
use crate::transfer::engine::Endpoints;
use crate::utils::error::TransferError;
use crate::utils::file::ensure_parent_dir;
use log::debug;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Opens the remote file for reading, then creates the local target.
pub fn open_download(
    transport: &mut dyn Transport,
    remote_path: &str,
    local_path: &str,
    known_size: Option<u64>,
) -> Result<Endpoints, TransferError> {
    let total_size = match known_size {
        Some(size) => Some(size),
        None => {
            let stat = transport.stat(remote_path)?;
            if stat.is_dir {
                return Err(TransferError::RemoteIoError(format!(
                    "{}: is a directory",
                    remote_path
                )));
            }
            Some(stat.size)
        }
    };

    let reader = transport.open_read(remote_path)?;

    let target = get_target_file_path(Path::new(local_path), remote_path)?;
    ensure_parent_dir(&target)
        .map_err(|e| TransferError::LocalIoError(format!("{}: {}", target.display(), e)))?;
    let file = File::create(&target)
        .map_err(|e| TransferError::LocalIoError(format!("{}: {}", target.display(), e)))?;
    debug!("Download target resolved to {}", target.display());

    Ok(Endpoints {
        reader,
        writer: Box::new(file),
        total_size,
        destination: Some(target.to_string_lossy().into_owned()),
    })
}

// 本地路径是目录时，在该目录下使用远程文件名
fn get_target_file_path(local: &Path, remote_path: &str) -> Result<PathBuf, TransferError> {
    if local.is_dir() {
        let file_name = path::file_name(remote_path).ok_or_else(|| {
            TransferError::RemoteIoError(format!(
                "Cannot determine file name from remote path {}",
                remote_path
            ))
        })?;
        Ok(local.join(file_name))
    } else {
        Ok(local.to_path_buf())
    }
}
