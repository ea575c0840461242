// 文件哈希计算
//
// OneDrive 个人版在上传完成后返回 file.hashes.sha1Hash，
// 本地计算同样的摘要用于：
// 1. 上传 / 下载完成后的完整性校验
// 2. 生成已保存上传会话的唯一标识（文件被修改后不会误用旧会话）

use crate::error::{DriveError, DriveResult};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 读取缓冲区大小: 1MB
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// 计算字节串的 SHA-1（小写十六进制）
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// 计算文件的 SHA-1（小写十六进制）
///
/// 在阻塞线程池中执行，避免大文件哈希阻塞异步运行时
pub async fn sha1_file(path: &Path) -> DriveResult<String> {
    let path = path.to_path_buf();
    let task_path = path.clone();

    tokio::task::spawn_blocking(move || sha1_file_sync(&task_path))
        .await
        .map_err(|e| DriveError::local_io(&path, std::io::Error::other(e.to_string())))?
}

fn sha1_file_sync(path: &Path) -> DriveResult<String> {
    let file = std::fs::File::open(path).map_err(|e| DriveError::local_io(path, e))?;
    let mut reader = std::io::BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| DriveError::local_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest = hex::encode(hasher.finalize());
    debug!("SHA-1 计算完成: {:?} = {}", path, digest);
    Ok(digest)
}
