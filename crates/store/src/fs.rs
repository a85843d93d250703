//! 文件原语：追加、原子替换与按字节区间读写。
//!
//! - 整文件写入一律先写同目录下的临时文件，再 `rename` 到最终文件名，
//!   崩溃时最终文件名下不会出现写了一半的内容。是否 `sync_all` 由调用方决定。
//! - 追加使用操作系统的 append 模式。
//! - 区间写只用于改写分区文件头，不改变文件长度。
//! - 截断只用于丢弃分区文件尾部不完整的记录。

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.tmp-{}-{}", name, std::process::id(), seq))
}

/// 确保父目录存在。
pub async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// 原子地替换整个文件，内容在 `rename` 前落盘。
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    write_atomic_with(path, data, true).await
}

/// # Summary
/// 原子地替换整个文件。
///
/// # Logic
/// 1. 在同目录下创建唯一的临时文件并写入全部内容。
/// 2. `sync` 为真时 `sync_all` 保证内容落盘。
/// 3. `rename` 覆盖目标文件；失败时清理临时文件。
pub async fn write_atomic_with(path: &Path, data: &[u8], sync: bool) -> std::io::Result<()> {
    ensure_parent(path).await?;
    let tmp = temp_path_for(path);

    let result = async {
        let mut file = File::create(&tmp).await?;
        file.write_all(data).await?;
        if sync {
            file.sync_all().await?;
        } else {
            file.flush().await?;
        }
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err()
        && let Err(e) = fs::remove_file(&tmp).await
        && e.kind() != ErrorKind::NotFound
    {
        tracing::warn!(path = ?tmp, error = %e, "Failed to remove temp file");
    }
    result
}

/// # Summary
/// 仅当目标不存在时原子地创建文件。
///
/// # Returns
/// 新建返回 `true`；目标已存在时不做修改并返回 `false`。
pub async fn create_atomic(path: &Path, data: &[u8]) -> std::io::Result<bool> {
    if fs::try_exists(path).await? {
        return Ok(false);
    }
    write_atomic(path, data).await?;
    Ok(true)
}

/// 以 append 模式追加字节，文件不存在时创建。
pub async fn append(path: &Path, data: &[u8], sync: bool) -> std::io::Result<()> {
    ensure_parent(path).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    if sync {
        file.sync_data().await?;
    } else {
        file.flush().await?;
    }
    Ok(())
}

/// # Summary
/// 读取 `[offset, offset + len)` 区间。
///
/// # Returns
/// 文件不存在时返回 `None`；文件不足 `len` 字节时返回实际读到的部分。
pub async fn read_range(path: &Path, offset: u64, len: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len);
    let mut limited = file.take(u64::try_from(len).unwrap_or(u64::MAX));
    limited.read_to_end(&mut buf).await?;
    Ok(Some(buf))
}

/// # Summary
/// 在已存在的文件中覆盖 `offset` 处的字节。
///
/// # Logic
/// 以非 append、非 truncate 模式打开，`seek` 后写入。
pub async fn write_range(path: &Path, offset: u64, data: &[u8], sync: bool) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    if sync {
        file.sync_data().await?;
    } else {
        file.flush().await?;
    }
    Ok(())
}

/// 把文件截断到 `len` 字节，丢弃其后的内容。
pub async fn truncate(path: &Path, len: u64, sync: bool) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    if sync {
        file.sync_data().await?;
    }
    Ok(())
}

/// 读取整个文件，不存在时返回 `None`。
pub async fn read_if_exists(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// # Summary
/// 列出目录中的文件名。
///
/// # Returns
/// 目录不存在时返回空列表。
pub async fn list_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// 列出目录中的子目录名，目录不存在时返回空列表。
pub async fn list_dir_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
