//! File I/O drivers

use std::io::ErrorKind;

use blueprint_core::{NodeKind, Value};

use super::{want_bytes, want_string};
use crate::outcome::OpError;

pub async fn run(kind: NodeKind) -> Result<Value, OpError> {
    match kind {
        NodeKind::ReadFile { path } => {
            let path = want_string("read_file", "path", &path)?;
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| OpError::operation(format!("read {} failed: {}", path, e)))?;
            Ok(Value::String(content))
        }
        NodeKind::WriteFile { path, content } => {
            let path = want_string("write_file", "path", &path)?;
            let bytes = want_bytes("write_file", "content", &content)?;
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| OpError::operation(format!("write {} failed: {}", path, e)))?;
            Ok(Value::Null)
        }
        NodeKind::AppendFile { path, content } => {
            let path = want_string("append_file", "path", &path)?;
            let bytes = want_bytes("append_file", "content", &content)?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| OpError::operation(format!("append {} failed: {}", path, e)))?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
                .await
                .map_err(|e| OpError::operation(format!("append {} failed: {}", path, e)))?;
            Ok(Value::Null)
        }
        NodeKind::DeleteFile { path } => {
            let path = want_string("delete_file", "path", &path)?;
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| OpError::operation(format!("delete {} failed: {}", path, e)))?;
            Ok(Value::Null)
        }
        NodeKind::FileExists { path } => {
            let path = want_string("file_exists", "path", &path)?;
            probe(&path, |_| true).await
        }
        NodeKind::IsFile { path } => {
            let path = want_string("is_file", "path", &path)?;
            probe(&path, |meta| meta.is_file()).await
        }
        NodeKind::IsDir { path } => {
            let path = want_string("is_dir", "path", &path)?;
            probe(&path, |meta| meta.is_dir()).await
        }
        NodeKind::Mkdir { path, recursive } => {
            let path = want_string("mkdir", "path", &path)?;
            let result = if recursive {
                tokio::fs::create_dir_all(&path).await
            } else {
                tokio::fs::create_dir(&path).await
            };
            result.map_err(|e| OpError::operation(format!("mkdir {} failed: {}", path, e)))?;
            Ok(Value::Null)
        }
        NodeKind::Rmdir { path, recursive } => {
            let path = want_string("rmdir", "path", &path)?;
            let result = if recursive {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_dir(&path).await
            };
            result.map_err(|e| OpError::operation(format!("rmdir {} failed: {}", path, e)))?;
            Ok(Value::Null)
        }
        NodeKind::ListDir { path } => {
            let path = want_string("list_dir", "path", &path)?;
            let mut dir = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| OpError::operation(format!("list {} failed: {}", path, e)))?;
            let mut names = Vec::new();
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| OpError::operation(format!("list {} failed: {}", path, e)))?
            {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();
            Ok(Value::List(names.into_iter().map(Value::String).collect()))
        }
        NodeKind::CopyFile { src, dst } => {
            let src = want_string("copy_file", "src", &src)?;
            let dst = want_string("copy_file", "dst", &dst)?;
            tokio::fs::copy(&src, &dst)
                .await
                .map_err(|e| OpError::operation(format!("copy {} -> {} failed: {}", src, dst, e)))?;
            Ok(Value::Null)
        }
        NodeKind::MoveFile { src, dst } => {
            let src = want_string("move_file", "src", &src)?;
            let dst = want_string("move_file", "dst", &dst)?;
            tokio::fs::rename(&src, &dst)
                .await
                .map_err(|e| OpError::operation(format!("move {} -> {} failed: {}", src, dst, e)))?;
            Ok(Value::Null)
        }
        NodeKind::FileSize { path } => {
            let path = want_string("file_size", "path", &path)?;
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| OpError::operation(format!("stat {} failed: {}", path, e)))?;
            Ok(Value::Int(meta.len() as i64))
        }
        other => Err(OpError::operation(format!(
            "not a file kind: {}",
            other.name()
        ))),
    }
}

async fn probe(
    path: &str,
    check: impl FnOnce(&std::fs::Metadata) -> bool,
) -> Result<Value, OpError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Value::Bool(check(&meta))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Value::Bool(false)),
        Err(e) => Err(OpError::operation(format!("stat {} failed: {}", path, e))),
    }
}
