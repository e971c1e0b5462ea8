//! 向量库快照
//!
//! 内置向量库可选地把全部记忆条目写入单个 JSON 文件，启动时再读回（嵌入向量不落盘，加载后重新计算）。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::MemoryError;
use crate::memory::MemoryItem;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    items: Vec<MemoryItem>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// 单文件 JSON 快照
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    path: PathBuf,
}

impl StoreSnapshot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取快照；文件不存在时返回空列表
    pub async fn load(&self) -> Result<Vec<MemoryItem>, MemoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| MemoryError::Persistence(format!("{}: {e}", self.path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&data)
            .map_err(|e| MemoryError::Persistence(format!("{}: {e}", self.path.display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MemoryError::Persistence(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot.items)
    }

    /// 覆盖写入；父目录不存在时自动创建。先写临时文件再改名，避免写一半的快照
    pub async fn save(&self, items: &[MemoryItem]) -> Result<(), MemoryError> {
        let err =
            |e: std::io::Error| MemoryError::Persistence(format!("{}: {e}", self.path.display()));
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(err)?;
        }
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            items: items.to_vec(),
        };
        let data = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await.map_err(err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NewMemory;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = StoreSnapshot::new(dir.path().join("none.json"));
        assert!(snap.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let snap = StoreSnapshot::new(dir.path().join("nested/memory.json"));
        let items = vec![
            NewMemory::new(0, "a", "b", "talk", "hello").with_id(0),
            NewMemory::new(1, "b", "a", "talk", "你好").with_id(1),
        ];
        snap.save(&items).await.unwrap();
        assert_eq!(snap.load().await.unwrap(), items);
    }
}
