//! 缓存索引
//!
//! 每个输出类别一份 `cache_index.json`，键是指纹的十六进制字符串，
//! 值记录源文件、输出文件、时间戳和原始文件名，跨进程重启可恢复。
//!
//! 并发约定：同一类别的"读索引-改-写回"序列必须串行，否则并发插入会
//! 相互覆盖丢失。每个类别持有一把 `tokio::sync::Mutex`，所有会改写
//! 索引的操作都先拿锁。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::fingerprint::Fingerprint;
use crate::error::{PipelineError, Result};

/// 索引文件名
const INDEX_FILE_NAME: &str = "cache_index.json";

/// 输出类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    /// 预处理后的用户照片
    PreprocessedUser,
    /// 预处理后的发型参考图
    PreprocessedStyle,
    /// 最终换发型结果
    FinalOutput,
}

impl CacheCategory {
    /// 全部类别（invalidate 时遍历用）
    pub const ALL: [CacheCategory; 3] = [
        CacheCategory::PreprocessedUser,
        CacheCategory::PreprocessedStyle,
        CacheCategory::FinalOutput,
    ];

    /// 类别对应的输出子目录名
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheCategory::PreprocessedUser => "gemini_processed_user",
            CacheCategory::PreprocessedStyle => "gemini_processed_hairstyle",
            CacheCategory::FinalOutput => "final_results",
        }
    }

    fn lock_index(&self) -> usize {
        match self {
            CacheCategory::PreprocessedUser => 0,
            CacheCategory::PreprocessedStyle => 1,
            CacheCategory::FinalOutput => 2,
        }
    }
}

/// 一条缓存记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 源文件路径
    pub original_path: String,
    /// 输出文件路径
    pub processed_path: String,
    /// 创建时间（ISO-8601）
    pub timestamp: String,
    /// 原始文件名
    pub original_filename: String,
}

/// 单个类别的缓存统计
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// 索引中的记录数
    pub total: usize,
    /// 输出文件仍然存在的记录数
    pub valid: usize,
    /// 输出文件已丢失的记录数
    pub dangling: usize,
}

/// 结果缓存
///
/// 指纹 → 已产出结果的映射，每类别一份 JSON 索引文件。
pub struct ResultCache {
    base_dir: PathBuf,
    locks: [Mutex<()>; 3],
}

impl ResultCache {
    /// 创建缓存，确保各类别目录存在
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for category in CacheCategory::ALL {
            let dir = base_dir.join(category.dir_name());
            fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::io(dir.display().to_string(), e))?;
        }
        Ok(Self {
            base_dir,
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        })
    }

    /// 类别的输出目录
    pub fn category_dir(&self, category: CacheCategory) -> PathBuf {
        self.base_dir.join(category.dir_name())
    }

    fn index_path(&self, category: CacheCategory) -> PathBuf {
        self.category_dir(category).join(INDEX_FILE_NAME)
    }

    /// 查询缓存
    ///
    /// 只有索引命中且输出文件仍然存在才算命中；索引在、文件没了的
    /// 陈旧记录会被顺手从索引里删掉，按未命中处理。
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        category: CacheCategory,
    ) -> Option<PathBuf> {
        let _guard = self.locks[category.lock_index()].lock().await;

        let mut index = self.read_index(category);
        let entry = index.get(fingerprint.as_hex())?.clone();

        let output = PathBuf::from(&entry.processed_path);
        if output.exists() {
            debug!("缓存命中: {} → {}", fingerprint.short(), entry.processed_path);
            return Some(output);
        }

        // 陈旧记录：输出文件被外部删除了，清理索引
        warn!(
            "缓存文件已丢失，清理索引: {} ({})",
            fingerprint.short(),
            entry.processed_path
        );
        index.remove(fingerprint.as_hex());
        if let Err(e) = self.write_index(category, &index) {
            warn!("清理缓存索引失败: {}", e);
        }
        None
    }

    /// 写入缓存记录
    ///
    /// 幂等：同一指纹重复插入时后写的覆盖先写的（last-write-wins）。
    pub async fn insert(
        &self,
        fingerprint: &Fingerprint,
        category: CacheCategory,
        source: &Path,
        output: &Path,
    ) -> Result<()> {
        let _guard = self.locks[category.lock_index()].lock().await;

        let mut index = self.read_index(category);
        index.insert(
            fingerprint.as_hex().to_string(),
            CacheEntry {
                original_path: source.display().to_string(),
                processed_path: output.display().to_string(),
                timestamp: chrono::Local::now().to_rfc3339(),
                original_filename: source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },
        );
        self.write_index(category, &index)?;

        debug!("缓存已更新: {} → {}", fingerprint.short(), output.display());
        Ok(())
    }

    /// 按输出文件路径删除缓存记录
    ///
    /// 供外部文件管理工具在人工删除缓存产物后调用，避免索引悬空。
    pub async fn invalidate(&self, output: &Path) -> Result<usize> {
        let target = output.display().to_string();
        let mut removed = 0;

        for category in CacheCategory::ALL {
            let _guard = self.locks[category.lock_index()].lock().await;

            let mut index = self.read_index(category);
            let before = index.len();
            index.retain(|_, entry| entry.processed_path != target);
            if index.len() != before {
                removed += before - index.len();
                self.write_index(category, &index)?;
            }
        }

        if removed > 0 {
            debug!("已失效 {} 条缓存记录: {}", removed, output.display());
        }
        Ok(removed)
    }

    /// 统计某类别的缓存状况
    pub async fn stats(&self, category: CacheCategory) -> CacheStats {
        let _guard = self.locks[category.lock_index()].lock().await;

        let index = self.read_index(category);
        let mut stats = CacheStats {
            total: index.len(),
            ..Default::default()
        };
        for entry in index.values() {
            if Path::new(&entry.processed_path).exists() {
                stats.valid += 1;
            } else {
                stats.dangling += 1;
            }
        }
        stats
    }

    // ========== 索引文件读写 ==========

    fn read_index(&self, category: CacheCategory) -> HashMap<String, CacheEntry> {
        let path = self.index_path(category);
        if !path.exists() {
            return HashMap::new();
        }
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("缓存索引解析失败，按空索引处理 ({}): {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) => {
                warn!("读取缓存索引失败，按空索引处理 ({}): {}", path.display(), e);
                HashMap::new()
            }
        }
    }

    fn write_index(
        &self,
        category: CacheCategory,
        index: &HashMap<String, CacheEntry>,
    ) -> Result<()> {
        let path = self.index_path(category);
        let text = serde_json::to_string_pretty(index)?;
        fs::write(&path, text).map_err(|e| PipelineError::io(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::fingerprint_bytes;
    use std::fs::File;
    use std::io::Write;

    fn touch(path: &Path) {
        let mut f = File::create(path).unwrap();
        f.write_all(b"output bytes").unwrap();
    }

    #[tokio::test]
    async fn test_insert_then_lookup_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path()).unwrap();

        let output = dir.path().join("out.png");
        touch(&output);

        let fp = fingerprint_bytes(b"input-1");
        cache
            .insert(&fp, CacheCategory::PreprocessedUser, Path::new("in.jpg"), &output)
            .await
            .unwrap();

        let hit = cache.lookup(&fp, CacheCategory::PreprocessedUser).await;
        assert_eq!(hit, Some(output));
    }

    #[tokio::test]
    async fn test_second_insert_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path()).unwrap();

        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        touch(&first);
        touch(&second);

        let fp = fingerprint_bytes(b"input-2");
        cache
            .insert(&fp, CacheCategory::FinalOutput, Path::new("in.jpg"), &first)
            .await
            .unwrap();
        cache
            .insert(&fp, CacheCategory::FinalOutput, Path::new("in.jpg"), &second)
            .await
            .unwrap();

        let hit = cache.lookup(&fp, CacheCategory::FinalOutput).await;
        assert_eq!(hit, Some(second));
    }

    #[tokio::test]
    async fn test_stale_entry_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path()).unwrap();

        let output = dir.path().join("gone.png");
        touch(&output);

        let fp = fingerprint_bytes(b"input-3");
        cache
            .insert(&fp, CacheCategory::PreprocessedStyle, Path::new("in.jpg"), &output)
            .await
            .unwrap();

        // 外部删除了输出文件
        fs::remove_file(&output).unwrap();

        assert!(cache.lookup(&fp, CacheCategory::PreprocessedStyle).await.is_none());

        // 陈旧记录应当已被删除：恢复文件后依然未命中
        touch(&output);
        assert!(cache.lookup(&fp, CacheCategory::PreprocessedStyle).await.is_none());
    }

    #[tokio::test]
    async fn test_index_round_trip_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("persisted.png");
        touch(&output);

        let fp = fingerprint_bytes(b"input-4");
        {
            let cache = ResultCache::new(dir.path()).unwrap();
            cache
                .insert(&fp, CacheCategory::PreprocessedUser, Path::new("src/in.jpg"), &output)
                .await
                .unwrap();
        }

        // 模拟进程重启：新建一个指向同一目录的缓存
        let cache = ResultCache::new(dir.path()).unwrap();
        let hit = cache.lookup(&fp, CacheCategory::PreprocessedUser).await;
        assert_eq!(hit, Some(output));
    }

    #[tokio::test]
    async fn test_invalidate_by_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path()).unwrap();

        let output = dir.path().join("deleted_by_user.png");
        touch(&output);

        let fp = fingerprint_bytes(b"input-5");
        cache
            .insert(&fp, CacheCategory::FinalOutput, Path::new("in.jpg"), &output)
            .await
            .unwrap();

        let removed = cache.invalidate(&output).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&fp, CacheCategory::FinalOutput).await.is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_valid_and_dangling() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path()).unwrap();

        let alive = dir.path().join("alive.png");
        let dead = dir.path().join("dead.png");
        touch(&alive);
        touch(&dead);

        cache
            .insert(&fingerprint_bytes(b"a"), CacheCategory::FinalOutput, Path::new("a.jpg"), &alive)
            .await
            .unwrap();
        cache
            .insert(&fingerprint_bytes(b"b"), CacheCategory::FinalOutput, Path::new("b.jpg"), &dead)
            .await
            .unwrap();
        fs::remove_file(&dead).unwrap();

        let stats = cache.stats(CacheCategory::FinalOutput).await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.dangling, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(ResultCache::new(dir.path()).unwrap());

        let output = dir.path().join("shared.png");
        touch(&output);

        let mut handles = Vec::new();
        for i in 0..20u32 {
            let cache = cache.clone();
            let output = output.clone();
            handles.push(tokio::spawn(async move {
                let fp = fingerprint_bytes(format!("concurrent-{}", i).as_bytes());
                cache
                    .insert(&fp, CacheCategory::PreprocessedUser, Path::new("in.jpg"), &output)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 读-改-写被锁串行化后，20 条插入一条都不能丢
        let stats = cache.stats(CacheCategory::PreprocessedUser).await;
        assert_eq!(stats.total, 20);
    }
}
