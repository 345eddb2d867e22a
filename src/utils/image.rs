//! 图片文件扫描
//!
//! 按扩展名递归收集目录下的图片文件，结果按文件名排序，
//! 保证同一目录两次扫描得到的顺序一致。

use std::path::{Path, PathBuf};
use tracing::warn;

/// 识别为图片的扩展名（不区分大小写）
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

/// 递归扫描目录下的所有图片文件
///
/// 目录不存在或不可读时返回空列表并记日志，不报错。
pub fn scan_image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect(dir, &mut files);
    files.sort();
    files
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("无法读取目录 {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, out);
        } else if is_image(&path) {
            out.push(path);
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}
