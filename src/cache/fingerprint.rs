//! 内容指纹
//!
//! 对文件字节做 SHA-256，得到十六进制字符串作为缓存键。
//! 指纹只用于判等，不参与排序；相同字节必然得到相同指纹。

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// 分块读取的块大小
const CHUNK_SIZE: usize = 8192;

/// 内容指纹（SHA-256 十六进制字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 十六进制表示
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// 前 8 位短指纹（用于生成文件名）
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// 合并两个指纹，得到一对输入的组合指纹
    pub fn combine(&self, other: &Fingerprint) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(other.0.as_bytes());
        Fingerprint(hex_string(&hasher.finalize()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 计算文件的内容指纹
///
/// 分块读取，避免一次性加载大图。读取失败返回 `Io` 错误，
/// 调用方应视为"缓存未命中，跳过缓存继续处理"。
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let mut file =
        File::open(path).map_err(|e| PipelineError::io(path.display().to_string(), e))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| PipelineError::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Fingerprint(hex_string(&hasher.finalize())))
}

/// 计算内存字节的内容指纹
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hex_string(&hasher.finalize()))
}

fn hex_string(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identical_bytes_identical_fingerprint() {
        let a = fingerprint_bytes(b"hello world");
        let b = fingerprint_bytes(b"hello world");
        assert_eq!(a, b);

        let c = fingerprint_bytes(b"hello world!");
        assert_ne!(a, c);
    }

    #[test]
    fn test_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.jpg");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"fake image bytes").unwrap();

        let from_file = fingerprint_file(&path).unwrap();
        let from_bytes = fingerprint_bytes(b"fake image bytes");
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = fingerprint_file(Path::new("/nonexistent/no_such_file.jpg"));
        assert!(matches!(result, Err(PipelineError::Io { .. })));
    }

    #[test]
    fn test_combine_is_stable() {
        let a = fingerprint_bytes(b"user");
        let b = fingerprint_bytes(b"hairstyle");
        assert_eq!(a.combine(&b), a.combine(&b));
        // 组合是有序的：user+hairstyle 与 hairstyle+user 是不同的键
        assert_ne!(a.combine(&b), b.combine(&a));
    }
}
