//! 结果缓存层
//!
//! 以文件内容指纹为键，把"同一张输入图"的昂贵远端处理结果持久化下来。
//! 指纹计算见 `fingerprint`，索引读写见 `index`。

pub mod fingerprint;
pub mod index;

pub use fingerprint::{fingerprint_bytes, fingerprint_file, Fingerprint};
pub use index::{CacheCategory, CacheEntry, CacheStats, ResultCache};
