//! 工具模块

pub mod image;
pub mod logging;

pub use image::scan_image_files;
pub use logging::{init_logging, truncate_text};
