//! 对 `wsi-berry::catalog` 的更一层封装. 提供更直接的存储布局获取.

use std::env;
use std::path::PathBuf;
use wsi_berry::catalog::StoreLayout;

/// 获取切片存储目录.
///
/// 1. 若环境变量 `$WSI_SLIDE_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/slides`.
pub fn slide_dir_from_env_or_home() -> PathBuf {
    if let Ok(d) = env::var("WSI_SLIDE_DIR") {
        PathBuf::from(d)
    } else {
        wsi_berry::home_slide_dir().unwrap()
    }
}

/// 获取元数据索引文件路径.
///
/// 1. 若环境变量 `$WSI_INDEX_PATH` 非空, 则返回其值;
/// 2. 否则, 返回 `{切片存储目录}/index.json`.
pub fn index_path_from_env_or_home() -> PathBuf {
    if let Ok(p) = env::var("WSI_INDEX_PATH") {
        PathBuf::from(p)
    } else {
        slide_dir_from_env_or_home().join("index.json")
    }
}

/// 从 `$WSI_SLIDE_DIR` 或者 `$HOME/slides` 构建存储布局.
#[inline]
pub fn layout_from_env_or_home() -> StoreLayout {
    StoreLayout::new(slide_dir_from_env_or_home())
}
