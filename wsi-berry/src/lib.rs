#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供全切片病理图像 (WSI) 的 tile 采样、逐切片缓存与数据集划分功能.
//!
//! 该 crate 目前仅提供 `safe` 接口. 将来可能为部分高性能场景关键路径提供 `unsafe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 以外部图像管理服务器导出的目录结构为基准组织数据
//!   (切片文件位于 `<store>/<id>.svs`, 缓存位于 `<store>/patches/<id>.bin`).
//!   只要新数据按该模式组织, 其它来源的数据也可以工作.
//! 2. 在非期望情况下 (调用方违反约定), 程序会直接 panic, 而不会导致内存错误.
//!   As what Rust promises.
//!
//! # 功能地图
//!
//! ### 切片目录解析与同步 ✅
//!
//! 按 (key, value) 条件集的笛卡尔积查询元数据源, 构建 [`SlideRecord`] 目录;
//! 按期望字节数校验本地切片文件并给出重新拉取计划.
//!
//! 实现位于 `wsi-berry/src/catalog.rs`.
//!
//! ### tile 表与逐切片缓存 ✅
//!
//! tile 表按 (切片, 像素坐标, 分辨率级) 组织行, 附带标签列与推理概率列.
//! 缓存单元以 "tiling 配置指纹 -> (配置快照, tile 表片段)" 的映射形式
//! 整体压缩存储, 不同指纹的结果可在同一文件内共存.
//!
//! 实现位于 `wsi-berry/src/{table, cache}.rs`.
//!
//! ### 数据集划分 ✅
//!
//! 测试集按切片分组整体切出, 随后在 tile 级做分层随机划分.
//! 注意 train/validation 之间不保持切片分组 (与上游管线行为一致).
//!
//! 实现位于 `wsi-berry/src/split.rs`.
//!
//! ### tile 数据集与变换管线 ✅
//!
//! 随机可索引的 tile 读取视图, 支持多 (尺寸, 分辨率级) 键,
//! 以及含染色自适应步骤的有序变换管线.
//!
//! 实现位于 `wsi-berry/src/tiles`.
//!
//! ### Macenko 染色归一化 ✅
//!
//! 光密度域协方差特征分解, 角度百分位估计 H&E 染色矩阵与浓度上限.
//!
//! 实现位于 `wsi-berry/src/stain.rs`.
//!
//! ### tile 网格生成与组织区 QC ✅
//!
//! 按背景亮度阈值与 (可选的) 标注掩膜筛选 tile 坐标, 构建初始 tile 表.
//!
//! 实现位于 `wsi-berry/src/{preprocess, mask}.rs`.
//!
//! ### 推理结果写回 ✅
//!
//! 标签编码, 批量推理驱动, `prob_*` 概率列写回与缓存回存.
//!
//! 实现位于 `wsi-berry/src/predict.rs`.

/// 二维数组索引 (height, width).
pub type Idx2d = (usize, usize);

/// 切片基准层像素坐标 (x, y). 注意与 [`Idx2d`] 的轴序不同.
pub type Coord2d = (u32, u32);

/// 三通道 RGB tile 像素缓冲, 形状为 (height, width, 3).
pub type RgbTile = ndarray::Array3<u8>;

pub mod consts;

pub mod catalog;
pub mod mask;
pub mod preprocess;
pub mod split;
pub mod stain;
pub mod table;
pub mod tiles;

#[cfg(feature = "serde")]
pub mod cache;
#[cfg(feature = "serde")]
pub mod config;

pub mod predict;
pub mod prelude;

pub use catalog::{Criteria, SlideRecord, StoreLayout};
pub use preprocess::{Tiler, TilingSection};
pub use split::{partition, Partition, SplitError, SplitSpec};
pub use table::{TileRow, TileTable, Value};
pub use tiles::{RegionReader, Step, TileItem, TileSet};

#[cfg(feature = "serde")]
pub use cache::{load_tiles, save_tiles, Fingerprint, LoadOutcome};
#[cfg(feature = "serde")]
pub use config::PipelineConfig;

/// 获取 `{用户主目录}/slides` 目录.
pub fn home_slide_dir() -> Option<std::path::PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("slides");
    Some(ans)
}

/// 获取 `{用户主目录}/slides` 目录下给定继续项组成的全路径.
pub fn home_slide_dir_with<P, I>(it: I) -> Option<std::path::PathBuf>
where
    P: AsRef<std::path::Path>,
    I: IntoIterator<Item = P>,
{
    let mut ans = dirs::home_dir()?;
    ans.push("slides");
    ans.extend(it);
    Some(ans)
}
