//! 管线依赖的通用组件.

use wsi_berry::tiles::TileDim;

pub mod loader;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) {
    writeln!(&mut w, "{SEP}").unwrap();
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 创建一般情况下合适的单倍率 tile 维度: 基准层 256x256.
#[inline]
pub fn base_dim() -> TileDim {
    TileDim {
        size: 256,
        level: 0,
    }
}
