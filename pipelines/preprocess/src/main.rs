//! 预处理管线入口: 目录解析 -> 同步检查 -> tiling -> 缓存 -> 数据集划分.

mod report;
mod runner;

use std::path::PathBuf;

fn main() {
    simple_logger::SimpleLogger::new()
        .init()
        .expect("Logger init error");

    let config = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .expect("usage: preprocess <config.toml>");

    let report = runner::run(&config);
    utils::sep();
    report.print();
}
