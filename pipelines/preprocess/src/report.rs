//! 运行结果.

use std::io::{self, Write};

/// 管线最终统计.
pub struct PipelineReport {
    /// 目录解析得到的切片数.
    pub slides: usize,

    /// 本地就绪并参与 tiling 的切片数.
    pub ready: usize,

    /// 未就绪 (缺失或字节数不符) 被跳过的切片数.
    pub pending: usize,

    /// 通过 QC 的 tile 总数.
    pub tiles: usize,

    /// 缓存覆盖检查中命中的切片数.
    pub cache_loaded: usize,

    /// 缓存覆盖检查中跳过的切片数.
    pub cache_skipped: usize,

    /// 训练集行数.
    pub train: usize,

    /// 验证集行数.
    pub val: usize,

    /// 测试集行数.
    pub test: usize,
}

impl PipelineReport {
    /// 将统计写进 `w` 中.
    pub fn describe_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        const S4: &str = "    ";

        writeln!(w, "Pipeline summary:")?;
        writeln!(w, "{S4}Catalog slides: {}", self.slides)?;
        writeln!(w, "{S4}Ready slides: {}", self.ready)?;
        writeln!(w, "{S4}Pending slides: {}", self.pending)?;
        writeln!(w, "{S4}Tiles after QC: {}", self.tiles)?;
        writeln!(
            w,
            "{S4}Cache coverage: {} loaded / {} skipped",
            self.cache_loaded, self.cache_skipped
        )?;
        write!(
            w,
            "{S4}Partition: train {} / val {} / test {}",
            self.train, self.val, self.test
        )?;
        Ok(())
    }

    /// 输出到标准输出.
    pub fn print(&self) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        self.describe_into(&mut lock).expect("Writing report error");
        writeln!(&mut lock).expect("Writing report error");
    }
}
