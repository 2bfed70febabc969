//! 逐切片 tile 缓存.
//!
//! 每张切片对应一个物理缓存单元 (`<store>/patches/<id>.bin`),
//! 内容是 "tiling 配置指纹 -> (配置快照, tile 表片段)" 的映射,
//! 以 bincode 序列化并经 zlib 压缩整体存储. 不同指纹的结果在同一单元内共存;
//! 相同指纹重新保存时整项覆盖.

use crate::catalog::SlideRecord;
use crate::preprocess::TilingSection;
use crate::table::TileTable;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// tiling 配置指纹.
///
/// 由 [`TilingSection`] 的全部字段按键名排序后渲染为规范字符串,
/// 与字段书写顺序无关. tiling 语义相同的两份配置必然得到相同指纹;
/// 任一 tiling 相关字段不同则指纹不同.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 从 tiling 配置计算指纹.
    pub fn of(tiling: &TilingSection) -> Self {
        // levels 是集合语义, 排序去重后再渲染.
        let levels = tiling.levels.iter().sorted().dedup().join("+");
        Fingerprint(format!(
            "levels={levels};stain_norm={};tile_size={};tissue_fraction={};white_cutoff={}",
            tiling.stain_norm, tiling.tile_size, tiling.tissue_fraction, tiling.white_cutoff,
        ))
    }

    /// 规范字符串表示.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 缓存单元内的一项: 配置快照与对应的 tile 表片段.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    tiling: TilingSection,
    tiles: TileTable,
}

/// 缓存单元的物理形态: 指纹 -> 缓存项.
type CacheUnit = BTreeMap<String, CacheEntry>;

/// 缓存读写错误. 单元损坏对该工作单元而言是致命的.
#[derive(Debug)]
pub enum CacheError {
    /// 底层 I/O 错误.
    Io(std::io::Error),

    /// 序列化/反序列化错误 (单元损坏).
    Codec(bincode::Error),
}

/// 读取整个缓存单元. 文件必须存在.
fn read_unit(path: &Path) -> Result<CacheUnit, CacheError> {
    let file = fs::File::open(path).map_err(CacheError::Io)?;
    let mut buf = Vec::new();
    ZlibDecoder::new(file)
        .read_to_end(&mut buf)
        .map_err(CacheError::Io)?;
    bincode::deserialize(&buf).map_err(CacheError::Codec)
}

/// 整体重写缓存单元.
fn write_unit(path: &Path, unit: &CacheUnit) -> Result<(), CacheError> {
    let file = fs::File::create(path).map_err(CacheError::Io)?;
    let mut enc = ZlibEncoder::new(file, Compression::best());
    bincode::serialize_into(&mut enc, unit).map_err(CacheError::Codec)?;
    enc.finish().map_err(CacheError::Io)?;
    Ok(())
}

/// 缓存加载结果.
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    /// 命中片段拼接成的工作表.
    pub tiles: TileTable,

    /// 命中的切片数.
    pub loaded: usize,

    /// 被跳过的切片数 (单元缺失或无当前指纹的项).
    pub skipped: usize,
}

/// 按当前 tiling 配置从各切片的缓存单元加载 tile 表片段并拼接.
///
/// 单元文件不存在、或单元内没有当前指纹的项时, 该切片被跳过并计数,
/// 不视为错误; 单元存在但无法解码则是致命错误.
pub fn load_tiles(
    tiling: &TilingSection,
    records: &[SlideRecord],
) -> Result<LoadOutcome, CacheError> {
    let fp = Fingerprint::of(tiling);
    let mut ans = LoadOutcome::default();
    for rec in records {
        if !rec.cache_path.exists() {
            ans.skipped += 1;
            continue;
        }
        let mut unit = read_unit(&rec.cache_path)?;
        match unit.remove(fp.as_str()) {
            Some(entry) => {
                ans.tiles.extend(entry.tiles);
                ans.loaded += 1;
            }
            None => ans.skipped += 1,
        }
    }
    Ok(ans)
}

/// 将一张切片的 tile 表片段保存进其缓存单元.
///
/// 读出已有映射 (没有则从空映射开始), 覆盖当前指纹的项, 再整体写回;
/// 其余指纹的项原样保留. 按需创建中间目录.
///
/// # 注意
///
/// 1. `tiles` 的所有行必须属于 `record` 这张切片, 否则程序 panic.
/// 2. 多进程并发保存同一单元没有协调机制, 结果为后写者胜.
///   调用方需要自行对单个切片的写入串行化, 或接受该覆盖语义.
pub fn save_tiles(
    tiling: &TilingSection,
    tiles: &TileTable,
    record: &SlideRecord,
) -> Result<PathBuf, CacheError> {
    assert!(
        tiles.rows().all(|r| r.slide == record.external_id),
        "片段包含其它切片的行"
    );

    if let Some(parent) = record.cache_path.parent() {
        fs::create_dir_all(parent).map_err(CacheError::Io)?;
    }

    let mut unit = if record.cache_path.exists() {
        read_unit(&record.cache_path)?
    } else {
        CacheUnit::new()
    };

    let fp = Fingerprint::of(tiling);
    unit.insert(
        fp.as_str().to_owned(),
        CacheEntry {
            tiling: tiling.clone(),
            tiles: tiles.clone(),
        },
    );
    write_unit(&record.cache_path, &unit)?;
    Ok(record.cache_path.clone())
}
