//! tile 网格生成与组织区质量控制.
//!
//! 对每张切片按配置的分辨率级生成规则网格, 先用低分辨率组织掩膜
//! (若可用) 粗筛, 再读取像素按背景亮度做精筛, 产出初始 tile 表.
//! 同一切片的行不会在该步骤被拆分.

use crate::catalog::SlideRecord;
use crate::consts::{DEFAULT_TILE_SIZE, WHITE_CUTOFF};
use crate::mask::{self, MaskArchive};
use crate::table::{TileRow, TileTable};
use crate::tiles::{RegionReader, SlideStore, TileReadError};
use crate::{Coord2d, RgbTile};
use either::Either;
use ndarray::Array2;
use ndarray_npy::ReadNpzError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

/// tiling 相关配置. 该结构的字段集合即缓存指纹的输入,
/// 新增字段时必须同步考虑指纹兼容性.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TilingSection {
    /// tile 边长 (像素).
    #[cfg_attr(feature = "serde", serde(default = "default_tile_size"))]
    pub tile_size: u32,

    /// 参与 tiling 的分辨率级列表. 0 为基准层.
    #[cfg_attr(feature = "serde", serde(default = "default_levels"))]
    pub levels: Vec<u32>,

    /// 背景判定的白色亮度下界.
    #[cfg_attr(feature = "serde", serde(default = "default_white_cutoff"))]
    pub white_cutoff: u8,

    /// tile 内组织像素占比阈值, 低于该值的 tile 被丢弃.
    #[cfg_attr(feature = "serde", serde(default = "default_tissue_fraction"))]
    pub tissue_fraction: f64,

    /// 是否启用 Macenko 染色归一化.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stain_norm: bool,
}

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

fn default_levels() -> Vec<u32> {
    vec![0]
}

fn default_white_cutoff() -> u8 {
    WHITE_CUTOFF
}

fn default_tissue_fraction() -> f64 {
    0.5
}

impl Default for TilingSection {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            levels: default_levels(),
            white_cutoff: default_white_cutoff(),
            tissue_fraction: default_tissue_fraction(),
            stain_norm: false,
        }
    }
}

/// 预处理错误.
#[derive(Debug)]
pub enum PreprocessError {
    /// 切片读取错误.
    Read(TileReadError),

    /// 组织掩膜读取错误.
    Mask(ReadNpzError),

    /// 缓存写入错误.
    #[cfg(feature = "serde")]
    Cache(crate::cache::CacheError),
}

impl From<TileReadError> for PreprocessError {
    #[inline]
    fn from(e: TileReadError) -> Self {
        PreprocessError::Read(e)
    }
}

/// 生成级 `level` 上的规则 tile 网格.
///
/// 返回基准层坐标; 相邻 tile 在基准层上相距 `tile_size << level`,
/// 不足一个完整 tile 的边缘部分被舍弃.
pub fn tile_grid((w, h): Coord2d, tile_size: u32, level: u32) -> Vec<Coord2d> {
    let step = tile_size << level;
    if step == 0 || step > w || step > h {
        return Vec::new();
    }
    let mut ans = Vec::new();
    let mut y = 0;
    while y + step <= h {
        let mut x = 0;
        while x + step <= w {
            ans.push((x, y));
            x += step;
        }
        y += step;
    }
    ans
}

/// tile 内组织像素 (非玻片背景) 的占比.
pub fn rgb_tissue_fraction(tile: &RgbTile, white_cutoff: u8) -> f64 {
    let (h, w, _) = tile.dim();
    let mut tissue = 0usize;
    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = (tile[(y, x, 0)], tile[(y, x, 1)], tile[(y, x, 2)]);
            if r.min(g).min(b) <= white_cutoff {
                tissue += 1;
            }
        }
    }
    tissue as f64 / (h * w) as f64
}

/// tile 网格生成器.
pub struct Tiler<'a> {
    tiling: &'a TilingSection,
    masks: Option<&'a MaskArchive>,
}

impl<'a> Tiler<'a> {
    /// 以 tiling 配置创建生成器.
    pub fn new(tiling: &'a TilingSection) -> Self {
        Self {
            tiling,
            masks: None,
        }
    }

    /// 启用组织掩膜粗筛.
    pub fn with_masks(mut self, masks: &'a MaskArchive) -> Self {
        self.masks = Some(masks);
        self
    }

    /// 对一张切片生成经过 QC 的 tile 表片段.
    ///
    /// 切片的键值标注被附到每一行上 (以便把切片级标签用作训练目标).
    pub fn tile_slide(
        &self,
        record: &SlideRecord,
        reader: &dyn RegionReader,
    ) -> Result<TileTable, PreprocessError> {
        let mask: Option<Array2<u8>> = match self.masks {
            Some(a) => Some(
                a.mask_by_slide(&record.external_id)
                    .map_err(PreprocessError::Mask)?,
            ),
            None => None,
        };

        let dims = reader.dimensions();
        let size = self.tiling.tile_size;
        let mut ans = TileTable::new();
        for &level in &self.tiling.levels {
            let step = size << level;
            let grid = tile_grid(dims, size, level).into_iter();

            // 掩膜可用时先粗筛, 省掉绝大多数无谓的像素读取.
            let candidates = match &mask {
                Some(m) => Either::Left(grid.filter(|&c| {
                    mask::tissue_fraction(m, c, step, dims) >= self.tiling.tissue_fraction
                })),
                None => Either::Right(grid),
            };

            for coord in candidates {
                let raw = reader.read_region(coord, level, (size, size))?;
                if rgb_tissue_fraction(&raw, self.tiling.white_cutoff)
                    < self.tiling.tissue_fraction
                {
                    continue;
                }
                let mut row = TileRow::new(record.external_id.clone(), coord, level);
                for (k, v) in &record.annotations {
                    row.set_value(k.clone(), v.as_str());
                }
                ans.push(row);
            }
        }
        Ok(ans)
    }

    /// 对目录中的全部切片做 tiling, 返回合并后的工作表.
    pub fn tile_catalog(
        &self,
        records: &[SlideRecord],
        store: &SlideStore,
    ) -> Result<TileTable, PreprocessError> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                let parts: Result<Vec<TileTable>, PreprocessError> = records
                    .par_iter()
                    .map(|rec| {
                        let reader = store.reader(&rec.external_id)?;
                        self.tile_slide(rec, reader.as_ref())
                    })
                    .collect();
            } else {
                let parts: Result<Vec<TileTable>, PreprocessError> = records
                    .iter()
                    .map(|rec| {
                        let reader = store.reader(&rec.external_id)?;
                        self.tile_slide(rec, reader.as_ref())
                    })
                    .collect();
            }
        }
        Ok(TileTable::concat(parts?))
    }

    /// tiling 并把每张切片的片段写进其缓存单元, 返回合并后的工作表.
    #[cfg(feature = "serde")]
    pub fn tile_and_cache(
        &self,
        records: &[SlideRecord],
        store: &SlideStore,
    ) -> Result<TileTable, PreprocessError> {
        let mut ans = TileTable::new();
        for rec in records {
            let reader = store.reader(&rec.external_id)?;
            let fragment = self.tile_slide(rec, reader.as_ref())?;
            crate::cache::save_tiles(self.tiling, &fragment, rec)
                .map_err(PreprocessError::Cache)?;
            ans.extend(fragment);
        }
        Ok(ans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StoreLayout;
    use crate::tiles::PlainImageReader;
    use ndarray::Array3;
    use std::collections::BTreeMap;

    #[test]
    fn test_tile_grid() {
        assert_eq!(tile_grid((1024, 512), 256, 0).len(), 4 * 2);
        // 级 1 的步长翻倍.
        assert_eq!(tile_grid((1024, 512), 256, 1).len(), 2);
        // 边缘不足一个 tile 的部分被舍弃.
        assert_eq!(tile_grid((300, 300), 256, 0).len(), 1);
        // 切片装不下一个 tile.
        assert!(tile_grid((100, 100), 256, 0).is_empty());
    }

    #[test]
    fn test_rgb_tissue_fraction() {
        // 左半白, 右半深粉.
        let mut data = Array3::zeros((64, 64, 3));
        for y in 0..64 {
            for x in 0..64 {
                let px: [u8; 3] = if x < 32 { [250, 250, 250] } else { [200, 120, 180] };
                for c in 0..3 {
                    data[(y, x, c)] = px[c];
                }
            }
        }
        let f = rgb_tissue_fraction(&data, WHITE_CUTOFF);
        assert!((f - 0.5).abs() < 1e-12);
    }

    /// 上半背景、下半组织的 1024x1024 合成切片.
    fn half_tissue_record() -> (SlideRecord, PlainImageReader) {
        let layout = StoreLayout::new("/data/slides");
        let mut ann = BTreeMap::new();
        ann.insert("diagnosis".to_owned(), "sarcoma".to_owned());
        let rec = SlideRecord {
            external_id: "X001".to_owned(),
            remote_id: 1,
            size: 0,
            slide_path: layout.slide_path("X001"),
            cache_path: layout.cache_path("X001"),
            annotations: ann,
        };

        let mut data = Array3::zeros((1024, 1024, 3));
        for y in 0..1024 {
            for x in 0..1024 {
                let px: [u8; 3] = if y < 512 { [245, 245, 245] } else { [190, 110, 170] };
                for c in 0..3 {
                    data[(y, x, c)] = px[c];
                }
            }
        }
        (rec, PlainImageReader::from_array(data))
    }

    #[test]
    fn test_tile_slide_filters_background() {
        let (rec, reader) = half_tissue_record();
        let tiling = TilingSection::default();
        let table = Tiler::new(&tiling).tile_slide(&rec, &reader).unwrap();

        // 4x4 网格中只有下半 8 个 tile 通过 QC.
        assert_eq!(table.len(), 8);
        assert!(table.rows().all(|r| r.y >= 512));
        // 切片标注附在每一行上.
        assert!(table
            .rows()
            .all(|r| r.value("diagnosis").and_then(|v| v.as_text()) == Some("sarcoma")));
    }

    #[test]
    fn test_tile_slide_multi_level() {
        let (rec, reader) = half_tissue_record();
        let tiling = TilingSection {
            levels: vec![0, 1],
            ..TilingSection::default()
        };
        let table = Tiler::new(&tiling).tile_slide(&rec, &reader).unwrap();

        // 级 0 下半 8 个; 级 1 步长 512, 2x2 网格中下排 2 个.
        assert_eq!(table.rows().filter(|r| r.level == 0).count(), 8);
        assert_eq!(table.rows().filter(|r| r.level == 1).count(), 2);
    }
}
