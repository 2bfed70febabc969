//! 切片区域读取.
//!
//! [`RegionReader`] 是切片文件格式的接缝: 给定基准层坐标、分辨率级与输出尺寸,
//! 返回三通道 RGB 像素块. 金字塔格式的读取器可从外部接入;
//! 本模块内置 [`PlainImageReader`], 把普通位图当作单文件切片使用
//! (分辨率级按 2 的幂次降采样).

use crate::consts::RGB_CHANNELS;
use crate::{Coord2d, RgbTile};
use ndarray::Array3;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::TileReadError;

/// 支持的最大分辨率级. `1 << level` 不能溢出 u32.
pub const MAX_LEVEL: u32 = 15;

/// 切片区域读取器. 实现必须是只读且线程安全的,
/// 同一读取器可被多个 worker 并发使用.
pub trait RegionReader: Send + Sync {
    /// 基准层尺寸 (width, height).
    fn dimensions(&self) -> Coord2d;

    /// 读取像素区域.
    ///
    /// `coord` 是基准层坐标, `size` 是输出尺寸 (width, height),
    /// 以级 `level` 的像素为单位. 区域越界或级不可用时返回错误,
    /// 不做静默回退.
    fn read_region(
        &self,
        coord: Coord2d,
        level: u32,
        size: Coord2d,
    ) -> Result<RgbTile, TileReadError>;
}

/// 普通位图充当的切片读取器.
///
/// 打开时整体解码进内存, 之后的区域读取只做切取与块平均降采样.
pub struct PlainImageReader {
    data: Array3<u8>,
    dims: Coord2d,
}

impl PlainImageReader {
    /// 打开并整体解码位图文件.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TileReadError> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| TileReadError::OpenSlide(path.to_owned(), e))?
            .to_rgb8();
        let (w, h) = img.dimensions();
        // RgbImage 的底层缓冲是 (h, w, 3) 标准布局, reshape 不会失败.
        let data = Array3::from_shape_vec((h as usize, w as usize, RGB_CHANNELS), img.into_raw())
            .unwrap();
        Ok(Self { data, dims: (w, h) })
    }

    /// 直接以内存中的像素缓冲构造读取器.
    pub fn from_array(data: Array3<u8>) -> Self {
        let (h, w, c) = data.dim();
        assert_eq!(c, RGB_CHANNELS, "必须是三通道缓冲");
        Self {
            data,
            dims: (w as u32, h as u32),
        }
    }
}

impl RegionReader for PlainImageReader {
    #[inline]
    fn dimensions(&self) -> Coord2d {
        self.dims
    }

    fn read_region(
        &self,
        (x, y): Coord2d,
        level: u32,
        (out_w, out_h): Coord2d,
    ) -> Result<RgbTile, TileReadError> {
        if level > MAX_LEVEL {
            return Err(TileReadError::BadLevel(level));
        }
        let ds = 1u32 << level;
        let (full_w, full_h) = self.dims;
        let end_x = x as u64 + out_w as u64 * ds as u64;
        let end_y = y as u64 + out_h as u64 * ds as u64;
        if end_x > full_w as u64 || end_y > full_h as u64 {
            return Err(TileReadError::OutOfRange {
                coord: (x, y),
                level,
                size: (out_w, out_h),
            });
        }

        let mut ans = RgbTile::zeros((out_h as usize, out_w as usize, RGB_CHANNELS));
        let block = (ds * ds) as u32;
        for oy in 0..out_h as usize {
            for ox in 0..out_w as usize {
                for c in 0..RGB_CHANNELS {
                    // ds x ds 块平均.
                    let mut acc = 0u32;
                    for by in 0..ds as usize {
                        for bx in 0..ds as usize {
                            let sy = y as usize + oy * ds as usize + by;
                            let sx = x as usize + ox * ds as usize + bx;
                            acc += self.data[(sy, sx, c)] as u32;
                        }
                    }
                    ans[(oy, ox, c)] = (acc / block) as u8;
                }
            }
        }
        Ok(ans)
    }
}

/// 读取器构造回调: 从切片文件路径打开一个 [`RegionReader`].
pub type SlideOpener =
    Box<dyn Fn(&Path) -> Result<Arc<dyn RegionReader>, TileReadError> + Send + Sync>;

/// 切片句柄仓库.
///
/// 按外部标识符缓存已打开的读取器; 首次访问时经 opener 打开.
/// 仓库自身只在句柄表插入时短暂加锁, 读取器是只读共享的,
/// 因此随机访问之间相互独立.
pub struct SlideStore {
    paths: BTreeMap<String, PathBuf>,
    open: Mutex<BTreeMap<String, Arc<dyn RegionReader>>>,
    opener: SlideOpener,
}

impl SlideStore {
    /// 以 (外部标识符 -> 切片路径) 映射和默认的位图读取器创建仓库.
    pub fn new(paths: BTreeMap<String, PathBuf>) -> Self {
        Self::with_opener(
            paths,
            Box::new(|p| Ok(Arc::new(PlainImageReader::open(p)?) as Arc<dyn RegionReader>)),
        )
    }

    /// 以显式 opener 创建仓库. 用于接入金字塔格式或测试替身.
    pub fn with_opener(paths: BTreeMap<String, PathBuf>, opener: SlideOpener) -> Self {
        Self {
            paths,
            open: Mutex::new(BTreeMap::new()),
            opener,
        }
    }

    /// 从切片目录记录构建仓库.
    pub fn from_records(records: &[crate::catalog::SlideRecord]) -> Self {
        Self::new(
            records
                .iter()
                .map(|r| (r.external_id.clone(), r.slide_path.clone()))
                .collect(),
        )
    }

    /// 获取 (或打开并缓存) `slide` 的读取器.
    pub fn reader(&self, slide: &str) -> Result<Arc<dyn RegionReader>, TileReadError> {
        if let Some(r) = self.open.lock().unwrap().get(slide) {
            return Ok(Arc::clone(r));
        }
        let path = self
            .paths
            .get(slide)
            .ok_or_else(|| TileReadError::UnknownSlide(slide.to_owned()))?;
        let reader = (self.opener)(path)?;
        let mut open = self.open.lock().unwrap();
        // 并发首开时后到者复用先到者的句柄.
        Ok(Arc::clone(
            open.entry(slide.to_owned()).or_insert(reader),
        ))
    }

    /// 已登记的切片个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// 仓库是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8x8 渐变图: 像素 (y, x) 的 R=G=B=y*8+x.
    fn gradient() -> PlainImageReader {
        let mut data = Array3::zeros((8, 8, 3));
        for y in 0..8 {
            for x in 0..8 {
                for c in 0..3 {
                    data[(y, x, c)] = (y * 8 + x) as u8;
                }
            }
        }
        PlainImageReader::from_array(data)
    }

    #[test]
    fn test_read_region_level0() {
        let r = gradient();
        assert_eq!(r.dimensions(), (8, 8));
        let t = r.read_region((2, 1), 0, (2, 2)).unwrap();
        assert_eq!(t.dim(), (2, 2, 3));
        assert_eq!(t[(0, 0, 0)], 8 + 2);
        assert_eq!(t[(1, 1, 1)], 2 * 8 + 3);
    }

    #[test]
    fn test_read_region_downsample() {
        let r = gradient();
        let t = r.read_region((0, 0), 1, (2, 2)).unwrap();
        assert_eq!(t.dim(), (2, 2, 3));
        // 2x2 块平均: (0 + 1 + 8 + 9) / 4 = 4.
        assert_eq!(t[(0, 0, 0)], 4);
        assert_eq!(t[(0, 1, 0)], 6);
    }

    #[test]
    fn test_read_region_out_of_range_is_fatal() {
        let r = gradient();
        assert!(matches!(
            r.read_region((7, 7), 0, (2, 2)),
            Err(TileReadError::OutOfRange { .. })
        ));
        assert!(matches!(
            r.read_region((0, 0), 2, (4, 4)),
            Err(TileReadError::OutOfRange { .. })
        ));
        assert!(matches!(
            r.read_region((0, 0), 99, (1, 1)),
            Err(TileReadError::BadLevel(99))
        ));
    }

    #[test]
    fn test_store_unknown_slide() {
        let store = SlideStore::new(BTreeMap::new());
        assert!(matches!(
            store.reader("X404"),
            Err(TileReadError::UnknownSlide(_))
        ));
    }
}
