//! 组织掩膜归档.
//!
//! 标注导出以 npz 归档的形式存放 (`<store>/masks.npz`), 每张切片一个条目,
//! 内容是该切片的低分辨率组织掩膜 (取值见 [`crate::consts::mask_gray`]).
//! 归档按 worker 通道打开多次, 各通道排他使用, 以支持并行读取.

use crate::consts::mask_gray;
use crate::{Coord2d, Idx2d};
use ndarray::{Array2, Ix2, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 打开 [`MaskArchive`] 错误.
#[derive(Debug)]
pub enum OpenArchiveError {
    /// workers 太大. 最多支持 64.
    TooManyWorkers(u32),

    /// 打开 npz 文件错误.
    ReadNpzError(ReadNpzError),

    /// 其他底层 I/O 错误.
    IoError(std::io::Error),
}

/// 组织掩膜 npz 归档.
///
/// 该结构建模硬盘上已存储的多张切片组织掩膜的压缩文件.
pub struct MaskArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
}

impl MaskArchive {
    /// 初始化.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    pub fn new<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, OpenArchiveError> {
        let workers = workers.get();
        if workers > 64 {
            return Err(OpenArchiveError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(p.as_ref())
                .map_err(OpenArchiveError::IoError)?;
            v.push(Mutex::new(
                NpzReader::new(file).map_err(OpenArchiveError::ReadNpzError)?,
            ));
        }
        Ok(Self {
            entries: v,
            turn: AtomicUsize::new(0),
        })
    }

    /// 通过切片外部标识符获取其组织掩膜. 条目名形如 `{id}.npy`.
    pub fn mask_by_slide(&self, id: &str) -> Result<Array2<u8>, ReadNpzError> {
        let slot = self.next_slot();
        let entry = format!("{id}.npy");
        let mut file = self.entries[slot].lock().unwrap();
        file.by_name::<OwnedRepr<u8>, Ix2>(entry.as_str())
    }

    /// 获取底层 npz 文件包含的所有条目名.
    pub fn mask_names(&self) -> Result<Vec<String>, ReadNpzError> {
        let slot = self.next_slot();
        self.entries[slot].lock().unwrap().names()
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 获取底层 npz 文件的掩膜条目个数.
    pub fn mask_len(&self) -> usize {
        let slot = self.next_slot();
        self.entries[slot].lock().unwrap().len()
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }
}

/// 将基准层像素坐标映射为掩膜索引.
///
/// 掩膜覆盖整张切片, 分辨率可远低于基准层; 映射按两轴独立缩放.
/// 坐标超出切片范围时收敛到掩膜边缘.
pub fn mask_index((x, y): Coord2d, (slide_w, slide_h): Coord2d, mask_shape: Idx2d) -> Idx2d {
    let (mh, mw) = mask_shape;
    let scale = |v: u32, full: u32, m: usize| -> usize {
        if full == 0 || m == 0 {
            return 0;
        }
        let idx = (v as u64 * m as u64 / full as u64) as usize;
        idx.min(m - 1)
    };
    (scale(y, slide_h, mh), scale(x, slide_w, mw))
}

/// 统计掩膜矩形区域内组织像素的占比.
///
/// 矩形以基准层像素坐标给出, 内部映射到掩膜索引. 空交集时返回 0.
pub fn tissue_fraction(
    mask: &Array2<u8>,
    origin: Coord2d,
    tile_size: u32,
    slide_dims: Coord2d,
) -> f64 {
    let (h0, w0) = mask_index(origin, slide_dims, mask.dim());
    let (h1, w1) = mask_index(
        (origin.0 + tile_size, origin.1 + tile_size),
        slide_dims,
        mask.dim(),
    );
    // 区域至少覆盖一个掩膜像素.
    let (h1, w1) = (h1.max(h0 + 1).min(mask.dim().0), w1.max(w0 + 1).min(mask.dim().1));

    let mut tissue = 0usize;
    let mut total = 0usize;
    for h in h0..h1 {
        for w in w0..w1 {
            total += 1;
            if mask_gray::is_tissue(mask[(h, w)]) {
                tissue += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        tissue as f64 / total as f64
    }
}
