//! tile 数据集.
//!
//! [`TileSet`] 是 tile 表之上的随机可索引读取视图: 对任意合法下标,
//! 按行内坐标从切片读出像素区域, 依次通过变换管线, 返回
//! (图像, 标签) 或仅图像 (推理模式). 随机访问无副作用且相互独立,
//! 唯一共享的是只读 tile 表与只读句柄仓库, 因此可安全并行预取.

use crate::stain::{StainError, StainStats};
use crate::table::{TileTable, Value};
use crate::{Coord2d, RgbTile};
use std::collections::BTreeMap;
use std::path::PathBuf;

mod reader;

pub use reader::{PlainImageReader, RegionReader, SlideOpener, SlideStore, MAX_LEVEL};

#[cfg(feature = "rayon")]
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// tile 读取错误. 任何一种对当前访问而言都是致命的:
/// 表中坐标越界通常意味着上游缓存已经损坏, 不做静默回退.
#[derive(Debug)]
pub enum TileReadError {
    /// 打开/解码切片文件失败.
    OpenSlide(PathBuf, image::ImageError),

    /// 句柄仓库中没有该切片.
    UnknownSlide(String),

    /// 区域越界.
    OutOfRange {
        /// 基准层坐标.
        coord: Coord2d,

        /// 分辨率级.
        level: u32,

        /// 请求的输出尺寸.
        size: Coord2d,
    },

    /// 分辨率级不可用.
    BadLevel(u32),

    /// 行缺少目标标签列.
    MissingLabel(String),

    /// 标签值无法映射为类别编号.
    BadLabel(String),

    /// 染色估计/归一化失败.
    Stain(StainError),
}

impl From<StainError> for TileReadError {
    #[inline]
    fn from(e: StainError) -> Self {
        TileReadError::Stain(e)
    }
}

/// 一个 (输出尺寸, 分辨率级) 对.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileDim {
    /// 输出边长 (像素).
    pub size: u32,

    /// 分辨率级.
    pub level: u32,
}

impl TileDim {
    /// 该维度在返回映射中的键, 形如 `256_0`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.size, self.level)
    }
}

/// 普通图像变换.
pub type TransformFn = Box<dyn Fn(RgbTile) -> RgbTile + Send + Sync>;

/// 需要染色统计的变换.
pub type StainTransformFn =
    Box<dyn Fn(RgbTile, &StainStats) -> Result<RgbTile, StainError> + Send + Sync>;

/// 变换管线中的一步.
///
/// 以带标签的变体区分两类步骤, 而不是对具体类型做判别:
/// [`Step::StainAdaptive`] 声明自己需要原始 tile 的染色统计,
/// 统计在管线入口处对原始像素一次性计算.
pub enum Step {
    /// 普通图像变换.
    Standard(TransformFn),

    /// 染色自适应变换. 额外接收管线入口处计算的 [`StainStats`].
    StainAdaptive(StainTransformFn),
}

impl Step {
    /// 内置的 Macenko 归一化步骤: 把 tile 映射到 `reference`.
    pub fn stain_norm(reference: crate::stain::StainReference) -> Step {
        Step::StainAdaptive(Box::new(move |tile, stats| {
            crate::stain::normalize(&tile, stats, &reference)
        }))
    }
}

/// 有序变换管线.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// 空管线 (恒等变换).
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一步.
    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// 是否存在需要染色统计的步骤.
    pub fn needs_stain_stats(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, Step::StainAdaptive(_)))
    }

    /// 对原始 tile 依次应用所有步骤.
    ///
    /// 染色统计 (若有步骤需要) 在任何步骤运行前, 对原始像素一次性计算.
    pub fn apply(&self, raw: RgbTile) -> Result<RgbTile, TileReadError> {
        let stats = if self.needs_stain_stats() {
            Some(StainStats::fit(&raw)?)
        } else {
            None
        };

        let mut cur = raw;
        for step in &self.steps {
            cur = match step {
                Step::Standard(f) => f(cur),
                // needs_stain_stats 保证统计已计算.
                Step::StainAdaptive(f) => f(cur, stats.as_ref().unwrap())?,
            };
        }
        Ok(cur)
    }
}

/// 标签映射: 把标签列取值转为类别编号. 无法映射时返回 `None`.
pub type LabelMap = Box<dyn Fn(&Value) -> Option<i64> + Send + Sync>;

/// 训练模式的标签配置.
pub struct TargetSpec {
    /// 目标标签列名.
    pub column: String,

    /// 可选的标签映射. 缺省时要求标签列已是整数编码.
    pub remap: Option<LabelMap>,
}

/// 一次随机访问的结果.
pub struct TileItem {
    /// 按 [`TileDim::key`] 组织的变换后图像.
    pub images: BTreeMap<String, RgbTile>,

    /// 类别编号. 推理模式为 `None`.
    pub label: Option<i64>,
}

/// tile 表之上的随机可索引读取视图.
pub struct TileSet<'a> {
    table: &'a TileTable,
    store: &'a SlideStore,
    dims: Vec<TileDim>,
    pipeline: Pipeline,
    target: Option<TargetSpec>,
}

impl<'a> TileSet<'a> {
    /// 创建推理模式的数据集 (只返回图像).
    ///
    /// `dims` 不能为空, 否则程序 panic.
    pub fn for_inference(
        table: &'a TileTable,
        store: &'a SlideStore,
        dims: Vec<TileDim>,
        pipeline: Pipeline,
    ) -> Self {
        assert!(!dims.is_empty(), "至少需要一个 (尺寸, 分辨率级) 对");
        Self {
            table,
            store,
            dims,
            pipeline,
            target: None,
        }
    }

    /// 创建训练模式的数据集 (返回图像与标签).
    ///
    /// `dims` 不能为空, 否则程序 panic.
    pub fn for_training(
        table: &'a TileTable,
        store: &'a SlideStore,
        dims: Vec<TileDim>,
        pipeline: Pipeline,
        target: TargetSpec,
    ) -> Self {
        assert!(!dims.is_empty(), "至少需要一个 (尺寸, 分辨率级) 对");
        Self {
            table,
            store,
            dims,
            pipeline,
            target: Some(target),
        }
    }

    /// tile 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// 随机访问第 `index` 个 tile.
    ///
    /// 读取该行坐标处所有配置维度的图像并通过管线, 训练模式下解析标签.
    /// `index` 越界时程序 panic; 读取失败返回错误.
    pub fn get(&self, index: usize) -> Result<TileItem, TileReadError> {
        let row = self.table.row(index);
        let reader = self.store.reader(&row.slide)?;

        let mut images = BTreeMap::new();
        for dim in &self.dims {
            let raw = reader.read_region((row.x, row.y), dim.level, (dim.size, dim.size))?;
            images.insert(dim.key(), self.pipeline.apply(raw)?);
        }

        let label = match &self.target {
            None => None,
            Some(spec) => {
                let v = row
                    .value(&spec.column)
                    .ok_or_else(|| TileReadError::MissingLabel(spec.column.clone()))?;
                let encoded = match &spec.remap {
                    Some(f) => f(v),
                    None => v.as_int(),
                };
                Some(encoded.ok_or_else(|| TileReadError::BadLabel(format!("{v:?}")))?)
            }
        };

        Ok(TileItem { images, label })
    }

    /// 顺序读取 `[start, end)` 范围的 tile.
    pub fn get_range(&self, start: usize, end: usize) -> Result<Vec<TileItem>, TileReadError> {
        (start..end).map(|i| self.get(i)).collect()
    }

    /// 按批迭代整个数据集.
    ///
    /// `batch_size` 不能为 0, 否则程序 panic.
    pub fn batches(&self, batch_size: usize) -> Batches<'_, 'a> {
        assert_ne!(batch_size, 0);
        Batches {
            set: self,
            batch_size,
            next: 0,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        /// 并行访问接口.
        impl TileSet<'_> {
            /// 借助 `rayon` 并行读取 `[start, end)` 范围的 tile.
            ///
            /// 访问相互独立, worker 仅共享只读状态.
            pub fn par_range(&self, start: usize, end: usize) -> Result<Vec<TileItem>, TileReadError> {
                (start..end).into_par_iter().map(|i| self.get(i)).collect()
            }
        }
    }
}

/// [`TileSet`] 的批迭代器. 每项是一个批的读取结果.
pub struct Batches<'s, 'a> {
    set: &'s TileSet<'a>,
    batch_size: usize,
    next: usize,
}

impl Iterator for Batches<'_, '_> {
    type Item = Result<Vec<TileItem>, TileReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.set.len() {
            return None;
        }
        let start = self.next;
        let end = (start + self.batch_size).min(self.set.len());
        self.next = end;
        Some(self.set.get_range(start, end))
    }
}

impl ExactSizeIterator for Batches<'_, '_> {
    #[inline]
    fn len(&self) -> usize {
        let remain = self.set.len() - self.next;
        remain.div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TileRow;
    use ndarray::Array3;
    use std::collections::BTreeMap as Map;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// 由切片标识符决定底色的合成读取器.
    fn synthetic_store() -> SlideStore {
        let paths: Map<String, PathBuf> = [
            ("X001".to_owned(), PathBuf::from("/nonexistent/X001.svs")),
            ("X002".to_owned(), PathBuf::from("/nonexistent/X002.svs")),
        ]
        .into_iter()
        .collect();

        SlideStore::with_opener(
            paths,
            Box::new(|path| {
                let shade = if path.to_string_lossy().contains("X001") {
                    60
                } else {
                    180
                };
                let mut data = Array3::zeros((1024, 1024, 3));
                data.fill(shade);
                Ok(Arc::new(PlainImageReader::from_array(data)) as Arc<dyn RegionReader>)
            }),
        )
    }

    fn table() -> TileTable {
        [
            ("X001", (0u32, 0u32), "tumour"),
            ("X001", (256, 0), "tumour"),
            ("X002", (0, 256), "fat"),
        ]
        .into_iter()
        .map(|(s, c, l)| TileRow::new(s, c, 0).with_value("tumour_label", l))
        .collect()
    }

    fn dims() -> Vec<TileDim> {
        vec![
            TileDim { size: 256, level: 0 },
            TileDim { size: 128, level: 1 },
        ]
    }

    #[test]
    fn test_inference_mode_multi_dim() {
        let store = synthetic_store();
        let t = table();
        let set = TileSet::for_inference(&t, &store, dims(), Pipeline::new());
        assert_eq!(set.len(), 3);

        let item = set.get(0).unwrap();
        assert!(item.label.is_none());
        assert_eq!(item.images.len(), 2);
        assert_eq!(item.images["256_0"].dim(), (256, 256, 3));
        assert_eq!(item.images["128_1"].dim(), (128, 128, 3));
        assert_eq!(item.images["256_0"][(0, 0, 0)], 60);

        // 不同切片取到不同句柄.
        let other = set.get(2).unwrap();
        assert_eq!(other.images["256_0"][(0, 0, 0)], 180);
    }

    #[test]
    fn test_training_mode_with_remap() {
        let store = synthetic_store();
        let t = table();
        let target = TargetSpec {
            column: "tumour_label".to_owned(),
            remap: Some(Box::new(|v: &Value| match v.as_text()? {
                "tumour" => Some(1),
                "fat" => Some(0),
                _ => None,
            })),
        };
        let set = TileSet::for_training(&t, &store, dims(), Pipeline::new(), target);

        assert_eq!(set.get(0).unwrap().label, Some(1));
        assert_eq!(set.get(2).unwrap().label, Some(0));
    }

    #[test]
    fn test_training_mode_unencoded_text_label_fails() {
        let store = synthetic_store();
        let t = table();
        let target = TargetSpec {
            column: "tumour_label".to_owned(),
            remap: None,
        };
        let set = TileSet::for_training(&t, &store, dims(), Pipeline::new(), target);
        assert!(matches!(set.get(0), Err(TileReadError::BadLabel(_))));
    }

    #[test]
    fn test_standard_transform_applies_in_order() {
        let store = synthetic_store();
        let t = table();
        let mut pipeline = Pipeline::new();
        pipeline
            .push(Step::Standard(Box::new(|mut t| {
                t.mapv_inplace(|v| v / 2);
                t
            })))
            .push(Step::Standard(Box::new(|mut t| {
                t.mapv_inplace(|v| v + 10);
                t
            })));
        let set = TileSet::for_inference(&t, &store, dims(), pipeline);
        // 60 / 2 + 10 = 40.
        assert_eq!(set.get(0).unwrap().images["256_0"][(0, 0, 0)], 40);
    }

    #[test]
    fn test_out_of_range_row_is_fatal() {
        let store = synthetic_store();
        let t: TileTable =
            [TileRow::new("X001", (1020, 1020), 0).with_value("tumour_label", "tumour")]
                .into_iter()
                .collect();
        let set = TileSet::for_inference(&t, &store, dims(), Pipeline::new());
        assert!(matches!(
            set.get(0),
            Err(TileReadError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_batches() {
        let store = synthetic_store();
        let t = table();
        let set = TileSet::for_inference(&t, &store, dims(), Pipeline::new());
        let mut it = set.batches(2);
        assert_eq!(it.len(), 2);
        assert_eq!(it.next().unwrap().unwrap().len(), 2);
        assert_eq!(it.next().unwrap().unwrap().len(), 1);
        assert!(it.next().is_none());
    }

    /// 多线程并发随机访问: 访问之间无共享可变状态.
    #[test]
    fn test_concurrent_access_is_independent() {
        use std::sync::mpsc;

        let store = synthetic_store();
        let t = table();
        let set = TileSet::for_inference(&t, &store, dims(), Pipeline::new());

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..num_cpus::get().min(8) {
                let tx = tx.clone();
                let set = &set;
                s.spawn(move || {
                    for i in 0..set.len() {
                        tx.send(set.get(i).is_ok()).unwrap();
                    }
                });
            }
            drop(tx);
            assert!(rx.iter().all(|ok| ok));
        });
    }
}
