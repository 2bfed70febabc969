//! 切片目录.
//!
//! 按 (key, value) 条件集的笛卡尔积查询元数据源, 解析出 [`SlideRecord`] 目录;
//! 并依照记录中的期望字节数对本地切片文件做同步校验.
//! 元数据源与文件拉取均为外部协作者, 以 trait 接入.

use itertools::Itertools;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::{CACHE_EXT, PATCHES_SUBDIR, SLIDE_EXT};

/// 切片存储目录布局.
///
/// 切片文件位于 `<dir>/<id>.svs`, 缓存单元位于 `<dir>/patches/<id>.bin`,
/// 组织掩膜归档位于 `<dir>/masks.npz`.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    dir: PathBuf,
}

impl StoreLayout {
    /// 以 `dir` 为切片存储目录创建布局.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    /// 存储目录.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 外部标识符为 `id` 的切片文件路径.
    pub fn slide_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SLIDE_EXT}"))
    }

    /// 外部标识符为 `id` 的缓存单元路径.
    pub fn cache_path(&self, id: &str) -> PathBuf {
        let mut p = self.patches_dir();
        p.push(format!("{id}.{CACHE_EXT}"));
        p
    }

    /// 缓存单元所在子目录.
    pub fn patches_dir(&self) -> PathBuf {
        self.dir.join(PATCHES_SUBDIR)
    }

    /// 组织掩膜归档路径.
    pub fn mask_archive_path(&self) -> PathBuf {
        self.dir.join("masks.npz")
    }
}

/// 一张切片的目录记录.
///
/// 记录由目录解析整体创建, 不做原地修改; 重新查询时成套替换.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SlideRecord {
    /// 外部标识符 (文件名去扩展名).
    pub external_id: String,

    /// 服务器内部标识符.
    pub remote_id: i64,

    /// 期望的切片文件字节数.
    pub size: u64,

    /// 本地切片文件路径.
    pub slide_path: PathBuf,

    /// 本地缓存单元路径.
    pub cache_path: PathBuf,

    /// 服务器侧的键值标注.
    pub annotations: BTreeMap<String, String>,
}

/// 选片条件: 键 -> 候选值列表.
///
/// 匹配按候选值列表的笛卡尔积展开: 任一组合的全部 (key, value)
/// 对都出现在标注中时, 记录即被选中. 空条件匹配一切.
#[derive(Clone, Debug, Default)]
pub struct Criteria {
    entries: Vec<(String, Vec<String>)>,
}

impl Criteria {
    /// 创建空条件.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个键及其候选值列表.
    pub fn push<S: Into<String>, I: IntoIterator<Item = S>>(&mut self, key: S, values: I) {
        self.entries
            .push((key.into(), values.into_iter().map(Into::into).collect()));
    }

    /// 标注 `ann` 是否满足该条件.
    pub fn matches(&self, ann: &BTreeMap<String, String>) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries
            .iter()
            .map(|(_, values)| values.iter())
            .multi_cartesian_product()
            .any(|combo| {
                self.entries
                    .iter()
                    .zip(&combo)
                    .all(|((key, _), value)| ann.get(key) == Some(value))
            })
    }
}

impl From<&BTreeMap<String, Vec<String>>> for Criteria {
    fn from(m: &BTreeMap<String, Vec<String>>) -> Self {
        let mut ans = Criteria::new();
        for (k, v) in m {
            ans.push(k.clone(), v.iter().cloned());
        }
        ans
    }
}

/// 元数据源返回的一行.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexRow {
    /// 服务器内部标识符.
    pub remote_id: i64,

    /// 原始文件名 (含扩展名).
    pub name: String,

    /// 文件字节数.
    pub size: u64,

    /// 键值标注.
    #[cfg_attr(feature = "serde", serde(default))]
    pub annotations: BTreeMap<String, String>,
}

/// 查询元数据源错误.
#[derive(Debug)]
pub enum IndexError {
    /// 底层 I/O 错误.
    Io(io::Error),

    /// 索引内容解析错误.
    #[cfg(feature = "serde")]
    Parse(serde_json::Error),
}

/// 切片元数据源. 外部协作者.
pub trait SlideIndex {
    /// 返回满足 `criteria` 的全部元数据行.
    fn query(&self, criteria: &Criteria) -> Result<Vec<IndexRow>, IndexError>;
}

/// 本地 JSON 文件充当的元数据源.
///
/// 文件内容为 [`IndexRow`] 的 JSON 数组, 通常由服务器侧导出.
#[cfg(feature = "serde")]
#[derive(Clone, Debug)]
pub struct JsonIndex {
    rows: Vec<IndexRow>,
}

#[cfg(feature = "serde")]
impl JsonIndex {
    /// 从 JSON 文件加载索引.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let text = fs::read_to_string(path.as_ref()).map_err(IndexError::Io)?;
        let rows: Vec<IndexRow> = serde_json::from_str(&text).map_err(IndexError::Parse)?;
        Ok(Self { rows })
    }

    /// 直接从内存行构造索引.
    pub fn from_rows(rows: Vec<IndexRow>) -> Self {
        Self { rows }
    }
}

#[cfg(feature = "serde")]
impl SlideIndex for JsonIndex {
    fn query(&self, criteria: &Criteria) -> Result<Vec<IndexRow>, IndexError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| criteria.matches(&r.annotations))
            .cloned()
            .collect())
    }
}

/// 查询元数据源并构建切片目录.
///
/// 同一外部标识符出现多次时只保留首个. 返回的记录按外部标识符字典序排列.
pub fn resolve(
    index: &dyn SlideIndex,
    criteria: &Criteria,
    layout: &StoreLayout,
) -> Result<Vec<SlideRecord>, IndexError> {
    let rows = index.query(criteria)?;
    let mut by_id: BTreeMap<String, SlideRecord> = BTreeMap::new();
    for row in rows {
        let external_id = Path::new(&row.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| row.name.clone());
        by_id.entry(external_id.clone()).or_insert(SlideRecord {
            slide_path: layout.slide_path(&external_id),
            cache_path: layout.cache_path(&external_id),
            external_id,
            remote_id: row.remote_id,
            size: row.size,
            annotations: row.annotations,
        });
    }
    Ok(by_id.into_values().collect())
}

/// 同步计划中对一张切片的处置.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// 本地文件存在且字节数一致, 不动.
    Keep,

    /// 本地文件缺失, 需要拉取.
    FetchMissing,

    /// 本地文件字节数与期望不符 (疑似损坏), 需要删除后重新拉取.
    Refetch {
        /// 实际字节数.
        actual: u64,
    },
}

/// 计算同步计划. 与 `records` 一一对应.
///
/// 除 "文件不存在" 外的底层 I/O 错误视为致命, 直接返回.
pub fn plan_sync(records: &[SlideRecord]) -> io::Result<Vec<SyncAction>> {
    let mut ans = Vec::with_capacity(records.len());
    for rec in records {
        match fs::metadata(&rec.slide_path) {
            Ok(meta) if meta.len() == rec.size => ans.push(SyncAction::Keep),
            Ok(meta) => ans.push(SyncAction::Refetch { actual: meta.len() }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => ans.push(SyncAction::FetchMissing),
            Err(e) => return Err(e),
        }
    }
    Ok(ans)
}

/// 拉取外部文件错误.
#[derive(Debug)]
pub enum FetchError {
    /// 远端错误 (连接, 鉴权, 对象不存在等).
    Remote(String),

    /// 本地 I/O 错误.
    Io(io::Error),
}

/// 切片/掩膜文件拉取器. 外部协作者, 不在本 crate 内实现网络传输.
pub trait SlideFetcher {
    /// 将 `record` 对应的切片文件拉取到 `record.slide_path`.
    fn fetch_slide(&self, record: &SlideRecord) -> Result<(), FetchError>;

    /// 将组织掩膜归档拉取到 `layout.mask_archive_path()`.
    fn fetch_masks(&self, layout: &StoreLayout) -> Result<(), FetchError>;
}

/// 同步结果统计.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 本地已是最新的切片数.
    pub kept: usize,

    /// 因缺失而拉取的切片数.
    pub fetched: usize,

    /// 因字节数不符而重新拉取的切片数.
    pub refetched: usize,
}

/// 同步错误. 同步过程中的任何失败都是致命的, 不做自动重试.
#[derive(Debug)]
pub enum SyncError {
    /// 本地 I/O 错误.
    Io(io::Error),

    /// 拉取错误.
    Fetch(FetchError),
}

/// 按同步计划逐张执行, 返回统计.
///
/// 字节数不符的文件先删除再拉取. 任一失败立即终止并返回错误.
pub fn synchronize(records: &[SlideRecord], fetcher: &dyn SlideFetcher) -> Result<SyncReport, SyncError> {
    let plan = plan_sync(records).map_err(SyncError::Io)?;
    let mut report = SyncReport::default();
    for (rec, action) in records.iter().zip(&plan) {
        match action {
            SyncAction::Keep => report.kept += 1,
            SyncAction::FetchMissing => {
                fetcher.fetch_slide(rec).map_err(SyncError::Fetch)?;
                report.fetched += 1;
            }
            SyncAction::Refetch { .. } => {
                fs::remove_file(&rec.slide_path).map_err(SyncError::Io)?;
                fetcher.fetch_slide(rec).map_err(SyncError::Fetch)?;
                report.refetched += 1;
            }
        }
    }
    Ok(report)
}

/// 掩膜归档缺失时通过 `fetcher` 拉取. 返回是否实际发生了拉取.
///
/// 会按需创建 `patches` 子目录, 以便后续缓存写入.
pub fn ensure_masks(layout: &StoreLayout, fetcher: &dyn SlideFetcher) -> Result<bool, SyncError> {
    fs::create_dir_all(layout.patches_dir()).map_err(SyncError::Io)?;
    if layout.mask_archive_path().exists() {
        return Ok(false);
    }
    fetcher.fetch_masks(layout).map_err(SyncError::Fetch)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn test_criteria_product() {
        let mut c = Criteria::new();
        c.push("diagnosis", ["sarcoma", "lipoma"]);
        c.push("stain", ["H&E"]);

        // (sarcoma, H&E) 与 (lipoma, H&E) 两个组合, 任一命中即可.
        assert!(c.matches(&ann(&[("diagnosis", "sarcoma"), ("stain", "H&E")])));
        assert!(c.matches(&ann(&[
            ("diagnosis", "lipoma"),
            ("stain", "H&E"),
            ("scanner", "GT450")
        ])));
        assert!(!c.matches(&ann(&[("diagnosis", "sarcoma"), ("stain", "IHC")])));
        assert!(!c.matches(&ann(&[("diagnosis", "sarcoma")])));

        // 空条件匹配一切.
        assert!(Criteria::new().matches(&ann(&[])));
    }

    #[test]
    fn test_store_layout_paths() {
        let layout = StoreLayout::new("/data/slides");
        assert_eq!(
            layout.slide_path("X009"),
            PathBuf::from("/data/slides/X009.svs")
        );
        assert_eq!(
            layout.cache_path("X009"),
            PathBuf::from("/data/slides/patches/X009.bin")
        );
        assert_eq!(
            layout.mask_archive_path(),
            PathBuf::from("/data/slides/masks.npz")
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_resolve_dedup_and_paths() {
        let rows = vec![
            IndexRow {
                remote_id: 7,
                name: "X001.svs".to_owned(),
                size: 1024,
                annotations: ann(&[("diagnosis", "sarcoma")]),
            },
            IndexRow {
                remote_id: 7,
                name: "X001.svs".to_owned(),
                size: 1024,
                annotations: ann(&[("diagnosis", "sarcoma")]),
            },
            IndexRow {
                remote_id: 8,
                name: "X002.svs".to_owned(),
                size: 2048,
                annotations: ann(&[("diagnosis", "lipoma")]),
            },
        ];
        let index = JsonIndex::from_rows(rows);
        let layout = StoreLayout::new("/data/slides");

        let mut c = Criteria::new();
        c.push("diagnosis", ["sarcoma"]);
        let records = resolve(&index, &c, &layout).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "X001");
        assert_eq!(records[0].slide_path, layout.slide_path("X001"));
        assert_eq!(records[0].cache_path, layout.cache_path("X001"));

        let all = resolve(&index, &Criteria::new(), &layout).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_plan_sync_missing() {
        let layout = StoreLayout::new(std::env::temp_dir().join("wsi-berry-nonexistent"));
        let rec = SlideRecord {
            external_id: "X009".to_owned(),
            remote_id: 1,
            size: 100,
            slide_path: layout.slide_path("X009"),
            cache_path: layout.cache_path("X009"),
            annotations: BTreeMap::new(),
        };
        let plan = plan_sync(std::slice::from_ref(&rec)).unwrap();
        assert_eq!(plan, vec![SyncAction::FetchMissing]);
    }
}
