//! tile 表.
//!
//! 每行代表一个 (切片, 像素坐标, 分辨率级) 上的 tile, 并携带若干命名列
//! (标签列, 推理概率列等). 行内容在 tiling 步骤创建后不再拆分,
//! 概率列由推理步骤追加.

use crate::Coord2d;
use binary_heap_plus::BinaryHeap;
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 命名列的取值.
///
/// 浮点数以 [`OrderedFloat`] 包装, 因此 `Value` 可做全序比较,
/// 能直接用作分组的 map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    /// 文本值 (原始标签名等).
    Text(String),

    /// 整数值 (编码后的标签等).
    Int(i64),

    /// 浮点值 (推理概率等).
    Float(OrderedFloat<f64>),
}

impl Value {
    /// 取浮点表示. 文本值返回 `None`.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Text(_) => None,
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(v.into_inner()),
        }
    }

    /// 取整数表示. 仅 `Int` 返回 `Some`.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// 取文本表示. 仅 `Text` 返回 `Some`.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(v: f64) -> Self {
        Value::Float(OrderedFloat(v))
    }
}

/// tile 表中的一行.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TileRow {
    /// 所属切片的外部标识符.
    pub slide: String,

    /// 基准层像素横坐标.
    pub x: u32,

    /// 基准层像素纵坐标.
    pub y: u32,

    /// 分辨率级. 0 为基准层.
    pub level: u32,

    /// 命名列 (标签, 概率等).
    values: BTreeMap<String, Value>,
}

impl TileRow {
    /// 创建不带命名列的行.
    pub fn new<S: Into<String>>(slide: S, (x, y): Coord2d, level: u32) -> Self {
        Self {
            slide: slide.into(),
            x,
            y,
            level,
            values: BTreeMap::new(),
        }
    }

    /// 链式设置命名列.
    pub fn with_value<S: Into<String>, V: Into<Value>>(mut self, name: S, value: V) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// 设置 (或覆盖) 命名列.
    #[inline]
    pub fn set_value<S: Into<String>, V: Into<Value>>(&mut self, name: S, value: V) {
        self.values.insert(name.into(), value.into());
    }

    /// 获取命名列取值.
    #[inline]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// 是否存在名为 `name` 的列.
    #[inline]
    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// tile 表. 行序有意义 (逐类截断按行序取头部).
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TileTable {
    rows: Vec<TileRow>,
}

impl TileTable {
    /// 创建空表.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 行数.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 追加一行.
    #[inline]
    pub fn push(&mut self, row: TileRow) {
        self.rows.push(row);
    }

    /// 追加 `other` 的全部行.
    #[inline]
    pub fn extend(&mut self, other: TileTable) {
        self.rows.extend(other.rows);
    }

    /// 将多张表按序合并为一张.
    pub fn concat<I: IntoIterator<Item = TileTable>>(it: I) -> TileTable {
        let mut ans = TileTable::new();
        for t in it {
            ans.extend(t);
        }
        ans
    }

    /// 行迭代器.
    #[inline]
    pub fn rows(&self) -> std::slice::Iter<'_, TileRow> {
        self.rows.iter()
    }

    /// 获取第 `index` 行. 越界时 panic.
    #[inline]
    pub fn row(&self, index: usize) -> &TileRow {
        &self.rows[index]
    }

    /// 出现过的切片标识符集合, 按字典序.
    pub fn slides(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.rows.iter().map(|r| r.slide.as_str()).collect();
        set.into_iter().map(str::to_owned).collect()
    }

    /// 仅保留属于切片 `slide` 的行, 返回新表.
    pub fn only_slide(&self, slide: &str) -> TileTable {
        TileTable {
            rows: self
                .rows
                .iter()
                .filter(|r| r.slide == slide)
                .cloned()
                .collect(),
        }
    }

    /// 表中是否每一行都带有名为 `name` 的列. 空表返回 `false`.
    pub fn has_column(&self, name: &str) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|r| r.has_value(name))
    }

    /// 按 `target` 列的取值分组, 每组按行序最多保留前 `cap` 行.
    ///
    /// 组内行数不足 `cap` 时全部保留. 行间相对顺序不变.
    ///
    /// # 注意
    ///
    /// 所有行必须带有 `target` 列, 否则程序 panic.
    pub fn head_per_class(&self, target: &str, cap: usize) -> TileTable {
        let mut seen: BTreeMap<&Value, usize> = BTreeMap::new();
        let mut rows = Vec::new();
        for row in &self.rows {
            let label = row
                .value(target)
                .unwrap_or_else(|| panic!("行缺少标签列 `{target}`"));
            let count = seen.entry(label).or_insert(0);
            if *count < cap {
                *count += 1;
                rows.push(row.clone());
            }
        }
        TileTable { rows }
    }

    /// 以长度为 `self.len()` 的数组整体覆写浮点列 `name`.
    /// 数组中的 NaN 值以 0.0 落表.
    ///
    /// # 注意
    ///
    /// `values.len()` 必须等于行数, 否则程序 panic.
    pub fn set_float_column(&mut self, name: &str, values: &[f64]) {
        assert_eq!(values.len(), self.len(), "概率列长度与行数不符");
        for (row, &v) in self.rows.iter_mut().zip(values) {
            let v = if v.is_nan() { 0.0 } else { v };
            row.set_value(name, v);
        }
    }

    /// 按浮点列 `column` 降序取前 `k` 行的索引.
    ///
    /// 缺少该列或该列非数值的行被跳过. 返回的索引按取值从大到小排列.
    pub fn top_by_float(&self, column: &str, k: usize) -> Vec<usize> {
        // 小顶堆维护当前最大的 k 个.
        let mut heap = BinaryHeap::with_capacity_min(k + 1);
        for (idx, row) in self.rows.iter().enumerate() {
            let Some(v) = row.value(column).and_then(Value::as_f64) else {
                continue;
            };
            heap.push((OrderedFloat(v), idx));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut ans: Vec<(OrderedFloat<f64>, usize)> = heap.into_vec();
        ans.sort_by(|a, b| b.cmp(a));
        ans.into_iter().map(|(_, idx)| idx).collect()
    }
}

impl FromIterator<TileRow> for TileTable {
    fn from_iter<T: IntoIterator<Item = TileRow>>(iter: T) -> Self {
        TileTable {
            rows: iter.into_iter().collect(),
        }
    }
}
