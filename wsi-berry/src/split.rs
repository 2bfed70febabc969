//! 数据集划分.
//!
//! 测试集按切片分组整体切出 (同一切片的 tile 不跨越测试集边界),
//! 随后对剩余部分做逐类截断与 tile 级分层随机划分.
//!
//! # 注意
//!
//! train 与 validation 之间的划分发生在 tile 级, **不保持切片分组**:
//! 同一切片的 tile 可以同时出现在 train 与 validation 中.
//! 这与上游管线的既有行为一致, 调用方必须自行知晓
//! validation 相对 train 并非切片无关.

use crate::table::{TileTable, Value};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};

/// 划分参数.
#[derive(Clone, Debug)]
pub struct SplitSpec {
    /// 目标标签列名. 分层依据.
    pub target: String,

    /// 训练集在 (train + validation) 中的占比. 必须在 (0, 1) 内.
    pub train_size: f64,

    /// 测试集按切片分组切出的占比. 必须在 (0, 1) 内.
    pub test_size: f64,

    /// 每类最多保留的 tile 数, 两侧独立生效. `None` 不截断.
    pub per_class_cap: Option<usize>,

    /// 随机种子. 相同输入与种子给出相同划分.
    pub seed: u64,
}

/// 划分结果.
///
/// test 与 train/validation 在行和切片两个层面都不相交;
/// train 与 validation 之间可能共享切片 (见模块文档).
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    /// 训练集.
    pub train: TileTable,

    /// 验证集.
    pub val: TileTable,

    /// 测试集.
    pub test: TileTable,
}

/// 划分错误. 任何一种都立即失败, 不返回部分结果.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitError {
    /// 工作表为空.
    EmptyTable,

    /// 存在缺少目标标签列的行.
    MissingLabelColumn(String),

    /// train_size 不在 (0, 1) 内.
    BadTrainSize(f64),

    /// test_size 不在 (0, 1) 内.
    BadTestSize(f64),

    /// 测试集切出后不再有剩余切片可供训练.
    NotEnoughSlides {
        /// 切片总数.
        total: usize,

        /// 被测试集占用的切片数.
        test: usize,
    },

    /// 某一类在截断后没有任何 tile, 分层无法进行.
    EmptyClass(String),
}

/// 标签值的展示形式. 仅用于错误信息.
fn label_repr(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
    }
}

/// 按切片分组的随机划分: 返回划入测试集的切片集合.
fn test_slides(slides: &[String], test_size: f64, rng: &mut ChaCha8Rng) -> BTreeSet<String> {
    let mut shuffled: Vec<&String> = slides.iter().collect();
    shuffled.shuffle(rng);
    // 向上取整, 保证 test_size > 0 时测试集至少有一张切片.
    let n_test = (test_size * slides.len() as f64).ceil() as usize;
    shuffled.into_iter().take(n_test).cloned().collect()
}

/// tile 级分层随机划分: 每类独立打乱后按 `train_size` 取头部进训练集.
fn stratified(
    table: TileTable,
    target: &str,
    train_size: f64,
    rng: &mut ChaCha8Rng,
) -> (TileTable, TileTable) {
    let mut by_class: BTreeMap<&Value, Vec<usize>> = BTreeMap::new();
    for (idx, row) in table.rows().enumerate() {
        // 调用方已整体校验过标签列.
        by_class.entry(row.value(target).unwrap()).or_default().push(idx);
    }

    let mut train_idx = Vec::new();
    let mut val_idx = Vec::new();
    for (_, mut indices) in by_class {
        indices.shuffle(rng);
        let n_train = (train_size * indices.len() as f64).round() as usize;
        let n_train = n_train.min(indices.len());
        val_idx.extend(indices.split_off(n_train));
        train_idx.extend(indices);
    }

    let pick = |idx: &[usize]| -> TileTable { idx.iter().map(|&i| table.row(i).clone()).collect() };
    (pick(&train_idx), pick(&val_idx))
}

/// 划分工作表.
///
/// 1. 按切片分组随机切出测试集 (没有切片同时出现在两侧);
/// 2. 两侧独立做逐类截断 (按行序取头部, 不是随机抽样);
/// 3. 剩余部分按标签列做 tile 级分层随机划分得到 train/validation.
pub fn partition(table: &TileTable, spec: &SplitSpec) -> Result<Partition, SplitError> {
    if table.is_empty() {
        return Err(SplitError::EmptyTable);
    }
    if !table.has_column(&spec.target) {
        return Err(SplitError::MissingLabelColumn(spec.target.clone()));
    }
    if !(0.0 < spec.train_size && spec.train_size < 1.0) {
        return Err(SplitError::BadTrainSize(spec.train_size));
    }
    if !(0.0 < spec.test_size && spec.test_size < 1.0) {
        return Err(SplitError::BadTestSize(spec.test_size));
    }

    let slides = table.slides();
    let mut group_rng = ChaCha8Rng::seed_from_u64(spec.seed);
    let test_set = test_slides(&slides, spec.test_size, &mut group_rng);
    if test_set.len() == slides.len() {
        return Err(SplitError::NotEnoughSlides {
            total: slides.len(),
            test: test_set.len(),
        });
    }

    let mut test = TileTable::new();
    let mut train_val = TileTable::new();
    for row in table.rows() {
        if test_set.contains(&row.slide) {
            test.push(row.clone());
        } else {
            train_val.push(row.clone());
        }
    }

    // 截断前记录剩余侧的类集合, 用于检测截断造成的空类.
    let classes_before: BTreeSet<Value> = train_val
        .rows()
        .map(|r| r.value(&spec.target).unwrap().clone())
        .collect();

    if let Some(cap) = spec.per_class_cap {
        train_val = train_val.head_per_class(&spec.target, cap);
        test = test.head_per_class(&spec.target, cap);
    }

    let classes_after: BTreeSet<Value> = train_val
        .rows()
        .map(|r| r.value(&spec.target).unwrap().clone())
        .collect();
    if let Some(lost) = classes_before.difference(&classes_after).next() {
        return Err(SplitError::EmptyClass(label_repr(lost)));
    }

    let mut strat_rng = ChaCha8Rng::seed_from_u64(spec.seed.wrapping_add(1));
    let (train, val) = stratified(train_val, &spec.target, spec.train_size, &mut strat_rng);

    Ok(Partition { train, val, test })
}
