//! 推理驱动与结果写回.
//!
//! 神经网络本体是外部协作者 ([`Classifier`]); 本模块负责数据一侧:
//! 标签编码, 按批驱动 [`TileSet`], 把逐类概率以 `prob_*`
//! 列写回工作表, 并把各切片的片段回存缓存.

use crate::consts::prob_column;
use crate::table::TileTable;
use crate::tiles::{LabelMap, TileItem, TileReadError, TileSet};
use ndarray::Array2;

/// 标签编码器: 文本类名与类别编号的双向映射.
///
/// 类名按字典序编号, 因此同一类集合总是得到同一编码.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// 从类名集合拟合编码器. 重复类名会被去重.
    pub fn fit<S: Into<String>, I: IntoIterator<Item = S>>(labels: I) -> Self {
        let mut classes: Vec<String> = labels.into_iter().map(Into::into).collect();
        classes.sort_unstable();
        classes.dedup();
        Self { classes }
    }

    /// 从工作表的标签列拟合编码器.
    ///
    /// # 注意
    ///
    /// 所有行必须带有文本类型的 `column` 列, 否则程序 panic.
    pub fn fit_from_table(table: &TileTable, column: &str) -> Self {
        Self::fit(table.rows().map(|r| {
            r.value(column)
                .and_then(|v| v.as_text())
                .unwrap_or_else(|| panic!("行缺少文本标签列 `{column}`"))
        }))
    }

    /// 类名列表, 按编号序.
    #[inline]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// 类别个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// 是否没有任何类.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// 类名 -> 编号.
    pub fn transform(&self, label: &str) -> Option<i64> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .ok()
            .map(|i| i as i64)
    }

    /// 编号 -> 类名.
    pub fn inverse(&self, code: i64) -> Option<&str> {
        usize::try_from(code)
            .ok()
            .and_then(|i| self.classes.get(i))
            .map(String::as_str)
    }

    /// 生成可交给 [`crate::tiles::TargetSpec`] 的标签映射闭包.
    pub fn remap(&self) -> LabelMap {
        let owned = self.clone();
        Box::new(move |v| match v {
            crate::table::Value::Text(s) => owned.transform(s),
            other => other.as_int(),
        })
    }
}

/// 推理错误.
#[derive(Debug)]
pub enum PredictError {
    /// tile 读取错误.
    Read(TileReadError),

    /// 模型侧错误.
    Model(String),

    /// 模型输出形状与批不符.
    ///
    /// 第一个参数是期望形状, 第二个参数是实际形状.
    BadShape((usize, usize), (usize, usize)),
}

impl From<TileReadError> for PredictError {
    #[inline]
    fn from(e: TileReadError) -> Self {
        PredictError::Read(e)
    }
}

/// 图像分类器. 外部协作者: 网络结构与前向计算不在本 crate 内.
pub trait Classifier {
    /// 类别个数.
    fn num_classes(&self) -> usize;

    /// 对一批 tile 给出逐类概率, 形状 (batch, num_classes).
    fn predict_batch(&self, batch: &[TileItem]) -> Result<Array2<f32>, PredictError>;
}

/// 按批驱动数据集做整体推理, 返回形状 (len, num_classes) 的概率矩阵.
///
/// 模型输出形状与批不符时立即失败.
pub fn predict_all(
    set: &TileSet<'_>,
    model: &dyn Classifier,
    batch_size: usize,
) -> Result<Array2<f32>, PredictError> {
    let k = model.num_classes();
    let mut ans = Array2::zeros((set.len(), k));
    let mut offset = 0usize;
    for batch in set.batches(batch_size) {
        let batch = batch?;
        let probs = model.predict_batch(&batch)?;
        let expected = (batch.len(), k);
        if probs.dim() != expected {
            return Err(PredictError::BadShape(expected, probs.dim()));
        }
        ans.slice_mut(ndarray::s![offset..offset + batch.len(), ..])
            .assign(&probs);
        offset += batch.len();
    }
    Ok(ans)
}

/// 把概率矩阵以 `prob_<target>_<class>` 列写回工作表.
/// 矩阵中的 NaN 以 0.0 落表.
///
/// # 注意
///
/// `probs` 的形状必须是 (表行数, 类别数), 否则程序 panic.
pub fn write_probabilities(
    table: &mut TileTable,
    target: &str,
    encoder: &LabelEncoder,
    probs: &Array2<f32>,
) {
    assert_eq!(
        probs.dim(),
        (table.len(), encoder.len()),
        "概率矩阵形状与表不符"
    );
    for (j, class) in encoder.classes().iter().enumerate() {
        let column: Vec<f64> = probs.column(j).iter().map(|&v| v as f64).collect();
        table.set_float_column(&prob_column(target, class), &column);
    }
}

/// 把工作表按切片拆分, 将各片段回存进对应的缓存单元.
/// 返回写入的切片数.
#[cfg(feature = "serde")]
pub fn write_back_to_cache(
    tiling: &crate::preprocess::TilingSection,
    table: &TileTable,
    records: &[crate::catalog::SlideRecord],
) -> Result<usize, crate::cache::CacheError> {
    let mut saved = 0usize;
    for rec in records {
        let fragment = table.only_slide(&rec.external_id);
        if fragment.is_empty() {
            continue;
        }
        crate::cache::save_tiles(tiling, &fragment, rec)?;
        saved += 1;
    }
    Ok(saved)
}
