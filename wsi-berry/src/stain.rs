//! Macenko 染色归一化.
//!
//! 将 RGB tile 变换到光密度 (OD) 域, 对组织像素的 OD 协方差做特征分解,
//! 在最大两个特征向量张成的平面内取投影角度的鲁棒百分位,
//! 得到逐 tile 的 H&E 染色矩阵与浓度上限 ([`StainStats`]);
//! 归一化则把浓度映射到参考染色矩阵上重建像素.

use crate::consts::RGB_CHANNELS;
use crate::RgbTile;
use itertools::izip;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, Inverse, UPLO};
use once_cell::sync::Lazy;
use ordered_float::NotNan;

/// 透射光强度基准.
pub const DEFAULT_IO: f64 = 240.0;

/// 角度百分位参数 (百分数).
pub const DEFAULT_ALPHA: f64 = 1.0;

/// 透明像素过滤阈值: 任一通道 OD 低于该值的像素不参与估计.
pub const DEFAULT_BETA: f64 = 0.15;

/// 估计至少需要的组织像素数.
const MIN_TISSUE_PIXELS: usize = 16;

/// 常用的 H&E 参考染色矩阵, 形状 (3, 2), 列为 H/E 染色向量.
static HE_REF: Lazy<Array2<f64>> = Lazy::new(|| {
    Array2::from_shape_vec(
        (3, 2),
        vec![0.5626, 0.2159, 0.7201, 0.8012, 0.4062, 0.5581],
    )
    .unwrap()
});

/// 与 [`HE_REF`] 配套的参考浓度上限.
const MAX_C_REF: [f64; 2] = [1.9705, 1.0308];

/// 染色估计/归一化错误.
#[derive(Debug)]
pub enum StainError {
    /// 过滤后组织像素过少, 无法稳定估计.
    ///
    /// 第一个参数是实际可用的像素数, 第二个参数是所需的最少像素数.
    TooFewPixels(usize, usize),

    /// 数据中出现非有限值.
    NonFinite,

    /// 底层线性代数错误 (矩阵奇异等).
    Linalg(LinalgError),
}

impl From<LinalgError> for StainError {
    #[inline]
    fn from(e: LinalgError) -> Self {
        StainError::Linalg(e)
    }
}

/// 逐 tile 的染色统计: H&E 染色矩阵与 99 百分位浓度上限.
#[derive(Clone, Debug)]
pub struct StainStats {
    /// 染色矩阵, 形状 (3, 2). 两列分别为 Hematoxylin/Eosin 方向, 单位范数.
    pub he: Array2<f64>,

    /// 两种染色的浓度上限.
    pub max_c: [f64; 2],
}

/// 归一化的参考目标.
#[derive(Clone, Debug)]
pub struct StainReference {
    /// 参考染色矩阵, 形状 (3, 2).
    pub he: Array2<f64>,

    /// 参考浓度上限.
    pub max_c: [f64; 2],
}

impl Default for StainReference {
    fn default() -> Self {
        Self {
            he: HE_REF.clone(),
            max_c: MAX_C_REF,
        }
    }
}

/// 线性插值百分位. `p` 取百分数 (0 到 100).
///
/// 空数组或含 NaN 时返回 `Err`.
pub(crate) fn percentile<T: num::Float + ordered_float::FloatCore>(xs: &[T], p: f64) -> Result<T, StainError> {
    if xs.is_empty() {
        return Err(StainError::TooFewPixels(0, 1));
    }
    let mut sorted: Vec<NotNan<T>> = Vec::with_capacity(xs.len());
    for &x in xs {
        sorted.push(NotNan::new(x).map_err(|_| StainError::NonFinite)?);
    }
    sorted.sort_unstable();

    let pos = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = T::from(pos - lo as f64).ok_or(StainError::NonFinite)?;
    let a = sorted[lo].into_inner();
    let b = sorted[hi].into_inner();
    Ok(a + (b - a) * frac)
}

/// 逐像素光密度变换: `od = -ln((I + 1) / Io)`. 输出形状 (N, 3).
fn optical_density(tile: &RgbTile, io: f64) -> Array2<f64> {
    let (h, w, _) = tile.dim();
    let mut od = Array2::zeros((h * w, RGB_CHANNELS));
    // tile 是标准布局, reshape 不会生成 `Err`, 可直接 unwrap.
    for (i, px) in tile
        .view()
        .into_shape((h * w, RGB_CHANNELS))
        .unwrap()
        .axis_iter(Axis(0))
        .enumerate()
    {
        for c in 0..RGB_CHANNELS {
            od[(i, c)] = -((px[c] as f64 + 1.0) / io).ln();
        }
    }
    od
}

/// 普通最小二乘: `he * c = y` 的解 `c`, 经正规方程求得.
/// `he` 形状 (3, 2), `y` 形状 (3, N), 结果形状 (2, N).
fn lstsq(he: &Array2<f64>, y: &Array2<f64>) -> Result<Array2<f64>, StainError> {
    let gram = he.t().dot(he);
    let pinv = gram.inv()?.dot(&he.t().to_owned());
    Ok(pinv.dot(y))
}

impl StainStats {
    /// 以默认参数从原始 tile 估计染色统计.
    pub fn fit(tile: &RgbTile) -> Result<Self, StainError> {
        Self::fit_with(tile, DEFAULT_IO, DEFAULT_ALPHA, DEFAULT_BETA)
    }

    /// 以显式参数估计染色统计.
    ///
    /// `io` 是透射光强度基准, `alpha` 是角度百分位 (百分数),
    /// `beta` 是透明像素过滤阈值.
    pub fn fit_with(tile: &RgbTile, io: f64, alpha: f64, beta: f64) -> Result<Self, StainError> {
        let od = optical_density(tile, io);

        // 过滤透明像素: 任一通道 OD 低于 beta 的像素丢弃.
        let tissue: Vec<usize> = od
            .axis_iter(Axis(0))
            .enumerate()
            .filter(|(_, row)| row.iter().all(|&v| v >= beta))
            .map(|(i, _)| i)
            .collect();
        if tissue.len() < MIN_TISSUE_PIXELS {
            return Err(StainError::TooFewPixels(tissue.len(), MIN_TISSUE_PIXELS));
        }
        let od_hat = od.select(Axis(0), &tissue);

        // 协方差 (3, 3) 与特征分解. eigh 返回升序特征值,
        // 故取后两列作为主平面基.
        let mean = od_hat.mean_axis(Axis(0)).ok_or(StainError::NonFinite)?;
        let centered = &od_hat - &mean;
        let cov = centered.t().dot(&centered) / (od_hat.nrows() as f64 - 1.0);
        let (_, eigvecs) = cov.eigh(UPLO::Upper)?;
        let plane = eigvecs.slice(s![.., 1..3]).to_owned();

        // 投影角度的鲁棒极值.
        let proj = od_hat.dot(&plane);
        let phi: Vec<f64> = proj
            .axis_iter(Axis(0))
            .map(|p| p[1].atan2(p[0]))
            .collect();
        let min_phi = percentile(&phi, alpha)?;
        let max_phi = percentile(&phi, 100.0 - alpha)?;

        let dir = |angle: f64| -> Array1<f64> {
            plane.dot(&Array1::from(vec![angle.cos(), angle.sin()]))
        };
        let v_min = dir(min_phi);
        let v_max = dir(max_phi);

        // Hematoxylin 向量约定排在第一列.
        let (first, second) = if v_min[0] > v_max[0] {
            (v_min, v_max)
        } else {
            (v_max, v_min)
        };
        let mut he = Array2::zeros((RGB_CHANNELS, 2));
        he.column_mut(0).assign(&first);
        he.column_mut(1).assign(&second);

        // 全体像素的浓度, 取 99 百分位为上限.
        let conc = lstsq(&he, &od.t().to_owned())?;
        let c0: Vec<f64> = conc.row(0).to_vec();
        let c1: Vec<f64> = conc.row(1).to_vec();
        let max_c = [percentile(&c0, 99.0)?, percentile(&c1, 99.0)?];

        Ok(Self { he, max_c })
    }
}

/// 将 tile 的染色浓度映射到参考染色矩阵上, 重建归一化后的 RGB tile.
///
/// `stats` 是该 tile 自身的染色统计 (通常由 [`StainStats::fit`] 现场计算),
/// `reference` 是归一化目标. 输出形状与输入一致.
pub fn normalize(
    tile: &RgbTile,
    stats: &StainStats,
    reference: &StainReference,
) -> Result<RgbTile, StainError> {
    let (h, w, _) = tile.dim();
    let od = optical_density(tile, DEFAULT_IO);
    let conc = lstsq(&stats.he, &od.t().to_owned())?;

    // 浓度按 max_c / max_c_ref 重标定.
    let mut scaled = conc;
    for (mut row, own, rf) in izip!(
        scaled.axis_iter_mut(Axis(0)),
        stats.max_c.iter(),
        reference.max_c.iter()
    ) {
        let k = own / rf;
        if !k.is_finite() || k == 0.0 {
            return Err(StainError::NonFinite);
        }
        row.mapv_inplace(|v| v / k);
    }

    // Inorm = Io * exp(-HE_ref · C), 逐像素回填.
    let rebuilt = reference.he.dot(&scaled);
    let mut ans = RgbTile::zeros((h, w, RGB_CHANNELS));
    for (i, px) in rebuilt.axis_iter(Axis(1)).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..RGB_CHANNELS {
            let v = DEFAULT_IO * (-px[c]).exp();
            // 饱和在 254, 避免把组织像素推成纯白.
            ans[(y, x, c)] = if v > 254.0 { 254 } else { v.max(0.0) as u8 };
        }
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let xs = [1.0f64, 2.0, 3.0, 4.0, 5.0];
        assert!((percentile(&xs, 50.0).unwrap() - 3.0).abs() < 1e-12);
        assert!((percentile(&xs, 0.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((percentile(&xs, 100.0).unwrap() - 5.0).abs() < 1e-12);
        // 线性插值.
        assert!((percentile(&xs, 25.0).unwrap() - 2.0).abs() < 1e-12);
        assert!((percentile(&xs, 10.0).unwrap() - 1.4).abs() < 1e-12);

        assert!(percentile::<f64>(&[], 50.0).is_err());
        assert!(percentile(&[1.0, f64::NAN], 50.0).is_err());
    }

    #[test]
    fn test_optical_density_monotone() {
        let mut tile = RgbTile::zeros((1, 2, 3));
        // 纯白像素 OD 接近 0, 深色像素 OD 大.
        for c in 0..3 {
            tile[(0, 0, c)] = 255;
            tile[(0, 1, c)] = 40;
        }
        let od = optical_density(&tile, DEFAULT_IO);
        for c in 0..3 {
            assert!(od[(0, c)].abs() < 0.1);
            assert!(od[(1, c)] > 1.0);
        }
    }

    /// 以已知染色矩阵合成 tile.
    fn synthetic_tile(n: usize) -> RgbTile {
        let he = HE_REF.clone();
        let mut tile = RgbTile::zeros((n, n, 3));
        for y in 0..n {
            for x in 0..n {
                let c0 = 0.05 + 1.6 * (x as f64 / (n - 1) as f64);
                let c1 = 0.05 + 0.9 * (y as f64 / (n - 1) as f64);
                for ch in 0..3 {
                    let od = he[(ch, 0)] * c0 + he[(ch, 1)] * c1;
                    let v = DEFAULT_IO * (-od).exp();
                    tile[(y, x, ch)] = v.clamp(0.0, 255.0) as u8;
                }
            }
        }
        tile
    }

    #[test]
    fn test_fit_recovers_reference_directions() {
        let tile = synthetic_tile(32);
        let stats = StainStats::fit(&tile).unwrap();

        // 两列均为单位范数.
        for col in 0..2 {
            let norm: f64 = stats.he.column(col).iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6, "column {col} norm {norm}");
        }

        // 每个拟合方向都与某个参考染色方向高度一致.
        for col in 0..2 {
            let fitted = stats.he.column(col);
            let best = (0..2)
                .map(|r| {
                    let rf = HE_REF.column(r);
                    fitted.iter().zip(rf.iter()).map(|(a, b)| a * b).sum::<f64>().abs()
                })
                .fold(0.0f64, f64::max);
            assert!(best > 0.98, "column {col} cosine {best}");
        }

        assert!(stats.max_c[0].is_finite() && stats.max_c[0] > 0.0);
        assert!(stats.max_c[1].is_finite() && stats.max_c[1] > 0.0);
    }

    #[test]
    fn test_fit_rejects_blank_tile() {
        // 纯白 tile 经透明过滤后没有组织像素.
        let mut tile = RgbTile::zeros((16, 16, 3));
        tile.fill(250);
        assert!(matches!(
            StainStats::fit(&tile),
            Err(StainError::TooFewPixels(_, _))
        ));
    }

    #[test]
    fn test_normalize_self_reference_is_near_identity() {
        let tile = synthetic_tile(24);
        let stats = StainStats::fit(&tile).unwrap();

        // 以自身统计为参考时浓度重标定系数为 1, 重建应接近原图.
        let own_ref = StainReference {
            he: stats.he.clone(),
            max_c: stats.max_c,
        };
        let out = normalize(&tile, &stats, &own_ref).unwrap();
        assert_eq!(out.dim(), tile.dim());
        let mut max_diff = 0i32;
        for (a, b) in out.iter().zip(tile.iter()) {
            max_diff = max_diff.max((*a as i32 - *b as i32).abs());
        }
        assert!(max_diff <= 16, "max diff {max_diff}");

        // 映射到外部参考时仅要求形状一致, 数值会整体重标定.
        let shifted = normalize(&tile, &stats, &StainReference::default()).unwrap();
        assert_eq!(shifted.dim(), tile.dim());
    }
}
