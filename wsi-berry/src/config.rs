//! 管线配置.
//!
//! 配置以 TOML 文件提供, 解析为显式结构并在进入管线前整体校验.
//! 其中 [`TilingSection`] 是影响 tiling/预处理输出的字段子集,
//! 也是缓存指纹 ([`crate::cache::Fingerprint`]) 的唯一输入.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 配置错误. 构造或校验失败时返回, 不产生部分可用的配置.
#[derive(Debug)]
pub enum ConfigError {
    /// 读取配置文件错误.
    Io(std::io::Error),

    /// TOML 解析错误.
    Parse(toml::de::Error),

    /// tile 边长为 0.
    ZeroTileSize,

    /// 未指定任何分辨率级.
    NoLevels,

    /// 组织占比阈值不在 [0, 1] 内.
    BadTissueFraction(f64),

    /// train_size 不在 (0, 1) 内.
    BadTrainSize(f64),

    /// test_size 不在 (0, 1) 内.
    BadTestSize(f64),

    /// 目标标签列名为空.
    EmptyTarget,
}

/// 图像管理服务器连接信息. 本 crate 不直接建立连接,
/// 仅将其传递给外部拉取器实现.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    /// 服务器地址.
    pub host: String,

    /// 用户名.
    pub user: String,

    /// 密码.
    pub password: String,
}

/// 数据位置与目标标签.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSection {
    /// 切片存储目录.
    pub slide_dir: PathBuf,

    /// 本地元数据索引文件路径.
    pub index_path: PathBuf,

    /// 目标标签列名.
    pub target: String,
}

pub use crate::preprocess::TilingSection;

/// 数据集划分配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitSection {
    /// 训练集在 (train + validation) 中的占比.
    pub train_size: f64,

    /// 测试集按切片分组切出的占比.
    pub test_size: f64,

    /// 每类最多保留的 tile 数. 缺省时不截断.
    #[serde(default)]
    pub per_class_cap: Option<usize>,

    /// 随机种子.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

/// 模型与检查点. 网络结构本身是外部协作者, 这里只透传其参数.
/// 不参与指纹.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSection {
    /// 骨干网络名称.
    pub backbone: String,

    /// 类别个数.
    pub n_classes: usize,

    /// 检查点路径.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
}

/// 运行时参数. 不参与指纹.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// 推理/训练批大小.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 并行 worker 数. 0 表示由运行时自行决定.
    #[serde(default)]
    pub workers: usize,
}

fn default_batch_size() -> usize {
    8
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: 0,
        }
    }
}

/// 完整管线配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 服务器连接信息.
    pub server: ServerSection,

    /// 数据位置与目标标签.
    pub data: DataSection,

    /// 选片条件: 键 -> 候选值列表, 按笛卡尔积展开匹配.
    #[serde(default)]
    pub criteria: BTreeMap<String, Vec<String>>,

    /// tiling 配置 (指纹输入).
    #[serde(default)]
    pub tiling: TilingSection,

    /// 数据集划分配置.
    pub split: SplitSection,

    /// 模型与检查点. 仅推理/训练管线需要.
    #[serde(default)]
    pub model: Option<ModelSection>,

    /// 运行时参数.
    #[serde(default)]
    pub runtime: RuntimeSection,
}

impl PipelineConfig {
    /// 从 TOML 文件加载并整体校验.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        let cfg: PipelineConfig = toml::from_str(&text).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验配置. 任何一项不合法都立即失败.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.target.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }
        if self.tiling.tile_size == 0 {
            return Err(ConfigError::ZeroTileSize);
        }
        if self.tiling.levels.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        if !(0.0..=1.0).contains(&self.tiling.tissue_fraction) {
            return Err(ConfigError::BadTissueFraction(self.tiling.tissue_fraction));
        }
        if !(0.0 < self.split.train_size && self.split.train_size < 1.0) {
            return Err(ConfigError::BadTrainSize(self.split.train_size));
        }
        if !(0.0 < self.split.test_size && self.split.test_size < 1.0) {
            return Err(ConfigError::BadTestSize(self.split.test_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::DEFAULT_TILE_SIZE;

    const MINIMAL: &str = r#"
        [server]
        host = "wss://images.example.org"
        user = "reader"
        password = "secret"

        [data]
        slide_dir = "/data/slides"
        index_path = "/data/slides/index.json"
        target = "tumour_label"

        [criteria]
        diagnosis = ["sarcoma"]

        [split]
        train_size = 0.7
        test_size = 0.15
    "#;

    #[test]
    fn test_minimal_toml_defaults() {
        let cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.tiling.tile_size, DEFAULT_TILE_SIZE);
        assert_eq!(cfg.tiling.levels, vec![0]);
        assert!(!cfg.tiling.stain_norm);
        assert_eq!(cfg.split.seed, 42);
        assert_eq!(cfg.split.per_class_cap, None);
        assert_eq!(cfg.runtime.batch_size, 8);
        assert_eq!(cfg.model, None);
        assert_eq!(cfg.criteria["diagnosis"], vec!["sarcoma".to_owned()]);
    }

    #[test]
    fn test_validate_rejects_bad_fractions() {
        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.split.test_size = 1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadTestSize(v)) if v == 1.0
        ));

        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.split.train_size = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::BadTrainSize(_))));
    }

    #[test]
    fn test_validate_rejects_bad_tiling() {
        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.tiling.tile_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroTileSize)));

        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.tiling.levels.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoLevels)));

        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.tiling.tissue_fraction = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadTissueFraction(_))
        ));
    }
}
