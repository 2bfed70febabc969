//! 程序运行函数.

use crate::report::PipelineReport;
use log::{info, warn};
use std::num::NonZeroUsize;
use std::path::Path;
use utils::loader;
use wsi_berry::prelude::*;

/// 实际运行.
pub fn run(config_path: &Path) -> PipelineReport {
    let config = PipelineConfig::load(config_path).expect("Loading pipeline config error");

    let layout = if config.data.slide_dir.as_os_str().is_empty() {
        loader::layout_from_env_or_home()
    } else {
        StoreLayout::new(&config.data.slide_dir)
    };
    assert!(layout.dir().is_dir(), "切片存储目录不存在");

    let index = JsonIndex::load(&config.data.index_path).expect("Loading slide index error");
    let criteria = Criteria::from(&config.criteria);
    let records = resolve(&index, &criteria, &layout).expect("Resolving catalog error");
    info!("目录解析: {} 张切片", records.len());

    // 同步检查. 本程序不执行网络拉取: 未就绪的切片仅告警并跳过,
    // 以便在部分数据就绪时也能推进迭代.
    let plan = plan_sync(&records).expect("Planning sync error");
    let mut ready = Vec::new();
    let mut pending = 0usize;
    for (rec, action) in records.iter().zip(&plan) {
        match action {
            SyncAction::Keep => ready.push(rec.clone()),
            other => {
                warn!("切片 {} 未就绪: {other:?}", rec.external_id);
                pending += 1;
            }
        }
    }

    // 掩膜归档可用时启用粗筛.
    let masks = layout.mask_archive_path().exists().then(|| {
        let workers = NonZeroUsize::new(utils::cpus().min(64)).unwrap();
        MaskArchive::new(workers, layout.mask_archive_path()).expect("Opening mask archive error")
    });

    let store = SlideStore::from_records(&ready);
    let mut tiler = Tiler::new(&config.tiling);
    if let Some(m) = &masks {
        tiler = tiler.with_masks(m);
    }
    let tiles = tiler.tile_and_cache(&ready, &store).expect("Tiling error");
    info!("tiling 完成: {} 个 tile", tiles.len());

    // 缓存覆盖检查: 刚写入的指纹项应当全部可读.
    let out = load_tiles(&config.tiling, &ready).expect("Loading cache error");
    info!("缓存加载: 命中 {}, 跳过 {}", out.loaded, out.skipped);

    let spec = SplitSpec {
        target: config.data.target.clone(),
        train_size: config.split.train_size,
        test_size: config.split.test_size,
        per_class_cap: config.split.per_class_cap,
        seed: config.split.seed,
    };
    let parts = partition(&out.tiles, &spec).expect("Partitioning error");

    PipelineReport {
        slides: records.len(),
        ready: ready.len(),
        pending,
        tiles: tiles.len(),
        cache_loaded: out.loaded,
        cache_skipped: out.skipped,
        train: parts.train.len(),
        val: parts.val.len(),
        test: parts.test.len(),
    }
}
