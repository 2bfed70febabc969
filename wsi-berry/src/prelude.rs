//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Coord2d, Idx2d, RgbTile};

pub use crate::catalog::{
    plan_sync, resolve, synchronize, Criteria, SlideFetcher, SlideIndex, SlideRecord, StoreLayout,
    SyncAction, SyncReport,
};

#[cfg(feature = "serde")]
pub use crate::catalog::JsonIndex;

pub use crate::table::{TileRow, TileTable, Value};

#[cfg(feature = "serde")]
pub use crate::cache::{load_tiles, save_tiles, Fingerprint, LoadOutcome};

#[cfg(feature = "serde")]
pub use crate::config::PipelineConfig;

pub use crate::preprocess::{tile_grid, Tiler, TilingSection};

pub use crate::split::{partition, Partition, SplitError, SplitSpec};

pub use crate::stain::{StainReference, StainStats};

pub use crate::tiles::{
    Pipeline, PlainImageReader, RegionReader, SlideStore, Step, TargetSpec, TileDim, TileItem,
    TileSet,
};

pub use crate::mask::MaskArchive;

pub use crate::predict::{predict_all, write_probabilities, Classifier, LabelEncoder};

pub use crate::consts::prob_column;

pub use crate::home_slide_dir_with;
