// Core
pub mod consts;
pub mod error;
pub mod extent;
pub mod metrics;
pub mod pump;
pub mod snapshot;

// Migration
pub mod cloning;
pub mod config;
pub mod pipeline;
pub mod steps; // src/steps/{mod,prepare,create_temp,clone_os,fix_volume,shrink,...}.rs

// Host boundary and real implementations
pub mod access; // src/access/{mod,tool,mbr,ntfs,vdisk,vss,registry,host}.rs

// Binary support
pub mod cli;
pub mod lock;

// Convenient re-exports
pub use cloning::clone_volume;
pub use config::{find_temp_folder, ContainerType, ContextBuilder, MigrationContext, MigrationMode};
pub use error::{MigrateError, Result};
pub use extent::{bitmap_to_extents, ClusterBitmap, Extent};
pub use pipeline::{MigrationPipeline, PipelineMetrics, PipelineReport, RunOutcome, StepMetrics};
pub use pump::{CopyProgress, CopyResult, SparsePump};
pub use snapshot::{Snapshot, SnapshotState};
pub use steps::{MigrationStep, StepCheck};
