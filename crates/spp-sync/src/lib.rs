//! Schema registry, record synchronization and the prediction pipeline.

mod analysis;
mod config;
mod export;
mod mutation;
mod pipeline;
mod reconcile;
mod schema;
mod session;

pub use analysis::{
    analyze, bullying_type_summary, category_distribution, pending_actuals, BullyingTypeSummary,
    CategoryShare, HistoryAnalysis,
};
pub use config::{open_store, AppConfig, StoreBackend};
pub use export::{export_history, history_csv, history_parquet, ExportManifest, ExportManifestFile, HistoryExport};
pub use mutation::{delete_all, delete_by_key, set_actual_performance};
pub use pipeline::{ManualPrediction, Pipeline, PipelineSettings, StagedSummary};
pub use reconcile::{plan_reconciliation, NumberingPolicy, Reconciliation, StoreSnapshot, Synchronizer};
pub use schema::{ensure_schema, migrate_row, DriftPolicy, SchemaStatus};
pub use session::{AuthenticatedSession, Authenticator, Credential, SessionContext, StagedBatch};

pub const CRATE_NAME: &str = "spp-sync";
