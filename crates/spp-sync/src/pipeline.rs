//! Normalize, predict, classify, then reconcile against the store.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use spp_adapters::{ManualInput, NormalizedInput, Normalizer, SourceShape};
use spp_core::{CategoryScheme, SchemaVersion, SppError, SppResult, StudentRecord};
use spp_model::PredictionEngine;
use spp_storage::{ExportStore, TabularStore};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::analysis::{analyze, HistoryAnalysis};
use crate::config::{open_store, AppConfig};
use crate::export::{export_history, HistoryExport};
use crate::mutation;
use crate::reconcile::{NumberingPolicy, Reconciliation, Synchronizer};
use crate::schema::{ensure_schema, DriftPolicy, SchemaStatus};
use crate::session::{AuthenticatedSession, SessionContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub schema_version: SchemaVersion,
    pub category_scheme: CategoryScheme,
    pub numbering: NumberingPolicy,
    pub drift_policy: DriftPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            schema_version: config.schema_version,
            category_scheme: config.category_scheme,
            numbering: config.numbering,
            drift_policy: config.schema_drift,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualPrediction {
    pub record: StudentRecord,
    /// False when a record with the same name was already stored.
    pub stored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagedSummary {
    pub shape: SourceShape,
    pub rows: usize,
}

/// Entry point for every caller-facing operation. Mutations are serialized
/// through one writer lock; reads go straight to the store.
pub struct Pipeline {
    store: Arc<dyn TabularStore>,
    engine: PredictionEngine,
    normalizer: Normalizer,
    settings: PipelineSettings,
    exports: ExportStore,
    writer: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn TabularStore>,
        engine: PredictionEngine,
        normalizer: Normalizer,
        settings: PipelineSettings,
        exports: ExportStore,
    ) -> SppResult<Self> {
        engine.check_schema(settings.schema_version)?;
        Ok(Self {
            store,
            engine,
            normalizer,
            settings,
            exports,
            writer: Mutex::new(()),
        })
    }

    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let engine = PredictionEngine::load(&config.model_path)
            .with_context(|| format!("loading model {}", config.model_path.display()))?;
        let normalizer = Normalizer::new(config.score_scale()?, config.survey_layout()?);
        let store = open_store(config).await?;
        let pipeline = Self::new(
            store,
            engine,
            normalizer,
            PipelineSettings::from_config(config),
            ExportStore::new(config.export_dir.clone()),
        )
        .context("model does not fit the configured schema version")?;
        Ok(pipeline)
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn engine(&self) -> &PredictionEngine {
        &self.engine
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(
            self.store.clone(),
            self.settings.schema_version,
            self.settings.numbering,
        )
    }

    pub async fn ensure_schema(&self) -> SppResult<SchemaStatus> {
        let _guard = self.writer.lock().await;
        ensure_schema(
            self.store.as_ref(),
            self.settings.schema_version,
            self.settings.drift_policy,
        )
        .await
    }

    /// Scores every input before anything is written. One bad row fails the lot.
    pub fn score(&self, inputs: Vec<NormalizedInput>) -> SppResult<Vec<StudentRecord>> {
        let layout = self.engine.layout();
        let features = inputs
            .iter()
            .map(|input| input.features(layout))
            .collect::<SppResult<Vec<_>>>()?;
        let scores = self.engine.predict_batch(&features)?;
        Ok(inputs
            .into_iter()
            .zip(scores)
            .map(|(input, score)| {
                let mut record = StudentRecord::scored(
                    input.profile,
                    input.scores,
                    score,
                    self.settings.category_scheme,
                );
                record.actual_performance = input.actual_performance;
                record
            })
            .collect())
    }

    pub async fn predict_manual(
        &self,
        session: &AuthenticatedSession,
        input: ManualInput,
    ) -> SppResult<ManualPrediction> {
        let normalized = self.normalizer.manual(input)?;
        let record = self
            .score(vec![normalized])?
            .pop()
            .ok_or_else(|| SppError::InvalidInput("nothing to predict".into()))?;

        let _guard = self.writer.lock().await;
        let outcome = self
            .synchronizer()
            .reconcile(vec![record.clone()])
            .instrument(info_span!("predict_manual", user = session.username()))
            .await?;
        Ok(match outcome.added.into_iter().next() {
            Some(stored) => ManualPrediction {
                record: stored,
                stored: true,
            },
            None => ManualPrediction {
                record,
                stored: false,
            },
        })
    }

    /// Parses an upload into the session cache without touching the store.
    pub fn stage_upload(
        &self,
        ctx: &mut SessionContext,
        shape: SourceShape,
        bytes: &[u8],
    ) -> SppResult<StagedSummary> {
        let inputs = self.normalizer.batch(shape, bytes)?;
        let rows = inputs.len();
        ctx.stage(shape, inputs);
        info!(user = ctx.session().username(), %shape, rows, "staged upload");
        Ok(StagedSummary { shape, rows })
    }

    /// Writes the session's staged upload. The cache is kept on failure so the
    /// same batch can be resubmitted; already-stored names are skipped then.
    pub async fn import_staged(&self, ctx: &mut SessionContext) -> SppResult<Reconciliation> {
        let staged = ctx
            .staged()
            .ok_or_else(|| SppError::InvalidInput("no upload is staged for this session".into()))?;
        let records = self.score(staged.inputs.clone())?;
        let outcome = self.reconcile_as(ctx.session(), records).await?;
        ctx.clear_staged();
        Ok(outcome)
    }

    /// One-shot parse, score and write of an upload.
    pub async fn import_batch(
        &self,
        session: &AuthenticatedSession,
        shape: SourceShape,
        bytes: &[u8],
    ) -> SppResult<Reconciliation> {
        let inputs = self.normalizer.batch(shape, bytes)?;
        let records = self.score(inputs)?;
        self.reconcile_as(session, records).await
    }

    async fn reconcile_as(
        &self,
        session: &AuthenticatedSession,
        records: Vec<StudentRecord>,
    ) -> SppResult<Reconciliation> {
        let _guard = self.writer.lock().await;
        self.synchronizer()
            .reconcile(records)
            .instrument(info_span!("import", user = session.username()))
            .await
    }

    /// Stored records with categories re-derived from the stored scores.
    /// Rows that no longer decode are logged and left out.
    pub async fn history(&self) -> SppResult<Vec<StudentRecord>> {
        let rows = self.store.read_all().await.map_err(|e| e.into_spp("read_all"))?;
        let version = self.settings.schema_version;
        Ok(rows
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(index, row)| {
                match StudentRecord::from_row(row, version, self.settings.category_scheme) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(store_row = index + 1, error = %err, "skipping undecodable row");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn delete_all(&self, session: &AuthenticatedSession) -> SppResult<usize> {
        let _guard = self.writer.lock().await;
        info!(user = session.username(), "delete all requested");
        mutation::delete_all(self.store.as_ref(), self.settings.schema_version).await
    }

    pub async fn delete_by_name(&self, session: &AuthenticatedSession, name: &str) -> SppResult<usize> {
        if name.trim().is_empty() {
            return Err(SppError::InvalidInput("name to delete must not be empty".into()));
        }
        let _guard = self.writer.lock().await;
        info!(user = session.username(), name, "delete by name requested");
        mutation::delete_by_key(self.store.as_ref(), self.settings.schema_version, name).await
    }

    pub async fn set_actual_performance(
        &self,
        session: &AuthenticatedSession,
        name: &str,
        value: f64,
    ) -> SppResult<bool> {
        let _guard = self.writer.lock().await;
        info!(user = session.username(), name, value, "actual performance submitted");
        let updated = mutation::set_actual_performance(
            self.store.as_ref(),
            self.settings.schema_version,
            name,
            value,
        )
        .await?;
        Ok(updated.is_some())
    }

    pub async fn analysis(&self) -> SppResult<HistoryAnalysis> {
        let records = self.history().await?;
        Ok(analyze(&records, self.settings.category_scheme))
    }

    pub async fn export_history(&self) -> anyhow::Result<HistoryExport> {
        let records = self.history().await?;
        export_history(&self.exports, &records, self.settings.schema_version, Utc::now()).await
    }
}
