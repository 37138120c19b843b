//! Single-row processor for unit telemetry events.

use crate::enrichment::{Enrichment, EnrichmentLookup};
use crate::error_ingestion::ErrorIngestion;
use crate::processor::{
    get_f64, get_string, parse_timestamp, run_pipeline, EventMessage, ProcessError, ProcessorOps,
    StreamProcessor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

pub const STREAM_KEY: &str = "tfp-unit-events-stream";
pub const CONSUMER_GROUP: &str = "unit-events-ingester";

#[derive(Debug, Clone, PartialEq)]
pub struct UnitEventRow {
    pub message_id: String,
    pub unit_number: Option<String>,
    pub unit_type_code: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_kind: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub severity: Option<String>,
    pub report_notes: Option<String>,
    pub container_number: Option<String>,
    pub id_trailer: Option<i64>,
    pub id_vehicle: Option<i64>,
}

pub struct UnitEventProcessor {
    pool: PgPool,
    enrichment: Arc<dyn EnrichmentLookup>,
    errors: Arc<dyn ErrorIngestion>,
}

impl UnitEventProcessor {
    pub fn new(
        pool: PgPool,
        enrichment: Arc<dyn EnrichmentLookup>,
        errors: Arc<dyn ErrorIngestion>,
    ) -> Self {
        Self {
            pool,
            enrichment,
            errors,
        }
    }

    /// Project the payload into the row; business keys are stored even when
    /// enrichment later finds nothing.
    pub fn build_row(message: &EventMessage, payload: &JsonValue) -> UnitEventRow {
        UnitEventRow {
            message_id: message.message_id.clone(),
            unit_number: get_string(payload, "unitNumber"),
            unit_type_code: get_string(payload, "unitTypeCode"),
            event_time: parse_timestamp(payload, "eventTime"),
            event_kind: get_string(payload, "type"),
            latitude: get_f64(payload, "latitude"),
            longitude: get_f64(payload, "longitude"),
            severity: get_string(payload, "severity"),
            report_notes: get_string(payload, "reportNotes"),
            container_number: None,
            id_trailer: None,
            id_vehicle: None,
        }
    }
}

#[async_trait]
impl ProcessorOps for UnitEventProcessor {
    type Model = UnitEventRow;

    fn processor_name(&self) -> &str {
        "unit-events"
    }

    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool, ProcessError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM evt_unit_events WHERE message_id = $1)")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, ProcessError> {
        let done = sqlx::query("DELETE FROM evt_unit_events WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    fn build_models(
        &self,
        message: &EventMessage,
        payload: &JsonValue,
    ) -> Result<Vec<UnitEventRow>, ProcessError> {
        Ok(vec![Self::build_row(message, payload)])
    }

    fn apply_enrichment(&self, model: &mut UnitEventRow, enrichment: &Enrichment) {
        model.container_number = enrichment.container_number.clone();
        model.id_trailer = enrichment.id_trailer;
        model.id_vehicle = enrichment.id_vehicle;
    }

    async fn save_models(&self, models: Vec<UnitEventRow>) -> Result<(), ProcessError> {
        for row in models {
            sqlx::query(
                r#"
                INSERT INTO evt_unit_events
                    (message_id, unit_number, unit_type_code, event_time, event_kind,
                     latitude, longitude, severity, report_notes,
                     container_number, id_trailer, id_vehicle, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
                "#,
            )
            .bind(&row.message_id)
            .bind(&row.unit_number)
            .bind(&row.unit_type_code)
            .bind(row.event_time)
            .bind(&row.event_kind)
            .bind(row.latitude)
            .bind(row.longitude)
            .bind(&row.severity)
            .bind(&row.report_notes)
            .bind(&row.container_number)
            .bind(row.id_trailer)
            .bind(row.id_vehicle)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamProcessor for UnitEventProcessor {
    fn stream_key(&self) -> &str {
        STREAM_KEY
    }

    fn consumer_group(&self) -> &str {
        CONSUMER_GROUP
    }

    fn processor_name(&self) -> &str {
        ProcessorOps::processor_name(self)
    }

    async fn process(&self, fields: &HashMap<String, String>) -> Result<(), ProcessError> {
        run_pipeline(self, &*self.enrichment, &*self.errors, fields).await
    }
}
