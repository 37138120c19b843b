//! Multi-row processor: one composition message expands into one row per
//! unit, disambiguated by `pos_index` (1-based).

use crate::enrichment::{Enrichment, EnrichmentLookup};
use crate::error_ingestion::ErrorIngestion;
use crate::processor::{
    get_bool, get_string, run_pipeline, EventMessage, ProcessError, ProcessorOps, StreamProcessor,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

pub const STREAM_KEY: &str = "tfp-convoy-compositions-stream";
pub const CONSUMER_GROUP: &str = "convoy-compositions-ingester";

#[derive(Debug, Clone, PartialEq)]
pub struct ConvoyCompositionRow {
    pub message_id: String,
    pub pos_index: i32,
    pub convoy_code: Option<String>,
    pub unit_number: Option<String>,
    pub unit_type_code: Option<String>,
    pub wagon_code: Option<String>,
    pub loaded: Option<bool>,
    pub container_number: Option<String>,
    pub id_trailer: Option<i64>,
    pub id_vehicle: Option<i64>,
}

pub struct ConvoyCompositionProcessor {
    pool: PgPool,
    enrichment: Arc<dyn EnrichmentLookup>,
    errors: Arc<dyn ErrorIngestion>,
}

impl ConvoyCompositionProcessor {
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

    pub fn build_rows(message: &EventMessage, payload: &JsonValue) -> Vec<ConvoyCompositionRow> {
        let convoy_code = get_string(payload, "convoyCode");
        let units = payload
            .get("units")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();

        units
            .iter()
            .enumerate()
            .map(|(index, unit)| ConvoyCompositionRow {
                message_id: message.message_id.clone(),
                pos_index: index as i32 + 1,
                convoy_code: convoy_code.clone(),
                unit_number: get_string(unit, "unitNumber"),
                unit_type_code: get_string(unit, "unitTypeCode"),
                wagon_code: get_string(unit, "wagonCode"),
                loaded: get_bool(unit, "loaded"),
                container_number: None,
                id_trailer: None,
                id_vehicle: None,
            })
            .collect()
    }

    fn first_unit(payload: &JsonValue) -> Option<&JsonValue> {
        payload.get("units").and_then(JsonValue::as_array)?.first()
    }
}

#[async_trait]
impl ProcessorOps for ConvoyCompositionProcessor {
    type Model = ConvoyCompositionRow;

    fn processor_name(&self) -> &str {
        "convoy-compositions"
    }

    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool, ProcessError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM evt_convoy_compositions WHERE message_id = $1)",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, ProcessError> {
        let done = sqlx::query("DELETE FROM evt_convoy_compositions WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    fn build_models(
        &self,
        message: &EventMessage,
        payload: &JsonValue,
    ) -> Result<Vec<ConvoyCompositionRow>, ProcessError> {
        Ok(Self::build_rows(message, payload))
    }

    fn apply_enrichment(&self, model: &mut ConvoyCompositionRow, enrichment: &Enrichment) {
        model.container_number = enrichment.container_number.clone();
        model.id_trailer = enrichment.id_trailer;
        model.id_vehicle = enrichment.id_vehicle;
    }

    async fn save_models(&self, models: Vec<ConvoyCompositionRow>) -> Result<(), ProcessError> {
        for row in models {
            sqlx::query(
                r#"
                INSERT INTO evt_convoy_compositions
                    (message_id, pos_index, convoy_code, unit_number, unit_type_code,
                     wagon_code, loaded, container_number, id_trailer, id_vehicle, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                "#,
            )
            .bind(&row.message_id)
            .bind(row.pos_index)
            .bind(&row.convoy_code)
            .bind(&row.unit_number)
            .bind(&row.unit_type_code)
            .bind(&row.wagon_code)
            .bind(row.loaded)
            .bind(&row.container_number)
            .bind(row.id_trailer)
            .bind(row.id_vehicle)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// The lookup identifier comes from the head unit of the composition.
    fn unit_number_from_payload(&self, payload: &JsonValue) -> Option<String> {
        Self::first_unit(payload).and_then(|unit| get_string(unit, "unitNumber"))
    }

    fn unit_type_code_from_payload(&self, payload: &JsonValue) -> Option<String> {
        Self::first_unit(payload).and_then(|unit| get_string(unit, "unitTypeCode"))
    }
}

#[async_trait]
impl StreamProcessor for ConvoyCompositionProcessor {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> EventMessage {
        EventMessage {
            message_id: "ID:conv-1".to_string(),
            event_type: "CONVOY_COMPOSITIONS".to_string(),
            is_resend: false,
        }
    }

    #[test]
    fn test_one_row_per_unit_with_pos_index() {
        let payload = json!({
            "convoyCode": "CNV-42",
            "units": [
                {"unitNumber": "U1", "unitTypeCode": "CONTAINER", "wagonCode": "W1", "loaded": true},
                {"unitNumber": "U2", "unitTypeCode": "TRAILER", "wagonCode": "W2", "loaded": false},
                {"unitNumber": "U3"}
            ]
        });
        let rows = ConvoyCompositionProcessor::build_rows(&message(), &payload);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].pos_index, 1);
        assert_eq!(rows[1].pos_index, 2);
        assert_eq!(rows[2].pos_index, 3);
        assert!(rows.iter().all(|r| r.message_id == "ID:conv-1"));
        assert!(rows.iter().all(|r| r.convoy_code.as_deref() == Some("CNV-42")));
        assert_eq!(rows[0].loaded, Some(true));
        assert_eq!(rows[1].unit_type_code.as_deref(), Some("TRAILER"));
        assert_eq!(rows[2].wagon_code, None);
    }

    #[test]
    fn test_empty_units_builds_no_rows() {
        let rows = ConvoyCompositionProcessor::build_rows(
            &message(),
            &json!({"convoyCode": "CNV-0", "units": []}),
        );
        assert!(rows.is_empty());

        let no_field = ConvoyCompositionProcessor::build_rows(&message(), &json!({}));
        assert!(no_field.is_empty());
    }
}
