//! Composite processor: one parent damage row plus a pivoted label row.
//!
//! The damage labels arrive as a tag array; each asset subtype has a closed
//! tag-to-column map, and tags outside the map set the `dmg_other` flag.

use crate::enrichment::{Enrichment, EnrichmentLookup};
use crate::error_ingestion::ErrorIngestion;
use crate::processor::{
    get_i64, get_string, parse_timestamp, run_pipeline, EventMessage, ProcessError, ProcessorOps,
    StreamProcessor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

pub const STREAM_KEY: &str = "tfp-asset-damages-stream";
pub const CONSUMER_GROUP: &str = "asset-damages-ingester";

const VEHICLE_LABEL_MAP: &[(&str, VehicleLabel)] = &[
    ("DMG_BRACKING", VehicleLabel::Braking),
    ("DMG_TYRES", VehicleLabel::Tyres),
    ("DMG_LIGHTS", VehicleLabel::Lights),
    ("DMG_BODYWORK", VehicleLabel::Bodywork),
];

const TRAILER_LABEL_MAP: &[(&str, TrailerLabel)] = &[
    ("DMG_AXLE", TrailerLabel::Axle),
    ("DMG_TARPAULIN", TrailerLabel::Tarpaulin),
    ("DMG_FLOOR", TrailerLabel::Floor),
    ("DMG_DOORS", TrailerLabel::Doors),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VehicleLabel {
    Braking,
    Tyres,
    Lights,
    Bodywork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrailerLabel {
    Axle,
    Tarpaulin,
    Floor,
    Doors,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleDamageLabels {
    pub dmg_braking: bool,
    pub dmg_tyres: bool,
    pub dmg_lights: bool,
    pub dmg_bodywork: bool,
    pub dmg_other: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailerDamageLabels {
    pub dmg_axle: bool,
    pub dmg_tarpaulin: bool,
    pub dmg_floor: bool,
    pub dmg_doors: bool,
    pub dmg_other: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DamageLabels {
    Vehicle(VehicleDamageLabels),
    Trailer(TrailerDamageLabels),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetDamage {
    pub id: i64,
    pub message_id: String,
    pub asset_type: Option<String>,
    pub asset_identifier: Option<String>,
    pub damage_time: Option<DateTime<Utc>>,
    pub reported_by: Option<String>,
    pub notes: Option<String>,
    pub container_number: Option<String>,
    pub id_trailer: Option<i64>,
    pub id_vehicle: Option<i64>,
    pub labels: Option<DamageLabels>,
}

pub struct AssetDamageProcessor {
    pool: PgPool,
    enrichment: Arc<dyn EnrichmentLookup>,
    errors: Arc<dyn ErrorIngestion>,
}

impl AssetDamageProcessor {
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

    fn label_tags(payload: &JsonValue) -> Vec<String> {
        payload
            .get("assetDamageLabels")
            .and_then(JsonValue::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|entry| get_string(entry, "assetDamageLabel"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pivot the tag array into the subtype's boolean columns. Tags with no
    /// column in the closed map raise `dmg_other`.
    pub fn pivot_labels(asset_type: &str, tags: &[String]) -> Option<DamageLabels> {
        match asset_type {
            "VEHICLE" => {
                let mut labels = VehicleDamageLabels::default();
                for tag in tags {
                    match VEHICLE_LABEL_MAP.iter().find(|(name, _)| *name == tag.as_str()) {
                        Some((_, VehicleLabel::Braking)) => labels.dmg_braking = true,
                        Some((_, VehicleLabel::Tyres)) => labels.dmg_tyres = true,
                        Some((_, VehicleLabel::Lights)) => labels.dmg_lights = true,
                        Some((_, VehicleLabel::Bodywork)) => labels.dmg_bodywork = true,
                        None => labels.dmg_other = true,
                    }
                }
                Some(DamageLabels::Vehicle(labels))
            }
            "TRAILER" => {
                let mut labels = TrailerDamageLabels::default();
                for tag in tags {
                    match TRAILER_LABEL_MAP.iter().find(|(name, _)| *name == tag.as_str()) {
                        Some((_, TrailerLabel::Axle)) => labels.dmg_axle = true,
                        Some((_, TrailerLabel::Tarpaulin)) => labels.dmg_tarpaulin = true,
                        Some((_, TrailerLabel::Floor)) => labels.dmg_floor = true,
                        Some((_, TrailerLabel::Doors)) => labels.dmg_doors = true,
                        None => labels.dmg_other = true,
                    }
                }
                Some(DamageLabels::Trailer(labels))
            }
            _ => None,
        }
    }

    pub fn build_damage(
        message: &EventMessage,
        payload: &JsonValue,
    ) -> Result<AssetDamage, ProcessError> {
        let id = get_i64(payload, "id")
            .ok_or_else(|| ProcessError::Payload("asset damage without numeric id".to_string()))?;
        let asset_type = get_string(payload, "assetType");
        let tags = Self::label_tags(payload);
        let labels = asset_type
            .as_deref()
            .and_then(|at| Self::pivot_labels(at, &tags));

        Ok(AssetDamage {
            id,
            message_id: message.message_id.clone(),
            asset_type,
            asset_identifier: get_string(payload, "assetIdentifier"),
            damage_time: parse_timestamp(payload, "damageTime"),
            reported_by: get_string(payload, "reportedBy"),
            notes: get_string(payload, "notes"),
            container_number: None,
            id_trailer: None,
            id_vehicle: None,
            labels,
        })
    }
}

#[async_trait]
impl ProcessorOps for AssetDamageProcessor {
    type Model = AssetDamage;

    fn processor_name(&self) -> &str {
        "asset-damages"
    }

    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool, ProcessError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM evt_asset_damages WHERE message_id = $1)",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Child label rows go first, then the parent.
    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, ProcessError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM evt_vehicle_damage_labels
            WHERE id_asset_damage IN (SELECT id FROM evt_asset_damages WHERE message_id = $1)
            "#,
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM evt_trailer_damage_labels
            WHERE id_asset_damage IN (SELECT id FROM evt_asset_damages WHERE message_id = $1)
            "#,
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        let done = sqlx::query("DELETE FROM evt_asset_damages WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    fn build_models(
        &self,
        message: &EventMessage,
        payload: &JsonValue,
    ) -> Result<Vec<AssetDamage>, ProcessError> {
        Ok(vec![Self::build_damage(message, payload)?])
    }

    fn apply_enrichment(&self, model: &mut AssetDamage, enrichment: &Enrichment) {
        model.container_number = enrichment.container_number.clone();
        model.id_trailer = enrichment.id_trailer;
        model.id_vehicle = enrichment.id_vehicle;
    }

    async fn save_models(&self, models: Vec<AssetDamage>) -> Result<(), ProcessError> {
        for damage in models {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO evt_asset_damages
                    (id, message_id, asset_type, asset_identifier, damage_time,
                     reported_by, notes, container_number, id_trailer, id_vehicle, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                "#,
            )
            .bind(damage.id)
            .bind(&damage.message_id)
            .bind(&damage.asset_type)
            .bind(&damage.asset_identifier)
            .bind(damage.damage_time)
            .bind(&damage.reported_by)
            .bind(&damage.notes)
            .bind(&damage.container_number)
            .bind(damage.id_trailer)
            .bind(damage.id_vehicle)
            .execute(&mut *tx)
            .await?;

            match &damage.labels {
                Some(DamageLabels::Vehicle(labels)) => {
                    sqlx::query(
                        r#"
                        INSERT INTO evt_vehicle_damage_labels
                            (id_asset_damage, dmg_braking, dmg_tyres, dmg_lights,
                             dmg_bodywork, dmg_other)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(damage.id)
                    .bind(labels.dmg_braking)
                    .bind(labels.dmg_tyres)
                    .bind(labels.dmg_lights)
                    .bind(labels.dmg_bodywork)
                    .bind(labels.dmg_other)
                    .execute(&mut *tx)
                    .await?;
                }
                Some(DamageLabels::Trailer(labels)) => {
                    sqlx::query(
                        r#"
                        INSERT INTO evt_trailer_damage_labels
                            (id_asset_damage, dmg_axle, dmg_tarpaulin, dmg_floor,
                             dmg_doors, dmg_other)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(damage.id)
                    .bind(labels.dmg_axle)
                    .bind(labels.dmg_tarpaulin)
                    .bind(labels.dmg_floor)
                    .bind(labels.dmg_doors)
                    .bind(labels.dmg_other)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {}
            }
            tx.commit().await?;
        }
        Ok(())
    }

    fn unit_number_from_payload(&self, payload: &JsonValue) -> Option<String> {
        get_string(payload, "assetIdentifier")
    }

    /// The asset type doubles as a synthetic unit type code: CONTAINER takes
    /// the container path, everything else the vehicle/trailer path.
    fn unit_type_code_from_payload(&self, payload: &JsonValue) -> Option<String> {
        get_string(payload, "assetType")
    }
}

#[async_trait]
impl StreamProcessor for AssetDamageProcessor {
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
