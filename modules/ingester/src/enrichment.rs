//! Catalogue lookups that augment typed rows with unit ids.
//!
//! Lookups are strictly best-effort: every transport or decode failure is
//! logged at warn and collapsed into an empty result so the enclosing save
//! still succeeds.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const CONTAINER_TYPE_CODE: &str = "CONTAINER";

/// Catalogue ids resolved for one identifier. All-`None` means the lookup
/// found nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub container_number: Option<String>,
    pub id_trailer: Option<i64>,
    pub id_vehicle: Option<i64>,
}

#[async_trait]
pub trait EnrichmentLookup: Send + Sync {
    async fn lookup(&self, identifier: &str, type_code: Option<&str>) -> Enrichment;
}

/// Disabled lookup; every call resolves to the empty result.
pub struct NoEnrichment;

#[async_trait]
impl EnrichmentLookup for NoEnrichment {
    async fn lookup(&self, _identifier: &str, _type_code: Option<&str>) -> Enrichment {
        Enrichment::default()
    }
}

#[derive(Debug, Deserialize)]
struct UnitSearchResult {
    id: Option<i64>,
    #[serde(rename = "unitType")]
    unit_type: Option<String>,
    cassa: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VehicleByPlateResponse {
    status: Option<String>,
    data: Option<VehicleByPlateData>,
}

#[derive(Debug, Deserialize)]
struct VehicleByPlateData {
    id_vehicle: Option<i64>,
}

/// HTTP client against the unit catalogue.
pub struct EnrichmentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EnrichmentClient {
    pub fn new(
        base_url: String,
        api_key: String,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Container identifiers are stored in the catalogue in a starred form;
    /// the rules are exact and ordered.
    ///
    /// - `GBTU` + >=2 digits: strip leading zeros from the digit body
    ///   (keeping the last two digits when fewer remain), then separate the
    ///   final digit with a dot: `GBTU0281810` -> `GBTU*28181.0`.
    /// - `BRND` + digits: strip leading zeros: `BRND000123` -> `BRND*123`
    ///   (`BRND*0` when all zeros).
    /// - anything else: unchanged.
    pub fn normalize_container_identifier(raw: &str) -> String {
        if let Some(body) = raw.strip_prefix("GBTU") {
            if body.len() >= 2 && body.bytes().all(|b| b.is_ascii_digit()) {
                let stripped = body.trim_start_matches('0');
                let kept = if stripped.len() >= 2 {
                    stripped
                } else {
                    &body[body.len() - 2..]
                };
                let (head, last) = kept.split_at(kept.len() - 1);
                return format!("GBTU*{head}.{last}");
            }
        }
        if let Some(body) = raw.strip_prefix("BRND") {
            if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
                let stripped = body.trim_start_matches('0');
                let body = if stripped.is_empty() { "0" } else { stripped };
                return format!("BRND*{body}");
            }
        }
        raw.to_string()
    }

    async fn search_units(
        &self,
        q: &str,
        include_vehicles: bool,
    ) -> Result<Vec<UnitSearchResult>, reqwest::Error> {
        let mut query: Vec<(&str, &str)> = vec![("q", q), ("limit", "1")];
        if include_vehicles {
            query.push(("includeVehicles", "true"));
        }
        self.http
            .get(format!("{}/api/units/search", self.base_url))
            .query(&query)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn vehicle_by_plate(&self, plate: &str) -> Result<Option<i64>, reqwest::Error> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .unwrap_or_else(|_| reqwest::Url::parse("http://localhost").unwrap());
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(["api", "vehicles", "by-plate", plate]);
        }
        let response: VehicleByPlateResponse = self
            .http
            .get(url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status.as_deref() == Some("success") {
            Ok(response.data.and_then(|d| d.id_vehicle))
        } else {
            Ok(None)
        }
    }

    async fn lookup_container(&self, identifier: &str) -> Result<Enrichment, reqwest::Error> {
        let q = Self::normalize_container_identifier(identifier);
        let results = self.search_units(&q, false).await?;
        let mut enrichment = Enrichment::default();
        if let Some(first) = results.first() {
            if first.unit_type.as_deref() == Some("c") {
                enrichment.container_number = first.cassa.clone();
            }
        }
        Ok(enrichment)
    }

    async fn lookup_non_container(&self, identifier: &str) -> Result<Enrichment, reqwest::Error> {
        let results = self.search_units(identifier, true).await?;
        match results.first() {
            Some(first) if first.unit_type.as_deref() == Some("t") => Ok(Enrichment {
                id_trailer: first.id,
                ..Enrichment::default()
            }),
            Some(first) if first.unit_type.as_deref() == Some("v") => Ok(Enrichment {
                id_vehicle: first.id,
                ..Enrichment::default()
            }),
            _ => {
                // Not in the unit catalogue: try the vehicle registry.
                let id_vehicle = self.vehicle_by_plate(identifier).await?;
                Ok(Enrichment {
                    id_vehicle,
                    ..Enrichment::default()
                })
            }
        }
    }
}

#[async_trait]
impl EnrichmentLookup for EnrichmentClient {
    async fn lookup(&self, identifier: &str, type_code: Option<&str>) -> Enrichment {
        let result = if type_code == Some(CONTAINER_TYPE_CODE) {
            self.lookup_container(identifier).await
        } else {
            self.lookup_non_container(identifier).await
        };
        match result {
            Ok(enrichment) => enrichment,
            Err(e) => {
                tracing::warn!(
                    identifier = %identifier,
                    type_code = ?type_code,
                    error = %e,
                    "Enrichment lookup failed, continuing without catalogue ids"
                );
                Enrichment::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_normalize_gbtu_strips_zeros_and_dots_last_digit() {
        assert_eq!(
            EnrichmentClient::normalize_container_identifier("GBTU0281810"),
            "GBTU*28181.0"
        );
        assert_eq!(
            EnrichmentClient::normalize_container_identifier("GBTU123456"),
            "GBTU*12345.6"
        );
    }

    #[test]
    fn test_normalize_gbtu_keeps_last_two_when_stripped_short() {
        assert_eq!(
            EnrichmentClient::normalize_container_identifier("GBTU000005"),
            "GBTU*0.5"
        );
    }

    #[test]
    fn test_normalize_brnd() {
        assert_eq!(
            EnrichmentClient::normalize_container_identifier("BRND000123"),
            "BRND*123"
        );
        assert_eq!(EnrichmentClient::normalize_container_identifier("BRND000"), "BRND*0");
    }

    #[test]
    fn test_normalize_other_identifiers_unchanged() {
        assert_eq!(EnrichmentClient::normalize_container_identifier("MSCU1234567"), "MSCU1234567");
        assert_eq!(EnrichmentClient::normalize_container_identifier("GBTUX1"), "GBTUX1");
        assert_eq!(EnrichmentClient::normalize_container_identifier("GBTU5"), "GBTU5");
    }

    fn client(base: &str) -> EnrichmentClient {
        EnrichmentClient::new(
            base.to_string(),
            "test-key".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_container_lookup_uses_normalized_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .and(query_param("q", "GBTU*28181.0"))
            .and(query_param("limit", "1"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "unitType": "c", "cassa": "GBTU*28181.0"}
            ])))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri())
            .lookup("GBTU0281810", Some(CONTAINER_TYPE_CODE))
            .await;
        assert_eq!(enrichment.container_number.as_deref(), Some("GBTU*28181.0"));
        assert_eq!(enrichment.id_vehicle, None);
    }

    #[tokio::test]
    async fn test_container_lookup_ignores_non_container_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .and(query_param("q", "BRND*123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 9, "unitType": "t", "cassa": null}
            ])))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri())
            .lookup("BRND000123", Some(CONTAINER_TYPE_CODE))
            .await;
        assert_eq!(enrichment, Enrichment::default());
    }

    #[tokio::test]
    async fn test_vehicle_lookup_maps_unit_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .and(query_param("q", "AB123CD"))
            .and(query_param("includeVehicles", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 7, "unitType": "v"}
            ])))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri()).lookup("AB123CD", None).await;
        assert_eq!(enrichment.id_vehicle, Some(7));
        assert_eq!(enrichment.id_trailer, None);
    }

    #[tokio::test]
    async fn test_empty_search_falls_back_to_by_plate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vehicles/by-plate/AB123CD"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"id_vehicle": 9}
            })))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri()).lookup("AB123CD", None).await;
        assert_eq!(enrichment.id_vehicle, Some(9));
    }

    #[tokio::test]
    async fn test_by_plate_failure_status_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vehicles/by-plate/ZZ000AA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error"
            })))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri()).lookup("ZZ000AA", None).await;
        assert_eq!(enrichment, Enrichment::default());
    }

    #[tokio::test]
    async fn test_transport_error_downgrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/units/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let enrichment = client(&server.uri())
            .lookup("TEST001", Some(CONTAINER_TYPE_CODE))
            .await;
        assert_eq!(enrichment, Enrichment::default());
    }
}
