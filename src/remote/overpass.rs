use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::models::Coordinates;
use crate::remote::traits::RoadVerifier;

pub const DEFAULT_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";

/// Asks an Overpass API instance whether any drivable way or parking area
/// lies within a radius of the spot.
pub struct OverpassRoadVerifier {
    client: Client,
    endpoint: String,
    radius_m: f64,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<serde_json::Value>,
}

impl OverpassRoadVerifier {
    pub fn new(endpoint: &str, radius_m: f64, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("parking-scout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            radius_m,
        })
    }

    fn query(&self, coords: &Coordinates) -> String {
        let around = format!(
            "(around:{:.0},{:.6},{:.6})",
            self.radius_m, coords.latitude, coords.longitude
        );
        format!(
            "[out:json][timeout:10];(way{around}[highway];\
             way{around}[amenity=parking];node{around}[amenity=parking];);out ids 1;"
        )
    }
}

#[async_trait]
impl RoadVerifier for OverpassRoadVerifier {
    async fn is_near_road(&self, coords: &Coordinates) -> Result<bool> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("data", self.query(coords))])
            .send()
            .await
            .context("Failed to reach Overpass")?;

        if !response.status().is_success() {
            anyhow::bail!("Overpass returned {}", response.status());
        }

        let body: OverpassResponse = response
            .json()
            .await
            .context("Failed to decode Overpass response")?;
        debug!(
            "Overpass found {} ways near ({:.5}, {:.5})",
            body.elements.len(),
            coords.latitude,
            coords.longitude
        );
        Ok(!body.elements.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_shape() {
        let verifier =
            OverpassRoadVerifier::new(DEFAULT_ENDPOINT, 30.0, Duration::from_secs(5)).unwrap();
        let query = verifier.query(&Coordinates::new(59.3145, 18.0736).unwrap());
        assert!(query.starts_with("[out:json]"));
        assert!(query.contains("way(around:30,59.314500,18.073600)[highway]"));
        assert!(query.contains("[amenity=parking]"));
    }

    #[test]
    fn test_parse_response() {
        let empty: OverpassResponse = serde_json::from_str(r#"{"version":0.6}"#).unwrap();
        assert!(empty.elements.is_empty());
        let hit: OverpassResponse =
            serde_json::from_str(r#"{"elements":[{"type":"way","id":1}]}"#).unwrap();
        assert_eq!(hit.elements.len(), 1);
    }
}
