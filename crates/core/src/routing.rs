//! Routing/geocoding collaborator (out-of-scope per spec §1, narrow
//! interface only). `RoutingService` covers geocode/autocomplete/
//! directions; `OrsRoutingService` is the one concrete adapter, talking to
//! an OpenRouteService-compatible API over `reqwest` (grounded in
//! `hanibalsk-phone-manager-backend`'s `reqwest` client usage and
//! `foofork-riptidecrawler`'s timeout/retry shape).

use crate::cache::{keys, EphemeralStore, GEOCODE_TTL, ROUTING_TTL};
use crate::error::{AppError, AppResult};
use crate::geo::LatLng;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeHit {
    pub label: String,
    pub pos: LatLng,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directions {
    pub points: Vec<LatLng>,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn geocode(&self, query: &str) -> AppResult<GeocodeHit>;
    async fn autocomplete(
        &self,
        query: &str,
        limit: u32,
        country: Option<&str>,
    ) -> AppResult<Vec<GeocodeHit>>;
    /// `waypoints` must have at least two entries (origin..stops..destination).
    async fn directions(&self, profile: &str, waypoints: &[LatLng]) -> AppResult<Directions>;
}

pub struct OrsRoutingService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    cache: Arc<dyn EphemeralStore>,
}

const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);
const SINGLE_PAIR_TIMEOUT: Duration = Duration::from_secs(15);
const MULTI_WAYPOINT_TIMEOUT: Duration = Duration::from_secs(30);

impl OrsRoutingService {
    pub fn new(api_key: String, base_url: String, cache: Arc<dyn EphemeralStore>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url,
            cache,
        })
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> AppResult<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", &self.api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))
    }

    /// Single retry on 429/5xx/network error, 1s delay — directions only,
    /// per spec §5 timeout table.
    async fn post_json_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> AppResult<serde_json::Value> {
        for attempt in 0..2 {
            let result = self
                .client
                .post(url)
                .header("Authorization", &self.api_key)
                .json(body)
                .timeout(timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json()
                        .await
                        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()));
                }
                Ok(resp) if attempt == 0 && (resp.status().as_u16() == 429 || resp.status().is_server_error()) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Ok(resp) => {
                    return Err(AppError::UpstreamUnavailable(format!("status {}", resp.status())));
                }
                Err(e) if attempt == 0 => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _ = e;
                    continue;
                }
                Err(e) => return Err(AppError::UpstreamUnavailable(e.to_string())),
            }
        }
        Err(AppError::UpstreamUnavailable("retry exhausted".into()))
    }
}

#[async_trait]
impl RoutingService for OrsRoutingService {
    async fn geocode(&self, query: &str) -> AppResult<GeocodeHit> {
        let cache_key = keys::geocode(query);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(hit) = serde_json::from_value(cached) {
                return Ok(hit);
            }
        }
        let url = format!(
            "{}/geocode/search?text={}",
            self.base_url,
            urlencode(query)
        );
        let body = self.get_json(&url, GEOCODE_TIMEOUT).await?;
        let hit = first_feature_as_hit(&body)
            .ok_or_else(|| AppError::NotFound("no geocode results".into()))?;
        self.cache
            .set(&cache_key, serde_json::to_value(&hit).unwrap(), Some(GEOCODE_TTL))
            .await;
        Ok(hit)
    }

    async fn autocomplete(
        &self,
        query: &str,
        limit: u32,
        country: Option<&str>,
    ) -> AppResult<Vec<GeocodeHit>> {
        let cache_key = keys::autocomplete(query, country);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(hits) = serde_json::from_value(cached) {
                return Ok(hits);
            }
        }
        let mut url = format!(
            "{}/geocode/autocomplete?text={}&size={}",
            self.base_url,
            urlencode(query),
            limit
        );
        if let Some(cc) = country {
            url.push_str(&format!("&boundary.country={}", urlencode(cc)));
        }
        let body = self.get_json(&url, GEOCODE_TIMEOUT).await?;
        let hits = all_features_as_hits(&body);
        self.cache
            .set(&cache_key, serde_json::to_value(&hits).unwrap(), Some(GEOCODE_TTL))
            .await;
        Ok(hits)
    }

    async fn directions(&self, profile: &str, waypoints: &[LatLng]) -> AppResult<Directions> {
        if waypoints.len() < 2 {
            return Err(AppError::BadArgument(
                "directions needs at least 2 waypoints".into(),
            ));
        }
        let coords_key: String = waypoints
            .iter()
            .map(|p| format!("{:.6},{:.6}", p.lng, p.lat))
            .collect::<Vec<_>>()
            .join(";");
        let cache_key = keys::route_directions(profile, &coords_key);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(d) = serde_json::from_value(cached) {
                return Ok(d);
            }
        }

        let url = format!("{}/v2/directions/{}/geojson", self.base_url, profile);
        let body = serde_json::json!({
            "coordinates": waypoints.iter().map(|p| [p.lng, p.lat]).collect::<Vec<_>>(),
        });
        let timeout = if waypoints.len() > 2 {
            MULTI_WAYPOINT_TIMEOUT
        } else {
            SINGLE_PAIR_TIMEOUT
        };
        let resp = if waypoints.len() > 2 {
            self.post_json_with_retry(&url, &body, timeout).await?
        } else {
            self.client
                .post(&url)
                .header("Authorization", &self.api_key)
                .json(&body)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?
                .json()
                .await
                .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?
        };

        let directions = parse_directions(&resp)
            .ok_or_else(|| AppError::UpstreamUnavailable("unrecognized directions response".into()))?;
        self.cache
            .set(&cache_key, serde_json::to_value(&directions).unwrap(), Some(ROUTING_TTL))
            .await;
        Ok(directions)
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

fn first_feature_as_hit(body: &serde_json::Value) -> Option<GeocodeHit> {
    all_features_as_hits(body).into_iter().next()
}

fn all_features_as_hits(body: &serde_json::Value) -> Vec<GeocodeHit> {
    body.get("features")
        .and_then(|f| f.as_array())
        .map(|features| {
            features
                .iter()
                .filter_map(|f| {
                    let coords = f.get("geometry")?.get("coordinates")?.as_array()?;
                    let lng = coords.first()?.as_f64()?;
                    let lat = coords.get(1)?.as_f64()?;
                    let label = f
                        .get("properties")
                        .and_then(|p| p.get("label"))
                        .and_then(|l| l.as_str())
                        .unwrap_or("")
                        .to_string();
                    Some(GeocodeHit {
                        label,
                        pos: LatLng::new(lat, lng),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_directions(body: &serde_json::Value) -> Option<Directions> {
    let feature = body.get("features")?.as_array()?.first()?;
    let coords = feature.get("geometry")?.get("coordinates")?.as_array()?;
    let points = coords
        .iter()
        .filter_map(|c| {
            let arr = c.as_array()?;
            let lng = arr.first()?.as_f64()?;
            let lat = arr.get(1)?.as_f64()?;
            Some(LatLng::new(lat, lng))
        })
        .collect();
    let summary = feature.get("properties")?.get("summary")?;
    Some(Directions {
        points,
        distance_m: summary.get("distance").and_then(|v| v.as_f64()).unwrap_or(0.0),
        duration_s: summary.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feature_collection_into_hits() {
        let body = serde_json::json!({
            "features": [
                {"geometry": {"coordinates": [29.0, 41.0]}, "properties": {"label": "Istanbul"}}
            ]
        });
        let hits = all_features_as_hits(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "Istanbul");
        assert!((hits[0].pos.lat - 41.0).abs() < 1e-9);
    }

    #[test]
    fn parses_directions_summary() {
        let body = serde_json::json!({
            "features": [{
                "geometry": {"coordinates": [[29.0, 41.0], [29.1, 41.1]]},
                "properties": {"summary": {"distance": 1200.5, "duration": 180.0}}
            }]
        });
        let directions = parse_directions(&body).unwrap();
        assert_eq!(directions.points.len(), 2);
        assert!((directions.distance_m - 1200.5).abs() < 1e-9);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("foo-bar_1.2~3"), "foo-bar_1.2~3");
    }
}
