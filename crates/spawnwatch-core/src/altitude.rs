//! Ground altitude resolution.
//!
//! Altitudes come from an external elevation service. The registry keeps a
//! memo of every answer keyed by a coarse [`RoundedPoint`]; this module only
//! knows how to ask.
//!
//! Uses enum dispatch instead of a trait object because async methods are
//! not dyn-compatible. [`AltitudeSource::Http`] talks to an elevation web
//! API; [`AltitudeSource::Static`] answers from a fixed table and serves
//! offline runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use spawnwatch_types::Coordinate;

use crate::config::{ElevationConfig, SurveyBounds};
use crate::geo::{GridError, RoundedPoint, grid_points, round_coordinate};

/// Errors produced while resolving an altitude.
///
/// A failed lookup is always surfaced to the caller. It is never cached and
/// never replaced by a placeholder altitude.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The HTTP request could not be sent or timed out.
    #[error("elevation request failed: {0}")]
    Request(String),

    /// The service answered with a non-success HTTP status.
    #[error("elevation service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The service answered but the payload was unusable.
    #[error("malformed elevation response: {0}")]
    MalformedResponse(String),

    /// The survey area cannot be swept.
    #[error("invalid survey grid: {0}")]
    Grid(#[from] GridError),

    /// A static table has no entry for the requested point.
    #[error("no altitude known for {0}")]
    UnknownPoint(RoundedPoint),
}

/// A source of ground altitudes.
pub enum AltitudeSource {
    /// Elevation web API.
    Http(HttpAltitudeResolver),
    /// Fixed lookup table.
    Static(StaticAltitudes),
}

impl AltitudeSource {
    /// Resolve the altitude of a single point, in meters.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] if the point cannot be resolved.
    pub async fn resolve(&self, point: Coordinate) -> Result<f64, LookupError> {
        match self {
            Self::Http(resolver) => resolver.resolve(point).await,
            Self::Static(table) => table.resolve(point),
        }
    }

    /// Resolve altitudes for a whole survey area in one sweep.
    ///
    /// Used to seed an empty altitude cache so a cold start does not issue
    /// one request per point.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] if any batch of the sweep fails.
    pub async fn resolve_bulk(&self) -> Result<Vec<(Coordinate, f64)>, LookupError> {
        match self {
            Self::Http(resolver) => resolver.resolve_bulk().await,
            Self::Static(table) => Ok(table.entries()),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Static(_) => "static",
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP elevation API
// ---------------------------------------------------------------------------

/// Resolver backed by an elevation web API.
///
/// Sends `GET {api_url}?locations=lat,lon|lat,lon&key={api_key}` and reads
/// `results[i].elevation` from the JSON answer.
pub struct HttpAltitudeResolver {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    batch_size: usize,
    max_grid_points: u64,
    bounds: SurveyBounds,
    grid_precision: u8,
}

impl HttpAltitudeResolver {
    /// Create a resolver from configuration.
    ///
    /// `grid_precision` is the rounding used for altitude cache keys; the
    /// bulk sweep visits every grid point at that precision.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Request`] if the HTTP client cannot be built.
    pub fn new(config: &ElevationConfig, grid_precision: u8) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LookupError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            batch_size: config.batch_size.max(1),
            max_grid_points: config.max_grid_points,
            bounds: config.bounds,
            grid_precision,
        })
    }

    async fn resolve(&self, point: Coordinate) -> Result<f64, LookupError> {
        let altitudes = self.request(&[point]).await?;
        altitudes.first().copied().ok_or_else(|| {
            LookupError::MalformedResponse("response contained no results".to_owned())
        })
    }

    async fn resolve_bulk(&self) -> Result<Vec<(Coordinate, f64)>, LookupError> {
        if self.bounds.is_empty() {
            return Ok(Vec::new());
        }

        let mut grid = grid_points(
            Coordinate::new(self.bounds.south, self.bounds.west),
            Coordinate::new(self.bounds.north, self.bounds.east),
            self.grid_precision,
            self.max_grid_points,
        )?
        .map(|point| point.to_coordinate());
        tracing::info!(
            points = grid.size_hint().0,
            batch_size = self.batch_size,
            "Starting bulk altitude sweep"
        );

        let mut resolved = Vec::with_capacity(grid.size_hint().0);
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            batch.clear();
            batch.extend(grid.by_ref().take(self.batch_size));
            if batch.is_empty() {
                break;
            }
            let altitudes = self.request(&batch).await?;
            resolved.extend(batch.iter().copied().zip(altitudes));
        }

        tracing::info!(points = resolved.len(), "Bulk altitude sweep finished");
        Ok(resolved)
    }

    /// Request altitudes for `points`, returned in the same order.
    async fn request(&self, points: &[Coordinate]) -> Result<Vec<f64>, LookupError> {
        let locations = points
            .iter()
            .map(|p| format!("{},{}", p.lat, p.lon))
            .collect::<Vec<_>>()
            .join("|");

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("locations", locations.as_str()), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| LookupError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(LookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ElevationResponse = response
            .json()
            .await
            .map_err(|e| LookupError::MalformedResponse(e.to_string()))?;

        payload.into_altitudes(points.len())
    }
}

#[derive(Debug, Deserialize)]
struct ElevationResponse {
    status: String,
    #[serde(default)]
    results: Vec<ElevationResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ElevationResult {
    elevation: f64,
}

impl ElevationResponse {
    fn into_altitudes(self, expected: usize) -> Result<Vec<f64>, LookupError> {
        if self.status != "OK" {
            return Err(LookupError::MalformedResponse(format!(
                "status {}: {}",
                self.status,
                self.error_message.unwrap_or_default()
            )));
        }
        if self.results.len() != expected {
            return Err(LookupError::MalformedResponse(format!(
                "expected {expected} results, got {}",
                self.results.len()
            )));
        }
        Ok(self.results.into_iter().map(|r| r.elevation).collect())
    }
}

// ---------------------------------------------------------------------------
// Static table
// ---------------------------------------------------------------------------

/// Resolver answering from a fixed table of rounded points.
///
/// Points missing from the table fail with [`LookupError::UnknownPoint`].
/// Counts every single-point lookup so callers can verify memoization.
#[derive(Debug, Default)]
pub struct StaticAltitudes {
    precision: u8,
    table: HashMap<RoundedPoint, f64>,
    lookups: AtomicU64,
}

impl StaticAltitudes {
    /// Create an empty table keyed at `precision` decimal digits.
    pub fn new(precision: u8) -> Self {
        Self {
            precision,
            table: HashMap::new(),
            lookups: AtomicU64::new(0),
        }
    }

    /// Add an entry for the grid cell containing `point`.
    #[must_use]
    pub fn with(mut self, point: Coordinate, altitude: f64) -> Self {
        self.table
            .insert(round_coordinate(point, self.precision), altitude);
        self
    }

    /// Number of single-point lookups served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn resolve(&self, point: Coordinate) -> Result<f64, LookupError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let key = round_coordinate(point, self.precision);
        self.table
            .get(&key)
            .copied()
            .ok_or(LookupError::UnknownPoint(key))
    }

    fn entries(&self) -> Vec<(Coordinate, f64)> {
        self.table
            .iter()
            .map(|(point, altitude)| (point.to_coordinate(), *altitude))
            .collect()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Answers one connection per canned `(status, body)` and returns the
    /// request lines it received.
    async fn canned_server(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/elevation", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut chunk = [0_u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = stream.read(&mut chunk).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    head.extend_from_slice(&chunk[..read]);
                }
                let head = String::from_utf8_lossy(&head);
                seen.push(head.lines().next().unwrap_or_default().to_owned());

                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (url, handle)
    }

    fn ok_body(altitudes: &[f64]) -> String {
        let results: Vec<String> = altitudes
            .iter()
            .map(|a| format!(r#"{{"elevation":{a}}}"#))
            .collect();
        format!(r#"{{"status":"OK","results":[{}]}}"#, results.join(","))
    }

    /// A resolver built from `config` that never goes through a proxy.
    fn local_resolver(config: &ElevationConfig, grid_precision: u8) -> HttpAltitudeResolver {
        let mut resolver = HttpAltitudeResolver::new(config, grid_precision).unwrap();
        resolver.client = reqwest::Client::builder().no_proxy().build().unwrap();
        resolver
    }

    fn http_config(api_url: String) -> ElevationConfig {
        ElevationConfig {
            api_url,
            api_key: "secret".to_owned(),
            batch_size: 4,
            ..ElevationConfig::default()
        }
    }

    /// 2 rows x 3 columns at two decimal digits.
    const SIX_POINTS: SurveyBounds = SurveyBounds {
        south: 10.0,
        west: 20.0,
        north: 10.01,
        east: 20.02,
    };

    #[tokio::test]
    async fn http_resolver_sends_locations_and_key() {
        let (url, server) = canned_server(vec![(200, ok_body(&[56.0]))]).await;
        let source = AltitudeSource::Http(local_resolver(&http_config(url), 3));
        assert_eq!(source.name(), "http");

        let altitude = source.resolve(Coordinate::new(47.5, -122.25)).await.unwrap();
        assert_eq!(altitude, 56.0);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("GET /elevation?"));
        assert!(requests[0].contains("locations=47.5%2C-122.25"));
        assert!(requests[0].contains("key=secret"));
    }

    #[tokio::test]
    async fn http_resolver_maps_error_status() {
        let (url, server) = canned_server(vec![(503, "overloaded".to_owned())]).await;
        let resolver = local_resolver(&http_config(url), 3);

        let result = resolver.resolve(Coordinate::new(1.0, 2.0)).await;
        match result {
            Err(LookupError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_bulk_sweep_batches_the_grid() {
        let (url, server) = canned_server(vec![
            (200, ok_body(&[1.0, 2.0, 3.0, 4.0])),
            (200, ok_body(&[5.0, 6.0])),
        ])
        .await;
        let config = ElevationConfig {
            bounds: SIX_POINTS,
            ..http_config(url)
        };
        let source = AltitudeSource::Http(local_resolver(&config, 2));

        let resolved = source.resolve_bulk().await.unwrap();
        let altitudes: Vec<f64> = resolved.iter().map(|(_, a)| *a).collect();
        assert_eq!(altitudes, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let (first, _) = resolved[0];
        assert!((first.lat - 10.0).abs() < 1e-9 && (first.lon - 20.0).abs() < 1e-9);
        let (last, _) = resolved[5];
        assert!((last.lat - 10.01).abs() < 1e-9 && (last.lon - 20.02).abs() < 1e-9);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].matches("%7C").count(), 3);
        assert_eq!(requests[1].matches("%7C").count(), 1);
    }

    #[tokio::test]
    async fn http_bulk_sweep_fails_on_short_batch() {
        let (url, server) = canned_server(vec![(200, ok_body(&[1.0, 2.0]))]).await;
        let config = ElevationConfig {
            bounds: SIX_POINTS,
            ..http_config(url)
        };
        let resolver = local_resolver(&config, 2);

        let result = resolver.resolve_bulk().await;
        assert!(matches!(result, Err(LookupError::MalformedResponse(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_bulk_sweep_rejects_oversized_area() {
        let config = ElevationConfig {
            bounds: SIX_POINTS,
            max_grid_points: 5,
            ..http_config("http://127.0.0.1:1/elevation".to_owned())
        };
        let resolver = local_resolver(&config, 2);

        let result = resolver.resolve_bulk().await;
        assert!(matches!(
            result,
            Err(LookupError::Grid(GridError::TooLarge {
                points: 6,
                limit: 5
            }))
        ));
    }

    #[tokio::test]
    async fn static_table_resolves_by_grid_cell() {
        let source = AltitudeSource::Static(
            StaticAltitudes::new(3).with(Coordinate::new(47.6062, -122.3321), 56.0),
        );
        let altitude = source.resolve(Coordinate::new(47.60619, -122.33208)).await;
        assert_eq!(altitude.unwrap(), 56.0);
    }

    #[tokio::test]
    async fn static_table_reports_unknown_points() {
        let source = AltitudeSource::Static(StaticAltitudes::new(3));
        let result = source.resolve(Coordinate::new(1.0, 1.0)).await;
        assert!(matches!(result, Err(LookupError::UnknownPoint(_))));
    }

    #[tokio::test]
    async fn static_bulk_returns_all_entries() {
        let source = AltitudeSource::Static(
            StaticAltitudes::new(2)
                .with(Coordinate::new(1.0, 1.0), 10.0)
                .with(Coordinate::new(2.0, 2.0), 20.0),
        );
        let entries = source.resolve_bulk().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(source.name(), "static");
    }

    #[test]
    fn elevation_response_parses_ok_payload() {
        let json = r#"{"status":"OK","results":[{"elevation":12.5,"location":{"lat":1.0,"lng":2.0}}]}"#;
        let payload: ElevationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(payload.into_altitudes(1).unwrap(), vec![12.5]);
    }

    #[test]
    fn elevation_response_rejects_error_status() {
        let json = r#"{"status":"REQUEST_DENIED","error_message":"bad key","results":[]}"#;
        let payload: ElevationResponse = serde_json::from_str(json).unwrap();
        let err = payload.into_altitudes(1).unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn elevation_response_rejects_short_results() {
        let json = r#"{"status":"OK","results":[]}"#;
        let payload: ElevationResponse = serde_json::from_str(json).unwrap();
        assert!(payload.into_altitudes(2).is_err());
    }
}
