use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const USER_AGENT: &str = concat!("geocode-cache/", env!("CARGO_PKG_VERSION"));

pub const NOTE_ZIP_CENTROID: &str = "zip_centroid";
pub const NOTE_GEOCODER: &str = "geocoder";

/// One answer from an external geocoder. Coordinates are optional because
/// providers occasionally return candidates without a usable position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeCandidate {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub display_name: Option<String>,
    /// Administrative region (state) reported by the provider.
    pub region: Option<String>,
    pub note: Option<String>,
}

impl GeocodeCandidate {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.lat?, self.lon?))
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// An empty list is a miss. Errors are transport or provider failures.
    async fn geocode(&self, address: &str) -> AppResult<Vec<GeocodeCandidate>>;
}

/// How often and how patiently a failed geocoder request is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.geocoder_max_attempts,
            Duration::from_millis(config.geocoder_backoff_base_ms),
            Duration::from_millis(config.geocoder_backoff_max_ms),
        )
    }

    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    /// Ceiling for the pause after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1 << doublings)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Pause drawn from the upper half of the ceiling. `spread` is clamped to `0..=1`.
    pub fn delay(&self, attempt: u32, spread: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        half + half.mul_f64(spread.clamp(0.0, 1.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Paced, retrying front for a [`Geocoder`].
#[derive(Clone)]
pub struct GeocoderService {
    inner: Arc<dyn Geocoder>,
    pacer: Arc<RequestPacer>,
    retry: RetryPolicy,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl GeocoderService {
    pub fn from_config(config: &AppConfig) -> Self {
        let nominatim = NominatimGeocoder::new(config);
        let inner: Arc<dyn Geocoder> = match config.mapbox_token.clone() {
            Some(token) => Arc::new(FallbackGeocoder::new(
                MapboxGeocoder::new(config, token),
                nominatim,
            )),
            None => Arc::new(nominatim),
        };
        Self::from_geocoder(inner, config.geocoder_rate_limit_qps, config.geocoder_max_attempts)
            .with_retry_policy(RetryPolicy::from_config(config))
    }

    pub fn from_geocoder(inner: Arc<dyn Geocoder>, qps: u32, max_attempts: u32) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            inner,
            pacer: Arc::new(RequestPacer::new(qps)),
            retry: RetryPolicy::new(max_attempts, defaults.base, defaults.cap),
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_rate_limit(&self, qps: u32) {
        self.pacer.set_qps(qps);
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.pacer.qps()
    }

    pub async fn lookup(&self, address: &str) -> AppResult<Vec<GeocodeCandidate>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.pacer.ready().await;
            let err = match self.inner.geocode(address).await {
                Ok(candidates) => {
                    debug!(
                        target: "geocoder",
                        attempt,
                        candidates = candidates.len(),
                        "geocoder answered"
                    );
                    return Ok(candidates);
                }
                Err(err) => err,
            };
            if attempt >= self.retry.max_attempts {
                warn!(target: "geocoder", ?err, attempt, "geocoder gave up");
                return Err(err);
            }
            let spread = self.jitter_rng.lock().gen::<f64>();
            let pause = self.retry.delay(attempt, spread);
            warn!(
                target: "geocoder",
                ?err,
                attempt,
                pause_ms = pause.as_millis() as u64,
                "geocoder request failed"
            );
            sleep(pause).await;
        }
    }
}

/// Spaces requests at least `1 / qps` apart. Each caller reserves the next free
/// slot and sleeps outside the lock, so waiters queue in arrival order.
struct RequestPacer {
    qps: AtomicU32,
    next_slot: AsyncMutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(qps: u32) -> Self {
        Self {
            qps: AtomicU32::new(qps.max(1)),
            next_slot: AsyncMutex::new(None),
        }
    }

    fn set_qps(&self, qps: u32) {
        self.qps.store(qps.max(1), Ordering::Relaxed);
    }

    fn qps(&self) -> u32 {
        self.qps.load(Ordering::Relaxed)
    }

    fn spacing(&self) -> Duration {
        Duration::from_secs(1) / self.qps()
    }

    async fn ready(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |reserved| reserved.max(now));
            *next = Some(slot + self.spacing());
            slot
        };
        sleep_until(slot).await;
    }
}

/// Tries `primary`, then `fallback` when the primary errors or finds nothing.
pub struct FallbackGeocoder<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackGeocoder<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: Geocoder, F: Geocoder> Geocoder for FallbackGeocoder<P, F> {
    async fn geocode(&self, address: &str) -> AppResult<Vec<GeocodeCandidate>> {
        match self.primary.geocode(address).await {
            Ok(candidates) if !candidates.is_empty() => Ok(candidates),
            Ok(_) => {
                debug!(target: "geocoder", "primary geocoder found nothing; trying fallback");
                self.fallback.geocode(address).await
            }
            Err(err) => {
                warn!(
                    target: "geocoder",
                    ?err,
                    "primary geocoder failed; falling back"
                );
                self.fallback.geocode(address).await
            }
        }
    }
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .build()
        .expect("geocoder http client")
}

pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
    contact: Option<String>,
    country_codes: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: http_client(config.geocoder_timeout_secs),
            base_url: config.geocoder_base_url.clone(),
            contact: config.geocoder_contact.clone(),
            country_codes: config.geocoder_country_codes.clone(),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<Vec<GeocodeCandidate>> {
        #[derive(Deserialize)]
        struct Place {
            lat: Option<String>,
            lon: Option<String>,
            display_name: Option<String>,
            addresstype: Option<String>,
            #[serde(rename = "type")]
            kind: Option<String>,
            address: Option<PlaceAddress>,
        }

        #[derive(Deserialize)]
        struct PlaceAddress {
            state: Option<String>,
            state_district: Option<String>,
        }

        let mut query: Vec<(&str, &str)> = vec![
            ("q", address),
            ("format", "jsonv2"),
            ("addressdetails", "1"),
            ("limit", "1"),
        ];
        if let Some(codes) = self.country_codes.as_deref() {
            query.push(("countrycodes", codes));
        }
        if let Some(contact) = self.contact.as_deref() {
            query.push(("email", contact));
        }

        let places: Vec<Place> = self
            .http
            .get(&self.base_url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(places
            .into_iter()
            .map(|place| {
                let is_postcode = [place.addresstype.as_deref(), place.kind.as_deref()]
                    .into_iter()
                    .flatten()
                    .any(|kind| kind == "postcode");
                GeocodeCandidate {
                    lat: place.lat.as_deref().map(parse_coordinate),
                    lon: place.lon.as_deref().map(parse_coordinate),
                    display_name: place.display_name,
                    region: place
                        .address
                        .and_then(|address| address.state.or(address.state_district)),
                    note: Some(note_for(is_postcode)),
                }
            })
            .collect())
    }
}

fn note_for(is_postcode: bool) -> String {
    let note = if is_postcode {
        NOTE_ZIP_CENTROID
    } else {
        NOTE_GEOCODER
    };
    note.to_string()
}

/// Unparsable text becomes NaN so the caller rejects it as invalid coordinates
/// instead of treating the candidate as absent.
fn parse_coordinate(value: &str) -> f64 {
    value.trim().parse::<f64>().unwrap_or(f64::NAN)
}

pub struct MapboxGeocoder {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    country_codes: Option<String>,
}

impl MapboxGeocoder {
    pub fn new(config: &AppConfig, token: SecretString) -> Self {
        Self {
            http: http_client(config.geocoder_timeout_secs),
            base_url: config.mapbox_base_url.trim_end_matches('/').to_string(),
            token,
            country_codes: config.geocoder_country_codes.clone(),
        }
    }
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<Vec<GeocodeCandidate>> {
        #[derive(Deserialize)]
        struct Response {
            features: Option<Vec<Feature>>,
        }

        #[derive(Deserialize)]
        struct Feature {
            center: Option<Vec<f64>>,
            place_name: Option<String>,
            place_type: Option<Vec<String>>,
            context: Option<Vec<ContextItem>>,
        }

        #[derive(Deserialize)]
        struct ContextItem {
            id: Option<String>,
            text: Option<String>,
        }

        let mut url = reqwest::Url::parse(&format!(
            "{}/geocoding/v5/mapbox.places/",
            self.base_url
        ))
        .map_err(|err| AppError::Config(format!("invalid mapbox base url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("mapbox base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(&format!("{address}.json"));

        let mut query: Vec<(&str, &str)> = vec![
            ("access_token", self.token.expose_secret()),
            ("limit", "1"),
            ("language", "de"),
        ];
        if let Some(codes) = self.country_codes.as_deref() {
            query.push(("country", codes));
        }

        let response: Response = self
            .http
            .get(url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .features
            .unwrap_or_default()
            .into_iter()
            .map(|feature| {
                let (lon, lat) = match feature.center.as_deref() {
                    Some([lon, lat, ..]) => (Some(*lon), Some(*lat)),
                    _ => (None, None),
                };
                let is_postcode = feature
                    .place_type
                    .unwrap_or_default()
                    .iter()
                    .any(|kind| kind == "postcode");
                let region = feature.context.unwrap_or_default().into_iter().find_map(|item| {
                    item.id
                        .filter(|id| id.starts_with("region."))
                        .and(item.text)
                });
                GeocodeCandidate {
                    lat,
                    lon,
                    display_name: feature.place_name,
                    region,
                    note: Some(note_for(is_postcode)),
                }
            })
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    use super::testing::{candidate, ScriptedGeocoder};
    use super::*;

    fn config_for(server: &Server) -> AppConfig {
        AppConfig {
            geocoder_base_url: server.url_str("/search"),
            mapbox_base_url: server.url_str(""),
            geocoder_contact: Some("ops@example.org".into()),
            geocoder_rate_limit_qps: 20,
            geocoder_timeout_secs: 5,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn nominatim_parses_candidates() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("q", "Altmarkt 1, Dresden")))),
                request::query(url_decoded(contains(("format", "jsonv2")))),
                request::query(url_decoded(contains(("countrycodes", "de")))),
                request::query(url_decoded(contains(("email", "ops@example.org")))),
            ])
            .respond_with(json_encoded(json!([{
                "lat": "51.0504",
                "lon": "13.7373",
                "display_name": "Altmarkt, Dresden",
                "addresstype": "road",
                "type": "residential",
                "address": {"state": "Sachsen"}
            }]))),
        );

        let geocoder = NominatimGeocoder::new(&config_for(&server));
        let candidates = geocoder.geocode("Altmarkt 1, Dresden").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].coordinates(), Some((51.0504, 13.7373)));
        assert_eq!(candidates[0].region.as_deref(), Some("Sachsen"));
        assert_eq!(candidates[0].note.as_deref(), Some(NOTE_GEOCODER));
    }

    #[tokio::test]
    async fn nominatim_flags_postcode_centroids_and_bad_numbers() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search")).respond_with(
                json_encoded(json!([
                    {"lat": "51.0", "lon": "13.7", "addresstype": "postcode"},
                    {"lat": "n/a", "lon": "13.7", "type": "house"}
                ])),
            ),
        );

        let geocoder = NominatimGeocoder::new(&config_for(&server));
        let candidates = geocoder.geocode("01067").await.unwrap();
        assert_eq!(candidates[0].note.as_deref(), Some(NOTE_ZIP_CENTROID));
        assert_eq!(candidates[0].region, None);
        assert!(candidates[1].lat.unwrap().is_nan());
    }

    #[tokio::test]
    async fn nominatim_surfaces_http_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .respond_with(status_code(503)),
        );
        let geocoder = NominatimGeocoder::new(&config_for(&server));
        assert!(matches!(
            geocoder.geocode("Altmarkt 1").await,
            Err(AppError::Http(_))
        ));
    }

    #[tokio::test]
    async fn mapbox_reads_center_and_region() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path(matches("^/geocoding/v5/mapbox.places/.*\\.json$")),
                request::query(url_decoded(contains(("access_token", "pk.test")))),
            ])
            .respond_with(json_encoded(json!({
                "features": [{
                    "center": [13.7373, 51.0504],
                    "place_name": "Altmarkt 1, 01067 Dresden, Deutschland",
                    "place_type": ["address"],
                    "context": [
                        {"id": "postcode.1", "text": "01067"},
                        {"id": "region.2", "text": "Sachsen"}
                    ]
                }]
            }))),
        );

        let config = config_for(&server);
        let geocoder = MapboxGeocoder::new(&config, SecretString::from("pk.test".to_string()));
        let candidates = geocoder.geocode("Altmarkt 1, Dresden").await.unwrap();
        assert_eq!(candidates[0].coordinates(), Some((51.0504, 13.7373)));
        assert_eq!(candidates[0].region.as_deref(), Some("Sachsen"));
        assert_eq!(candidates[0].note.as_deref(), Some(NOTE_GEOCODER));
    }

    #[tokio::test]
    async fn fallback_used_on_error_or_empty() {
        let primary = ScriptedGeocoder::new(vec![
            Ok(Vec::new()),
            Err(AppError::Geocoder("down".into())),
        ]);
        let fallback = ScriptedGeocoder::new(vec![
            Ok(vec![candidate(51.0, 13.0, None)]),
            Ok(vec![candidate(52.0, 13.0, None)]),
        ]);
        let geocoder = FallbackGeocoder::new(primary, fallback);

        let first = geocoder.geocode("x").await.unwrap();
        assert_eq!(first[0].lat, Some(52.0));
        let second = geocoder.geocode("x").await.unwrap();
        assert_eq!(second[0].lat, Some(51.0));
        assert_eq!(geocoder.primary.calls(), 2);
        assert_eq!(geocoder.fallback.calls(), 2);
    }

    #[tokio::test]
    async fn retries_before_succeeding() {
        let scripted = Arc::new(ScriptedGeocoder::new(vec![
            Ok(vec![candidate(51.0, 13.0, Some("Sachsen"))]),
            Err(AppError::Geocoder("transient".into())),
        ]));
        let mut service = GeocoderService::from_geocoder(scripted.clone(), 20, 3);
        service.jitter_rng = Arc::new(Mutex::new(StdRng::seed_from_u64(7)));

        let candidates = service.lookup("Altmarkt 1").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(scripted.calls(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let scripted = Arc::new(ScriptedGeocoder::new(vec![
            Err(AppError::Geocoder("still down".into())),
            Err(AppError::Geocoder("down".into())),
        ]));
        let service = GeocoderService::from_geocoder(scripted.clone(), 20, 2);
        assert!(matches!(
            service.lookup("Altmarkt 1").await,
            Err(AppError::Geocoder(_))
        ));
        assert_eq!(scripted.calls(), 2);
    }

    #[test]
    fn retry_pause_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(200),
            Duration::from_millis(1_000),
        );
        assert_eq!(policy.ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.ceiling(3), Duration::from_millis(800));
        assert_eq!(policy.ceiling(4), Duration::from_millis(1_000));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_millis(1_000));

        assert_eq!(policy.delay(2, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay(2, 1.0), Duration::from_millis(400));
        assert_eq!(policy.delay(2, 7.0), Duration::from_millis(400));
        assert_eq!(policy.delay(9, 0.5), Duration::from_millis(750));
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = AppConfig {
            geocoder_max_attempts: 4,
            geocoder_backoff_base_ms: 100,
            geocoder_backoff_max_ms: 50,
            ..AppConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.cap, Duration::from_millis(100));

        let service = GeocoderService::from_geocoder(Arc::new(ScriptedGeocoder::new(vec![])), 1, 1)
            .with_retry_policy(policy);
        assert_eq!(service.retry_policy(), policy);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(20);
        let started = Instant::now();
        for _ in 0..3 {
            pacer.ready().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn rate_limit_round_trips_qps() {
        let service = GeocoderService::from_geocoder(Arc::new(ScriptedGeocoder::new(vec![])), 1, 1);
        assert_eq!(service.rate_limit_qps(), 1);
        service.set_rate_limit(0);
        assert_eq!(service.rate_limit_qps(), 1);
        service.set_rate_limit(4);
        assert_eq!(service.rate_limit_qps(), 4);
    }
}
