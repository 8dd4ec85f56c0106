//! HTTP client for the central collector.
//!
//! Two calls are made: the machine list at startup and the periodic log push.
//! Both carry the workspace credentials in the JSON body.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CollectorConfig, MachineConfig};
use crate::publisher::CollectorSink;
use crate::registry::MachineRegistry;
use crate::state::MachineState;

const MACHINE_LIST_PATH: &str = "machine-logs/machine-list";
const MACHINE_LOGS_PATH: &str = "machine-logs";

/// Collector client errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Collector answered HTTP {0}")]
    Status(u16),
    #[error("Unexpected response: {0}")]
    Decode(String),
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Machines and last published states returned by the collector.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MachineListing {
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
    #[serde(rename = "machineData", default)]
    pub machine_data: Option<HashMap<String, MachineState>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Serialize)]
struct Credentials<'a> {
    #[serde(rename = "workspaceId")]
    workspace_id: &'a str,
    #[serde(rename = "apiKey")]
    api_key: &'a str,
}

#[derive(Serialize)]
struct LogPush<'a> {
    logs: &'a BTreeMap<String, MachineState>,
    #[serde(flatten)]
    credentials: Credentials<'a>,
}

/// reqwest-backed collector client.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    base_url: String,
    workspace_id: String,
    api_key: String,
}

impl HttpCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CollectorError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            workspace_id: config.workspace_id.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Absolute URL of an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            workspace_id: &self.workspace_id,
            api_key: &self.api_key,
        }
    }

    /// Fetch the machines of this workspace.
    pub async fn fetch_machines(&self) -> Result<MachineListing, CollectorError> {
        let url = self.url(MACHINE_LIST_PATH);
        debug!(url = %url, "Fetching machine list");

        let response = self
            .client
            .post(&url)
            .json(&self.credentials())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_listing(&body)
    }
}

/// Decode a machine-list response body.
pub fn parse_listing(body: &[u8]) -> Result<MachineListing, CollectorError> {
    let envelope: Envelope<MachineListing> =
        serde_json::from_slice(body).map_err(|e| CollectorError::Decode(e.to_string()))?;
    Ok(envelope.data)
}

impl MachineListing {
    /// Seed `registry` with the last published state of every listed machine
    /// and return the machines to poll.
    ///
    /// States for ids that are not in the machine list are dropped.
    pub fn seed_into(self, registry: &MachineRegistry) -> Vec<MachineConfig> {
        let mut known = self.machine_data.unwrap_or_default();
        for machine in &self.machines {
            if let Some(state) = known.remove(&machine.id) {
                debug!(machine = %machine.id, "Seeded state from collector");
                registry.seed(&machine.id, state);
            }
        }
        self.machines
    }
}

impl CollectorSink for HttpCollector {
    async fn push(&self, logs: &BTreeMap<String, MachineState>) -> Result<(), CollectorError> {
        let body = LogPush {
            logs,
            credentials: self.credentials(),
        };

        let response = self
            .client
            .post(self.url(MACHINE_LOGS_PATH))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::profile::StopCategory;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn config(base_url: &str) -> CollectorConfig {
        CollectorConfig {
            base_url: base_url.to_string(),
            workspace_id: "ws-1".to_string(),
            api_key: "secret".to_string(),
            ..Default::default()
        }
    }

    /// Serve `app` on an ephemeral port and return its base URL.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/v1", addr)
    }

    #[test]
    fn test_url_joining() {
        let collector = HttpCollector::new(&config("https://example.com/api/v1/")).unwrap();
        assert_eq!(
            collector.url("machine-logs"),
            "https://example.com/api/v1/machine-logs"
        );
        assert_eq!(
            collector.url("/machine-logs/machine-list"),
            "https://example.com/api/v1/machine-logs/machine-list"
        );
    }

    #[test]
    fn test_push_payload_shape() {
        let mut logs = BTreeMap::new();
        logs.insert(
            "loom-01".to_string(),
            MachineState {
                current_stop_code: 7,
                shift: Some(2),
                ..Default::default()
            },
        );
        let body = LogPush {
            logs: &logs,
            credentials: Credentials {
                workspace_id: "ws-1",
                api_key: "secret",
            },
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["workspaceId"], "ws-1");
        assert_eq!(json["apiKey"], "secret");
        assert_eq!(json["logs"]["loom-01"]["stop"], 7);
        assert_eq!(json["logs"]["loom-01"]["shift"], 2);
    }

    #[test]
    fn test_parse_listing() {
        let body = br#"{
            "data": {
                "machines": [
                    { "id": "m1", "ip": "192.168.205.7", "deviceType": "rs485" },
                    { "id": "m2", "ip": "192.168.205.8" }
                ],
                "machineData": {
                    "m1": { "stop": 3, "stopCount": 1, "shift": 2 }
                }
            }
        }"#;

        let listing = parse_listing(body).unwrap();
        assert_eq!(listing.machines.len(), 2);
        assert_eq!(listing.machines[0].transport, TransportKind::Rs485);
        assert_eq!(listing.machines[1].address, "192.168.205.8");
        let seeded = listing.machine_data.unwrap();
        assert_eq!(seeded["m1"].current_stop_code, 3);
        assert_eq!(seeded["m1"].stop_event_count, 1);
    }

    #[test]
    fn test_parse_listing_without_machine_data() {
        let listing = parse_listing(br#"{ "data": { "machines": [] } }"#).unwrap();
        assert!(listing.machines.is_empty());
        assert!(listing.machine_data.is_none());

        let listing = parse_listing(br#"{ "data": { "machineData": null } }"#).unwrap();
        assert!(listing.machine_data.is_none());
    }

    #[test]
    fn test_seed_only_listed_machines() {
        let body = br#"{
            "data": {
                "machines": [{ "id": "m1" }],
                "machineData": {
                    "m1": { "stop": 4, "shift": 1 },
                    "retired": { "stop": 0, "shift": 1 }
                }
            }
        }"#;
        let registry = MachineRegistry::new();

        let machines = parse_listing(body).unwrap().seed_into(&registry);

        assert_eq!(machines.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("m1").unwrap().current_stop_code, 4);
        assert!(registry.get("retired").is_none());
    }

    #[test]
    fn test_parse_listing_with_recorded_stops() {
        let body = br#"{
            "data": {
                "machines": [{ "id": "m1", "ip": "10.0.0.1", "deviceType": null }],
                "machineData": {
                    "m1": {
                        "stop": 0,
                        "stopCount": 1,
                        "stopsData": {
                            "weft": [{
                                "start": "2024-03-01T05:50:00Z",
                                "end": "2024-03-01T05:52:00Z",
                                "statusCode": 3,
                                "duration": 120
                            }],
                            "warp": [], "feeder": [], "manual": [], "other": []
                        },
                        "shift": 1
                    }
                }
            }
        }"#;
        let registry = MachineRegistry::new();

        let machines = parse_listing(body).unwrap().seed_into(&registry);

        assert_eq!(machines[0].transport, TransportKind::Tcp);
        let state = registry.get("m1").unwrap();
        let weft = state.stops_by_category.get(StopCategory::Weft);
        assert_eq!(weft.len(), 1);
        assert_eq!(weft[0].category, StopCategory::Weft);
        assert_eq!(weft[0].duration, 120);
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        let err = parse_listing(b"<html>maintenance</html>").unwrap_err();
        assert!(matches!(err, CollectorError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_and_push_against_local_server() {
        type Seen = Arc<Mutex<Vec<serde_json::Value>>>;
        let seen: Seen = Arc::default();

        async fn list(
            State(seen): State<Seen>,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            seen.lock().push(body);
            Json(serde_json::json!({
                "data": { "machines": [{ "id": "m1", "ip": "10.0.0.9" }], "machineData": {} }
            }))
        }

        async fn logs(State(seen): State<Seen>, Json(body): Json<serde_json::Value>) -> StatusCode {
            seen.lock().push(body);
            StatusCode::OK
        }

        let app = Router::new()
            .route("/api/v1/machine-logs/machine-list", post(list))
            .route("/api/v1/machine-logs", post(logs))
            .with_state(seen.clone());
        let collector = HttpCollector::new(&config(&serve(app).await)).unwrap();

        let listing = collector.fetch_machines().await.unwrap();
        assert_eq!(listing.machines[0].id, "m1");
        assert_eq!(listing.machine_data.map(|m| m.len()), Some(0));

        collector.push(&BTreeMap::new()).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["workspaceId"], "ws-1");
        assert_eq!(seen[0]["apiKey"], "secret");
        assert!(seen[1]["logs"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let app = Router::new().route(
            "/api/v1/machine-logs",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let collector = HttpCollector::new(&config(&serve(app).await)).unwrap();

        let err = collector.push(&BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Status(401)));
    }
}
