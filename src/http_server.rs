//! Shelly Gen2 HTTP API: JSON-RPC over `POST /rpc`, path style `GET /rpc/<Method>`
//! calls, and a WebSocket channel on `/rpc` with periodic status notifications.

use crate::device::DeviceIdentity;
use crate::error::{EmulatorError, Result};
use crate::meter_cache::MeterCache;
use crate::meter_data::unix_seconds;
use crate::status::{build_em_status, build_emdata_status, round_to};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PEER_SRC: &str = "user_1";
const PEER_QUEUE: usize = 16;

pub const METHODS: [&str; 11] = [
    "Shelly.ListMethods",
    "Shelly.GetDeviceInfo",
    "Shelly.GetStatus",
    "Shelly.GetConfig",
    "Shelly.GetComponents",
    "EM.GetStatus",
    "EM.GetConfig",
    "EM.GetCTTypes",
    "EMData.GetStatus",
    "Script.List",
    "Script.GetCode",
];

#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    MethodNotFound,
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::MethodNotFound => -32601,
            RpcError::Internal(_) => -32000,
        }
    }

    pub fn to_json(&self) -> Value {
        let message = match self {
            RpcError::MethodNotFound => "Method not found".to_string(),
            RpcError::Internal(e) => format!("Internal error: {e}"),
        };
        json!({"code": self.code(), "message": message})
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComponentsParams {
    offset: usize,
    dynamic_only: bool,
    include: Vec<String>,
    keys: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComponentQuery {
    pub id: Option<i64>,
}

/// One WebSocket client.
struct Peer {
    /// Client id the client last sent as `src`
    src: String,
    tx: mpsc::Sender<String>,
    /// Last `NotifyStatus` payload delivered, for change suppression
    last_pushed: Option<Value>,
}

/// Everything the HTTP surface answers from.
pub struct ShellyRpc {
    cache: Arc<MeterCache>,
    device: Arc<DeviceIdentity>,
    host: String,
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer: AtomicU64,
    shutdown: CancellationToken,
}

impl ShellyRpc {
    pub fn new(
        cache: Arc<MeterCache>,
        device: Arc<DeviceIdentity>,
        host: &str,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            device,
            host: host.to_string(),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            shutdown,
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    pub fn device_info(&self) -> Value {
        let mut info = self.device.device_info();
        info["name"] = json!(self.device.device_name());
        info["slot"] = json!(0);
        info
    }

    pub fn em_status(&self, em_id: i64) -> Value {
        build_em_status(&self.cache.get_snapshot(), em_id)
    }

    pub fn emdata_status(&self, em_id: i64) -> Value {
        build_emdata_status(&self.cache.get_snapshot(), em_id)
    }

    pub fn sys_status(&self) -> Value {
        let now = SystemTime::now();
        json!({
            "mac": self.device.mac_address(),
            "restart_required": false,
            "time": chrono::Local::now().format("%H:%M").to_string(),
            "unixtime": unix_seconds(now),
            "uptime": self.device.uptime_secs(),
            "ram_size": 245388,
            "ram_free": 139388,
            "fs_size": 524288,
            "fs_free": 163840,
            "available_updates": {},
        })
    }

    pub fn wifi_status(&self) -> Value {
        let sta_ip = if self.host == "0.0.0.0" {
            "192.168.1.100"
        } else {
            self.host.as_str()
        };
        json!({
            "sta_ip": sta_ip,
            "status": "got ip",
            "ssid": "WiFi",
            "rssi": -55,
        })
    }

    pub fn full_status(&self) -> Value {
        json!({
            "sys": self.sys_status(),
            "wifi": self.wifi_status(),
            "em:0": self.em_status(0),
            "emdata:0": self.emdata_status(0),
        })
    }

    pub fn em_config(&self, em_id: i64) -> Value {
        json!({
            "id": em_id,
            "name": null,
            "blink_mode_selector": "active_energy",
            "phase_selector": "all",
            "monitor_phase_sequence": false,
            "ct_type": "120A",
            "reverse": {},
        })
    }

    pub fn full_config(&self) -> Value {
        json!({
            "sys": {
                "device": {
                    "name": self.device.device_name(),
                    "mac": self.device.mac_address(),
                    "fw_id": self.device.fw_id(),
                    "discoverable": true,
                },
            },
            "wifi": {
                "ap": {"enable": false},
                "sta": {"enable": true, "ssid": "WiFi"},
                "sta1": {"enable": false},
            },
            "em:0": self.em_config(0),
        })
    }

    fn components(&self, params: Option<&Value>) -> std::result::Result<Value, RpcError> {
        let params: ComponentsParams = match params {
            Some(params) if !params.is_null() => serde_json::from_value(params.clone())
                .map_err(|e| RpcError::Internal(e.to_string()))?,
            _ => ComponentsParams::default(),
        };

        // The Pro 3EM has no dynamic components
        let mut keys: Vec<&str> = if params.dynamic_only {
            vec![]
        } else {
            vec!["em:0", "emdata:0"]
        };
        if let Some(filter) = params.keys.as_ref().filter(|k| !k.is_empty()) {
            keys.retain(|key| filter.iter().any(|f| f.as_str() == *key));
        }

        let with_status = params.include.iter().any(|i| i == "status");
        let with_config = params.include.iter().any(|i| i == "config");
        let total = keys.len();
        let components: Vec<Value> = keys
            .into_iter()
            .skip(params.offset)
            .map(|key| {
                let mut component = json!({"key": key});
                match key {
                    "em:0" => {
                        if with_status {
                            component["status"] = self.em_status(0);
                        }
                        if with_config {
                            component["config"] = self.em_config(0);
                        }
                    }
                    _ => {
                        if with_status {
                            component["status"] = self.emdata_status(0);
                        }
                    }
                }
                component
            })
            .collect();

        Ok(json!({
            "components": components,
            "cfg_rev": 0,
            "offset": params.offset,
            "total": total,
        }))
    }

    /// Dispatches one RPC method.
    pub fn call(&self, method: &str, params: Option<&Value>) -> std::result::Result<Value, RpcError> {
        let em_id = params
            .and_then(|p| p.get("id"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let result = match method {
            "Shelly.ListMethods" => json!({"methods": METHODS}),
            "Shelly.GetDeviceInfo" => self.device_info(),
            "Shelly.GetStatus" => self.full_status(),
            "Shelly.GetConfig" => self.full_config(),
            "Shelly.GetComponents" => self.components(params)?,
            "EM.GetStatus" => self.em_status(em_id),
            "EM.GetConfig" => self.em_config(em_id),
            "EM.GetCTTypes" => json!({"types": ["120A", "50A"]}),
            "EMData.GetStatus" => self.emdata_status(em_id),
            // Scripts are not supported by this device
            "Script.List" => json!({"scripts": []}),
            "Script.GetCode" => json!({"data": ""}),
            _ => return Err(RpcError::MethodNotFound),
        };
        Ok(result)
    }

    fn handle_rpc(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            debug!(version = ?request.jsonrpc, "Unexpected JSON-RPC version");
        }
        let (result, error) = match self.call(&request.method, request.params.as_ref()) {
            Ok(result) => (Some(result), None),
            Err(e) => {
                warn!(method = %request.method, error = ?e, "RPC call failed");
                (None, Some(e.to_json()))
            }
        };
        JsonRpcResponse {
            jsonrpc: "2.0",
            result,
            error,
            id: request.id,
        }
    }

    fn notification(&self, method: &str, dst: &str, mut params: Value) -> Value {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        params["ts"] = json!(round_to(ts, 2));
        json!({
            "src": self.device.device_id(),
            "dst": dst,
            "method": method,
            "params": params,
        })
    }

    fn full_status_notification(&self, dst: &str) -> Value {
        self.notification("NotifyFullStatus", dst, self.full_status())
    }

    fn register_peer(&self, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.peers().insert(
            id,
            Peer {
                src: DEFAULT_PEER_SRC.to_string(),
                tx,
                last_pushed: None,
            },
        );
        id
    }

    fn remove_peer(&self, id: u64) {
        if self.peers().remove(&id).is_some() {
            info!(peer = id, remaining = self.peer_count(), "WebSocket client removed");
        }
    }

    /// Answers one text frame from peer `peer_id` in the Shelly addressed form.
    fn handle_ws_text(&self, peer_id: u64, text: &str) -> Value {
        let request: Value = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = peer_id, error = %e, "Unparsable WebSocket frame");
                return json!({
                    "id": null,
                    "src": self.device.device_id(),
                    "error": {"code": -32700, "message": "Parse error"},
                });
            }
        };

        let dst = {
            let mut peers = self.peers();
            let peer = peers.get_mut(&peer_id);
            match (peer, request.get("src").and_then(Value::as_str)) {
                (Some(peer), Some(src)) => {
                    peer.src = src.to_string();
                    peer.src.clone()
                }
                (Some(peer), None) => peer.src.clone(),
                (None, src) => src.unwrap_or(DEFAULT_PEER_SRC).to_string(),
            }
        };

        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let mut response = json!({
            "id": request.get("id").cloned().unwrap_or(Value::Null),
            "src": self.device.device_id(),
            "dst": dst,
        });
        match self.call(method, request.get("params")) {
            Ok(result) => response["result"] = result,
            Err(e) => response["error"] = e.to_json(),
        }
        response
    }

    /// Sends `NotifyStatus` to every peer whose view is out of date.
    /// Returns the number of notifications delivered.
    pub async fn push_status(&self) -> usize {
        let payload = json!({
            "em:0": self.em_status(0),
            "emdata:0": self.emdata_status(0),
        });

        let targets: Vec<(u64, String, mpsc::Sender<String>)> = self
            .peers()
            .iter()
            .filter(|(_, peer)| peer.last_pushed.as_ref() != Some(&payload))
            .map(|(id, peer)| (*id, peer.src.clone(), peer.tx.clone()))
            .collect();

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (id, src, tx) in targets {
            let text = self
                .notification("NotifyStatus", &src, payload.clone())
                .to_string();
            match timeout(SEND_TIMEOUT, tx.send(text)).await {
                Ok(Ok(())) => delivered.push(id),
                Ok(Err(_)) => {
                    debug!(peer = id, "WebSocket client gone during push");
                    failed.push(id);
                }
                Err(_) => {
                    warn!(peer = id, "WebSocket send timeout, dropping client");
                    failed.push(id);
                }
            }
        }

        let mut peers = self.peers();
        for id in failed {
            peers.remove(&id);
        }
        for id in &delivered {
            if let Some(peer) = peers.get_mut(id) {
                peer.last_pushed = Some(payload.clone());
            }
        }
        delivered.len()
    }
}

pub fn router(rpc: Arc<ShellyRpc>) -> Router {
    Router::new()
        .route("/shelly", get(get_shelly))
        .route("/rpc", get(ws_handler).post(rpc_post))
        .route("/rpc/:method", get(rpc_get))
        .layer(CorsLayer::permissive())
        .with_state(rpc)
}

async fn get_shelly(State(rpc): State<Arc<ShellyRpc>>) -> Json<Value> {
    Json(rpc.device_info())
}

async fn rpc_post(
    State(rpc): State<Arc<ShellyRpc>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    debug!(method = %request.method, "RPC request");
    Json(rpc.handle_rpc(request))
}

async fn rpc_get(
    State(rpc): State<Arc<ShellyRpc>>,
    Path(method): Path<String>,
    Query(query): Query<ComponentQuery>,
) -> Response {
    let params = json!({"id": query.id.unwrap_or(0)});
    match rpc.call(&method, Some(&params)) {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            let status = match e {
                RpcError::MethodNotFound => StatusCode::NOT_FOUND,
                RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(e.to_json())).into_response()
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(rpc): State<Arc<ShellyRpc>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, rpc))
}

async fn handle_socket(socket: WebSocket, rpc: Arc<ShellyRpc>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(PEER_QUEUE);

    // Clients expect the full status first, so queue it before the push task can see the peer
    let initial = rpc.full_status_notification(DEFAULT_PEER_SRC).to_string();
    if tx.send(initial).await.is_err() {
        warn!("Failed to queue initial status");
    }
    let peer_id = rpc.register_peer(tx.clone());
    info!(peer = peer_id, total = rpc.peer_count(), "WebSocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            match timeout(SEND_TIMEOUT, sender.send(Message::Text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "WebSocket send failed");
                    break;
                }
                Err(_) => {
                    warn!("WebSocket send timed out");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = rpc.shutdown.cancelled() => break,
            frame = receiver.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                debug!(peer = peer_id, request = %text, "WebSocket request");
                let reply = rpc.handle_ws_text(peer_id, &text).to_string();
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(peer = peer_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    rpc.remove_peer(peer_id);
    drop(tx);
    let _ = writer.await;
    info!(peer = peer_id, "WebSocket client disconnected");
}

async fn push_loop(rpc: Arc<ShellyRpc>) {
    info!("WebSocket push task started");
    let mut ticker = interval(PUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = rpc.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let sent = rpc.push_status().await;
                if sent > 0 {
                    debug!(sent, "NotifyStatus pushed");
                }
            }
        }
    }
    info!("WebSocket push task stopped");
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| EmulatorError::Bind { addr, source })
}

/// Serves the HTTP API and the push task until the shutdown token of `rpc` is cancelled.
pub async fn serve(listener: TcpListener, rpc: Arc<ShellyRpc>) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "HTTP server listening");
    let push = tokio::spawn(push_loop(rpc.clone()));
    let shutdown = rpc.shutdown.clone();

    let res = axum::serve(listener, router(rpc))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = &res {
        error!(error = %e, "HTTP server failed");
    }
    push.abort();
    info!("HTTP server stopped");
    Ok(res?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityMapping;
    use crate::home_assistant::{EntityReading, ReadingSource};
    use crate::meter_data::MeterSnapshot;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoSource;

    #[async_trait]
    impl ReadingSource for NoSource {
        async fn read_entity(&self, _entity_id: &str) -> Option<EntityReading> {
            None
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    fn live_snapshot(power: f64) -> MeterSnapshot {
        let mut snapshot = MeterSnapshot {
            timestamp: Some(SystemTime::now()),
            is_valid: true,
            total_energy: 5000.0,
            ..Default::default()
        };
        snapshot.phase_a.power = power;
        snapshot
    }

    fn rpc_with(snapshot: MeterSnapshot) -> Arc<ShellyRpc> {
        let cache = Arc::new(MeterCache::new(
            Arc::new(NoSource),
            EntityMapping::default(),
            None,
            Duration::from_secs(1),
        ));
        cache.replace_snapshot(snapshot);
        let device = Arc::new(DeviceIdentity::new("", "Kitchen", "AABBCCDDEEFF").unwrap());
        Arc::new(ShellyRpc::new(cache, device, "0.0.0.0", CancellationToken::new()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_rpc(app: Router, body: Value) -> Value {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rpc")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_shelly_endpoint() {
        let (status, info) = get_json(router(rpc_with(live_snapshot(100.0))), "/shelly").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["id"], "shellypro3em-ddeeff");
        assert_eq!(info["name"], "Kitchen");
        assert_eq!(info["slot"], 0);
        assert_eq!(info["gen"], 2);
    }

    #[tokio::test]
    async fn test_json_rpc_em_status() {
        let app = router(rpc_with(live_snapshot(1234.0)));
        let response = post_rpc(
            app,
            json!({"jsonrpc": "2.0", "method": "EM.GetStatus", "params": {"id": 0}, "id": 5}),
        )
        .await;
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 5);
        assert_eq!(response["result"]["a_act_power"], 1234.0);
        assert_eq!(response["result"]["total_act_power"], 1234.0);
        assert!(response.get("error").is_none());
    }

    #[tokio::test]
    async fn test_json_rpc_unknown_method() {
        let app = router(rpc_with(live_snapshot(0.0)));
        let response = post_rpc(app, json!({"method": "Switch.Set", "id": 1})).await;
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["message"], "Method not found");
        assert!(response.get("result").is_none());
    }

    #[tokio::test]
    async fn test_path_style_calls() {
        let app = router(rpc_with(live_snapshot(10.0)));
        let (status, result) = get_json(app.clone(), "/rpc/EMData.GetStatus?id=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["id"], 1);
        assert_eq!(result["total_act"], 5000.0);

        let (status, result) = get_json(app.clone(), "/rpc/Shelly.ListMethods").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["methods"].as_array().unwrap().len(), METHODS.len());

        let (status, result) = get_json(app, "/rpc/Cover.Open").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(result["code"], -32601);
    }

    #[tokio::test]
    async fn test_full_status_and_config() {
        let rpc = rpc_with(live_snapshot(10.0));
        let status = rpc.call("Shelly.GetStatus", None).unwrap();
        assert_eq!(status["sys"]["mac"], "AABBCCDDEEFF");
        assert_eq!(status["sys"]["ram_size"], 245388);
        assert_eq!(status["sys"]["time"].as_str().unwrap().len(), 5);
        assert_eq!(status["wifi"]["sta_ip"], "192.168.1.100");
        assert_eq!(status["em:0"]["a_act_power"], 10.0);
        assert_eq!(status["emdata:0"]["total_act"], 5000.0);

        let config = rpc.call("Shelly.GetConfig", None).unwrap();
        assert_eq!(config["sys"]["device"]["name"], "Kitchen");
        assert_eq!(config["em:0"]["ct_type"], "120A");

        let em_config = rpc.call("EM.GetConfig", Some(&json!({"id": 3}))).unwrap();
        assert_eq!(em_config["id"], 3);
        assert!(em_config["name"].is_null());
    }

    #[tokio::test]
    async fn test_components() {
        let rpc = rpc_with(live_snapshot(10.0));
        let all = rpc.call("Shelly.GetComponents", None).unwrap();
        assert_eq!(all["total"], 2);
        assert_eq!(all["components"][0], json!({"key": "em:0"}));

        let filtered = rpc
            .call(
                "Shelly.GetComponents",
                Some(&json!({"keys": ["emdata:0"], "include": ["status", "config"]})),
            )
            .unwrap();
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["components"][0]["key"], "emdata:0");
        assert_eq!(filtered["components"][0]["status"]["total_act"], 5000.0);
        assert!(filtered["components"][0].get("config").is_none());

        let offset = rpc
            .call("Shelly.GetComponents", Some(&json!({"offset": 1})))
            .unwrap();
        assert_eq!(offset["total"], 2);
        assert_eq!(offset["offset"], 1);
        assert_eq!(offset["components"].as_array().unwrap().len(), 1);

        let dynamic = rpc
            .call("Shelly.GetComponents", Some(&json!({"dynamic_only": true})))
            .unwrap();
        assert_eq!(dynamic["total"], 0);

        let err = rpc
            .call("Shelly.GetComponents", Some(&json!({"offset": "first"})))
            .unwrap_err();
        assert_eq!(err.code(), -32000);
    }

    #[tokio::test]
    async fn test_ws_request_tracks_peer_src() {
        let rpc = rpc_with(live_snapshot(10.0));
        let (tx, _rx) = mpsc::channel(4);
        let peer = rpc.register_peer(tx);

        let reply = rpc.handle_ws_text(peer, r#"{"id": 1, "method": "Script.List"}"#);
        assert_eq!(reply["dst"], "user_1");
        assert_eq!(reply["result"], json!({"scripts": []}));

        let reply = rpc.handle_ws_text(
            peer,
            r#"{"id": 2, "src": "ha-client", "method": "EM.GetCTTypes"}"#,
        );
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["src"], "shellypro3em-ddeeff");
        assert_eq!(reply["dst"], "ha-client");

        let reply = rpc.handle_ws_text(peer, r#"{"id": 3, "method": "Nope"}"#);
        assert_eq!(reply["dst"], "ha-client");
        assert_eq!(reply["error"]["code"], -32601);

        let reply = rpc.handle_ws_text(peer, "{not json");
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_push_is_suppressed_until_status_changes() {
        let rpc = rpc_with(live_snapshot(10.0));
        let (tx, mut rx) = mpsc::channel(4);
        let peer = rpc.register_peer(tx);
        rpc.handle_ws_text(peer, r#"{"id": 1, "src": "hub", "method": "Script.List"}"#);

        assert_eq!(rpc.push_status().await, 1);
        let note: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(note["method"], "NotifyStatus");
        assert_eq!(note["dst"], "hub");
        assert_eq!(note["params"]["em:0"]["a_act_power"], 10.0);
        assert!(note["params"]["ts"].is_f64());

        assert_eq!(rpc.push_status().await, 0, "unchanged status is not resent");

        rpc.cache.replace_snapshot(live_snapshot(20.0));
        assert_eq!(rpc.push_status().await, 1);
        let note: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(note["params"]["em:0"]["a_act_power"], 20.0);
    }

    #[tokio::test]
    async fn test_closed_peer_is_removed_on_push() {
        let rpc = rpc_with(live_snapshot(10.0));
        let (tx, rx) = mpsc::channel(4);
        let (live_tx, mut live_rx) = mpsc::channel(4);
        rpc.register_peer(tx);
        rpc.register_peer(live_tx);
        drop(rx);

        assert_eq!(rpc.push_status().await, 1);
        assert_eq!(rpc.peer_count(), 1);
        assert!(live_rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_removed_after_send_timeout() {
        let rpc = rpc_with(live_snapshot(10.0));
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        stalled_tx.try_send("backlog".to_string()).unwrap();
        let (live_tx, mut live_rx) = mpsc::channel(4);
        rpc.register_peer(stalled_tx);
        rpc.register_peer(live_tx);

        let started = tokio::time::Instant::now();
        assert_eq!(rpc.push_status().await, 1);
        assert!(started.elapsed() >= SEND_TIMEOUT);
        assert_eq!(rpc.peer_count(), 1);
        assert!(live_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_full_status_notification() {
        let rpc = rpc_with(live_snapshot(10.0));
        let note = rpc.full_status_notification("user_1");
        assert_eq!(note["method"], "NotifyFullStatus");
        assert_eq!(note["src"], "shellypro3em-ddeeff");
        assert_eq!(note["dst"], "user_1");
        for key in ["sys", "wifi", "em:0", "emdata:0", "ts"] {
            assert!(note["params"].get(key).is_some(), "{key}");
        }
    }
}
