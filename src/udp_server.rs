//! UDP JSON-RPC surface, polled by battery controllers that speak the Shelly
//! datagram protocol.

use crate::device::DeviceIdentity;
use crate::error::{EmulatorError, Result};
use crate::meter_cache::MeterCache;
use crate::status::{build_em_status, round_to};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Offset that keeps whole numbers from rendering without a fractional part.
/// Some clients read a value like `100` as "no data".
pub const DECIMAL_ENFORCER: f64 = 0.001;

const MAX_DATAGRAM: usize = 4096;
/// Requests answered concurrently across all ports
pub const MAX_IN_FLIGHT: usize = 10;

/// Power value as reported over UDP, never a whole number.
pub fn format_power(power: f64) -> f64 {
    if power.abs() < 0.1 {
        return if power >= 0.0 {
            DECIMAL_ENFORCER
        } else {
            -DECIMAL_ENFORCER
        };
    }
    let rounded = round_to(power, 1);
    if rounded.fract() != 0.0 {
        return rounded;
    }
    let nudged = if rounded >= 0.0 {
        rounded + DECIMAL_ENFORCER
    } else {
        rounded - DECIMAL_ENFORCER
    };
    round_to(nudged, 3)
}

/// Answers parsed datagram requests from the current snapshot.
#[derive(Clone)]
pub struct UdpHandler {
    cache: Arc<MeterCache>,
    device: Arc<DeviceIdentity>,
}

impl UdpHandler {
    pub fn new(cache: Arc<MeterCache>, device: Arc<DeviceIdentity>) -> Self {
        Self { cache, device }
    }

    /// The response document, or `None` when the request gets no answer.
    pub fn process_request(&self, request: &Value) -> Option<Value> {
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let request_id = request.get("id").cloned().unwrap_or(json!(0));
        // Requests not addressed to a component are not for us
        let component_id = request
            .get("params")
            .and_then(|params| params.get("id"))
            .and_then(Value::as_i64)?;

        let result = match method {
            "EM.GetStatus" => self.em_status(component_id),
            "EM1.GetStatus" => {
                let snapshot = self.cache.get_snapshot();
                let total = if snapshot.is_usable() {
                    snapshot.total_power()
                } else {
                    0.0
                };
                json!({"id": 0, "act_power": format_power(total)})
            }
            "Shelly.GetDeviceInfo" => self.device.device_info(),
            "EM.GetCTTypes" => json!({"types": ["120A", "50A"]}),
            _ => {
                debug!(method, "Ignoring unsupported UDP method");
                return None;
            }
        };

        Some(json!({
            "id": request_id,
            "src": self.device.device_id(),
            "dst": "unknown",
            "result": result,
        }))
    }

    fn em_status(&self, component_id: i64) -> Value {
        let mut status = build_em_status(&self.cache.get_snapshot(), component_id);
        for key in ["a_act_power", "b_act_power", "c_act_power", "total_act_power"] {
            if let Some(value) = status.get_mut(key) {
                let power = value.as_f64().unwrap_or(0.0);
                *value = json!(format_power(power));
            }
        }
        status
    }

    /// Parses, answers and serializes one datagram.
    pub fn handle_datagram(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request: Value = match serde_json::from_slice(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Invalid JSON in UDP request");
                return None;
            }
        };
        let response = self.process_request(&request)?;
        match serde_json::to_vec(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "Failed to serialize UDP response");
                None
            }
        }
    }
}

/// Binds every configured port. Ports that fail to bind are logged and skipped.
pub async fn bind(host: &str, ports: &[u16]) -> Vec<UdpSocket> {
    let mut sockets = Vec::with_capacity(ports.len());
    for port in ports {
        let addr = format!("{host}:{port}");
        match UdpSocket::bind(&addr).await {
            Ok(socket) => sockets.push(socket),
            Err(source) => {
                let e = EmulatorError::Bind { addr, source };
                error!(error = %e, "UDP port unavailable");
            }
        }
    }
    sockets
}

/// Serves every socket until `shutdown` is cancelled. Each request is
/// answered on its own task, at most [`MAX_IN_FLIGHT`] at a time.
pub async fn serve(
    sockets: Vec<UdpSocket>,
    handler: UdpHandler,
    shutdown: CancellationToken,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let mut listeners = JoinSet::new();
    for socket in sockets {
        listeners.spawn(listen(
            Arc::new(socket),
            handler.clone(),
            permits.clone(),
            shutdown.clone(),
        ));
    }
    while let Some(res) = listeners.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "UDP listener task failed");
        }
    }
    info!("UDP server stopped");
    Ok(())
}

async fn listen(
    socket: Arc<UdpSocket>,
    handler: UdpHandler,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let local_addr = socket.local_addr().ok();
    info!(addr = ?local_addr, "UDP server listening");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier replies surface here, keep serving
                    warn!(addr = ?local_addr, error = %e, "UDP receive failed");
                    continue;
                }
            },
        };
        let data = buf[..len].to_vec();
        // When saturated, further datagrams wait in the socket buffer
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let socket = socket.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            respond(&socket, &handler, &data, peer).await;
            drop(permit);
        });
    }
}

async fn respond(socket: &UdpSocket, handler: &UdpHandler, data: &[u8], peer: SocketAddr) {
    debug!(%peer, request = %String::from_utf8_lossy(data), "UDP request received");
    let Some(response) = handler.handle_datagram(data) else {
        return;
    };
    if let Err(e) = socket.send_to(&response, peer).await {
        warn!(%peer, error = %e, "Failed to send UDP response");
    }
}
