//! Modbus TCP surface of the emulated meter.
//!
//! Input and holding register reads are both served from the register map,
//! restricted to the three published windows. The device is read only.

use crate::device::DeviceIdentity;
use crate::error::{EmulatorError, Result};
use crate::meter_cache::MeterCache;
use crate::register_map::{is_readable_address, RegisterMap};
use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct ShellyModbusService {
    cache: Arc<MeterCache>,
    registers: RegisterMap,
}

impl tokio_modbus::server::Service for ShellyModbusService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.read_registers(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::WriteSingleRegister(addr, _)
            | Request::WriteMultipleRegisters(addr, _)
            | Request::WriteSingleCoil(addr, _)
            | Request::WriteMultipleCoils(addr, _) => {
                warn!(addr, "Write attempt to read-only register");
                Err(ExceptionCode::IllegalFunction)
            }
            _ => {
                warn!("Unsupported Modbus function in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl ShellyModbusService {
    pub fn new(cache: Arc<MeterCache>, device: Arc<DeviceIdentity>) -> Self {
        Self {
            cache,
            registers: RegisterMap::new(device),
        }
    }

    /// Renders `cnt` words at `addr` from a fresh snapshot.
    pub fn read_registers(
        &self,
        addr: u16,
        cnt: u16,
    ) -> std::result::Result<Vec<u16>, ExceptionCode> {
        if !is_readable_address(u32::from(addr)) {
            debug!(addr, cnt, "Read outside register windows");
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut registers = self.registers.clone();
        registers.set_snapshot(self.cache.get_snapshot());
        let values = registers.read(u32::from(addr), usize::from(cnt));
        debug!(addr, cnt, "Modbus read returns {:?}", &values[..values.len().min(5)]);
        Ok(values)
    }
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| EmulatorError::Bind { addr, source })
}

/// Serves Modbus TCP on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    service: ShellyModbusService,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?local_addr, "Modbus server listening");

    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(service.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        error!("Modbus connection error: {err}");
    };

    tokio::select! {
        res = server.serve(&on_connected, on_process_error) => {
            res?;
        }
        _ = shutdown.cancelled() => info!("Modbus server stopped"),
    }
    Ok(())
}
