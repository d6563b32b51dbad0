use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::Slave;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("register read at {0} failed: {1}")]
    Read(u16, String),

    #[error("register write at {0} failed: {1}")]
    Write(u16, String),

    #[error("transport already closed")]
    Closed,
}

/// One Modbus TCP round trip partner. The concrete client library stays
/// behind this trait so the poller can be exercised against a fake.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn read_input_registers(&mut self, address: u16, count: u16)
        -> Result<Vec<u16>, TransportError>;

    async fn read_holding_registers(&mut self, address: u16, count: u16)
        -> Result<Vec<u16>, TransportError>;

    async fn write_single_register(&mut self, address: u16, value: u16)
        -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// Modbus TCP transport backed by tokio-modbus. Opened fresh for one poll
/// tick and torn down afterwards, never pooled.
pub struct TcpTransport {
    ctx: Option<Context>,
    io_timeout: Duration,
    peer: String,
}

/// Open a connection to `host:port` addressing unit `unit_id`, bounded by
/// `connect_timeout`. The same bound applies to each register operation.
pub async fn connect(
    host: &str,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
) -> Result<TcpTransport, TransportError> {
    let peer = format!("{}:{}", host, port);
    let addr: SocketAddr = lookup_host(&peer)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TransportError::Connect(peer.clone(), "address did not resolve".to_string()))?;

    debug!("Connecting to Modbus unit {unit_id} at {peer}");
    match timeout(connect_timeout, tcp::connect_slave(addr, Slave(unit_id))).await {
        Ok(Ok(ctx)) => {
            info!("Connected to Modbus unit {unit_id} at {peer}");
            Ok(TcpTransport {
                ctx: Some(ctx),
                io_timeout: connect_timeout,
                peer,
            })
        }
        Ok(Err(e)) => Err(TransportError::Connect(peer, e.to_string())),
        Err(_) => Err(TransportError::Timeout(connect_timeout)),
    }
}

impl TcpTransport {
    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        match timeout(io_timeout, ctx.read_input_registers(address, count)).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(e)) => Err(TransportError::Read(address, e.to_string())),
            Err(_) => Err(TransportError::Timeout(io_timeout)),
        }
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        match timeout(io_timeout, ctx.read_holding_registers(address, count)).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(e)) => Err(TransportError::Read(address, e.to_string())),
            Err(_) => Err(TransportError::Timeout(io_timeout)),
        }
    }

    async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let io_timeout = self.io_timeout;
        let ctx = self.context()?;
        match timeout(io_timeout, ctx.write_single_register(address, value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Write(address, e.to_string())),
            Err(_) => Err(TransportError::Timeout(io_timeout)),
        }
    }

    async fn close(&mut self) {
        /* Dropping the context closes the underlying TCP stream */
        if self.ctx.take().is_some() {
            debug!("Disconnected from {}", self.peer);
        }
    }
}
