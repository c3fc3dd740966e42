//! SNMP trap listener
//!
//! Receives datagrams on the configured UDP address, decodes them and passes
//! each packet to the dispatcher on its own task. At most `max_in_flight`
//! packets are dispatched at once. When every slot is taken the receive loop
//! stops reading until a dispatch finishes, and the backlog stays in the
//! socket buffer.

use crate::codec::decode_packet;
use crate::config::ListenConfig;
use crate::dispatcher::Dispatcher;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub struct SnmpListener {
    config: ListenConfig,
    dispatcher: Arc<Dispatcher>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
}

impl SnmpListener {
    pub fn new(config: ListenConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            config,
            dispatcher,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub async fn bind(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(&self.config.address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.address))?;
        info!("SNMP listener started on {}", socket.local_addr()?);
        Ok(socket)
    }

    /// Packets currently being decoded or dispatched
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }

    /// Receive loop. Errors on individual datagrams never end it.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let mut buffer = vec![0u8; self.config.max_packet_size];
        let mut packet_count = 0u64;

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, src_addr)) => {
                    packet_count += 1;
                    let data = buffer[..len].to_vec();
                    let listener = Arc::clone(&self);

                    if packet_count % 1000 == 0 {
                        info!("Processed {} UDP packets on {}", packet_count, self.config.address);
                    }

                    if self.slots.available_permits() == 0 {
                        debug!("{} dispatches in flight, pausing receive", self.max_in_flight);
                    }
                    let permit = Arc::clone(&self.slots)
                        .acquire_owned()
                        .await
                        .context("Dispatch limiter closed")?;

                    tokio::spawn(async move {
                        listener.process_datagram(&data, src_addr).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    async fn process_datagram(&self, data: &[u8], src_addr: SocketAddr) {
        debug!("Processing datagram from {} ({} bytes)", src_addr, data.len());

        let packet = match decode_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to parse SNMP trap from {}: {}", src_addr, e);
                return;
            }
        };

        self.dispatcher.dispatch(&packet, src_addr.ip()).await;
    }
}
