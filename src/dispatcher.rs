//! Trap dispatch
//!
//! Applies the community filter, assembles the record and hands it to each
//! registered publisher in turn. A failing publisher never affects the others.

use crate::codec::TrapPacket;
use crate::publishers::Publisher;
use crate::trap::assemble_trap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error};

/// What happened to one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Community mismatch, nothing was built or published
    Rejected,
    Delivered { attempted: usize, failed: usize },
}

pub struct Dispatcher {
    community: String,
    publishers: Vec<Arc<dyn Publisher>>,
}

impl Dispatcher {
    /// An empty `community` accepts every packet
    pub fn new(community: impl Into<String>) -> Self {
        Self {
            community: community.into(),
            publishers: Vec::new(),
        }
    }

    pub fn add_publisher(&mut self, publisher: Arc<dyn Publisher>) {
        debug!("Registered publisher '{}'", publisher.name());
        self.publishers.push(publisher);
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn accepts(&self, community: &str) -> bool {
        self.community.is_empty() || self.community == community
    }

    pub async fn dispatch(&self, packet: &TrapPacket, source: IpAddr) -> DispatchOutcome {
        if !self.accepts(&packet.community) {
            error!(
                "got trap from {} with community {}, waiting for community {}",
                source, packet.community, self.community
            );
            return DispatchOutcome::Rejected;
        }

        debug!(
            "new packet received from {} with version {} and community {}",
            source, packet.version, packet.community
        );
        let record = Arc::new(assemble_trap(source, packet));

        if self.publishers.is_empty() {
            debug!("No publishers configured, dropping trap from {}", source);
        }

        let mut failed = 0;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(Arc::clone(&record)).await {
                failed += 1;
                error!("error sending trap from {} to {}: {:#}", source, publisher.name(), e);
            }
        }

        DispatchOutcome::Delivered {
            attempted: self.publishers.len(),
            failed,
        }
    }

    /// Shut publishers down in registration order
    pub async fn shutdown(&self) {
        for publisher in &self.publishers {
            debug!("Shutting down publisher '{}'", publisher.name());
            publisher.shutdown().await;
        }
    }
}
