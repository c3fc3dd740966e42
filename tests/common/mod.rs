//! Shared helpers for integration tests: a minimal BER encoder for building
//! trap datagrams and a publisher that records what it receives.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use trap_relay::{Publisher, TrapRecord};

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    match content.len() {
        len if len < 0x80 => out.push(len as u8),
        len if len <= 0xff => out.extend_from_slice(&[0x81, len as u8]),
        len => {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    out.extend_from_slice(content);
    out
}

/// BER encode a dotted OID
pub fn oid(dotted: &str) -> Vec<u8> {
    let arcs: Vec<u64> = dotted.split('.').map(|a| a.parse().unwrap()).collect();
    let mut out = Vec::new();
    let mut push = |mut value: u64| {
        let mut chunk = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            chunk.push(((value & 0x7f) as u8) | 0x80);
            value >>= 7;
        }
        chunk.reverse();
        out.extend(chunk);
    };
    push(arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push(*arc);
    }
    out
}

pub fn varbind(name: &str, tag: u8, value: &[u8]) -> Vec<u8> {
    let mut content = tlv(0x06, &oid(name));
    content.extend(tlv(tag, value));
    tlv(0x30, &content)
}

pub fn v2c_trap(community: &str, bindings: &[Vec<u8>]) -> Vec<u8> {
    let mut pdu = tlv(0x02, &[0x2a]);
    pdu.extend(tlv(0x02, &[0x00]));
    pdu.extend(tlv(0x02, &[0x00]));
    pdu.extend(tlv(0x30, &bindings.concat()));

    let mut message = tlv(0x02, &[0x01]);
    message.extend(tlv(0x04, community.as_bytes()));
    message.extend(tlv(0xa7, &pdu));
    tlv(0x30, &message)
}

#[derive(Default)]
pub struct SpyPublisher {
    pub records: Mutex<Vec<Arc<TrapRecord>>>,
    pub notify: Notify,
}

impl SpyPublisher {
    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for SpyPublisher {
    fn name(&self) -> &str {
        "spy"
    }

    async fn publish(&self, record: Arc<TrapRecord>) -> Result<()> {
        self.records.lock().unwrap().push(record);
        self.notify.notify_one();
        Ok(())
    }
}

/// Holds every record until the test opens the gate
pub struct GatedPublisher {
    pub entered: AtomicUsize,
    pub gate: Semaphore,
}

impl GatedPublisher {
    pub fn closed() -> Self {
        Self {
            entered: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for GatedPublisher {
    fn name(&self) -> &str {
        "gated"
    }

    async fn publish(&self, _record: Arc<TrapRecord>) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await?.forget();
        Ok(())
    }
}
