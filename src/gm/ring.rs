//! CRC32-ordered retry ring over the known GM nodes
//!
//! The ring is the GM snapshot sorted by address. A report starts at
//! `crc32(instance_ip) % ring_size` and walks forward with wraparound,
//! visiting each node at most once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::connection::{GMConnection, GmError};

/// Where a report landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub gm_ip: String,
    pub gm_port: u16,
    /// Ring positions visited, including the successful one
    pub attempts: usize,
}

/// Sort a GM snapshot into ring order
pub fn ring_order(mut nodes: Vec<Arc<GMConnection>>) -> Vec<Arc<GMConnection>> {
    nodes.sort_by(|a, b| a.ip.cmp(&b.ip).then(a.port.cmp(&b.port)));
    nodes
}

/// Starting ring position for an instance
pub fn hash_index(instance_ip: &str, ring_size: usize) -> usize {
    if ring_size == 0 {
        return 0;
    }
    crc32fast::hash(instance_ip.as_bytes()) as usize % ring_size
}

/// Deliver one report to the first connected node on the ring.
///
/// `on_broken` is called for every node whose send failed; the caller uses
/// it to start a repair. Disconnected nodes are skipped without a send.
pub async fn report_to_ring<F>(
    ring: &[Arc<GMConnection>],
    instance_ip: &str,
    detect_type: &str,
    payload: &[u8],
    send_timeout: Duration,
    on_broken: F,
) -> Result<Delivery, GmError>
where
    F: Fn(&Arc<GMConnection>),
{
    let size = ring.len();
    let start = hash_index(instance_ip, size);

    for step in 0..size {
        let conn = &ring[(start + step) % size];
        if !conn.is_connected().await {
            debug!(gm = %conn.addr(), ip = %instance_ip, "Skipping disconnected GM");
            continue;
        }
        match conn.report(detect_type, payload, send_timeout).await {
            Ok(()) => {
                return Ok(Delivery {
                    gm_ip: conn.ip.clone(),
                    gm_port: conn.port,
                    attempts: step + 1,
                });
            }
            Err(e) => {
                warn!(gm = %conn.addr(), ip = %instance_ip, error = %e, "GM report failed, trying next node");
                on_broken(conn);
            }
        }
    }

    Err(GmError::AllDisconnected { ring_size: size })
}
