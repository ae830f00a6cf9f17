//! UDP discovery beacon.
//!
//! While serving, the agent periodically broadcasts a small JSON beacon so
//! clients on the network can list reachable targets and reject
//! incompatible ones before ever attempting a handshake.

use std::{net::Ipv4Addr, time::Duration};

use tokio::{net::UdpSocket, time};

use periscope_wire::{Beacon, DISCOVERY_PORT};

/// Seconds between beacons.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Broadcast `beacon` forever. Runs until the task is dropped or aborted.
pub async fn announce(beacon: Beacon) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "discovery beacon disabled, bind failed");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tracing::warn!(error = %e, "discovery beacon disabled, no broadcast permission");
        return;
    }

    let payload = match serde_json::to_vec(&beacon) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "discovery beacon disabled, unencodable");
            return;
        }
    };

    let mut ticker = time::interval(ANNOUNCE_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = socket
            .send_to(&payload, (Ipv4Addr::BROADCAST, DISCOVERY_PORT))
            .await
        {
            tracing::debug!(error = %e, "discovery beacon send failed");
        }
    }
}
