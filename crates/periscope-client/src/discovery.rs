//! Listening for agent discovery beacons.
//!
//! Agents broadcast small JSON beacons over UDP. The listener surfaces each
//! one, optionally pre-filtered so incompatible targets are rejected before
//! a handshake is ever attempted.

use std::{io, net::SocketAddr};

use tokio::{net::UdpSocket, sync::mpsc};

use periscope_core::AbiDescriptor;
use periscope_wire::{Beacon, DISCOVERY_PORT, SUPPORTED_VERSIONS};

/// Listen on the well-known discovery port.
///
/// With a `payload` descriptor given, only beacons from targets that
/// payload could be loaded into are surfaced.
///
/// # Errors
/// Propagates socket bind failures.
pub async fn listen(
    payload: Option<AbiDescriptor>,
) -> io::Result<mpsc::UnboundedReceiver<Beacon>> {
    let (_, rx) = listen_on(SocketAddr::from(([0, 0, 0, 0], DISCOVERY_PORT)), payload).await?;
    Ok(rx)
}

/// [`listen`] on an explicit address, returning the bound address as well.
///
/// # Errors
/// Propagates socket bind failures.
pub async fn listen_on(
    addr: SocketAddr,
    payload: Option<AbiDescriptor>,
) -> io::Result<(SocketAddr, mpsc::UnboundedReceiver<Beacon>)> {
    let socket = UdpSocket::bind(addr).await?;
    let local = socket.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "ignoring undecodable beacon");
                    continue;
                }
            };
            if !acceptable(&beacon, payload.as_ref()) {
                tracing::debug!(%from, abi = %beacon.abi, "ignoring incompatible beacon");
                continue;
            }
            if tx.send(beacon).is_err() {
                break;
            }
        }
    });

    Ok((local, rx))
}

/// Whether a beacon is worth attempting a handshake against.
fn acceptable(beacon: &Beacon, payload: Option<&AbiDescriptor>) -> bool {
    if !SUPPORTED_VERSIONS.contains(&beacon.protocol_version) {
        return false;
    }
    let Some(payload) = payload else {
        return true;
    };
    beacon
        .abi
        .parse::<AbiDescriptor>()
        .is_ok_and(|target| payload.is_compatible(&target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::BuildFlavor;
    use periscope_wire::PROTOCOL_VERSION;

    fn beacon(abi: &str, version: u32) -> Beacon {
        Beacon {
            name: "target".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11732,
            abi: abi.to_string(),
            protocol_version: version,
        }
    }

    #[test]
    fn filters_version_and_abi() {
        let payload = AbiDescriptor::new("x86_64", BuildFlavor::Release, 5, 2);

        assert!(acceptable(&beacon("tk5.4-x86_64-release", PROTOCOL_VERSION), Some(&payload)));
        assert!(!acceptable(&beacon("tk5.4-x86_64-release", 999), Some(&payload)));
        assert!(!acceptable(&beacon("tk5.4-aarch64-release", PROTOCOL_VERSION), Some(&payload)));
        assert!(!acceptable(&beacon("gibberish", PROTOCOL_VERSION), Some(&payload)));
        // No filter: anything with a supported version passes.
        assert!(acceptable(&beacon("gibberish", PROTOCOL_VERSION), None));
    }

    #[tokio::test]
    async fn beacons_arrive_through_the_listener() {
        let (local, mut rx) = listen_on(SocketAddr::from(([127, 0, 0, 1], 0)), None)
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = beacon("tk5.4-x86_64-release", PROTOCOL_VERSION);
        sender
            .send_to(&serde_json::to_vec(&b).unwrap(), local)
            .await
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b);
    }
}
