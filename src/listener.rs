//! The dual TCP listener service (§4.6), the counterpart to
//! [`crate::peer::pool::PeerPool::accept_inbound`] that actually produces the
//! inbound sockets it consumes.
//!
//! Soulseek clients advertise two listening ports to peers who want to dial
//! in directly: a plain one and an "obfuscated" one immediately above it
//! (`plain_port + 1`), used to dodge naive deep packet inspection. Both speak
//! the same protocol underneath; the obfuscation is a thin XOR scramble
//! applied inside the peer codec, not at this layer, so this service only
//! needs to tag each accepted socket with which port it came in on and hand
//! it to the pool.
//!
//! IPv6 is out of scope (SPEC_FULL.md's listener section): both listeners
//! bind `0.0.0.0` only.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::conf::ListenerConf;
use crate::error::{Error, Result};
use crate::peer::pool::PeerPool;

#[cfg(test)]
use crate::callbacks::PoolSinks;
#[cfg(test)]
use crate::conf::PeerConf;

/// A running pair of plain/obfuscated listeners. Dropping this does not stop
/// the accept loops; use the `shutdown` sender passed to [`bind`] for that.
pub struct ListenerService {
    /// The port the plain listener ended up bound to, picked from the
    /// configured range.
    pub plain_port: u16,
    /// The obfuscated listener's port, always `plain_port + 1`.
    pub obfuscated_port: u16,
}

impl ListenerService {
    /// Binds both listeners and spawns their accept loops, which run until
    /// `shutdown` fires. Tries each port in `conf.port_range` in turn for the
    /// plain listener; the first that is free wins.
    pub async fn bind(
        conf: ListenerConf,
        pool: Arc<PeerPool>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Arc<Self>> {
        let (plain, plain_port) = bind_in_range(&conf.port_range).await?;
        let obfuscated_port = plain_port
            .checked_add(1)
            .ok_or(Error::InvalidPort(plain_port))?;
        let obfuscated = bind_port(obfuscated_port).await?;

        let service = Arc::new(Self {
            plain_port,
            obfuscated_port,
        });

        tokio::spawn(accept_loop(plain, pool.clone(), false, shutdown.subscribe()));
        tokio::spawn(accept_loop(obfuscated, pool, true, shutdown.subscribe()));

        info!(
            "listening on {} (plain), {} (obfuscated)",
            service.plain_port, service.obfuscated_port
        );
        Ok(service)
    }
}

async fn bind_in_range(range: &std::ops::RangeInclusive<u16>) -> Result<(TcpListener, u16)> {
    let mut last_err = None;
    for port in range.clone() {
        match bind_port(port).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(Error::InvalidPort(*range.start())))
}

async fn bind_port(port: u16) -> Result<TcpListener> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    TcpListener::bind(addr).await.map_err(Error::from)
}

async fn accept_loop(
    mut listener: TcpListener,
    pool: Arc<PeerPool>,
    obfuscated: bool,
    mut shutdown: broadcast::Receiver<()>,
) {
    let kind = if obfuscated { "obfuscated" } else { "plain" };
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((socket, addr)) => {
                    debug!("accepted {} connection from {}", kind, addr);
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        pool.accept_inbound(socket, obfuscated).await;
                    });
                }
                Err(e) => warn!("{} listener accept failed: {}", kind, e),
            },
            _ = shutdown.recv() => {
                info!("{} listener shutting down", kind);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_obfuscated_port_directly_above_plain() {
        let conf = ListenerConf {
            port_range: 0..=0,
        };
        let pool = PeerPool::new(PeerConf::default(), "tester", PoolSinks::new());
        let (tx, _rx) = broadcast::channel(1);
        let service = ListenerService::bind(conf, pool, &tx).await.unwrap();
        assert_eq!(service.obfuscated_port, service.plain_port + 1);
    }

    #[tokio::test]
    async fn falls_back_to_next_port_in_range_when_first_is_taken() {
        let held = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        let taken_port = held.local_addr().unwrap().port();

        let conf = ListenerConf {
            port_range: taken_port..=taken_port.saturating_add(5),
        };
        let pool = PeerPool::new(PeerConf::default(), "tester", PoolSinks::new());
        let (tx, _rx) = broadcast::channel(1);
        let service = ListenerService::bind(conf, pool, &tx).await.unwrap();
        assert_ne!(service.plain_port, taken_port);
        drop(held);
    }
}
