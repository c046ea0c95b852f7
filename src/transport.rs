//! Connected UDP socket with a per-operation deadline and an optional
//! minute-bucketed send rate limiter.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout, Instant};

use crate::error::TransportError;

/// Receive buffer ceiling; the MTU-safe size both A2S and the master
/// protocol are documented to stay under.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Sleeps until the next allowed send, then records the following one.
///
/// Built around `wait = 60s/rate + 1s`: the extra second is empirical slack
/// the master server needs even though it advertises a 20/min limit.
struct RateLimiter {
    wait: Duration,
    next_earliest: Option<Instant>,
}

impl RateLimiter {
    fn new(per_minute: u32) -> Self {
        RateLimiter {
            wait: Duration::from_secs(60) / per_minute + Duration::from_secs(1),
            next_earliest: None,
        }
    }

    async fn enforce(&mut self) {
        if let Some(next) = self.next_earliest {
            sleep_until(next).await;
        }
    }

    fn record(&mut self) {
        self.next_earliest = Some(Instant::now() + self.wait);
    }
}

/// A UDP socket connected to a single remote address.
pub struct UdpTransport {
    sock: UdpSocket,
    timeout: Duration,
    rate_limiter: Option<RateLimiter>,
}

impl UdpTransport {
    pub async fn connect(addr: &str, timeout_dur: Duration) -> Result<Self, TransportError> {
        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(TransportError::BindFailed)?;
        tokio::time::timeout(timeout_dur, sock.connect(addr))
            .await
            .map_err(TransportError::Timeout)?
            .map_err(TransportError::ConnectFailed)?;
        Ok(UdpTransport {
            sock,
            timeout: timeout_dur,
            rate_limiter: None,
        })
    }

    /// Enables a send/recv rate limit of `per_minute` round trips.
    pub fn set_rate_limit(&mut self, per_minute: u32) {
        self.rate_limiter = Some(RateLimiter::new(per_minute));
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(limiter) = &mut self.rate_limiter {
            limiter.enforce().await;
        }
        let result = timeout(self.timeout, self.sock.send(bytes))
            .await
            .map_err(TransportError::Timeout)?
            .map_err(TransportError::SendFailed);
        if let Some(limiter) = &mut self.rate_limiter {
            limiter.record();
        }
        result.map(|_| ())
    }

    /// Receives one datagram, copying it out of a scratch buffer into an
    /// owned `Vec`. Copying (rather than handing back a slice of a shared
    /// buffer) keeps this type safe to use from concurrent workers that each
    /// own their own transport.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = timeout(self.timeout, self.sock.recv(&mut scratch))
            .await
            .map_err(TransportError::Timeout)?
            .map_err(TransportError::RecvFailed)?;
        Ok(scratch[..n].to_vec())
    }

    /// Receives one datagram with a caller-supplied deadline, overriding the
    /// transport's configured timeout for this call only. Used for the
    /// GoldSrc/mistaken-reply salvage peek, which lowers the deadline to
    /// 250ms to opportunistically drain extra packets.
    pub async fn recv_within(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = timeout(deadline, self.sock.recv(&mut scratch))
            .await
            .map_err(TransportError::Timeout)?
            .map_err(TransportError::RecvFailed)?;
        Ok(scratch[..n].to_vec())
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.sock.peer_addr()
    }
}
