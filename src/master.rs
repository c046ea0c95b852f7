//! Paginated walk of Valve's master server directory.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::time::Duration;

use log::{debug, warn};

use crate::codec::{Builder, Reader};
use crate::error::MasterError;
use crate::transport::UdpTransport;
use crate::types::AppId;

const MAX_FILTER_LENGTH: usize = 190;
const DEFAULT_MASTER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MASTER_RESPONSE_HEADER: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0x66, 0x0a];
const MASTER_RATE_LIMIT_PER_MINUTE: u32 = 15;
const PAGE_RETRY_LIMIT: u32 = 4;

/// An ordered list of `\appid\N`-style filter strings. Filters are queried
/// serially: each gets a complete paginated walk before the next begins.
#[derive(Debug, Default, Clone)]
pub struct MasterFilter {
    filters: Vec<String>,
}

impl MasterFilter {
    pub fn new() -> Self {
        MasterFilter::default()
    }

    /// Appends an `\appid\N` filter for each id. Returns an error if the
    /// resulting filter string would exceed the ~190 byte ceiling the
    /// master server request packet allows.
    pub fn add_app_ids(
        &mut self,
        app_ids: impl IntoIterator<Item = AppId>,
    ) -> Result<(), MasterError> {
        for app_id in app_ids {
            let filter = format!("\\appid\\{}", app_id.0);
            if filter.len() > MAX_FILTER_LENGTH {
                return Err(MasterError::FilterTooLong);
            }
            self.filters.push(filter);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Builds a master query request packet for the given seed address and
/// filter set. Pagination is per-filter: `filters` here is whichever single
/// filter (or the empty set) is active for the current paginated walk.
pub fn build_master_query(seed: &str, filters: &[String]) -> Vec<u8> {
    let mut packet = Builder::new();
    packet.write_u8(0x31);
    packet.write_u8(0xff);
    packet.write_cstring(seed);

    match filters {
        [] => {
            packet.write_u8(0);
            packet.write_u8(0);
        }
        [only] => packet.write_cstring(only),
        many => {
            packet.write_bytes(format!("\\or\\{}", many.len()).as_bytes());
            for filter in many {
                packet.write_bytes(filter.as_bytes());
            }
            packet.write_u8(0);
        }
    }

    packet.into_bytes()
}

/// The callback invoked with each non-duplicate page of discovered servers.
/// Returning `Err` stops the walk immediately with that error.
pub type MasterQueryCallback<'a> = dyn FnMut(&[SocketAddrV4]) -> Result<(), String> + Send + 'a;

/// Queries a Valve master server directory.
pub struct MasterClient {
    transport: UdpTransport,
    filters: MasterFilter,
}

impl MasterClient {
    pub async fn connect(host_and_port: &str) -> Result<Self, MasterError> {
        let mut transport = UdpTransport::connect(host_and_port, DEFAULT_MASTER_TIMEOUT)
            .await
            .map_err(MasterError::Transport)?;
        transport.set_rate_limit(MASTER_RATE_LIMIT_PER_MINUTE);
        Ok(MasterClient {
            transport,
            filters: MasterFilter::new(),
        })
    }

    pub fn set_filters(&mut self, filters: MasterFilter) {
        self.filters = filters;
    }

    /// Walks the full directory across all configured filters, delivering
    /// each page's non-duplicate addresses to `callback`. A master-query
    /// error (bad header, exhausted retries, or a callback failure) ends the
    /// whole sweep — unlike per-server query errors, these are fatal.
    pub async fn query(
        &mut self,
        callback: &mut MasterQueryCallback<'_>,
    ) -> Result<(), MasterError> {
        if self.filters.is_empty() {
            return self.query_one_filter(&[], callback).await;
        }
        for filter in self.filters.filters.clone() {
            self.query_one_filter(std::slice::from_ref(&filter), callback)
                .await?;
        }
        Ok(())
    }

    async fn query_one_filter(
        &mut self,
        filters: &[String],
        callback: &mut MasterQueryCallback<'_>,
    ) -> Result<(), MasterError> {
        let mut seen: HashSet<SocketAddrV4> = HashSet::new();
        let mut seed = "0.0.0.0:0".to_string();

        loop {
            let packet = self.send_page_with_retries(&seed, filters).await?;
            let (servers, terminated, next_seed) = parse_page(&packet, &mut seen)?;

            if !servers.is_empty() {
                callback(&servers).map_err(MasterError::CallbackFailed)?;
            }

            if terminated {
                break;
            }
            seed = next_seed;
        }
        Ok(())
    }

    async fn send_page_with_retries(
        &mut self,
        seed: &str,
        filters: &[String],
    ) -> Result<Vec<u8>, MasterError> {
        let query = build_master_query(seed, filters);
        let mut last_err = None;
        for attempt in 0..=PAGE_RETRY_LIMIT {
            self.transport
                .send(&query)
                .await
                .map_err(MasterError::Transport)?;
            match self.transport.recv().await {
                Ok(packet) => return Ok(packet),
                Err(e) => {
                    warn!("master page request failed (attempt {attempt}): {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(MasterError::Transport(last_err.unwrap()))
    }
}

/// Parses one master reply page: validates the header, decodes 6-byte
/// records, detects the `0.0.0.0:0` terminator, and suppresses addresses
/// already present in `seen` (mutated in place across pages of one walk).
/// Returns the non-duplicate servers in first-seen order, whether the
/// terminator was hit, and the next page's seed (the last non-terminator
/// record).
fn parse_page(
    packet: &[u8],
    seen: &mut HashSet<SocketAddrV4>,
) -> Result<(Vec<SocketAddrV4>, bool, String), MasterError> {
    if packet.len() < 6 || packet[0..6] != MASTER_RESPONSE_HEADER {
        return Err(MasterError::BadResponseHeader);
    }

    let mut reader = Reader::new(&packet[6..]);
    let mut servers = Vec::new();
    let mut terminated = false;
    let mut last_addr = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0);

    while reader.more() {
        let ip = match reader.read_ipv4() {
            Ok(ip) => ip,
            Err(_) => break,
        };
        let port = match reader.read_port() {
            Ok(port) => port,
            Err(_) => break,
        };
        let addr = SocketAddrV4::new(std::net::Ipv4Addr::from(ip), port);

        if ip == [0, 0, 0, 0] && port == 0 {
            terminated = true;
            break;
        }

        last_addr = addr;
        if seen.insert(addr) {
            servers.push(addr);
        } else {
            debug!("suppressing duplicate server record {addr}");
        }
    }

    let next_seed = last_addr.to_string();
    Ok((servers, terminated, next_seed))
}
