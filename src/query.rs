//! The A2S server querier: A2S_INFO (two wire variants plus challenge),
//! A2S_RULES (challenge, multi-packet reassembly, optional bzip2), and the
//! bug-compatibility branches real-world servers require.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use bzip2::read::BzDecoder;
use log::debug;
use std::io::Read;

use crate::codec::{Builder, Reader};
use crate::error::QueryError;
use crate::transport::UdpTransport;
use crate::types::{
    AppId, ExtInfo, GameEngine, ModInfo, Rules, ServerInfo, ServerKind, ServerOs, SpecTvInfo,
    TheShipInfo, A2S_INFO_GOLDSRC, A2S_INFO_SOURCE,
};

const SALVAGE_DEADLINE: Duration = Duration::from_millis(250);
const SALVAGE_ATTEMPTS: usize = 2;
const RULES_CONFUSED_RETRY_LIMIT: usize = 3;
const MAX_BZ2_DECOMPRESSED_SIZE: u32 = 1024 * 1024;

const S2A_INFO_CHALLENGE: u8 = 0x41;
const S2A_PLAYER: u8 = 0x44;
const S2A_RULES: u8 = 0x45;

/// Owns one connected UDP socket to one game server. Caches the last
/// successful `query_info` result so `query_rules`'s multi-packet reassembly
/// knows which engine framing to expect.
pub struct ServerQuerier {
    transport: UdpTransport,
    address: SocketAddrV4,
    last_info: Option<ServerInfo>,
}

impl ServerQuerier {
    pub async fn connect(address: SocketAddrV4, timeout_dur: Duration) -> Result<Self, QueryError> {
        let transport = UdpTransport::connect(&address.to_string(), timeout_dur)
            .await
            .map_err(QueryError::Transport)?;
        Ok(ServerQuerier {
            transport,
            address,
            last_info: None,
        })
    }

    /// Engine classification of the last successful `query_info`, if any.
    pub fn game_engine(&self) -> Option<GameEngine> {
        self.last_info.as_ref().map(ServerInfo::game_engine)
    }

    /// Runs A2S_INFO, handling the challenge handshake and the GoldSrc /
    /// mistaken-reply salvage peek.
    ///
    /// Example usage:
    /// ```no_run
    /// use std::time::Duration;
    /// use blaster::query::ServerQuerier;
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let addr = "nyc-1.us.uncletopia.com:27015".parse()?;
    /// let mut querier = ServerQuerier::connect(addr, Duration::from_secs(5)).await?;
    /// let info = querier.query_info().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_info(&mut self) -> Result<ServerInfo, QueryError> {
        let (info, via_mistaken_reply) = match self.a2s_info().await {
            Err(QueryError::MistakenReply) => {
                // Some non-Steam servers reply with a corrupted S2A_PLAYER
                // packet on the first try; resending often gets the real one.
                (self.a2s_info().await?, true)
            }
            other => (other?, false),
        };

        let info = self.try_salvage(info, via_mistaken_reply).await;
        self.last_info = Some(info.clone());
        Ok(info)
    }

    async fn a2s_info(&mut self) -> Result<ServerInfo, QueryError> {
        self.send_info_query(None).await?;
        let packet = self.transport.recv().await.map_err(QueryError::Transport)?;
        self.parse_info_reply(&packet).await
    }

    async fn parse_info_reply(&mut self, packet: &[u8]) -> Result<ServerInfo, QueryError> {
        let mut reader = Reader::new(packet);
        if reader.read_i32_le()? != -1 {
            return Err(QueryError::BadPacketHeader);
        }
        let version = reader.read_u8()?;
        match version {
            S2A_INFO_CHALLENGE => {
                let challenge = reader.read_bytes(4)?.to_vec();
                self.send_info_query(Some(&challenge)).await?;
                let retry_packet = self.transport.recv().await.map_err(QueryError::Transport)?;
                let mut retry_reader = Reader::new(&retry_packet);
                if retry_reader.read_i32_le()? != -1 {
                    return Err(QueryError::BadPacketHeader);
                }
                let retry_version = retry_reader.read_u8()?;
                self.parse_info_body(retry_version, retry_reader)
            }
            S2A_PLAYER => Err(QueryError::MistakenReply),
            other => self.parse_info_body(other, reader),
        }
    }

    fn parse_info_body(&self, version: u8, reader: Reader<'_>) -> Result<ServerInfo, QueryError> {
        match version {
            A2S_INFO_SOURCE => parse_source_info(self.address, reader),
            A2S_INFO_GOLDSRC => parse_goldsrc_info(self.address, reader),
            S2A_PLAYER => Err(QueryError::MistakenReply),
            other => Err(QueryError::UnknownInfoVersion(other)),
        }
    }

    async fn send_info_query(&mut self, challenge: Option<&[u8]>) -> Result<(), QueryError> {
        let mut packet = Builder::new();
        packet.write_bytes(&[0xff, 0xff, 0xff, 0xff, 0x54]);
        packet.write_cstring("Source Engine Query");
        if let Some(challenge) = challenge {
            packet.write_bytes(challenge);
        }
        self.transport
            .send(&packet.into_bytes())
            .await
            .map_err(QueryError::Transport)
    }

    /// After a GoldSrc info reply or a mistaken-reply retry, briefly lowers
    /// the deadline and drains up to two more datagrams; these servers are
    /// known to volunteer extra packets after the initial reply. If one
    /// parses as a valid A2S_INFO reply, it replaces `info`; otherwise the
    /// original is kept.
    async fn try_salvage(&mut self, info: ServerInfo, via_mistaken_reply: bool) -> ServerInfo {
        if info.game_engine() != GameEngine::GoldSrc && !via_mistaken_reply {
            return info;
        }
        for _ in 0..SALVAGE_ATTEMPTS {
            match self.transport.recv_within(SALVAGE_DEADLINE).await {
                Ok(packet) => match self.parse_info_reply(&packet).await {
                    Ok(salvaged) => return salvaged,
                    Err(_) => continue,
                },
                Err(_) => break,
            }
        }
        info
    }

    /// Runs A2S_RULES. Requires a prior successful `query_info` so the
    /// multi-packet reassembly knows which engine framing to expect.
    pub async fn query_rules(&mut self) -> Result<Rules, QueryError> {
        let engine = self.game_engine().ok_or(QueryError::UnknownGameEngine)?;

        for _attempt in 0..=RULES_CONFUSED_RETRY_LIMIT {
            match self.query_rules_once(engine).await {
                Err(QueryError::ConfusedChallengeReply) => continue,
                other => return other,
            }
        }
        Err(QueryError::ConfusedChallengeReply)
    }

    async fn query_rules_once(&mut self, engine: GameEngine) -> Result<Rules, QueryError> {
        self.send_rules_challenge().await?;
        let packet = self.transport.recv().await.map_err(QueryError::Transport)?;
        self.parse_rules_top_level(engine, &packet).await
    }

    /// Parses a top-level rules reply, following at most one challenge
    /// redirect (the server is only ever supposed to challenge once per
    /// request) before reaching a `-2` reassembly group or a `-1`/`0x45`
    /// single-packet body.
    async fn parse_rules_top_level(
        &mut self,
        engine: GameEngine,
        packet: &[u8],
    ) -> Result<Rules, QueryError> {
        let mut packet = packet.to_vec();
        for _ in 0..2 {
            let mut reader = Reader::new(&packet);
            let header = reader.read_i32_le()?;
            match header {
                -2 => return self.reassemble_rules(engine, reader).await,
                -1 => {
                    let kind = reader.read_u8()?;
                    match kind {
                        S2A_INFO_CHALLENGE => {
                            let challenge = reader.read_bytes(4)?.to_vec();
                            self.send_rules_request(&challenge).await?;
                            packet = self.transport.recv().await.map_err(QueryError::Transport)?;
                            continue;
                        }
                        S2A_RULES => return parse_rules_body(reader),
                        A2S_INFO_SOURCE | S2A_PLAYER => {
                            debug!("server sent a confused reply to a rules challenge, retrying");
                            return Err(QueryError::ConfusedChallengeReply);
                        }
                        _ => return Err(QueryError::BadChallengeResponse),
                    }
                }
                _ => return Err(QueryError::BadPacketHeader),
            }
        }
        Err(QueryError::BadChallengeResponse)
    }

    async fn send_rules_challenge(&mut self) -> Result<(), QueryError> {
        let mut packet = Builder::new();
        packet.write_bytes(&[0xff, 0xff, 0xff, 0xff, 0x56, 0xff, 0xff, 0xff, 0xff]);
        self.transport
            .send(&packet.into_bytes())
            .await
            .map_err(QueryError::Transport)
    }

    async fn send_rules_request(&mut self, challenge: &[u8]) -> Result<(), QueryError> {
        let mut packet = Builder::new();
        packet.write_bytes(&[0xff, 0xff, 0xff, 0xff, 0x56]);
        packet.write_bytes(challenge);
        self.transport
            .send(&packet.into_bytes())
            .await
            .map_err(QueryError::Transport)
    }

    /// Reassembles a multi-packet (`-2` header) reply group, receiving
    /// further packets until every index in `[0, total)` has been filled.
    /// `reader` is positioned just past the `-2` header of the first packet.
    async fn reassemble_rules(
        &mut self,
        engine: GameEngine,
        mut reader: Reader<'_>,
    ) -> Result<Rules, QueryError> {
        let app_id = self
            .last_info
            .as_ref()
            .and_then(|i| i.ext.as_ref().map(|e| e.app_id));
        let protocol = self.last_info.as_ref().map(|i| i.protocol);

        let (id, total, number, payload) =
            parse_multi_packet_header(engine, &mut reader, app_id, protocol)?;
        let compressed = engine == GameEngine::Source && (id & 0x8000_0000) != 0;

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total as usize];
        place_packet(&mut slots, number, total, payload)?;

        while slots.iter().any(Option::is_none) {
            let packet = self.transport.recv().await.map_err(QueryError::Transport)?;
            let mut reader = Reader::new(&packet);
            let header = reader.read_i32_le()?;
            if header != -2 {
                return Err(QueryError::BadPacketHeader);
            }
            let (_id, group_total, number, payload) =
                parse_multi_packet_header(engine, &mut reader, app_id, protocol)?;
            if group_total as usize != slots.len() {
                return Err(QueryError::BadPacketNumber {
                    number,
                    total: group_total,
                });
            }
            place_packet(&mut slots, number, group_total, payload)?;
        }

        let mut assembled = Vec::new();
        for slot in slots {
            assembled.extend_from_slice(&slot.expect("all slots filled by loop invariant"));
        }

        let body = if compressed {
            decompress_bz2(&assembled)?
        } else {
            assembled
        };

        let mut reader = Reader::new(&body);
        let header = reader.read_i32_le()?;
        if header != -1 {
            return Err(QueryError::BadRulesReply);
        }
        let kind = reader.read_u8()?;
        if kind != S2A_RULES {
            return Err(QueryError::BadRulesReply);
        }
        parse_rules_body(reader)
    }
}

fn place_packet(
    slots: &mut [Option<Vec<u8>>],
    number: u8,
    total: u8,
    payload: Vec<u8>,
) -> Result<(), QueryError> {
    if number >= total {
        return Err(QueryError::BadPacketNumber { number, total });
    }
    let slot = &mut slots[number as usize];
    if slot.is_some() {
        return Err(QueryError::DuplicatePacket(number));
    }
    *slot = Some(payload);
    Ok(())
}

/// Counter-Strike: Source's app id; combined with `protocol == 7` this is
/// the one pre-orange-box case not covered by the fixed app id list.
const CSS_APP_ID: AppId = AppId(240);

/// Decodes a multi-packet header (already past the `-2` prefix) per the
/// active engine's framing, returning `(group_id, total, number, payload)`.
fn parse_multi_packet_header(
    engine: GameEngine,
    reader: &mut Reader<'_>,
    app_id: Option<AppId>,
    protocol: Option<u8>,
) -> Result<(u32, u8, u8, Vec<u8>), QueryError> {
    match engine {
        GameEngine::GoldSrc => {
            let id = reader.read_u32_le()?;
            let byte = reader.read_u8()?;
            let number = byte >> 4;
            let total = byte & 0x0f;
            let payload = reader.read_remaining().to_vec();
            Ok((id, total, number, payload))
        }
        GameEngine::Source => {
            let id = reader.read_u32_le()?;
            let total = reader.read_u8()?;
            let number = reader.read_u8()?;
            let pre_orange_box = app_id.map(AppId::is_pre_orange_box).unwrap_or(false)
                || (app_id == Some(CSS_APP_ID) && protocol == Some(7));
            if !pre_orange_box {
                let _packet_size = reader.read_u16_le()?;
            }
            let payload = reader.read_remaining().to_vec();
            Ok((id, total, number, payload))
        }
    }
}

/// Decompresses a bzip2-compressed Source rules group. The payload is
/// expected to begin with `decompressed_size u32` and `checksum u32`
/// (CRC32/IEEE), followed by the bzip2 stream itself.
fn decompress_bz2(payload: &[u8]) -> Result<Vec<u8>, QueryError> {
    let mut reader = Reader::new(payload);
    let decompressed_size = reader.read_u32_le()?;
    let checksum = reader.read_u32_le()?;

    if decompressed_size > MAX_BZ2_DECOMPRESSED_SIZE {
        return Err(QueryError::WrongBz2Size(decompressed_size));
    }

    let compressed = reader.read_remaining();
    let mut out = Vec::with_capacity(decompressed_size as usize);
    BzDecoder::new(compressed).read_to_end(&mut out)?;

    if out.len() != decompressed_size as usize {
        return Err(QueryError::WrongBz2SizeMismatch);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out);
    if hasher.finalize() != checksum {
        return Err(QueryError::WrongBz2Checksum);
    }

    Ok(out)
}

/// Parses a rules body (`count u16` then `count` key/value C-string pairs),
/// stopping early and returning whatever pairs parsed if a string runs past
/// the buffer — truncated replies are common and a partial result beats
/// failing the whole server.
fn parse_rules_body(mut reader: Reader<'_>) -> Result<Rules, QueryError> {
    let count = reader.read_u16_le()?;
    let mut rules = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = match reader.read_cstring() {
            Ok(k) => k,
            Err(_) => break,
        };
        let value = match reader.read_cstring() {
            Ok(v) => v,
            Err(_) => break,
        };
        rules.insert(key, value);
    }
    Ok(rules)
}

fn parse_source_info(
    address: SocketAddrV4,
    mut reader: Reader<'_>,
) -> Result<ServerInfo, QueryError> {
    let protocol = reader.read_u8()?;
    let name = reader.read_cstring()?;
    let map_name = reader.read_cstring()?;
    let folder = reader.read_cstring()?;
    let game = reader.read_cstring()?;
    let mut app_id = AppId(reader.read_u16_le()? as u32);
    let players = reader.read_u8()?;
    let max_players = reader.read_u8()?;
    let bots = reader.read_u8()?;
    let kind = ServerKind::from_byte(reader.read_u8()?);
    let os = ServerOs::from_byte(reader.read_u8()?);
    let visibility = reader.read_u8()?;
    let vac = reader.read_u8()?;

    let the_ship = if app_id == AppId::THE_SHIP {
        Some(TheShipInfo {
            mode: reader.read_u8()?,
            witnesses: reader.read_u8()?,
            duration: reader.read_u8()?,
        })
    } else {
        None
    };

    let game_version = reader.read_cstring()?;
    let mut ext = ExtInfo {
        app_id,
        game_version,
        ..Default::default()
    };
    let mut spec_tv = None;

    if reader.more() {
        let edf = reader.read_u8()?;
        if edf & 0x80 != 0 {
            ext.port = Some(reader.read_u16_le()?);
        }
        if edf & 0x10 != 0 {
            ext.steam_id = Some(reader.read_u64_le()?);
        }
        if edf & 0x40 != 0 {
            spec_tv = Some(SpecTvInfo {
                port: reader.read_u16_le()?,
                name: reader.read_cstring()?,
            });
        }
        if edf & 0x20 != 0 {
            ext.game_mode_description = Some(reader.read_cstring()?);
        }
        if edf & 0x01 != 0 {
            let game_id = reader.read_u64_le()?;
            ext.game_id = Some(game_id);
            app_id = AppId((game_id & 0xff_ffff) as u32);
            ext.app_id = app_id;
        }
    }

    Ok(ServerInfo {
        address,
        info_version: A2S_INFO_SOURCE,
        protocol,
        name,
        map_name,
        folder,
        game,
        players,
        max_players,
        bots,
        kind,
        os,
        visibility,
        vac,
        r#mod: None,
        the_ship,
        spec_tv,
        ext: Some(ext),
    })
}

fn parse_goldsrc_info(
    address: SocketAddrV4,
    mut reader: Reader<'_>,
) -> Result<ServerInfo, QueryError> {
    let _reported_address = reader.read_cstring()?;
    let name = reader.read_cstring()?;
    let map_name = reader.read_cstring()?;
    let folder = reader.read_cstring()?;
    let game = reader.read_cstring()?;
    let players = reader.read_u8()?;
    let max_players = reader.read_u8()?;
    let protocol = reader.read_u8()?;
    let kind = ServerKind::from_byte(reader.read_u8()?);
    let os = ServerOs::from_byte(reader.read_u8()?);
    let visibility = reader.read_u8()?;
    let is_mod = reader.read_u8()?;

    let r#mod = if is_mod == 1 {
        let url = reader.read_cstring()?;
        let download_url = reader.read_cstring()?;
        let _reserved = reader.read_u8()?;
        let version = reader.read_u32_le()?;
        let size = reader.read_u32_le()?;
        let kind = reader.read_u8()?;
        let dll = reader.read_u8()?;
        Some(ModInfo {
            url,
            download_url,
            version,
            size,
            kind,
            dll,
        })
    } else {
        None
    };

    let vac = reader.read_u8()?;
    let bots = reader.read_u8()?;

    Ok(ServerInfo {
        address,
        info_version: A2S_INFO_GOLDSRC,
        protocol,
        name,
        map_name,
        folder,
        game,
        players,
        max_players,
        bots,
        kind,
        os,
        visibility,
        vac,
        r#mod,
        the_ship: None,
        spec_tv: None,
        ext: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goldsrc_info_packet() -> Vec<u8> {
        let mut b = Builder::new();
        b.write_bytes(&[0xff, 0xff, 0xff, 0xff]);
        b.write_u8(A2S_INFO_GOLDSRC);
        b.write_cstring("1.2.3.4:27015");
        b.write_cstring("Srv");
        b.write_cstring("de_dust");
        b.write_cstring("cstrike");
        b.write_cstring("Counter-Strike");
        b.write_u8(4);
        b.write_u8(16);
        b.write_u8(0x47);
        b.write_u8(b'd');
        b.write_u8(b'l');
        b.write_u8(0);
        b.write_u8(0); // is_mod
        b.write_u8(0); // vac
        b.write_u8(1); // bots
        b.into_bytes()
    }

    #[test]
    fn goldsrc_info_parses_expected_fields() {
        let packet = goldsrc_info_packet();
        let mut reader = Reader::new(&packet);
        assert_eq!(reader.read_i32_le().unwrap(), -1);
        let version = reader.read_u8().unwrap();
        assert_eq!(version, A2S_INFO_GOLDSRC);
        let info = parse_goldsrc_info("1.2.3.4:27015".parse().unwrap(), reader).unwrap();

        assert_eq!(info.info_version, A2S_INFO_GOLDSRC);
        assert_eq!(info.players, 4);
        assert_eq!(info.max_players, 16);
        assert_eq!(info.protocol, 0x47);
        assert_eq!(info.kind, ServerKind::Dedicated);
        assert_eq!(info.os, ServerOs::Linux);
        assert_eq!(info.visibility, 0);
        assert!(info.r#mod.is_none());
        assert_eq!(info.vac, 0);
        assert_eq!(info.bots, 1);
    }

    fn source_info_prefix(app_id: u16) -> Builder {
        let mut b = Builder::new();
        b.write_u8(7); // protocol
        b.write_cstring("Srv");
        b.write_cstring("de_dust2");
        b.write_cstring("cstrike");
        b.write_cstring("Counter-Strike: Source");
        b.write_u16_le(app_id);
        b.write_u8(1);
        b.write_u8(32);
        b.write_u8(0);
        b.write_u8(b'd');
        b.write_u8(b'l');
        b.write_u8(0);
        b.write_u8(0);
        b
    }

    #[test]
    fn source_info_edf_game_id_overrides_app_id() {
        let mut b = source_info_prefix(240);
        b.write_cstring("1.37.9");
        b.write_u8(0x01); // EDF: game id only
        b.write_u64_le(500); // low 24 bits = 500
        let bytes = b.into_bytes();

        let info = parse_source_info("1.2.3.4:1".parse().unwrap(), Reader::new(&bytes)).unwrap();
        let ext = info.ext.unwrap();
        assert_eq!(ext.app_id.0, 500);
        assert_eq!(ext.game_id, Some(500));
    }

    #[test]
    fn source_info_short_reply_is_out_of_bounds() {
        let bytes = [7u8, b'S', b'r', b'v']; // missing NUL and everything after
        let err = parse_source_info("1.2.3.4:1".parse().unwrap(), Reader::new(&bytes)).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Codec(crate::error::CodecError::UnterminatedString)
        ));
    }

    #[test]
    fn multi_packet_reassembly_is_order_independent() {
        let payloads = [b"AAA".to_vec(), b"BB".to_vec(), b"CCCC".to_vec()];
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; 3];
        // deliver out of order: 2, 0, 1
        place_packet(&mut slots, 2, 3, payloads[2].clone()).unwrap();
        place_packet(&mut slots, 0, 3, payloads[0].clone()).unwrap();
        place_packet(&mut slots, 1, 3, payloads[1].clone()).unwrap();

        let mut assembled = Vec::new();
        for slot in slots {
            assembled.extend_from_slice(&slot.unwrap());
        }
        assert_eq!(assembled, b"AAABBCCCC");
    }

    #[test]
    fn duplicate_packet_number_is_rejected() {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; 2];
        place_packet(&mut slots, 0, 2, b"a".to_vec()).unwrap();
        assert!(matches!(
            place_packet(&mut slots, 0, 2, b"b".to_vec()),
            Err(QueryError::DuplicatePacket(0))
        ));
    }

    #[test]
    fn packet_number_beyond_total_is_rejected() {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; 2];
        assert!(matches!(
            place_packet(&mut slots, 2, 2, b"a".to_vec()),
            Err(QueryError::BadPacketNumber {
                number: 2,
                total: 2
            })
        ));
    }

    #[test]
    fn rules_body_parses_challenge_reply() {
        let mut b = Builder::new();
        b.write_u16_le(2);
        b.write_cstring("mp_timelimit");
        b.write_cstring("30");
        b.write_cstring("sv_gravity");
        b.write_cstring("800");
        let bytes = b.into_bytes();

        let rules = parse_rules_body(Reader::new(&bytes)).unwrap();
        assert_eq!(rules.get("mp_timelimit").unwrap(), "30");
        assert_eq!(rules.get("sv_gravity").unwrap(), "800");
    }

    #[test]
    fn rules_body_truncated_mid_pair_keeps_completed_pairs() {
        let mut b = Builder::new();
        b.write_u16_le(2);
        b.write_cstring("mp_timelimit");
        b.write_cstring("30");
        b.write_cstring("sv_gravity"); // value is missing entirely
        let bytes = b.into_bytes();

        let rules = parse_rules_body(Reader::new(&bytes)).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.get("mp_timelimit").unwrap(), "30");
    }

    #[test]
    fn bz2_size_over_limit_is_rejected_before_decompressing() {
        let mut b = Builder::new();
        b.write_u32_le(MAX_BZ2_DECOMPRESSED_SIZE + 1);
        b.write_u32_le(0);
        let bytes = b.into_bytes();
        assert!(matches!(
            decompress_bz2(&bytes),
            Err(QueryError::WrongBz2Size(_))
        ));
    }

    /// End-to-end tests below drive a real `ServerQuerier` against a fake
    /// server over a loopback socket, exercising the wire state machine
    /// (challenge handshakes, multi-packet reassembly, salvage) rather than
    /// just the leaf parsers the tests above cover directly.
    use tokio::net::UdpSocket as StdUdp;

    fn source_info_wire_reply(name: &str, app_id: u16) -> Vec<u8> {
        let mut b = Builder::new();
        b.write_bytes(&[0xff, 0xff, 0xff, 0xff]);
        b.write_u8(A2S_INFO_SOURCE);
        b.write_u8(17);
        b.write_cstring(name);
        b.write_cstring("de_dust2");
        b.write_cstring("cstrike");
        b.write_cstring("Counter-Strike: Source");
        b.write_u16_le(app_id);
        b.write_u8(1);
        b.write_u8(32);
        b.write_u8(0);
        b.write_u8(b'd');
        b.write_u8(b'l');
        b.write_u8(0);
        b.write_u8(0);
        b.write_cstring("1.0.0");
        b.into_bytes()
    }

    fn source_multi_packet(
        id: u32,
        total: u8,
        number: u8,
        include_size: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut b = Builder::new();
        b.write_bytes(&(-2i32).to_le_bytes());
        b.write_u32_le(id);
        b.write_u8(total);
        b.write_u8(number);
        if include_size {
            b.write_u16_le(payload.len() as u16);
        }
        b.write_bytes(payload);
        b.into_bytes()
    }

    #[tokio::test]
    async fn query_info_completes_challenge_handshake_over_loopback() {
        let server = StdUdp::bind("127.0.0.1:0").await.unwrap();
        let server_addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("expected an IPv4 loopback address, got {other}"),
        };

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1400];

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..5], &[0xff, 0xff, 0xff, 0xff, 0x54]);
            let _ = n;

            let challenge = [0x11, 0x22, 0x33, 0x44];
            let mut challenge_reply = Builder::new();
            challenge_reply.write_bytes(&[0xff, 0xff, 0xff, 0xff, S2A_INFO_CHALLENGE]);
            challenge_reply.write_bytes(&challenge);
            server
                .send_to(&challenge_reply.into_bytes(), from)
                .await
                .unwrap();

            let (n, _from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[n - 4..n], &challenge);

            let reply = source_info_wire_reply("Challenge Server", 240);
            server.send_to(&reply, from).await.unwrap();
        });

        let mut querier = ServerQuerier::connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        let info = querier.query_info().await.unwrap();

        assert_eq!(info.name, "Challenge Server");
        assert_eq!(info.players, 1);
        assert_eq!(info.max_players, 32);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn query_rules_completes_challenge_and_out_of_order_reassembly_over_loopback() {
        let server = StdUdp::bind("127.0.0.1:0").await.unwrap();
        let server_addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("expected an IPv4 loopback address, got {other}"),
        };

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1400];

            // A2S_INFO, no challenge, so query_rules has an engine/app id to work with.
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let info_reply = source_info_wire_reply("Rules Server", 4000);
            server.send_to(&info_reply, from).await.unwrap();

            // A2S_RULES challenge handshake.
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let challenge = [0xaa, 0xbb, 0xcc, 0xdd];
            let mut challenge_reply = Builder::new();
            challenge_reply.write_bytes(&[0xff, 0xff, 0xff, 0xff, S2A_INFO_CHALLENGE]);
            challenge_reply.write_bytes(&challenge);
            server
                .send_to(&challenge_reply.into_bytes(), from)
                .await
                .unwrap();

            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[n - 4..n], &challenge);

            let mut body = Builder::new();
            body.write_bytes(&[0xff, 0xff, 0xff, 0xff, S2A_RULES]);
            body.write_u16_le(2);
            body.write_cstring("mp_timelimit");
            body.write_cstring("30");
            body.write_cstring("sv_gravity");
            body.write_cstring("800");
            let body = body.into_bytes();

            let third = body.len() / 3;
            let chunks = [&body[..third], &body[third..2 * third], &body[2 * third..]];
            let packets: Vec<Vec<u8>> = chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| source_multi_packet(0x1234_5678, 3, i as u8, true, chunk))
                .collect();

            // Deliver out of order: 2, 0, 1.
            for &idx in &[2usize, 0, 1] {
                server.send_to(&packets[idx], from).await.unwrap();
            }
        });

        let mut querier = ServerQuerier::connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        querier.query_info().await.unwrap();
        let rules = querier.query_rules().await.unwrap();

        assert_eq!(rules.get("mp_timelimit").unwrap(), "30");
        assert_eq!(rules.get("sv_gravity").unwrap(), "800");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn query_info_attempts_salvage_after_mistaken_reply_over_loopback() {
        let server = StdUdp::bind("127.0.0.1:0").await.unwrap();
        let server_addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("expected an IPv4 loopback address, got {other}"),
        };

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1400];

            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut mistaken = Builder::new();
            mistaken.write_bytes(&[0xff, 0xff, 0xff, 0xff, S2A_PLAYER]);
            mistaken.write_bytes(&[0u8; 5]);
            server.send_to(&mistaken.into_bytes(), from).await.unwrap();

            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let initial = source_info_wire_reply("Initial Name", 4000);
            server.send_to(&initial, from).await.unwrap();

            let salvaged = source_info_wire_reply("Salvaged Name", 4000);
            server.send_to(&salvaged, from).await.unwrap();
        });

        let mut querier = ServerQuerier::connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        let info = querier.query_info().await.unwrap();

        assert_eq!(info.name, "Salvaged Name");

        handle.await.unwrap();
    }
}
