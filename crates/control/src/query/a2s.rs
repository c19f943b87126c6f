//! Source engine `A2S_INFO` over UDP, including the challenge round trip newer
//! servers require.

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{QueryAdapter, QueryContext, QueryOutcome};
use crate::error::ProbeError;

const HEADER: [u8; 4] = [0xFF; 4];
const INFO_REQUEST: u8 = 0x54;
const INFO_RESPONSE: u8 = 0x49;
const CHALLENGE: u8 = 0x41;

pub struct A2sAdapter;

pub fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = HEADER.to_vec();
    out.push(INFO_REQUEST);
    out.extend_from_slice(b"Source Engine Query\0");
    if let Some(c) = challenge {
        out.extend_from_slice(&c);
    }
    out
}

fn challenge_of(packet: &[u8]) -> Option<[u8; 4]> {
    let body = packet.strip_prefix(&HEADER)?;
    match body.split_first() {
        Some((&CHALLENGE, rest)) if rest.len() >= 4 => Some([rest[0], rest[1], rest[2], rest[3]]),
        _ => None,
    }
}

/// Player and slot counts out of an `A2S_INFO` response.
pub fn parse_info(packet: &[u8]) -> Result<QueryOutcome, ProbeError> {
    let malformed = |what: &str| ProbeError::Malformed(format!("a2s: {what}"));
    let body = packet.strip_prefix(&HEADER).ok_or_else(|| malformed("missing header"))?;
    let (&kind, rest) = body.split_first().ok_or_else(|| malformed("empty packet"))?;
    if kind != INFO_RESPONSE {
        return Err(malformed(&format!("unexpected response type 0x{kind:02x}")));
    }
    // protocol byte, then name, map, folder and game as C strings
    let mut rest = rest.get(1..).ok_or_else(|| malformed("truncated"))?;
    for _ in 0..4 {
        let end = rest.iter().position(|b| *b == 0).ok_or_else(|| malformed("unterminated string"))?;
        rest = &rest[end + 1..];
    }
    // u16 app id precedes the counts
    match rest.get(2..4) {
        Some(&[players, max_players]) => Ok(QueryOutcome {
            status: "online".to_string(),
            players: Some(players as u32),
            max_players: Some(max_players as u32),
        }),
        _ => Err(malformed("truncated counts")),
    }
}

#[async_trait]
impl QueryAdapter for A2sAdapter {
    fn name(&self) -> &'static str {
        "a2s"
    }

    fn supports(&self, query_type: &str) -> bool {
        matches!(query_type, "a2s" | "source" | "steam")
    }

    async fn query(&self, ctx: &QueryContext) -> Result<QueryOutcome, ProbeError> {
        let port = ctx.query_port.or(ctx.game_port).ok_or(ProbeError::MissingContext("query port"))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((ctx.host.as_str(), port)).await?;
        socket.send(&info_request(None)).await?;

        let mut buf = [0u8; 1400];
        // a server may answer a stale challenge with a fresh one
        for _ in 0..3 {
            let n = socket.recv(&mut buf).await?;
            match challenge_of(&buf[..n]) {
                Some(challenge) => {
                    socket.send(&info_request(Some(challenge))).await?;
                }
                None => return parse_info(&buf[..n]),
            }
        }
        Err(ProbeError::Malformed("a2s: challenge not accepted".to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn info_packet(players: u8, max_players: u8) -> Vec<u8> {
        let mut p = HEADER.to_vec();
        p.push(INFO_RESPONSE);
        p.push(17);
        for s in ["My Server", "de_dust2", "csgo", "Counter-Strike"] {
            p.extend_from_slice(s.as_bytes());
            p.push(0);
        }
        p.extend_from_slice(&730u16.to_le_bytes());
        p.push(players);
        p.push(max_players);
        p.push(0);
        p
    }

    #[test]
    fn parses_info_counts() {
        let outcome = parse_info(&info_packet(5, 24)).unwrap();
        assert_eq!(outcome.players, Some(5));
        assert_eq!(outcome.max_players, Some(24));
    }

    #[test]
    fn rejects_truncated_packets() {
        let packet = info_packet(5, 24);
        assert!(parse_info(&packet[..packet.len() - 3]).is_err());
        assert!(parse_info(&[0x00, 0x01]).is_err());
    }

    #[tokio::test]
    async fn challenge_round_trip_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1400];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], info_request(None).as_slice());
            let mut challenge = HEADER.to_vec();
            challenge.extend_from_slice(&[CHALLENGE, 1, 2, 3, 4]);
            server.send_to(&challenge, peer).await.unwrap();

            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], info_request(Some([1, 2, 3, 4])).as_slice());
            server.send_to(&info_packet(3, 16), peer).await.unwrap();
        });

        let ctx = QueryContext { host: "127.0.0.1".into(), query_port: Some(port), ..Default::default() };
        let outcome = A2sAdapter.query(&ctx).await.unwrap();
        assert_eq!(outcome.players, Some(3));
        assert_eq!(outcome.max_players, Some(16));
    }
}
