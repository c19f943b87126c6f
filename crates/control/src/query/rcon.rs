//! Source RCON over TCP: authenticate, run one command, read player counts
//! out of the text reply.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{QueryAdapter, QueryContext, QueryOutcome};
use crate::error::ProbeError;

const AUTH: i32 = 3;
const AUTH_RESPONSE: i32 = 2;
const EXEC: i32 = 2;
const MAX_PACKET: i32 = 4106;

pub struct RconAdapter;

pub fn encode(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let size = (4 + 4 + body.len() + 2) as i32;
    let mut out = Vec::with_capacity(size as usize + 4);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

/// One packet as (id, type, body).
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(i32, i32, String), ProbeError> {
    let mut size = [0u8; 4];
    stream.read_exact(&mut size).await?;
    let size = i32::from_le_bytes(size);
    if !(10..=MAX_PACKET).contains(&size) {
        return Err(ProbeError::Malformed(format!("rcon: packet size {size}")));
    }
    let mut rest = vec![0u8; size as usize];
    stream.read_exact(&mut rest).await?;
    let id = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let kind = i32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let body = String::from_utf8_lossy(&rest[8..rest.len() - 2]).into_owned();
    Ok((id, kind, body))
}

/// Players and slots from a `list` (Minecraft) or `status` (Source) reply.
pub fn parse_player_counts(text: &str) -> Option<(u32, u32)> {
    if let Some((_, rest)) = text.split_once("There are ") {
        let first = rest.split_whitespace().next()?;
        // older servers answer "There are 3/20 players online"
        if let Some((players, max)) = first.split_once('/') {
            return Some((players.parse().ok()?, max.parse().ok()?));
        }
        let players = first.parse().ok()?;
        let max = rest.split_once("max of ")?.1.split_whitespace().next()?.parse().ok()?;
        return Some((players, max));
    }
    // "players : 3 humans, 0 bots (24/0 max)"
    let line = text.lines().find(|l| l.trim_start().starts_with("players"))?;
    let after = line.split_once(':')?.1;
    let players = after.split_whitespace().next()?.parse().ok()?;
    let max = after.split_once('(')?.1.split('/').next()?.trim().parse().ok()?;
    Some((players, max))
}

#[async_trait]
impl QueryAdapter for RconAdapter {
    fn name(&self) -> &'static str {
        "rcon"
    }

    fn supports(&self, query_type: &str) -> bool {
        matches!(query_type, "rcon" | "minecraft")
    }

    async fn query(&self, ctx: &QueryContext) -> Result<QueryOutcome, ProbeError> {
        let port = ctx.rcon_port.ok_or(ProbeError::MissingContext("rcon port"))?;
        let password = ctx.rcon_password.as_deref().ok_or(ProbeError::MissingContext("rcon password"))?;
        let mut stream = TcpStream::connect((ctx.host.as_str(), port)).await?;

        stream.write_all(&encode(1, AUTH, password)).await?;
        // some servers send an empty response value ahead of the auth response
        let mut authed = false;
        for _ in 0..2 {
            let (id, kind, _) = read_packet(&mut stream).await?;
            if kind == AUTH_RESPONSE {
                if id == -1 {
                    return Err(ProbeError::AuthRejected);
                }
                authed = true;
                break;
            }
        }
        if !authed {
            return Err(ProbeError::Malformed("rcon: no auth response".to_string()));
        }

        let command = ctx.rcon_command.as_deref().unwrap_or("status");
        stream.write_all(&encode(2, EXEC, command)).await?;
        let (_, _, body) = read_packet(&mut stream).await?;
        let (players, max_players) = parse_player_counts(&body)
            .ok_or_else(|| ProbeError::Malformed("rcon: no player counts in reply".to_string()))?;
        Ok(QueryOutcome { status: "online".to_string(), players: Some(players), max_players: Some(max_players) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_both_reply_dialects() {
        assert_eq!(parse_player_counts("There are 3 of a max of 20 players online: a, b, c"), Some((3, 20)));
        assert_eq!(parse_player_counts("There are 0/10 players online:"), Some((0, 10)));
        let status = "hostname: My Server\nversion : 1.38\nplayers : 7 humans, 2 bots (24/0 max) (not hibernating)\n";
        assert_eq!(parse_player_counts(status), Some((7, 24)));
        assert_eq!(parse_player_counts("Unknown command"), None);
    }

    async fn serve_once(password: &'static str, reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (id, kind, body) = read_packet(&mut sock).await.unwrap();
            assert_eq!(kind, AUTH);
            sock.write_all(&encode(id, 0, "")).await.unwrap();
            if body != password {
                sock.write_all(&encode(-1, AUTH_RESPONSE, "")).await.unwrap();
                return;
            }
            sock.write_all(&encode(id, AUTH_RESPONSE, "")).await.unwrap();
            let (id, kind, _) = read_packet(&mut sock).await.unwrap();
            assert_eq!(kind, EXEC);
            sock.write_all(&encode(id, 0, reply)).await.unwrap();
        });
        port
    }

    fn ctx(port: u16, password: &str) -> QueryContext {
        QueryContext {
            host: "127.0.0.1".into(),
            rcon_port: Some(port),
            rcon_password: Some(password.into()),
            rcon_command: Some("list".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn queries_local_server() {
        let port = serve_once("hunter2", "There are 2 of a max of 8 players online: x, y").await;
        let outcome = RconAdapter.query(&ctx(port, "hunter2")).await.unwrap();
        assert_eq!((outcome.players, outcome.max_players), (Some(2), Some(8)));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let port = serve_once("hunter2", "").await;
        let err = RconAdapter.query(&ctx(port, "nope")).await.unwrap_err();
        assert!(matches!(err, ProbeError::AuthRejected));
    }
}
