//! Line-based TCP control interface.
//!
//! ```text
//! ASK <question>             200 OK QUESTION QUEUED
//! RESUME                     200 OK RESUMING
//! REMEMBER <name> = <desc>   200 OK REMEMBERED
//! STATUS                     200 {json status}
//! QUIT                       231 BYE
//! ```
//! Errors are answered with `500 ERR <reason>`. Lines end in CRLF.

use crate::orchestrator::CompanionHandle;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Ask(String),
    Resume,
    Remember { name: String, description: String },
    Status,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb.to_uppercase().as_str() {
        "ASK" if rest.is_empty() => Err("ASK needs a question".to_string()),
        "ASK" => Ok(ControlCommand::Ask(rest.to_string())),
        "RESUME" => Ok(ControlCommand::Resume),
        "REMEMBER" => {
            let (name, description) = rest
                .split_once('=')
                .map(|(n, d)| (n.trim(), d.trim()))
                .filter(|(n, d)| !n.is_empty() && !d.is_empty())
                .ok_or_else(|| "usage: REMEMBER <name> = <description>".to_string())?;
            Ok(ControlCommand::Remember {
                name: name.to_string(),
                description: description.to_string(),
            })
        }
        "STATUS" => Ok(ControlCommand::Status),
        "QUIT" => Ok(ControlCommand::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command {}", other)),
    }
}

pub async fn start_server(handle: CompanionHandle, port: u16) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Control: could not bind port {}: {}", port, e);
            return;
        }
    };
    info!("Control: listening on 127.0.0.1:{}", port);
    serve(listener, handle).await;
}

pub async fn serve(listener: TcpListener, handle: CompanionHandle) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("Control: connection from {}", addr);
                let handle = handle.clone();
                tokio::spawn(async move {
                    let (reader, writer) = socket.into_split();
                    if let Err(e) = handle_connection(reader, writer, handle).await {
                        warn!("Control: connection error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Control: accept error: {}", e),
        }
    }
}

pub async fn handle_connection<R, W>(reader: R, mut writer: W, handle: CompanionHandle) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    writer.write_all(b"299 CineMate control ready\r\n").await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let reply = match parse_command(&line) {
            Err(reason) => format!("500 ERR {}", reason),
            Ok(ControlCommand::Quit) => {
                writer.write_all(b"231 BYE\r\n").await?;
                return Ok(());
            }
            Ok(ControlCommand::Ask(question)) => {
                if handle.ask(&question).await {
                    "200 OK QUESTION QUEUED".to_string()
                } else {
                    "500 ERR COMPANION STOPPED".to_string()
                }
            }
            Ok(ControlCommand::Resume) => {
                if handle.resume().await {
                    "200 OK RESUMING".to_string()
                } else {
                    "500 ERR COMPANION STOPPED".to_string()
                }
            }
            Ok(ControlCommand::Remember { name, description }) => {
                if handle.remember(&name, &description).await {
                    "200 OK REMEMBERED".to_string()
                } else {
                    "500 ERR COMPANION STOPPED".to_string()
                }
            }
            Ok(ControlCommand::Status) => match handle.status().await {
                Some(status) => match serde_json::to_string(&status) {
                    Ok(json) => format!("200 {}", json),
                    Err(e) => format!("500 ERR {}", e),
                },
                None => "500 ERR COMPANION STOPPED".to_string(),
            },
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Proposal;
    use tokio::sync::mpsc;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_command("ask  who is the woman in red?\r\n"),
            Ok(ControlCommand::Ask("who is the woman in red?".into()))
        );
        assert_eq!(
            parse_command("REMEMBER Mara = the lighthouse keeper"),
            Ok(ControlCommand::Remember {
                name: "Mara".into(),
                description: "the lighthouse keeper".into()
            })
        );
        assert_eq!(parse_command("status"), Ok(ControlCommand::Status));
        assert!(parse_command("ASK").is_err());
        assert!(parse_command("REMEMBER Mara").is_err());
        assert!(parse_command("DANCE").is_err());
    }

    #[tokio::test]
    async fn session_forwards_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = CompanionHandle::from(tx);
        let mock = tokio_test::io::Builder::new()
            .write(b"299 CineMate control ready\r\n")
            .read(b"ASK what is she reading?\r\n")
            .write(b"200 OK QUESTION QUEUED")
            .write(b"\r\n")
            .read(b"bogus\r\n")
            .write(b"500 ERR unknown command BOGUS")
            .write(b"\r\n")
            .read(b"QUIT\r\n")
            .write(b"231 BYE\r\n")
            .build();
        let (reader, writer) = tokio::io::split(mock);

        handle_connection(reader, writer, handle).await.unwrap();
        match rx.recv().await {
            Some(Proposal::Ask(question)) => assert_eq!(question, "what is she reading?"),
            other => panic!("expected ASK to be forwarded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stopped_companion_is_reported() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let handle = CompanionHandle::from(tx);
        let mock = tokio_test::io::Builder::new()
            .write(b"299 CineMate control ready\r\n")
            .read(b"RESUME\r\n")
            .write(b"500 ERR COMPANION STOPPED")
            .write(b"\r\n")
            .build();
        let (reader, writer) = tokio::io::split(mock);
        handle_connection(reader, writer, handle).await.unwrap();
    }
}
