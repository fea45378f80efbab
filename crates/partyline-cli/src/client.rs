use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use partyline_protocol::{ClientMessage, MAX_LINE_BYTES, ServerMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Interval between keepalive pings while connected.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Line-oriented connection to a party host.
pub struct PartyClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl PartyClient {
    /// Connect and send the hello. The host answers with an error and a
    /// close if the token is wrong; that surfaces through [`Self::recv`].
    pub async fn connect(host: &str, port: u16, token: &str, user: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        };
        client
            .send(&ClientMessage::Hello {
                user: user.to_string(),
                token: token.to_string(),
            })
            .await?;
        Ok(client)
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> anyhow::Result<()> {
        self.writer.send(serde_json::to_string(msg)?).await?;
        Ok(())
    }

    /// Next server message, or `None` once the host closes the connection.
    pub async fn recv(&mut self) -> anyhow::Result<Option<ServerMessage>> {
        match self.reader.next().await {
            Some(line) => Ok(Some(serde_json::from_str(&line?)?)),
            None => Ok(None),
        }
    }
}

/// Connect and drive the plain client loop until the user quits or the
/// host goes away. With `raw` set, stdin lines become raw terminal input
/// for an interactive party instead of batch prompts.
pub async fn run_client(
    host: &str,
    port: u16,
    token: &str,
    user: &str,
    raw: bool,
) -> anyhow::Result<()> {
    let mut client = PartyClient::connect(host, port, token, user).await?;

    println!("type a prompt and press enter.");
    println!("special commands: /quit (exit)");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = client.recv() => {
                match msg? {
                    Some(msg) => render(&msg)?,
                    None => {
                        println!("[system] disconnected from party");
                        break;
                    }
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" || text == "/exit" {
                    break;
                }
                if raw {
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    client.send(&ClientMessage::InputBytes { data }).await?;
                } else {
                    let text = text.to_string();
                    client.send(&ClientMessage::Prompt { text }).await?;
                }
            }
            _ = ping.tick() => {
                client.send(&ClientMessage::Ping).await?;
            }
        }
    }
    Ok(())
}

fn render(msg: &ServerMessage) -> anyhow::Result<()> {
    match msg {
        ServerMessage::Output { text } => println!("{text}"),
        ServerMessage::OutputBytes { data, .. } => {
            let mut stdout = std::io::stdout();
            stdout.write_all(data)?;
            stdout.flush()?;
        }
        ServerMessage::System { message } => println!("[system] {message}"),
        ServerMessage::Error { message } => println!("[error] {message}"),
        ServerMessage::Participants { main_user, users } => {
            println!("[party] main={main_user} users={}", users.join(", "));
        }
        ServerMessage::DedupedPrompt { text } => {
            println!("[deduped]");
            println!("{text}");
        }
        ServerMessage::Invite { code } => println!("[invite] {code}"),
        ServerMessage::Pong => {}
    }
    Ok(())
}
