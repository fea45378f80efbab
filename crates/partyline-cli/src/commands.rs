use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use libpartyline::config::default_username;
use libpartyline::credentials::GEMINI_API_KEY_ENV;
use libpartyline::{PartyConfig, PartySession};
use partyline_protocol::Invite;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client;

/// Host a party: bind, serve, and unless `headless` join it from this
/// terminal as the first peer.
pub async fn host(mut config: PartyConfig, headless: bool, raw: bool) -> anyhow::Result<()> {
    if std::env::var(GEMINI_API_KEY_ENV).is_err() && config.gemini_api_key.is_none() {
        warn!("{GEMINI_API_KEY_ENV} not set; prompt merging will use the local fallback");
    }
    if config.public_host.is_none() {
        match fetch_public_ip().await {
            Some(ip) => {
                info!("public ip: {ip}");
                config.public_host = Some(ip);
            }
            None => warn!("could not determine public ip; invite uses the bind address"),
        }
    }

    let bind_addr = format!("{}:{}", config.bind_host, config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;

    let connect_host = if config.bind_host == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        config.bind_host.clone()
    };
    let user = config.user.clone();

    let session = Arc::new(PartySession::new(config));
    println!("party created");
    println!("invite code: {}", session.invite().encode());

    let signal_session = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_session.trigger_shutdown();
        }
    });

    let server = tokio::spawn(session.clone().run(listener));

    if !headless {
        let token = session.invite().secret.clone();
        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..10 {
            match client::run_client(&connect_host, local_addr.port(), &token, &user, raw).await {
                Ok(()) => break,
                Err(err) => {
                    debug!("local client not connected yet: {err}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    server.await?;
    Ok(())
}

/// Join a party from its invite code.
pub async fn join(code: String, user: Option<String>, raw: bool) -> anyhow::Result<()> {
    let invite = Invite::parse(&code).context("invalid invite code")?;
    let user = user.unwrap_or_else(default_username);
    client::run_client(&invite.host, invite.port, &invite.secret, &user, raw).await
}

/// Ask api.ipify.org for our public address. Best effort.
async fn fetch_public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .ok()?;
    let resp = client
        .get("https://api.ipify.org")
        .query(&[("format", "text")])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let ip = resp.text().await.ok()?;
    let ip = ip.trim().to_string();
    if ip.is_empty() { None } else { Some(ip) }
}
