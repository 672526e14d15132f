//! Publish and subscribe command implementations (kcat-style client).

use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::lookup_host;
use tracing::info;

use crate::cli::args::{ConnectionArgs, PublishArgs, SubscribeArgs};
use crate::client::{Client, ClientOptions};
use crate::codec::Qos;
use crate::core::config::Config;
use crate::state::StateEvent;

async fn resolve_gateway(connection: &ConnectionArgs) -> Result<SocketAddr> {
    let target = format!("{}:{}", connection.host, connection.port);
    let result = lookup_host(&target)
        .await
        .with_context(|| format!("unable to resolve {target}"))?
        .next()
        .with_context(|| format!("no address for {target}"));
    result
}

fn load_config(connection: &ConnectionArgs) -> Result<Config> {
    match &connection.config {
        Some(path) => Config::load(path),
        None => Config::load_from_env(),
    }
}

fn client_id(connection: &ConnectionArgs) -> String {
    connection
        .client_id
        .clone()
        .unwrap_or_else(|| format!("mqttsn-{}", std::process::id()))
}

async fn open_client(
    connection: &ConnectionArgs,
) -> Result<(Client, tokio::sync::mpsc::UnboundedReceiver<StateEvent>)> {
    let config = load_config(connection)?;
    let gateway = resolve_gateway(connection).await?;
    let options = ClientOptions {
        client_id: client_id(connection),
        gateway,
        protocol_version: config.identity.protocol_version,
        keep_alive: Duration::from_secs(u64::from(connection.keep_alive)),
        clean_session: connection.clean_session,
    };
    Client::bind(options, &config).await
}

/// Publish one message and wait for its delivery confirmation.
pub async fn run_publish(args: PublishArgs) -> Result<()> {
    let payload = match &args.message {
        Some(message) => message.clone().into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading payload from stdin")?;
            buf
        }
    };

    let (client, mut events) = open_client(&args.connection).await?;
    let qos = args.qos.to_qos();

    // QoS -1 is connectionless by definition.
    if qos != Qos::MinusOne {
        client.connect().await?;
    }

    let message_id = client
        .publish(&args.topic, qos, args.retain, payload)
        .await?;

    // Wait for the commit; QoS 0/-1 commit as soon as the datagram is out.
    loop {
        match events.recv().await {
            Some(StateEvent::MessageSent {
                message_id: Some(id),
                ..
            }) if id == message_id => {
                info!(topic = %args.topic, "publish confirmed");
                break;
            }
            Some(StateEvent::MessageSendFailure { queued, .. })
                if queued.message_id == message_id =>
            {
                anyhow::bail!("publish abandoned after {} retries", queued.retry_count);
            }
            Some(_) => {}
            None => anyhow::bail!("client stopped before the publish was confirmed"),
        }
    }

    if qos != Qos::MinusOne {
        client.disconnect().await?;
    }
    Ok(())
}

/// Subscribe and stream message payloads to stdout.
pub async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let (client, mut events) = open_client(&args.connection).await?;
    client.connect().await?;
    let (granted, _topic_id) = client.subscribe(&args.topic, args.qos.to_qos()).await?;
    info!(topic = %args.topic, ?granted, "subscribed, streaming messages");

    let mut received = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(StateEvent::MessageReceived { data, .. }) => {
                        println!("{}\t{}", data.topic_path, String::from_utf8_lossy(&data.payload));
                        received += 1;
                        if args.count.is_some_and(|count| received >= count) {
                            break;
                        }
                    }
                    Some(StateEvent::RemoteDisconnect { .. }) => {
                        anyhow::bail!("gateway disconnected the session");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await?;
    Ok(())
}
