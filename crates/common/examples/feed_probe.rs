//! Quick feed connectivity probe: connect, send one heartbeat, print replies.
//!
//! Usage: cargo run -p common --example feed_probe -- wss://host/socket/websocket [token]

use common::codec::{self, InboundFrame};
use common::{Connector, Outbox, WsConnector};
use futures::{SinkExt, StreamExt};
use std::time::Duration;

#[tokio::main]
async fn main() -> common::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: feed_probe <url> [token]");
        std::process::exit(2);
    };
    let connector = match args.next() {
        Some(token) => WsConnector::with_token(&url, &token)?,
        None => WsConnector::new(&url)?,
    };

    println!("Connecting to {}...", connector.display_url());
    let mut transport =
        match tokio::time::timeout(Duration::from_secs(10), connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                println!("Handshake timed out!");
                return Ok(());
            }
        };
    println!("Connected!");

    let mut outbox = Outbox::new(1);
    let reference = outbox.heartbeat();
    for frame in outbox.drain() {
        transport.sink.send(frame.encode()?).await?;
    }
    println!("Sent heartbeat (ref {})", reference);

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = transport.stream.next() => match frame {
                Some(Ok(text)) => match codec::decode(&text) {
                    Ok(InboundFrame::Reply { reference, status, .. }) => {
                        println!("Reply to ref {}: {:?}", reference, status)
                    }
                    Ok(other) => println!("Frame: {:?}", other),
                    Err(e) => println!("Undecodable frame: {}", e),
                },
                Some(Err(e)) => {
                    println!("Connection error: {}", e);
                    break;
                }
                None => {
                    println!("Connection closed");
                    break;
                }
            }
        }
    }

    let _ = transport.sink.close().await;
    println!("Done");
    Ok(())
}
