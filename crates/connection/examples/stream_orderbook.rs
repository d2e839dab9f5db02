//! Example: stream order-book snapshots from a feed endpoint.
//!
//! Run with: cargo run --example stream_orderbook -- ws://127.0.0.1:8546

use clobfeed_connection::{FeedConfig, FeedConnection};
use clobfeed_protocol::Channel;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8546".to_string());

    let connection = FeedConnection::new(FeedConfig::new(url));
    let listener = connection.add_event_listener(|event| println!("event: {event:?}"));

    connection
        .subscribe(
            Channel::Orderbook,
            Some(serde_json::json!({"depth": 10})),
            |update| println!("orderbook: {update}"),
            |err| eprintln!("orderbook error: {err}"),
            || println!("orderbook stream complete"),
        )
        .await?;

    tokio::signal::ctrl_c().await?;

    connection.remove_event_listener(listener);
    connection.disconnect().await;
    Ok(())
}
