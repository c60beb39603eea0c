//! Calls the built-in hello-world module on a local server:
//!
//! ```bash
//! tether-server --module hello-world --port 10050
//! cargo run --example hello
//! ```

use anyhow::Result;
use tether::{Client, ClientConfig};
use tether_protocol::Value;

#[tokio::main]
async fn main() -> Result<()> {
    let client = Client::new(ClientConfig::default());

    let greeting = client.dispatch("hello_world_sync", vec![]).await?;
    println!("sync: {greeting:?}");

    let greeting = client
        .dispatch("hello_world_async", vec![Value::Int(0)])
        .await?;
    println!("async: {greeting:?}");

    let greeting = client.dispatch("hello_world_thread", vec![]).await?;
    println!("thread: {greeting:?}");

    Ok(())
}
