//! Broker Server - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    broker_server::run().await
}
