mod control;
mod dispatch;
mod hardware;
mod history;
mod host;
mod http;
mod settings;
mod store;
mod uplink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
