mod api;
mod daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    daemon::run().await
}
