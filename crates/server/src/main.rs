#[tokio::main]
async fn main() -> anyhow::Result<()> {
    teamchat_server::run().await
}
