use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    picshare_server::run().await
}
