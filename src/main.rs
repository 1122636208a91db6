//! docrig - retrieval-augmented question answering over engineering
//! documents.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    docrig::cli::run().await
}
