use std::env;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use log::info;

mod dedup;
mod hasher;
mod matcher;
mod notify;
mod pipeline;
mod recipients;
mod store;
mod telegram;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    // Required credentials; missing values are fatal at startup.
    let api_id: i32 = env::var("TELEGRAM_API_ID")
        .context("TELEGRAM_API_ID must be set to your Telegram API ID")?
        .parse()
        .context("TELEGRAM_API_ID must be an integer")?;
    let api_hash = env::var("TELEGRAM_API_HASH")
        .context("TELEGRAM_API_HASH must be set to your Telegram API hash")?;
    let supabase_url =
        env::var("SUPABASE_URL").context("SUPABASE_URL must be set to the store endpoint")?;
    let supabase_key = env::var("SUPABASE_SERVICE_ROLE_KEY")
        .context("SUPABASE_SERVICE_ROLE_KEY must be set to the store service key")?;
    let session_file =
        env::var("SESSION_FILE").unwrap_or_else(|_| "cargo_monitor.session".to_string());

    let store = Arc::new(store::SupabaseStore::new(&supabase_url, &supabase_key));
    info!("store client ready at {}", supabase_url);

    let client = telegram::connect(api_id, &api_hash, &session_file).await?;
    let notifier = telegram::TelegramNotifier::new(client.clone());

    let pipeline = Arc::new(pipeline::Pipeline::new(store, notifier));

    info!("starting message monitoring, press Ctrl+C to stop");
    pipeline::run(pipeline, client).await
}
