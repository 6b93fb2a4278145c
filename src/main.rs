use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tradier_stream::{ClientConfig, StreamingConfig, StreamingService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Reads TRADIER_ACCESS_TOKEN / TRADIER_SANDBOX (and .env when present)
    #[cfg(feature = "env-file")]
    let config = ClientConfig::from_env_file("TRADIER")?;
    #[cfg(not(feature = "env-file"))]
    let config = ClientConfig::from_env("TRADIER")?;

    let service = StreamingService::from_config(&config)?;
    service.set_config(
        StreamingConfig::default()
            .with_reconnect_delay(Duration::from_secs(2))
            .with_max_reconnect_attempts(5),
    );
    service.set_error_handler(|message| error!(%message, "stream error"));

    let session = service.create_market_session().await?;
    info!(session_id = %session.id, "session created");

    service.subscribe_to_quotes(&session, &["SPY", "AAPL"], |quote| {
        info!(
            symbol = %quote.symbol,
            bid = %quote.bid,
            ask = %quote.ask,
            spread = %quote.spread(),
            "quote"
        );
        Ok(())
    });
    service.subscribe_to_trades(&session, &["SPY", "AAPL"], |trade| {
        info!(symbol = %trade.symbol, price = %trade.price, size = trade.size, "trade");
        Ok(())
    });

    service.connect(&session).await?;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stats = service.get_statistics();
    info!(
        received = stats.messages_received,
        processed = stats.messages_processed,
        errors = stats.errors,
        reconnects = stats.reconnects,
        "statistics"
    );

    service.disconnect().await;
    Ok(())
}
