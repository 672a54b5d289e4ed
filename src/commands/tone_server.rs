use crate::cli::ToneServerArgs;
use anyhow::Context;
use intensity_relay::tone_server::{ToneConfig, ToneServer};
use tokio_util::sync::CancellationToken;

pub async fn execute(args: ToneServerArgs) -> anyhow::Result<()> {
    let config = ToneConfig {
        frequency_hz: args.frequency,
        amplitude: args.amplitude,
        sample_rate: args.sample_rate,
        ..Default::default()
    };

    let server = ToneServer::bind(&args.bind, config)
        .await
        .with_context(|| format!("cannot listen on {}", args.bind))?;
    eprintln!("Tone server running at {}", server.url()?);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    server.serve(cancel).await?;
    Ok(())
}
