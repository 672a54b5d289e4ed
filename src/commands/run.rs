use crate::cli::RunArgs;
use anyhow::Context;
use intensity_relay::streaming::{
    create_source, DisplaySink, FrameSourceConfig, IntensityPipeline, LatestValueDisplay,
    LevelBarDisplay, PipelineEvent, SerialPortSink,
};
use intensity_relay::PipelineConfig;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const LEVEL_BAR_WIDTH: usize = 40;

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let config = pipeline_config(&args)?;
    let source_config = source_config(&args);
    log::info!("Source: {:?}", source_config);

    let source = create_source(source_config)?;
    let display: Arc<dyn DisplaySink> = if args.no_bar {
        Arc::new(LatestValueDisplay::new())
    } else {
        Arc::new(LevelBarDisplay::stderr(LEVEL_BAR_WIDTH))
    };

    let serial_encoding = config.serial_encoding;
    let mut pipeline = IntensityPipeline::new(config, source)?.with_display(display);

    pipeline.set_event_callback(|event| match event {
        PipelineEvent::StateChanged { state, .. } => log::info!("Pipeline state: {:?}", state),
        PipelineEvent::SourceFailed { error, .. } => {
            log::warn!("Source stopped, output is silent: {}", error)
        }
        PipelineEvent::SerialDisconnected { error, .. } => {
            log::warn!("Serial port lost: {}", error)
        }
    });

    if let Some(port) = &args.serial {
        // Without an Arduino the level bar still works
        match SerialPortSink::open(port, args.baud, serial_encoding) {
            Ok(sink) => pipeline.set_serial_sink(Arc::new(sink)),
            Err(e) => log::warn!("Continuing without serial output: {}", e),
        }
    }

    pipeline.start().await.context("failed to start pipeline")?;

    match args.duration_secs {
        Some(secs) => sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }

    pipeline.stop().await?;

    if !args.no_bar {
        eprintln!();
    }
    let stats = pipeline.stats();
    eprintln!(
        "Frames received: {} ({} coalesced), ticks: {}, serial writes: {}",
        stats.frames_received, stats.frames_coalesced, stats.ticks, stats.serial_writes
    );

    Ok(())
}

fn pipeline_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config =
        PipelineConfig::from_env().context("invalid INTENSITY_* environment variable")?;

    if let Some(cadence_ms) = args.cadence_ms {
        config.cadence_ms = cadence_ms;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(ceiling) = args.ceiling {
        config.clamp_ceiling = ceiling;
    }
    if let Some(encoding) = args.serial_encoding {
        config.serial_encoding = encoding;
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue_capacity = capacity;
    }

    config.validate()?;
    Ok(config)
}

fn source_config(args: &RunArgs) -> FrameSourceConfig {
    if let Some(path) = &args.wav {
        FrameSourceConfig::WavFile {
            path: path.clone(),
            loop_playback: args.loop_playback,
            chunk_ms: Some(args.chunk_ms),
        }
    } else if let Some(url) = &args.ws {
        FrameSourceConfig::WebSocket { url: url.clone() }
    } else {
        FrameSourceConfig::Robot {
            host: args.robot.clone().unwrap_or_default(),
            port: Some(args.robot_port),
            track: args.track,
            sample_rate: None,
        }
    }
}
