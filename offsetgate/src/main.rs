use std::env;
use std::error::Error;

use tokio::signal;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use offsetgate_core::config::{Settings, StreamIdGenerator};
use offsetgate_core::engine::EngineMarkers;
use offsetgate_core::rate_limit::RateSignal;
use offsetgate_core::types::BatchRecord;
use offsetgate_testing::simengine::SimulatedEngine;
use offsetgate_testing::simsource::SimulatedSource;

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e}");
        return Err(e.into());
    }
    info!("Exiting...");
    Ok(())
}

/// Runs the tracker and planner against a simulated upstream and engine.
async fn run() -> offsetgate_core::Result<()> {
    let matches = cmdline::root_cli().get_matches();
    let settings = Settings::load(cmdline::collect_options(&matches, env::vars())?)?;
    let demo = cmdline::DemoArgs::from_matches(&matches);
    info!(?settings, ?demo, "Starting with settings");

    let cancel = CancellationToken::new();
    let source = SimulatedSource::new(settings.stream_name.clone(), demo.partitions);
    let engine = SimulatedEngine::new();
    let signal = RateSignal::new();
    if let Some(rate) = demo.allowed_rate {
        signal.publish(rate);
    }

    let ids = StreamIdGenerator::new();
    let mut runner = offsetgate_core::build_runner(
        &settings,
        &ids,
        source.clone(),
        engine.clone(),
        signal,
        cancel.clone(),
    )
    .await?;

    // the simulated engine keeps its checkpoint in memory, restore it from what was committed
    // and refill the log up to there
    let committed = runner.planner().tracker().current();
    if !committed.is_initial() {
        let targets = committed
            .rate_seq_nos()
            .into_iter()
            .map(|(partition, next)| (partition, next - 1))
            .collect();
        engine.set_markers(EngineMarkers {
            start: BatchRecord::new(committed.batch_id, targets),
            consumed: Some(committed.offsets.clone()),
        });
        for (partition, seq_no) in committed.rate_seq_nos() {
            source.append(partition.index, seq_no);
        }
    }

    let shutdown = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let producer = tokio::spawn({
        let cancel = cancel.clone();
        let source = source.clone();
        let produce_per_tick = demo.produce_per_tick;
        let mut ticks = tokio::time::interval(demo.interval);
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => source.append_all(produce_per_tick),
                }
            }
        }
    });

    let triggers = IntervalStream::new(tokio::time::interval(demo.interval))
        .take(demo.batches.unwrap_or(usize::MAX));
    let result = runner.run(triggers).await;

    cancel.cancel();
    if let Err(e) = producer.await {
        error!(error = ?e, "Producer task failed");
    }
    shutdown.abort();

    info!(
        consumed_messages = engine.consumed_messages(),
        batches = engine.executed().len(),
        "Demo finished"
    );
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
