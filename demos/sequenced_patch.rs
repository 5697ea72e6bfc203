//! Sequenced Patch Example
//!
//! Builds a small sequenced voice (oscillator -> gain -> delay -> output),
//! plays a two-bar pattern, and changes tempo and pitch while the transport
//! is running. Without the `cpal` feature the graph renders into a buffer and
//! the peak level is printed instead.
//!
//! Run with: cargo run --example sequenced_patch [--features cpal]

use std::time::Duration;
use tonegraph::prelude::*;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt::init();

    let engine = build_engine();
    engine.start().await?;

    // Voice: oscillator into a gain stage, dry and through a feedback delay
    let osc = engine.create_node(
        NodeKind::Oscillator,
        ParamPatch::new()
            .with_frequency(220.0)
            .with_waveform(Waveform::Sawtooth),
    )?;
    let vca = engine.create_node(NodeKind::Gain, ParamPatch::new().with_level(0.0))?;
    let echo = engine.create_node(
        NodeKind::Delay,
        ParamPatch::new().with_delay_time(0.375).with_feedback(0.45),
    )?;
    let output = NodeId::output();

    engine.connect(&osc, &vca)?;
    engine.connect(&vca, &output)?;
    engine.connect(&vca, &echo)?;
    engine.connect(&echo, &output)?;

    // Four-on-the-floor with an offbeat pickup
    let seq = engine.create_node(NodeKind::Sequencer, ParamPatch::new())?;
    for step in [0, 4, 8, 12, 14] {
        engine.toggle_step(&seq, step)?;
    }
    engine.connect(&seq, &vca)?;

    let steps = engine.subscribe_steps();
    engine.update_params(&seq, ParamPatch::new().with_bpm(110.0).with_playing(true))?;

    let mut buffer = vec![0.0f32; 4800 * engine.config().channels as usize];
    for bar in 0..4 {
        if bar == 2 {
            engine.set_bpm(140.0);
            engine.update_params(&osc, ParamPatch::new().with_frequency(330.0))?;
        }

        let bar_length = engine.tick_interval() * STEP_COUNT as u32;
        let deadline = std::time::Instant::now() + bar_length;
        let mut peak = 0.0f32;
        while std::time::Instant::now() < deadline {
            if cfg!(not(feature = "cpal")) {
                engine.render(&mut buffer);
                peak = buffer.iter().fold(peak, |p, s| p.max(s.abs()));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let highlighted: Vec<usize> = steps.try_iter().collect();
        println!(
            "bar {bar}: {:.0} bpm, steps {:?}, peak {peak:.3}",
            engine.displayed_bpm(),
            highlighted
        );
    }

    engine.toggle_transport(false)?;
    println!("{} nodes, {} edges", engine.nodes().len(), engine.edges().len());
    engine.shutdown();
    Ok(())
}

#[cfg(feature = "cpal")]
fn build_engine() -> Engine {
    Engine::builder().backend(CpalBackend::new()).build()
}

#[cfg(not(feature = "cpal"))]
fn build_engine() -> Engine {
    Engine::new(EngineConfig::default())
}
