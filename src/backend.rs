//! Audio output backends
//!
//! A backend pulls samples from a [`Renderer`] on whatever thread its device
//! calls back on, and reports readiness once through a oneshot channel. The
//! renderer holds the graph lock for one block at a time, never longer.

use crate::clock::AudioClock;
use crate::error::BackendError;
use crate::graph::Graph;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Readiness signal from [`AudioBackend::open`]
pub type OpenResult = oneshot::Receiver<Result<StreamHandle, BackendError>>;

/// Something that can play a rendered graph
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    /// Start pulling audio from `renderer`
    ///
    /// The receiver resolves once the device is running, or with the reason
    /// it failed. Dropping the returned handle stops the stream.
    fn open(&mut self, renderer: Renderer) -> OpenResult;
}

/// Pulls interleaved frames out of the graph and advances audio time
#[derive(Clone)]
pub struct Renderer {
    graph: Arc<Mutex<Graph>>,
    clock: Arc<AudioClock>,
    block_size: usize,
}

impl Renderer {
    pub fn new(graph: Arc<Mutex<Graph>>, clock: Arc<AudioClock>, block_size: usize) -> Self {
        Self {
            graph,
            clock,
            block_size: block_size.max(1),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.clock.sample_rate()
    }

    /// Adopt the device's sample rate before the first block
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.clock.set_sample_rate(sample_rate);
        self.graph.lock().set_sample_rate(sample_rate);
    }

    /// Fill `data` with interleaved frames of `channels` samples each
    ///
    /// Audio time only advances under the graph lock, so anything reading the
    /// clock while holding that lock gets the time of the next frame to play.
    pub fn render(&self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for block in data.chunks_mut(self.block_size * channels) {
            let frames = block.len().div_ceil(channels);
            let mut graph = self.graph.lock();
            let start = self.clock.now();
            graph.render(block, channels, start);
            self.clock.advance(frames as u64);
        }
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("clock", &self.clock)
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Keeps an output stream alive; dropping it stops the stream
pub struct StreamHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    /// Handle that runs `close` when dropped
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// Handle with nothing to close
    pub fn detached() -> Self {
        Self { close: None }
    }

    pub fn close(self) {}
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("open", &self.close.is_some())
            .finish()
    }
}

/// Backend with no device: ready at once, audio only renders on demand
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, _renderer: Renderer) -> OpenResult {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(StreamHandle::detached()));
        rx
    }
}

#[cfg(feature = "cpal")]
pub use self::device::CpalBackend;

#[cfg(feature = "cpal")]
mod device {
    use super::{AudioBackend, OpenResult, Renderer, StreamHandle};
    use crate::error::BackendError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::thread;
    use tokio::sync::oneshot;

    /// Default output device of the default host
    ///
    /// The stream lives on its own thread because `cpal::Stream` is not `Send`
    /// on every platform.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalBackend;

    impl CpalBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl AudioBackend for CpalBackend {
        fn name(&self) -> &str {
            "cpal"
        }

        fn open(&mut self, renderer: Renderer) -> OpenResult {
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

            let spawned = thread::Builder::new()
                .name("tonegraph-audio".to_string())
                .spawn(move || {
                    let stream = match build_stream(renderer) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let handle = StreamHandle::new(move || {
                        let _ = stop_tx.send(());
                    });
                    if ready_tx.send(Ok(handle)).is_err() {
                        return;
                    }
                    // Sender dropped or stop requested
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::info!("audio stream closed");
                });

            if let Err(e) = spawned {
                tracing::error!(error = %e, "failed to spawn audio thread");
            }
            ready_rx
        }
    }

    fn build_stream(renderer: Renderer) -> Result<cpal::Stream, BackendError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(BackendError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(BackendError::UnsupportedFormat(format!(
                "{:?}",
                config.sample_format()
            )));
        }

        let sample_rate = config.sample_rate().0 as f64;
        let channels = config.channels() as usize;
        renderer.set_sample_rate(sample_rate);

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render(data, channels);
                },
                |err| tracing::error!(error = %err, "audio stream error"),
                None,
            )
            .map_err(|e| BackendError::Stream(e.to_string()))?;
        stream
            .play()
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        tracing::info!(sample_rate, channels, "audio stream started");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeId, NodeKind, ParamPatch};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn renderer(block_size: usize) -> (Renderer, Arc<Mutex<Graph>>, Arc<AudioClock>) {
        let graph = Arc::new(Mutex::new(Graph::new(48_000.0)));
        let clock = Arc::new(AudioClock::new(48_000.0));
        let renderer = Renderer::new(Arc::clone(&graph), Arc::clone(&clock), block_size);
        (renderer, graph, clock)
    }

    #[test]
    fn test_render_advances_audio_clock() {
        let (renderer, _, clock) = renderer(64);
        let mut data = vec![0.0f32; 1000 * 2];
        renderer.render(&mut data, 2);
        assert_eq!(clock.frames(), 1000);
    }

    #[test]
    fn test_render_in_blocks_matches_single_pass() {
        let (small, small_graph, _) = renderer(7);
        let (large, large_graph, _) = renderer(4096);
        for graph in [&small_graph, &large_graph] {
            let mut graph = graph.lock();
            let osc = graph
                .create_node(NodeKind::Oscillator, &ParamPatch::new())
                .unwrap();
            graph.connect(&osc, &NodeId::output()).unwrap();
        }

        let mut a = vec![0.0f32; 300];
        let mut b = vec![0.0f32; 300];
        small.render(&mut a, 1);
        large.render(&mut b, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_rate_reaches_graph() {
        let (renderer, graph, clock) = renderer(64);
        renderer.set_sample_rate(44_100.0);
        assert_eq!(clock.sample_rate(), 44_100.0);
        assert_eq!(graph.lock().sample_rate(), 44_100.0);
    }

    #[test]
    fn test_stream_handle_closes_on_drop() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let handle = StreamHandle::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!closed.load(Ordering::SeqCst));
        handle.close();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_null_backend_is_ready_at_once() {
        let (renderer, _, _) = renderer(64);
        let mut backend = NullBackend;
        let handle = backend.open(renderer).await.unwrap();
        assert!(handle.is_ok());
    }
}
