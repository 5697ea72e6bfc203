//! The engine context
//!
//! An [`Engine`] is one live graph with its transport, scheduler and audio
//! stream. Handles are cheap to clone and can be shared across threads; the
//! engine shuts down when the last handle is dropped or on [`Engine::shutdown`].
//! Tick callbacks that call back into the engine should hold a [`WeakEngine`]:
//! a strong handle captured by a callback keeps the engine alive until
//! `shutdown` drops the callbacks.
//!
//! Control commands lock the graph for a single mutation. The audio callback
//! locks it for one block and the transport thread for one tick, so a command
//! never waits longer than that.
//!
//! ```no_run
//! use tonegraph::prelude::*;
//!
//! # async fn demo() -> Result<(), EngineError> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.start().await?;
//!
//! let osc = engine.create_node(NodeKind::Oscillator, ParamPatch::new())?;
//! let vca = engine.create_node(NodeKind::Gain, ParamPatch::new())?;
//! engine.connect(&osc, &vca)?;
//! engine.connect(&vca, &NodeId::output())?;
//! engine.update_params(&osc, ParamPatch::new().with_frequency(880.0))?;
//! # Ok(())
//! # }
//! ```

use crate::backend::{AudioBackend, NullBackend, Renderer, StreamHandle};
use crate::clock::{AudioClock, Clock, ManualClock, MonotonicClock};
use crate::command::{Command, CommandOutput};
use crate::config::EngineConfig;
use crate::error::{BackendError, EngineError};
use crate::graph::{Edge, Graph};
use crate::node::{NodeId, NodeKind, NodeSnapshot, ParamPatch, LEVEL_RANGE};
use crate::scheduler::{CallbackId, Scheduler, TransportThread};
use crate::transport::{Transport, TransportState};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
enum ClockSource {
    Monotonic(MonotonicClock),
    Manual(ManualClock),
}

impl ClockSource {
    fn shared(&self) -> Arc<dyn Clock> {
        match self {
            ClockSource::Monotonic(clock) => Arc::new(*clock),
            ClockSource::Manual(clock) => Arc::new(clock.clone()),
        }
    }
}

/// Builder for an [`Engine`] with a custom backend or clock
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Box<dyn AudioBackend>,
    clock: ClockSource,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: Box::new(NullBackend),
            clock: ClockSource::Monotonic(MonotonicClock::new()),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: impl AudioBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    /// Drive the transport from `clock` instead of real time
    ///
    /// No transport thread is spawned; ticks are delivered by
    /// [`Engine::pump_transport`].
    pub fn manual_clock(mut self, clock: ManualClock) -> Self {
        self.clock = ClockSource::Manual(clock);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let graph = Arc::new(Mutex::new(Graph::new(config.sample_rate)));
        let transport = Arc::new(Mutex::new(Transport::new()));
        let audio_clock = Arc::new(AudioClock::new(config.sample_rate));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&transport),
            self.clock.shared(),
            Arc::clone(&audio_clock),
            config.step_feed_capacity,
        ));
        let renderer = Renderer::new(
            Arc::clone(&graph),
            Arc::clone(&audio_clock),
            config.block_size,
        );

        tracing::debug!(backend = self.backend.name(), "engine created");
        Engine {
            inner: Arc::new(Inner {
                config,
                graph,
                transport,
                audio_clock,
                scheduler,
                renderer,
                clock: self.clock,
                backend: Mutex::new(self.backend),
                start_lock: tokio::sync::Mutex::new(()),
                runtime: Mutex::new(Runtime::default()),
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Runtime {
    started: bool,
    stream: Option<StreamHandle>,
    thread: Option<TransportThread>,
}

impl Runtime {
    fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.wake();
        }
    }

    /// Mark stopped and hand back what must be closed outside the lock
    fn take(&mut self) -> (Option<TransportThread>, Option<StreamHandle>) {
        self.started = false;
        (self.thread.take(), self.stream.take())
    }
}

fn close(thread: Option<TransportThread>, stream: Option<StreamHandle>) {
    if let Some(mut thread) = thread {
        thread.shutdown();
    }
    drop(stream);
}

struct Inner {
    config: EngineConfig,
    graph: Arc<Mutex<Graph>>,
    transport: Arc<Mutex<Transport>>,
    audio_clock: Arc<AudioClock>,
    scheduler: Arc<Scheduler>,
    renderer: Renderer,
    clock: ClockSource,
    backend: Mutex<Box<dyn AudioBackend>>,
    start_lock: tokio::sync::Mutex<()>,
    runtime: Mutex<Runtime>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport.lock().stop();
        let (thread, stream) = self.runtime.get_mut().take();
        close(thread, stream);
    }
}

/// Handle to a running synth engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`Engine`], for use inside tick callbacks
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<Inner>,
}

impl WeakEngine {
    /// `None` once every [`Engine`] handle has been dropped
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEngine")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Engine {
    /// Engine with the Output node, a stopped transport and no audio device
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open the audio backend and start the transport thread
    ///
    /// Resolves once the backend reports it is running. On failure nothing is
    /// left half-started and `start` may be called again. Calling it on a
    /// started engine does nothing.
    pub async fn start(&self) -> Result<(), EngineError> {
        let _starting = self.inner.start_lock.lock().await;
        if self.is_started() {
            return Ok(());
        }

        let (name, ready) = {
            let mut backend = self.inner.backend.lock();
            let name = backend.name().to_string();
            (name, backend.open(self.inner.renderer.clone()))
        };
        tracing::info!(backend = %name, "starting audio backend");

        let stream = match ready.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(backend = %name, error = %e, "audio backend failed to start");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(backend = %name, "audio backend closed before it became ready");
                return Err(BackendError::Closed.into());
            }
        };

        let thread = match &self.inner.clock {
            ClockSource::Monotonic(clock) => Some(
                TransportThread::spawn(
                    Arc::clone(&self.inner.scheduler),
                    *clock,
                    &self.inner.config.transport_thread_name,
                )
                .map_err(|e| {
                    tracing::warn!(error = %e, "failed to spawn transport thread");
                    BackendError::Stream(format!("transport thread: {e}"))
                })?,
            ),
            ClockSource::Manual(_) => None,
        };

        let mut runtime = self.inner.runtime.lock();
        runtime.stream = Some(stream);
        runtime.thread = thread;
        runtime.started = true;

        tracing::info!(
            backend = %name,
            sample_rate = self.inner.audio_clock.sample_rate(),
            "engine started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.runtime.lock().started
    }

    /// Stop the transport, close the audio stream and join the transport thread
    ///
    /// Tick callbacks are dropped. The graph is kept and the engine can be
    /// started again.
    pub fn shutdown(&self) {
        self.inner.transport.lock().stop();
        // Tick callbacks may take the runtime lock; join with it released
        let (thread, stream) = self.inner.runtime.lock().take();
        close(thread, stream);
        self.inner.scheduler.clear_tick_callbacks();
        self.sync_sequencers();
        tracing::info!("engine shut down");
    }

    // Graph commands

    /// Add a node, returning its id
    ///
    /// A sequencer's initial `bpm` becomes the global tempo, so a restored
    /// graph keeps its tempo. Its initial `isPlaying` is ignored: play state
    /// always follows the transport.
    pub fn create_node(&self, kind: NodeKind, params: ParamPatch) -> Result<NodeId, EngineError> {
        let id = logged("createNode", self.inner.graph.lock().create_node(kind, &params))?;
        if kind == NodeKind::Sequencer {
            match params.bpm {
                Some(bpm) => {
                    self.set_bpm(bpm);
                }
                None => self.sync_sequencers(),
            }
            if params.is_playing.is_some() {
                tracing::debug!(id = %id, "initial isPlaying ignored, sequencer follows the transport");
            }
        }
        Ok(id)
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<(), EngineError> {
        logged("removeNode", self.inner.graph.lock().remove_node(id))
    }

    /// Merge a partial parameter update into a node
    ///
    /// A sequencer's `bpm` is the global tempo and its `isPlaying` the
    /// transport toggle, so updating them drives the transport.
    pub fn update_params(&self, id: &NodeId, params: ParamPatch) -> Result<(), EngineError> {
        let tempo = params.bpm;
        let playing = params.is_playing;
        let started = self.is_started();

        let is_sequencer = {
            let mut graph = self.inner.graph.lock();
            let is_sequencer = graph
                .params(id)
                .is_some_and(|p| p.kind() == NodeKind::Sequencer);
            if is_sequencer && playing == Some(true) && !started {
                return logged("updateParams", Err(EngineError::EngineNotStarted));
            }
            let now = self.inner.audio_clock.now();
            logged("updateParams", graph.update_params(id, &params, now))?;
            is_sequencer
        };

        if is_sequencer {
            if let Some(bpm) = tempo {
                self.set_bpm(bpm);
            }
            if let Some(playing) = playing {
                self.toggle_transport(playing)?;
            }
        }
        Ok(())
    }

    /// Flip one step of a sequencer pattern, returning its new state
    pub fn toggle_step(&self, id: &NodeId, step: usize) -> Result<bool, EngineError> {
        logged("toggleStep", self.inner.graph.lock().toggle_step(id, step))
    }

    pub fn connect(&self, source: &NodeId, target: &NodeId) -> Result<(), EngineError> {
        logged("connect", self.inner.graph.lock().connect(source, target))
    }

    /// Remove one matching edge; returns false if there was none
    pub fn disconnect(&self, source: &NodeId, target: &NodeId) -> Result<bool, EngineError> {
        logged("disconnect", self.inner.graph.lock().disconnect(source, target))
    }

    /// Snapshot of the targets `source` is connected to
    pub fn edges_from(&self, source: &NodeId) -> Vec<NodeId> {
        self.inner.graph.lock().edges_from(source)
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.inner.graph.lock().edges().to_vec()
    }

    /// Node list for rendering, in creation order
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.inner.graph.lock().nodes()
    }

    pub fn node(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.inner.graph.lock().node(id)
    }

    /// Run `f` with the graph locked
    pub fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(&self.inner.graph.lock())
    }

    /// Fire the envelope of a Gain node; returns false for other kinds
    pub fn trigger(&self, id: &NodeId, level: f64) -> Result<bool, EngineError> {
        if !self.is_started() {
            return logged("trigger", Err(EngineError::EngineNotStarted));
        }
        let level = LEVEL_RANGE.clamp(level);
        let mut graph = self.inner.graph.lock();
        let now = self.inner.audio_clock.now();
        logged("trigger", graph.trigger(id, level, now))
    }

    // Transport

    /// Change tempo, returning the value applied after clamping
    pub fn set_bpm(&self, bpm: f64) -> f64 {
        let now = self.inner.scheduler.now();
        let applied = self.inner.transport.lock().set_bpm(bpm, now);
        self.sync_sequencers();
        self.inner.runtime.lock().wake();
        tracing::debug!(bpm = applied, "tempo set");
        applied
    }

    /// Start or stop the transport
    ///
    /// Starting requires a started engine. Stopping is always allowed and
    /// leaves every node parameter untouched.
    pub fn toggle_transport(&self, playing: bool) -> Result<(), EngineError> {
        if playing && !self.is_started() {
            return logged("toggleTransport", Err(EngineError::EngineNotStarted));
        }

        let now = self.inner.scheduler.now();
        let changed = {
            let mut transport = self.inner.transport.lock();
            if playing {
                transport.start(now)
            } else {
                transport.stop()
            }
        };

        if changed {
            self.sync_sequencers();
            self.inner.runtime.lock().wake();
            tracing::info!(playing, bpm = self.bpm(), "transport toggled");
        }
        Ok(())
    }

    pub fn transport_state(&self) -> TransportState {
        self.inner.transport.lock().state()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.transport.lock().is_playing()
    }

    pub fn position(&self) -> u64 {
        self.inner.transport.lock().position()
    }

    pub fn bpm(&self) -> f64 {
        self.inner.transport.lock().bpm()
    }

    /// Tempo as heard, following a change over 100 ms while playing
    pub fn displayed_bpm(&self) -> f64 {
        let now = self.inner.scheduler.now();
        self.inner.transport.lock().displayed_bpm(now)
    }

    pub fn tick_interval(&self) -> Duration {
        self.inner.transport.lock().tick_interval()
    }

    /// Register a callback run on every tick with the step index
    ///
    /// Capture a [`WeakEngine`] rather than an `Engine` to call back in.
    pub fn on_tick(&self, callback: impl Fn(usize) + Send + Sync + 'static) -> CallbackId {
        self.inner.scheduler.on_tick(Arc::new(callback))
    }

    pub fn remove_tick_callback(&self, id: CallbackId) -> bool {
        self.inner.scheduler.remove_tick_callback(id)
    }

    /// Bounded feed of step indices for UI highlighting
    pub fn subscribe_steps(&self) -> Receiver<usize> {
        self.inner.scheduler.subscribe_steps()
    }

    /// Deliver ticks that are due, returning how many fired
    ///
    /// The transport thread does this on its own; with a manual clock it is
    /// the only way ticks are delivered.
    pub fn pump_transport(&self) -> usize {
        self.inner.scheduler.pump()
    }

    // Audio

    /// Render interleaved frames of `config().channels` channels
    ///
    /// Uses the same renderer as the device callback and advances audio time.
    pub fn render(&self, out: &mut [f32]) {
        self.inner
            .renderer
            .render(out, self.inner.config.channels as usize);
    }

    /// Seconds of audio rendered so far; the timebase of parameter ramps
    pub fn audio_time(&self) -> f64 {
        self.inner.audio_clock.now()
    }

    pub fn sample_rate(&self) -> f64 {
        self.inner.audio_clock.sample_rate()
    }

    /// Execute a typed command from the UI layer
    pub fn execute(&self, command: Command) -> Result<CommandOutput, EngineError> {
        tracing::trace!(command = command.name(), "execute");
        match command {
            Command::CreateNode { kind, params } => {
                self.create_node(kind, params).map(CommandOutput::NodeCreated)
            }
            Command::RemoveNode { id } => self.remove_node(&id).map(|()| CommandOutput::Done),
            Command::UpdateParams { id, params } => {
                self.update_params(&id, params).map(|()| CommandOutput::Done)
            }
            Command::ToggleStep { id, step } => {
                self.toggle_step(&id, step).map(CommandOutput::StepToggled)
            }
            Command::Connect { source, target } => {
                self.connect(&source, &target).map(|()| CommandOutput::Done)
            }
            Command::Disconnect { source, target } => self
                .disconnect(&source, &target)
                .map(CommandOutput::Disconnected),
            Command::SetBpm { bpm } => Ok(CommandOutput::Bpm(self.set_bpm(bpm))),
            Command::ToggleTransport { playing } => self
                .toggle_transport(playing)
                .map(|()| CommandOutput::Done),
            Command::Trigger { id, level } => {
                self.trigger(&id, level).map(CommandOutput::Triggered)
            }
        }
    }

    fn sync_sequencers(&self) {
        let (bpm, playing) = {
            let transport = self.inner.transport.lock();
            (transport.bpm(), transport.is_playing())
        };
        self.inner.graph.lock().sync_sequencers(bpm, playing);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("started", &self.is_started())
            .field("transport", &self.transport_state())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

fn logged<T>(operation: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        tracing::warn!(operation, error = %e, "command rejected");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OpenResult;
    use crate::graph::SEQUENCER_TRIGGER_LEVEL;
    use crate::node::{NodeParams, STEP_COUNT};
    use crate::unit::{Unit, ENVELOPE_ATTACK_SECS};
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    const TICK: Duration = Duration::from_millis(125);

    async fn manual_engine() -> (Engine, ManualClock) {
        let clock = ManualClock::new();
        let engine = Engine::builder().manual_clock(clock.clone()).build();
        engine.start().await.unwrap();
        (engine, clock)
    }

    fn voice(engine: &Engine) -> (NodeId, NodeId) {
        let osc = engine
            .create_node(NodeKind::Oscillator, ParamPatch::new())
            .unwrap();
        let gain = engine.create_node(NodeKind::Gain, ParamPatch::new()).unwrap();
        engine.connect(&osc, &gain).unwrap();
        engine.connect(&gain, &NodeId::output()).unwrap();
        (osc, gain)
    }

    fn frequency_at(engine: &Engine, osc: &NodeId, time: f64) -> f64 {
        engine.with_graph(|graph| match graph.unit(osc) {
            Some(Unit::Oscillator(unit)) => unit.frequency().value_at(time),
            _ => panic!("expected oscillator"),
        })
    }

    /// Fails `failures` times, then behaves like the null backend
    struct FlakyBackend {
        failures: Arc<AtomicUsize>,
    }

    impl AudioBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn open(&mut self, _renderer: Renderer) -> OpenResult {
            let (tx, rx) = oneshot::channel();
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                let _ = tx.send(Err(BackendError::NoDevice));
            } else {
                let _ = tx.send(Ok(StreamHandle::detached()));
            }
            rx
        }
    }

    #[test]
    fn test_new_engine_holds_output_only() {
        let engine = Engine::new(EngineConfig::default());
        let nodes = engine.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, NodeId::output());
        assert_eq!(engine.transport_state(), TransportState::Stopped);
        assert_eq!(engine.bpm(), 120.0);
    }

    #[test]
    fn test_audible_commands_need_start() {
        let engine = Engine::new(EngineConfig::default());
        let (_, gain) = voice(&engine);

        assert_eq!(engine.trigger(&gain, 0.5), Err(EngineError::EngineNotStarted));
        assert_eq!(
            engine.toggle_transport(true),
            Err(EngineError::EngineNotStarted)
        );
        assert!(engine.toggle_transport(false).is_ok());
        assert_eq!(engine.set_bpm(90.0), 90.0);
        assert_eq!(engine.edges().len(), 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = Engine::new(EngineConfig::default());
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_started());
        engine.shutdown();
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let engine = Engine::builder()
            .backend(FlakyBackend {
                failures: Arc::new(AtomicUsize::new(1)),
            })
            .manual_clock(ManualClock::new())
            .build();

        let first = engine.start().await;
        assert_eq!(first, Err(EngineError::Backend(BackendError::NoDevice)));
        assert!(!engine.is_started());

        engine.start().await.unwrap();
        assert!(engine.is_started());
    }

    #[tokio::test]
    async fn test_frequency_update_ramps_over_50ms() {
        let (engine, _) = manual_engine().await;
        let (osc, _) = voice(&engine);

        let mut warmup = vec![0.0f32; 480 * 2];
        engine.render(&mut warmup);
        let t0 = engine.audio_time();

        engine
            .update_params(&osc, ParamPatch::new().with_frequency(880.0))
            .unwrap();

        assert_relative_eq!(frequency_at(&engine, &osc, t0), 440.0);
        assert_relative_eq!(frequency_at(&engine, &osc, t0 + 0.025), 660.0, epsilon = 1e-6);
        assert_relative_eq!(frequency_at(&engine, &osc, t0 + 0.05), 880.0);

        // No sample-to-sample jump larger than the ramp's slope
        let dt = 1.0 / engine.sample_rate();
        let max_step = 440.0 / (0.05 / dt) + 1e-6;
        let mut last = frequency_at(&engine, &osc, t0);
        for i in 1..=2400 {
            let f = frequency_at(&engine, &osc, t0 + i as f64 * dt);
            assert!((f - last).abs() <= max_step);
            last = f;
        }

        let mut block = vec![0.0f32; 2400 * 2];
        engine.render(&mut block);
        assert_relative_eq!(
            frequency_at(&engine, &osc, engine.audio_time()),
            880.0,
            epsilon = 1e-6
        );
        assert!(block.iter().any(|&s| s.abs() > 0.1));
    }

    #[tokio::test]
    async fn test_sequencer_triggers_once_per_cycle() {
        let (engine, clock) = manual_engine().await;
        let mut steps = [false; STEP_COUNT];
        steps[0] = true;
        let seq = engine
            .create_node(NodeKind::Sequencer, ParamPatch::new().with_steps(steps))
            .unwrap();
        let (_, gain) = voice(&engine);
        engine.connect(&seq, &gain).unwrap();

        engine.toggle_transport(true).unwrap();
        let frames_per_tick = (TICK.as_secs_f64() * engine.sample_rate()) as usize;
        let mut block = vec![0.0f32; frames_per_tick * 2];

        let mut fired_at = Vec::new();
        for position in 0..STEP_COUNT * 2 {
            assert_eq!(engine.pump_transport(), 1);
            let now = engine.audio_time();
            let level = engine.with_graph(|graph| match graph.unit(&gain) {
                Some(Unit::Gain(unit)) => unit.gain().value_at(now + ENVELOPE_ATTACK_SECS),
                _ => panic!("expected gain"),
            });
            if (level - SEQUENCER_TRIGGER_LEVEL).abs() < 1e-9 {
                fired_at.push(position);
            }
            engine.render(&mut block);
            clock.advance(TICK);
        }

        assert_eq!(fired_at, vec![0, 16]);
        let pattern = *engine.node(&seq).unwrap().params.pattern().unwrap();
        assert_eq!(pattern.current_step(), 15);
    }

    #[tokio::test]
    async fn test_sixteen_ticks_visit_every_step() {
        let (engine, clock) = manual_engine().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_tick(move |step| sink.lock().push(step));

        engine.toggle_transport(true).unwrap();
        for _ in 0..STEP_COUNT {
            engine.pump_transport();
            clock.advance(TICK);
        }

        assert_eq!(*seen.lock(), (0..STEP_COUNT).collect::<Vec<_>>());
        assert_eq!(engine.position() % STEP_COUNT as u64, 0);
    }

    #[tokio::test]
    async fn test_last_bpm_wins() {
        let (engine, clock) = manual_engine().await;
        let feed = engine.subscribe_steps();
        engine.toggle_transport(true).unwrap();
        engine.pump_transport();

        engine.set_bpm(60.0);
        engine.set_bpm(200.0);
        assert_eq!(engine.tick_interval(), Duration::from_secs_f64(0.075));

        clock.advance(Duration::from_millis(74));
        assert_eq!(engine.pump_transport(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(engine.pump_transport(), 1);
        assert_eq!(feed.try_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_remove_output_rejected() {
        let engine = Engine::new(EngineConfig::default());
        voice(&engine);
        let nodes = engine.nodes();
        let edges = engine.edges();

        assert_eq!(
            engine.remove_node(&NodeId::output()),
            Err(EngineError::ProtectedNode(NodeId::output()))
        );
        assert_eq!(engine.nodes(), nodes);
        assert_eq!(engine.edges(), edges);
    }

    #[tokio::test]
    async fn test_create_then_remove_leaves_no_trace() {
        let (engine, _) = manual_engine().await;
        for kind in [
            NodeKind::Oscillator,
            NodeKind::Gain,
            NodeKind::Delay,
            NodeKind::Sequencer,
        ] {
            let id = engine.create_node(kind, ParamPatch::new()).unwrap();
            engine.remove_node(&id).unwrap();
            assert!(engine.node(&id).is_none());
            assert!(engine.nodes().iter().all(|n| n.id != id));
        }
        assert_eq!(engine.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_fatal() {
        let (engine, _) = manual_engine().await;
        let ghost = NodeId::new("ghost");
        assert_eq!(
            engine.update_params(&ghost, ParamPatch::new().with_level(0.3)),
            Err(EngineError::UnknownNode(ghost.clone()))
        );
        assert!(engine.trigger(&ghost, 0.5).is_err());
        assert!(engine.connect(&ghost, &NodeId::output()).is_err());
        assert!(engine.edges_from(&ghost).is_empty());

        // Still usable afterwards
        let gain = engine.create_node(NodeKind::Gain, ParamPatch::new()).unwrap();
        assert_eq!(engine.trigger(&gain, 0.5), Ok(true));
    }

    #[tokio::test]
    async fn test_sequencer_params_drive_transport() {
        let (engine, _) = manual_engine().await;
        let seq = engine
            .create_node(NodeKind::Sequencer, ParamPatch::new())
            .unwrap();

        engine
            .update_params(&seq, ParamPatch::new().with_bpm(90.0).with_playing(true))
            .unwrap();
        assert_eq!(engine.bpm(), 90.0);
        assert!(engine.is_playing());

        engine.toggle_transport(false).unwrap();
        let Some(NodeParams::Sequencer(params)) = engine.node(&seq).map(|n| n.params) else {
            panic!("expected sequencer");
        };
        assert!(!params.is_playing);
        assert_eq!(params.bpm, 90.0);
    }

    #[tokio::test]
    async fn test_stop_leaves_params_untouched() {
        let (engine, clock) = manual_engine().await;
        let (osc, gain) = voice(&engine);
        engine
            .update_params(&gain, ParamPatch::new().with_level(0.8).with_muted(true))
            .unwrap();
        engine.toggle_transport(true).unwrap();
        clock.advance(TICK * 3);
        engine.pump_transport();
        let before: Vec<NodeSnapshot> = engine
            .nodes()
            .into_iter()
            .filter(|n| n.id == osc || n.id == gain)
            .collect();

        engine.toggle_transport(false).unwrap();
        assert_eq!(engine.position(), 0);
        for snapshot in before {
            assert_eq!(engine.node(&snapshot.id), Some(snapshot));
        }
    }

    #[tokio::test]
    async fn test_tick_callback_can_reenter_engine() {
        let (engine, clock) = manual_engine().await;
        let handle = engine.downgrade();
        engine.on_tick(move |step| {
            if let (3, Some(engine)) = (step, handle.upgrade()) {
                let _ = engine.toggle_transport(false);
            }
        });

        engine.toggle_transport(true).unwrap();
        clock.advance(TICK * 10);
        assert_eq!(engine.pump_transport(), 4);
        assert!(!engine.is_playing());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_weak_callback_handle_lets_engine_drop() {
        let (engine, clock) = manual_engine().await;
        let handle = engine.downgrade();
        engine.on_tick(move |_| {
            if let Some(engine) = handle.upgrade() {
                engine.is_playing();
            }
        });
        engine.toggle_transport(true).unwrap();
        clock.advance(TICK);
        assert_eq!(engine.pump_transport(), 2);

        let weak = engine.downgrade();
        drop(engine);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_restored_sequencer_keeps_tempo() {
        let (engine, _) = manual_engine().await;
        let seq = engine
            .create_node(
                NodeKind::Sequencer,
                ParamPatch::new().with_bpm(96.0).with_playing(true),
            )
            .unwrap();

        assert_eq!(engine.bpm(), 96.0);
        assert!(!engine.is_playing());
        let Some(NodeParams::Sequencer(params)) = engine.node(&seq).map(|n| n.params) else {
            panic!("expected sequencer");
        };
        assert_eq!(params.bpm, 96.0);
        assert!(!params.is_playing);

        // A later sequencer without a tempo adopts the current one
        let other = engine
            .create_node(NodeKind::Sequencer, ParamPatch::new())
            .unwrap();
        let Some(NodeParams::Sequencer(params)) = engine.node(&other).map(|n| n.params) else {
            panic!("expected sequencer");
        };
        assert_eq!(params.bpm, 96.0);
    }

    #[tokio::test]
    async fn test_execute_json_commands() {
        let (engine, _) = manual_engine().await;
        let commands: Vec<Command> = serde_json::from_str(
            r#"[
                { "type": "createNode", "kind": "oscillator" },
                { "type": "createNode", "kind": "gain", "params": { "level": 0.7 } },
                { "type": "connect", "source": "oscillator-1", "target": "gain-2" },
                { "type": "connect", "source": "gain-2", "target": "output" },
                { "type": "trigger", "id": "gain-2", "level": 3.0 },
                { "type": "disconnect", "source": "oscillator-1", "target": "gain-2" },
                { "type": "setBpm", "bpm": 250 }
            ]"#,
        )
        .unwrap();

        let outputs: Vec<CommandOutput> = commands
            .into_iter()
            .map(|command| engine.execute(command).unwrap())
            .collect();

        assert_eq!(
            outputs,
            vec![
                CommandOutput::NodeCreated(NodeId::new("oscillator-1")),
                CommandOutput::NodeCreated(NodeId::new("gain-2")),
                CommandOutput::Done,
                CommandOutput::Done,
                CommandOutput::Triggered(true),
                CommandOutput::Disconnected(true),
                CommandOutput::Bpm(200.0),
            ]
        );
        assert!(engine.edges_from(&NodeId::new("oscillator-1")).is_empty());
    }

    #[tokio::test]
    async fn test_real_time_transport_ticks() {
        let engine = Engine::new(EngineConfig::default());
        engine.start().await.unwrap();
        engine.set_bpm(200.0);
        let feed = engine.subscribe_steps();
        engine.toggle_transport(true).unwrap();

        let first = feed.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = feed.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((first, second), (0, 1));

        engine.toggle_transport(false).unwrap();
        engine.shutdown();
    }
}
