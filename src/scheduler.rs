//! Tick dispatch and the real-time transport thread
//!
//! The [`Scheduler`] turns transport ticks into sequencer triggers. For each
//! due tick it takes the graph lock once, runs the sequencer driver, releases
//! the lock, then notifies the UI step feeds and the registered tick
//! callbacks. Callbacks may call back into the engine.
//!
//! The transport thread sleeps on its control channel until the next absolute
//! deadline, so tick timing never depends on how long a previous wake-up took.

use crate::clock::{AudioClock, Clock, MonotonicClock};
use crate::graph::Graph;
use crate::transport::Transport;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback invoked once per tick with the step index
pub type TickCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Handle for removing a registered tick callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(CallbackId, TickCallback)>,
}

pub struct Scheduler {
    graph: Arc<Mutex<Graph>>,
    transport: Arc<Mutex<Transport>>,
    clock: Arc<dyn Clock>,
    audio_clock: Arc<AudioClock>,
    callbacks: RwLock<Callbacks>,
    step_feeds: Mutex<Vec<Sender<usize>>>,
    feed_capacity: usize,
}

impl Scheduler {
    pub fn new(
        graph: Arc<Mutex<Graph>>,
        transport: Arc<Mutex<Transport>>,
        clock: Arc<dyn Clock>,
        audio_clock: Arc<AudioClock>,
        feed_capacity: usize,
    ) -> Self {
        Self {
            graph,
            transport,
            clock,
            audio_clock,
            callbacks: RwLock::new(Callbacks::default()),
            step_feeds: Mutex::new(Vec::new()),
            feed_capacity: feed_capacity.max(1),
        }
    }

    /// Transport clock reading
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.transport.lock().next_deadline()
    }

    /// Deliver every tick due by now, returning how many fired
    pub fn pump(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.clock.now();
            let Some(tick) = self.transport.lock().poll(now) else {
                break;
            };

            let triggered = {
                let mut graph = self.graph.lock();
                graph.dispatch_step(tick.step, self.audio_clock.now())
            };
            tracing::trace!(
                position = tick.position,
                step = tick.step,
                triggered = triggered.len(),
                "tick"
            );

            self.publish_step(tick.step);
            for callback in self.callbacks_snapshot() {
                callback(tick.step);
            }
            fired += 1;
        }
        fired
    }

    pub fn on_tick(&self, callback: TickCallback) -> CallbackId {
        let mut callbacks = self.callbacks.write();
        let id = CallbackId(callbacks.next_id);
        callbacks.next_id += 1;
        callbacks.entries.push((id, callback));
        id
    }

    /// Returns false if `id` was not registered
    pub fn remove_tick_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.entries.len();
        callbacks.entries.retain(|(entry, _)| *entry != id);
        callbacks.entries.len() != before
    }

    /// Bounded feed of step indices for a UI polling at its own rate
    ///
    /// Steps are dropped, never queued without bound, when the receiver falls
    /// behind. Dropping the receiver unsubscribes.
    pub fn subscribe_steps(&self) -> Receiver<usize> {
        let (tx, rx) = crossbeam_channel::bounded(self.feed_capacity);
        self.step_feeds.lock().push(tx);
        rx
    }

    fn publish_step(&self, step: usize) {
        self.step_feeds
            .lock()
            .retain(|feed| match feed.try_send(step) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn clear_tick_callbacks(&self) {
        self.callbacks.write().entries.clear();
    }

    fn callbacks_snapshot(&self) -> Vec<TickCallback> {
        self.callbacks
            .read()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("clock", &self.clock)
            .field("callbacks", &self.callbacks.read().entries.len())
            .field("step_feeds", &self.step_feeds.lock().len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Transport state changed; recompute the next deadline
    Wake,
    Shutdown,
}

/// Dedicated thread driving the scheduler from a monotonic clock
#[derive(Debug)]
pub(crate) struct TransportThread {
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl TransportThread {
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        clock: MonotonicClock,
        name: &str,
    ) -> io::Result<Self> {
        let (control, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&scheduler, clock, &rx))?;
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    pub fn wake(&self) {
        let _ = self.control.send(Control::Wake);
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.control.send(Control::Shutdown);
        // Shut down from a tick callback: the loop exits on its own
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("transport thread panicked");
        }
    }
}

impl Drop for TransportThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(scheduler: &Scheduler, clock: MonotonicClock, control: &Receiver<Control>) {
    tracing::debug!("transport thread running");
    loop {
        scheduler.pump();

        let message = match scheduler.next_deadline() {
            Some(deadline) => control.recv_deadline(clock.instant_at(deadline)),
            None => control.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("transport thread stopped");
}
