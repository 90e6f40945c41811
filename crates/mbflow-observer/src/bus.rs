use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mbflow_workflow::Event;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::observer::Observer;

const DEFAULT_QUEUE_SIZE: usize = 256;
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

struct ObserverQueue {
  events: Mutex<VecDeque<Event>>,
  notify: Notify,
  closed: AtomicBool,
  dropped: AtomicU64,
}

struct ObserverEntry {
  queue: Arc<ObserverQueue>,
  worker: JoinHandle<()>,
}

/// Fans events out to registered observers, each on its own worker task with
/// a bounded FIFO queue.
#[derive(Clone)]
pub struct ObserverBus {
  inner: Arc<BusInner>,
}

struct BusInner {
  observers: Mutex<HashMap<String, ObserverEntry>>,
  queue_size: usize,
}

impl Default for ObserverBus {
  fn default() -> Self {
    Self::new(DEFAULT_QUEUE_SIZE)
  }
}

impl ObserverBus {
  pub fn new(queue_size: usize) -> Self {
    Self {
      inner: Arc::new(BusInner {
        observers: Mutex::new(HashMap::new()),
        queue_size: queue_size.max(1),
      }),
    }
  }

  /// Register an observer and start its delivery worker. Re-registering a
  /// name replaces (and drains) the previous observer.
  pub fn register(&self, observer: Arc<dyn Observer>) {
    let name = observer.name().to_string();
    let queue = Arc::new(ObserverQueue {
      events: Mutex::new(VecDeque::new()),
      notify: Notify::new(),
      closed: AtomicBool::new(false),
      dropped: AtomicU64::new(0),
    });

    let worker = tokio::spawn(run_worker(
      name.clone(),
      observer,
      queue.clone(),
      self.inner.clone(),
    ));

    let previous = self
      .inner
      .observers
      .lock()
      .unwrap()
      .insert(name, ObserverEntry { queue, worker });
    if let Some(previous) = previous {
      previous.queue.closed.store(true, Ordering::SeqCst);
      previous.queue.notify.notify_one();
    }
  }

  /// Remove an observer, waiting for its queue to drain or a bounded
  /// deadline, whichever comes first.
  pub async fn unregister(&self, name: &str) {
    let entry = self.inner.observers.lock().unwrap().remove(name);
    if let Some(entry) = entry {
      entry.queue.closed.store(true, Ordering::SeqCst);
      entry.queue.notify.notify_one();
      if tokio::time::timeout(DRAIN_DEADLINE, entry.worker).await.is_err() {
        warn!(observer = name, "observer did not drain before deadline");
      }
    }
  }

  /// Deliver an event to every interested observer without blocking on any
  /// of them. Full queues drop their oldest pending event.
  pub fn emit(&self, event: &Event) {
    let observers = self.inner.observers.lock().unwrap();
    for entry in observers.values() {
      let mut queue = entry.queue.events.lock().unwrap();
      if queue.len() >= self.inner.queue_size {
        queue.pop_front();
        entry.queue.dropped.fetch_add(1, Ordering::Relaxed);
      }
      queue.push_back(event.clone());
      drop(queue);
      entry.queue.notify.notify_one();
    }
  }

  /// Events dropped so far for a slow observer.
  pub fn dropped(&self, name: &str) -> u64 {
    self
      .inner
      .observers
      .lock()
      .unwrap()
      .get(name)
      .map(|e| e.queue.dropped.load(Ordering::Relaxed))
      .unwrap_or(0)
  }

  pub fn is_registered(&self, name: &str) -> bool {
    self.inner.observers.lock().unwrap().contains_key(name)
  }
}

async fn run_worker(
  name: String,
  observer: Arc<dyn Observer>,
  queue: Arc<ObserverQueue>,
  bus: Arc<BusInner>,
) {
  loop {
    let next = queue.events.lock().unwrap().pop_front();
    match next {
      Some(event) => {
        if !observer.filter(&event) {
          continue;
        }
        // Run the handler on its own task so a panic is contained.
        let handler = observer.clone();
        let result = tokio::spawn(async move { handler.on_event(&event).await }).await;
        match result {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            warn!(observer = %name, error = %e, "observer returned error");
          }
          Err(join_err) if join_err.is_panic() => {
            warn!(observer = %name, "observer panicked; unregistering");
            bus.observers.lock().unwrap().remove(&name);
            return;
          }
          Err(_) => return,
        }
      }
      None => {
        if queue.closed.load(Ordering::SeqCst) {
          return;
        }
        queue.notify.notified().await;
      }
    }
  }
}
