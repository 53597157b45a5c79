//! Observer fan-out for monitors. A single event loop owns the observer
//! map; everyone else talks to it over three channels. Deliveries are
//! non-blocking: a monitor that stops draining its channel misses events
//! instead of stalling the publisher, the next periodic snapshot re-conveys
//! the ground truth.

use tokio::sync::mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender};

use crate::common::Map;
use crate::protocol::messages::{CompletedJob, ServerStateInfo};

/// How many undelivered updates a monitor may accumulate.
pub const OBSERVER_QUEUE_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub enum MonitorUpdate {
    Completed(CompletedJob),
    State(ServerStateInfo),
}

#[derive(Clone)]
pub struct UpdatePublisher {
    register: UnboundedSender<(String, Sender<MonitorUpdate>)>,
    deregister: UnboundedSender<String>,
    updates: UnboundedSender<MonitorUpdate>,
}

impl UpdatePublisher {
    /// Spawns the publish loop on the current task set.
    pub fn start() -> UpdatePublisher {
        let (register_tx, register_rx) = unbounded_channel();
        let (deregister_tx, deregister_rx) = unbounded_channel();
        let (updates_tx, updates_rx) = unbounded_channel();
        tokio::task::spawn_local(handle_publish(register_rx, deregister_rx, updates_rx));
        UpdatePublisher {
            register: register_tx,
            deregister: deregister_tx,
            updates: updates_tx,
        }
    }

    pub fn add_observer(&self, host: String, sink: Sender<MonitorUpdate>) {
        let _ = self.register.send((host, sink));
    }

    pub fn remove_observer(&self, host: &str) {
        let _ = self.deregister.send(host.to_string());
    }

    pub fn publish(&self, update: MonitorUpdate) {
        let _ = self.updates.send(update);
    }
}

async fn handle_publish(
    mut register_rx: UnboundedReceiver<(String, Sender<MonitorUpdate>)>,
    mut deregister_rx: UnboundedReceiver<String>,
    mut updates_rx: UnboundedReceiver<MonitorUpdate>,
) {
    let mut observers: Map<String, Sender<MonitorUpdate>> = Map::new();

    loop {
        tokio::select! {
            registration = register_rx.recv() => match registration {
                Some((host, sink)) => {
                    observers.insert(host, sink);
                }
                None => break,
            },
            host = deregister_rx.recv() => match host {
                Some(host) => {
                    observers.remove(&host);
                }
                None => break,
            },
            update = updates_rx.recv() => match update {
                Some(update) => {
                    for (host, sink) in &observers {
                        if sink.try_send(update.clone()).is_err() {
                            log::debug!("Monitor {} not keeping up, dropping update", host);
                        }
                    }
                }
                None => break,
            },
        }
    }
}
