//! Retry scheduler
//!
//! At-least-once delivery attempts for directed packets. Unacknowledged
//! sends are re-injected with exponential backoff until the peer acks,
//! the attempt budget runs out, or the total time window closes.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::error::MeshError;
use crate::protocol::{BitchatPacket, DeliveryInfo, PacketId, PeerId};

/// Invoked exactly once when an entry settles
pub type CompletionCallback = Box<dyn FnOnce(PacketId, bool, DeliveryInfo) + Send + 'static>;

/// Injected transmit function used for every attempt
pub type SendFn = Arc<dyn Fn(&BitchatPacket, PeerId) -> Result<(), MeshError> + Send + Sync>;

struct RetryEntry {
    packet: BitchatPacket,
    target: PeerId,
    attempts: u32,
    first_attempt: Instant,
    next_attempt: Instant,
    on_complete: Option<CompletionCallback>,
}

/// Exponential-backoff resend scheduler
pub struct RetryService {
    config: RetryConfig,
    entries: Arc<Mutex<HashMap<PacketId, RetryEntry>>>,
    send_fn: SendFn,
    shutdown_tx: watch::Sender<bool>,
}

impl RetryService {
    /// Create a scheduler that transmits through `send_fn`
    pub fn new(config: RetryConfig, send_fn: SendFn) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            send_fn,
            shutdown_tx,
        }
    }

    /// Spawn the ticker task; wakes once per second
    pub fn start(&self) {
        let entries = Arc::clone(&self.entries);
        let send_fn = Arc::clone(&self.send_fn);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::process_due(&entries, &send_fn, &config);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Track a packet until it is acked or gives up
    ///
    /// The original transmission counts as attempt one; adding the same
    /// packet id twice is a no-op.
    pub fn add(&self, packet: BitchatPacket, target: PeerId, on_complete: CompletionCallback) {
        let id = packet.packet_id();
        let mut entries = self.entries.lock().expect("retry lock");
        if entries.contains_key(&id) {
            return;
        }

        let now = Instant::now();
        entries.insert(
            id,
            RetryEntry {
                packet,
                target,
                attempts: 1,
                first_attempt: now,
                next_attempt: now + self.config.initial_backoff,
                on_complete: Some(on_complete),
            },
        );
        debug!("tracking {id} for retry");
    }

    /// Settle an entry as delivered; fires its callback with success
    pub fn mark_delivered(&self, id: &PacketId) {
        let entry = self.entries.lock().expect("retry lock").remove(id);
        if let Some(mut entry) = entry {
            let recipient = Some(entry.target);
            if let Some(callback) = entry.on_complete.take() {
                callback(*id, true, DeliveryInfo::delivered(recipient, entry.attempts));
            }
        }
    }

    /// Number of unsettled entries
    pub fn pending_count(&self) -> usize {
        self.entries.lock().expect("retry lock").len()
    }

    /// Packets currently being retried
    pub fn pending_packets(&self) -> Vec<BitchatPacket> {
        self.entries
            .lock()
            .expect("retry lock")
            .values()
            .map(|entry| entry.packet.clone())
            .collect()
    }

    /// Drop every entry without firing callbacks
    pub fn clear(&self) {
        self.entries.lock().expect("retry lock").clear();
    }

    /// Stop the ticker and fail every pending entry with the given reason
    pub fn shutdown(&self, reason: &str) {
        let _ = self.shutdown_tx.send(true);
        let drained: Vec<(PacketId, RetryEntry)> = self
            .entries
            .lock()
            .expect("retry lock")
            .drain()
            .collect();
        for (id, mut entry) in drained {
            if let Some(callback) = entry.on_complete.take() {
                callback(id, false, DeliveryInfo::failed(reason, entry.attempts));
            }
        }
    }

    /// Backoff after the given attempt count, capped at the maximum
    fn backoff_for(config: &RetryConfig, attempts: u32) -> Duration {
        let factor = config.backoff_factor.powi(attempts.saturating_sub(1) as i32);
        let raw = config.initial_backoff.mul_f64(factor);
        raw.min(config.max_backoff)
    }

    fn process_due(
        entries: &Arc<Mutex<HashMap<PacketId, RetryEntry>>>,
        send_fn: &SendFn,
        config: &RetryConfig,
    ) {
        let now = Instant::now();
        let mut resends: Vec<(PacketId, BitchatPacket, PeerId, u32)> = Vec::new();
        let mut failures: Vec<(PacketId, RetryEntry)> = Vec::new();

        {
            let mut guard = entries.lock().expect("retry lock");
            let due: Vec<PacketId> = guard
                .iter()
                .filter(|(_, entry)| entry.next_attempt <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in due {
                let entry = guard.get_mut(&id).expect("due entry present");
                let out_of_attempts = entry.attempts > config.max_retries;
                let out_of_time =
                    now.duration_since(entry.first_attempt) > config.max_retry_time;

                if out_of_attempts || out_of_time {
                    let entry = guard.remove(&id).expect("due entry present");
                    failures.push((id, entry));
                } else {
                    entry.attempts += 1;
                    entry.next_attempt = now + Self::backoff_for(config, entry.attempts);
                    resends.push((id, entry.packet.clone(), entry.target, entry.attempts));
                }
            }
        }

        for (id, packet, target, attempts) in resends {
            debug!("resending {id} to {target}, attempt {attempts}");
            if let Err(e) = send_fn(&packet, target) {
                warn!("resend of {id} failed: {e}");
            }
        }

        for (id, mut entry) in failures {
            debug!("giving up on {id} after {} attempts", entry.attempts);
            if let Some(callback) = entry.on_complete.take() {
                callback(
                    id,
                    false,
                    DeliveryInfo::failed("retry budget exhausted", entry.attempts),
                );
            }
        }
    }
}
