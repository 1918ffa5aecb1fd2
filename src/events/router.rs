// Progress-Router: ein gemeinsamer Event-Strom fuer alle Jobs.
// Abonnenten filtern nach (job_id, kind); der rohe Strom (broadcast) geht
// unverfiltert an den IPC-Writer, der Host filtert dort selbst nach job_id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;
use tokio::sync::broadcast;

use crate::events::{ProgressEvent, ProgressKind};

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct Subscriber {
    job_id: String,
    kind: ProgressKind,
    callback: ProgressCallback,
}

type SubscriberTable = Mutex<HashMap<u64, Subscriber>>;

fn lock_table(table: &SubscriberTable) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProgressRouter {
    tx: broadcast::Sender<ProgressEvent>,
    subscribers: Arc<SubscriberTable>,
    next_id: AtomicU64,
}

impl ProgressRouter {
    /// `capacity` begrenzt den Rueckstau langsamer Empfaenger des rohen Stroms.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Verteilt ein Event an alle passenden Abonnenten und den rohen Strom.
    /// Die Callbacks laufen ausserhalb des Locks, damit sie selbst
    /// (ab)abonnieren duerfen.
    pub fn publish(&self, event: ProgressEvent) {
        let matching: Vec<ProgressCallback> = lock_table(&self.subscribers)
            .values()
            .filter(|s| s.job_id == event.job_id && s.kind == event.kind)
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for callback in matching {
            callback(event.value);
        }

        // Err bedeutet nur: kein Empfaenger des rohen Stroms
        let _ = self.tx.send(event);
    }

    pub fn subscribe<F>(&self, job_id: &str, kind: ProgressKind, callback: F) -> Subscription
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_table(&self.subscribers).insert(
            id,
            Subscriber {
                job_id: job_id.to_string(),
                kind,
                callback: Arc::new(callback),
            },
        );
        debug!("Abonnement {id} fuer {job_id} ({kind:?})");
        Subscription {
            id,
            table: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Roher, ungefilterter Event-Strom.
    pub fn stream(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_table(&self.subscribers).len()
    }
}

/// Handle eines Abonnements. Wird beim Drop automatisch abgemeldet.
pub struct Subscription {
    id: u64,
    table: Weak<SubscriberTable>,
}

impl Subscription {
    /// Idempotent; auch nach Ende des Jobs oder des Routers sicher.
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            if lock_table(&table).remove(&self.id).is_some() {
                debug!("Abonnement {} beendet", self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
