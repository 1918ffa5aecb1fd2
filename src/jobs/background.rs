// Hintergrund-Task: prozessweiter Token fuer erweiterte Ausfuehrung.
// Zustaende: Inactive → Active (activate) → Inactive (deactivate | expire).
// Doppelte Aktivierung ersetzt nur den Listener, das OS-Grant wird nicht
// erneut angefordert.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{CompressError, Result};

pub type ExpiryListener = Box<dyn FnOnce(Value) + Send>;

/// OS-Primitive fuer erweiterte Ausfuehrung (ein globales Grant pro Prozess).
pub trait ExecutionGrant: Send + Sync {
    fn acquire(&self) -> AnyResult<()>;
    fn release(&self) -> AnyResult<()>;
}

/// Unix: SIGHUP ignorieren solange das Grant gehalten wird, damit der
/// Prozess weiterlaeuft wenn die Host-Sitzung verschwindet.
pub struct SighupGrant;

impl ExecutionGrant for SighupGrant {
    fn acquire(&self) -> AnyResult<()> {
        set_sighup_handler(libc::SIG_IGN)
    }

    fn release(&self) -> AnyResult<()> {
        set_sighup_handler(libc::SIG_DFL)
    }
}

fn set_sighup_handler(handler: libc::sighandler_t) -> AnyResult<()> {
    let previous = unsafe { libc::signal(libc::SIGHUP, handler) };
    if previous == libc::SIG_ERR {
        return Err(anyhow::anyhow!(
            "SIGHUP-Handler konnte nicht gesetzt werden: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Activated,
    ListenerReplaced,
    Deactivated,
    AlreadyInactive,
}

struct ActiveGrant {
    generation: u64,
    started: Instant,
    listener: Option<ExpiryListener>,
    timer: Option<CancellationToken>,
}

#[derive(Default)]
struct State {
    active: Option<ActiveGrant>,
    generation: u64,
}

struct Inner {
    grant: Box<dyn ExecutionGrant>,
    budget: Option<Duration>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Beendet das Grant unfreiwillig. `generation` = None → aktuelles Grant.
    fn expire(&self, generation: Option<u64>, reason: &str) -> bool {
        let taken = {
            let mut state = self.lock();
            match &state.active {
                Some(active) if generation.map_or(true, |g| g == active.generation) => {
                    state.active.take()
                }
                _ => None,
            }
        };
        let Some(active) = taken else {
            return false;
        };

        if let Some(timer) = &active.timer {
            timer.cancel();
        }
        if let Err(e) = self.grant.release() {
            warn!("Grant nach Ablauf nicht freigegeben: {e:#}");
        }
        info!("Hintergrund-Task abgelaufen ({reason})");

        if let Some(listener) = active.listener {
            listener(json!({
                "reason": reason,
                "elapsedMs": active.started.elapsed().as_millis() as u64,
            }));
        }
        true
    }
}

#[derive(Clone)]
pub struct BackgroundTaskManager {
    inner: Arc<Inner>,
}

impl BackgroundTaskManager {
    /// `budget` = Ausfuehrungsbudget eines Grants; danach laeuft es ab.
    pub fn new(grant: Box<dyn ExecutionGrant>, budget: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                grant,
                budget,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn activate(&self, listener: Option<ExpiryListener>) -> Result<BackgroundStatus> {
        let mut state = self.inner.lock();

        if let Some(active) = state.active.as_mut() {
            // Alter Listener wird verworfen, nicht aufgerufen
            active.listener = listener;
            return Ok(BackgroundStatus::ListenerReplaced);
        }

        self.inner
            .grant
            .acquire()
            .map_err(CompressError::BackgroundTask)?;

        state.generation += 1;
        let generation = state.generation;
        let timer = self.inner.budget.map(|budget| self.spawn_timer(generation, budget));

        state.active = Some(ActiveGrant {
            generation,
            started: Instant::now(),
            listener,
            timer,
        });
        info!("Hintergrund-Task aktiviert");
        Ok(BackgroundStatus::Activated)
    }

    pub fn deactivate(&self) -> Result<BackgroundStatus> {
        let mut state = self.inner.lock();
        if state.active.is_none() {
            return Ok(BackgroundStatus::AlreadyInactive);
        }
        // Schlaegt die Freigabe fehl, bleibt das Grant aktiv
        self.inner
            .grant
            .release()
            .map_err(CompressError::BackgroundTask)?;
        if let Some(timer) = state.active.take().and_then(|active| active.timer) {
            timer.cancel();
        }
        info!("Hintergrund-Task deaktiviert");
        Ok(BackgroundStatus::Deactivated)
    }

    /// Unfreiwilliger Ablauf (OS-seitig). Gibt false zurueck wenn kein Grant aktiv war.
    pub fn expire(&self, reason: &str) -> bool {
        self.inner.expire(None, reason)
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    fn spawn_timer(&self, generation: u64, budget: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::downgrade(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = cancelled.cancelled() => {}
                        _ = tokio::time::sleep(budget) => {
                            if let Some(inner) = inner.upgrade() {
                                inner.expire(Some(generation), "budget_exhausted");
                            }
                        }
                    }
                });
            }
            Err(_) => warn!("Keine Tokio-Runtime – Budget des Hintergrund-Tasks wird nicht ueberwacht"),
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGrant {
        acquired: AtomicUsize,
        released: AtomicUsize,
        fail_acquire: bool,
    }

    impl ExecutionGrant for Arc<CountingGrant> {
        fn acquire(&self) -> AnyResult<()> {
            if self.fail_acquire {
                return Err(anyhow::anyhow!("kein Grant verfuegbar"));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> AnyResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(budget: Option<Duration>) -> (BackgroundTaskManager, Arc<CountingGrant>) {
        let grant = Arc::new(CountingGrant::default());
        (BackgroundTaskManager::new(Box::new(grant.clone()), budget), grant)
    }

    fn counting_listener(counter: &Arc<AtomicUsize>) -> ExpiryListener {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn second_activation_replaces_listener() {
        let (mgr, grant) = manager(None);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert_eq!(mgr.activate(Some(counting_listener(&first))).unwrap(), BackgroundStatus::Activated);
        assert_eq!(
            mgr.activate(Some(counting_listener(&second))).unwrap(),
            BackgroundStatus::ListenerReplaced
        );
        assert_eq!(grant.acquired.load(Ordering::SeqCst), 1);

        assert!(mgr.expire("test"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!mgr.is_active());
    }

    #[test]
    fn expiry_invokes_listener_once() {
        let (mgr, grant) = manager(None);
        let calls = Arc::new(AtomicUsize::new(0));
        mgr.activate(Some(counting_listener(&calls))).unwrap();

        assert!(mgr.expire("test"));
        assert!(!mgr.expire("test"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(grant.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_without_listener_still_deactivates() {
        let (mgr, _) = manager(None);
        mgr.activate(None).unwrap();
        assert!(mgr.expire("test"));
        assert!(!mgr.is_active());
    }

    #[test]
    fn deactivate_inactive_is_noop() {
        let (mgr, grant) = manager(None);
        assert_eq!(mgr.deactivate().unwrap(), BackgroundStatus::AlreadyInactive);
        assert_eq!(grant.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deactivate_does_not_invoke_listener() {
        let (mgr, _) = manager(None);
        let calls = Arc::new(AtomicUsize::new(0));
        mgr.activate(Some(counting_listener(&calls))).unwrap();
        assert_eq!(mgr.deactivate().unwrap(), BackgroundStatus::Deactivated);
        assert!(!mgr.expire("late"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn acquire_failure_is_surfaced() {
        let grant = Arc::new(CountingGrant {
            fail_acquire: true,
            ..Default::default()
        });
        let mgr = BackgroundTaskManager::new(Box::new(grant), None);
        let err = mgr.activate(None).unwrap_err();
        assert!(matches!(err, CompressError::BackgroundTask(_)));
        assert!(!mgr.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_expires_grant() {
        let (mgr, _) = manager(Some(Duration::from_secs(30)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        mgr.activate(Some(Box::new(move |data| {
            let _ = tx.send(data);
        })))
        .unwrap();

        let data = rx.await.unwrap();
        assert_eq!(data["reason"], "budget_exhausted");
        assert!(!mgr.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_expire_new_grant() {
        let (mgr, _) = manager(Some(Duration::from_secs(30)));
        mgr.activate(None).unwrap();
        mgr.deactivate().unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        mgr.activate(None).unwrap();
        // Alter Timer waere hier abgelaufen
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(mgr.is_active());
    }
}
