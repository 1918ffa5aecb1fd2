// Cancellation-Registry: prozessweite Tabelle job_id → Abbruch-Flag.
// Jedes Flag ist ein Child-Token des globalen Shutdown-Tokens, damit ein
// Shutdown alle laufenden Jobs kooperativ abbricht.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{CompressError, Result};

/// Momentaufnahme eines registrierten Jobs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobState {
    pub id: String,
    pub cancelled: bool,
    pub active: bool,
}

struct Entry {
    cancel_token: CancellationToken,
}

pub struct CancellationRegistry {
    jobs: Mutex<HashMap<String, Entry>>,
    shutdown_token: CancellationToken,
}

impl CancellationRegistry {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            shutdown_token,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Ein Panic waehrend eines Inserts/Removes hinterlaesst die Map konsistent.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registriert einen neuen Job. Schlaegt mit `DuplicateJob` fehl, wenn
    /// die ID noch aktiv ist.
    pub fn register(&self, id: &str) -> Result<()> {
        let mut map = self.lock();
        if map.contains_key(id) {
            return Err(CompressError::DuplicateJob(id.to_string()));
        }
        map.insert(
            id.to_string(),
            Entry {
                cancel_token: self.shutdown_token.child_token(),
            },
        );
        debug!("Job registriert: {id}");
        Ok(())
    }

    /// Wie `register`, liefert aber einen Guard, der den Eintrag beim Drop
    /// wieder entfernt (auch bei Panik des Aufrufers).
    pub fn register_scoped(self: &Arc<Self>, id: &str) -> Result<JobGuard> {
        self.register(id)?;
        Ok(JobGuard {
            registry: Arc::clone(self),
            id: id.to_string(),
        })
    }

    /// Setzt das Abbruch-Flag. Unbekannte oder bereits beendete IDs sind kein Fehler.
    pub fn cancel(&self, id: &str) {
        let map = self.lock();
        match map.get(id) {
            Some(entry) => {
                entry.cancel_token.cancel();
                debug!("Abbruch angefordert: {id}");
            }
            None => debug!("Abbruch fuer unbekannten/beendeten Job ignoriert: {id}"),
        }
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.lock()
            .get(id)
            .map(|entry| entry.cancel_token.is_cancelled())
            .unwrap_or(false)
    }

    /// Token des Jobs, auf das der Encoder warten kann.
    pub fn token(&self, id: &str) -> Option<CancellationToken> {
        self.lock().get(id).map(|entry| entry.cancel_token.clone())
    }

    pub fn unregister(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            debug!("Job abgemeldet: {id}");
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<JobState> {
        let mut states: Vec<JobState> = self
            .lock()
            .iter()
            .map(|(id, entry)| JobState {
                id: id.clone(),
                cancelled: entry.cancel_token.is_cancelled(),
                active: true,
            })
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }
}

/// Haelt einen Registry-Eintrag fuer die Dauer eines Jobs.
pub struct JobGuard {
    registry: Arc<CancellationRegistry>,
    id: String,
}

impl JobGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.id)
    }

    pub fn token(&self) -> CancellationToken {
        // Eintrag existiert solange der Guard lebt
        self.registry
            .token(&self.id)
            .unwrap_or_else(CancellationToken::new)
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry() -> Arc<CancellationRegistry> {
        Arc::new(CancellationRegistry::new(CancellationToken::new()))
    }

    #[test]
    fn duplicate_register_fails_until_unregistered() {
        let reg = registry();
        reg.register("a").unwrap();
        assert!(matches!(reg.register("a"), Err(CompressError::DuplicateJob(id)) if id == "a"));
        reg.unregister("a");
        reg.register("a").unwrap();
    }

    #[test]
    fn cancel_is_monotonic_and_idempotent() {
        let reg = registry();
        reg.register("job").unwrap();
        assert!(!reg.is_cancelled("job"));
        reg.cancel("job");
        reg.cancel("job");
        assert!(reg.is_cancelled("job"));
        assert_eq!(
            reg.snapshot(),
            vec![JobState {
                id: "job".into(),
                cancelled: true,
                active: true
            }]
        );
    }

    #[test]
    fn cancel_unknown_has_no_side_effect() {
        let reg = registry();
        reg.register("other").unwrap();
        reg.cancel("missing");
        assert!(!reg.contains("missing"));
        assert!(!reg.is_cancelled("other"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let reg = registry();
        {
            let guard = reg.register_scoped("scoped").unwrap();
            assert_eq!(guard.id(), "scoped");
            assert!(reg.contains("scoped"));
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn guard_unregisters_on_panic() {
        let reg = registry();
        let reg_ref = reg.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = reg_ref.register_scoped("boom").unwrap();
            panic!("Encoder abgestuerzt");
        }));
        assert!(result.is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn shutdown_cancels_all_jobs() {
        let shutdown = CancellationToken::new();
        let reg = CancellationRegistry::new(shutdown.clone());
        reg.register("a").unwrap();
        reg.register("b").unwrap();
        shutdown.cancel();
        assert!(reg.is_cancelled("a"));
        assert!(reg.is_cancelled("b"));
    }

    #[test]
    fn token_observes_cancel() {
        let reg = registry();
        let guard = reg.register_scoped("t").unwrap();
        let token = guard.token();
        assert!(!token.is_cancelled());
        reg.cancel("t");
        assert!(token.is_cancelled());
        assert!(guard.is_cancelled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_register_twice_fails_while_active(id in "[a-z0-9-]{1,36}") {
            let reg = registry();
            prop_assert!(reg.register(&id).is_ok());
            prop_assert!(matches!(reg.register(&id), Err(CompressError::DuplicateJob(_))));
            reg.unregister(&id);
            prop_assert!(reg.register(&id).is_ok());
        }

        #[test]
        fn prop_cancel_unknown_never_fails(
            known in proptest::collection::hash_set("[a-z]{1,8}", 0..8),
            unknown in "[0-9]{1,8}",
        ) {
            let reg = registry();
            for id in &known {
                reg.register(id).unwrap();
            }
            let before = reg.snapshot();
            reg.cancel(&unknown);
            prop_assert_eq!(reg.snapshot(), before);
        }

        #[test]
        fn prop_every_guard_is_released(ids in proptest::collection::hash_set("[a-z]{1,8}", 0..16)) {
            let reg = registry();
            let guards: Vec<JobGuard> = ids.iter().map(|id| reg.register_scoped(id).unwrap()).collect();
            prop_assert_eq!(reg.len(), ids.len());
            drop(guards);
            prop_assert!(reg.is_empty());
        }
    }
}
