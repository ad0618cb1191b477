//! Id allocation and LRU bookkeeping for live exec sessions.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use rand::Rng;

use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_sessions::session::ExecSession;

/// Hard cap on concurrent sessions.
pub const MAX_SESSIONS: usize = 64;
/// The most recently used sessions are never eviction victims.
pub const PROTECTED_COUNT: usize = 8;
pub const MIN_SESSION_ID: u32 = 1000;
pub const MAX_SESSION_ID: u32 = 100_000;

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, Arc<ExecSession>>,
    reserved: HashSet<String>,
}

/// Thread-safe session map with atomic id reservation and LRU pruning.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a unique random id in `[1000, 100000)`. The reservation
    /// prevents collisions between parallel exec tool calls that have
    /// allocated but not yet stored.
    pub fn allocate_id(&self) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(MIN_SESSION_ID..MAX_SESSION_ID).to_string();
            if inner.reserved.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Insert a session, evicting one victim if the cap is exceeded.
    pub fn store(&self, session: Arc<ExecSession>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reserved.insert(session.id().to_string());
        inner.sessions.insert(session.id().to_string(), session);

        if inner.sessions.len() > MAX_SESSIONS {
            prune_one(&mut inner);
        }
    }

    /// Look up a session and mark it recently used.
    pub fn get(&self, session_id: &str) -> Result<Arc<ExecSession>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.sessions.get(session_id) {
            Some(session) => {
                session.touch();
                Ok(Arc::clone(session))
            }
            None => Err(TetherErr::UnknownSessionId(session_id.to_string())),
        }
    }

    /// Drop a session and release its id.
    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.remove(session_id);
        inner.reserved.remove(session_id);
    }

    /// Release a reserved id that never made it into the store (the
    /// process exited within its first yield window).
    pub fn release_id(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reserved.remove(session_id);
    }

    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .len()
    }
}

/// Pick and close one eviction victim: rank by last-use descending,
/// protect the newest `PROTECTED_COUNT`, then prefer the stalest exited
/// session, falling back to the stalest session overall.
fn prune_one(inner: &mut StoreInner) {
    struct Candidate {
        id: String,
        last_used: std::time::Instant,
        exited: bool,
    }

    let mut candidates: Vec<Candidate> = inner
        .sessions
        .values()
        .map(|sess| Candidate {
            id: sess.id().to_string(),
            last_used: sess.last_used(),
            exited: sess.has_exited(),
        })
        .collect();

    candidates.sort_by(|a, b| b.last_used.cmp(&a.last_used));

    let unprotected: &[Candidate] = if candidates.len() > PROTECTED_COUNT {
        &candidates[PROTECTED_COUNT..]
    } else {
        // Everything is protected; still evict the stalest.
        &candidates
    };

    let victim = unprotected
        .iter()
        .rev()
        .find(|candidate| candidate.exited)
        .or_else(|| unprotected.last())
        .map(|candidate| candidate.id.clone());

    if let Some(id) = victim {
        if let Some(session) = inner.sessions.remove(&id) {
            session.close();
        }
        inner.reserved.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_sessions::session::SessionOpts;
    use std::time::Duration;

    fn start(id: &str, command: &[&str]) -> Arc<ExecSession> {
        ExecSession::start(SessionOpts {
            id: id.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: Vec::new(),
            tty: false,
        })
        .expect("start session")
    }

    #[test]
    fn allocate_id_stays_in_range_and_unique() {
        let store = SessionStore::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = store.allocate_id();
            let n: u32 = id.parse().expect("numeric id");
            assert!((MIN_SESSION_ID..MAX_SESSION_ID).contains(&n));
            assert!(seen.insert(id), "duplicate id");
        }
    }

    #[tokio::test]
    async fn store_get_remove_round_trip() {
        let store = SessionStore::new();
        let sess = start("1001", &["sleep", "5"]);
        store.store(Arc::clone(&sess));
        assert_eq!(store.count(), 1);

        let got = store.get("1001").expect("lookup");
        assert_eq!(got.id(), "1001");

        store.remove("1001");
        assert_eq!(store.count(), 0);
        assert!(matches!(
            store.get("1001"),
            Err(TetherErr::UnknownSessionId(_))
        ));
        sess.close();
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get("9999"),
            Err(TetherErr::UnknownSessionId(_))
        ));
    }

    #[tokio::test]
    async fn released_id_can_be_reused() {
        let store = SessionStore::new();
        let id = store.allocate_id();
        store.release_id(&id);
        // Reservation is gone, so a fresh insert under the id succeeds.
        let inner_free = {
            let inner = store.inner.lock().unwrap();
            !inner.reserved.contains(&id)
        };
        assert!(inner_free);
    }

    #[tokio::test]
    async fn eviction_prefers_exited_and_respects_protection() {
        let store = SessionStore::new();

        // One exited session, touched long ago.
        let exited = start("2000", &["true"]);
        let mut exited_rx_wait = 0;
        while !exited.has_exited() && exited_rx_wait < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            exited_rx_wait += 1;
        }
        assert!(exited.has_exited());
        store.store(Arc::clone(&exited));

        // Fill to the cap with live sessions, each newer than the last.
        let mut live = Vec::new();
        for i in 0..MAX_SESSIONS - 1 {
            let sess = start(&format!("{}", 3000 + i), &["sleep", "60"]);
            tokio::time::sleep(Duration::from_millis(1)).await;
            sess.touch();
            store.store(Arc::clone(&sess));
            live.push(sess);
        }
        assert_eq!(store.count(), MAX_SESSIONS);

        // One over the cap: the exited session is the victim even though
        // other sessions are older than the protected set boundary.
        let overflow = start("9000", &["sleep", "60"]);
        overflow.touch();
        store.store(Arc::clone(&overflow));

        assert_eq!(store.count(), MAX_SESSIONS);
        assert!(matches!(
            store.get("2000"),
            Err(TetherErr::UnknownSessionId(_))
        ));

        // The most recently used sessions all survived.
        assert!(store.get("9000").is_ok());
        for sess in live.iter().rev().take(PROTECTED_COUNT) {
            assert!(store.get(sess.id()).is_ok());
        }

        for sess in live {
            sess.close();
        }
        overflow.close();
    }
}
