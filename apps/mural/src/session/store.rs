//! Session bookkeeping. All mutation funnels through here so replacing a
//! session always cancels the old poller before the new session lands.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::QrSession;

/// Cancellation handle for a session's fallback poller.
///
/// Cancelling (or dropping) stops the task; in-flight polls additionally
/// check the flag before mutating state, so a check that raced the abort
/// cannot write after cancellation.
pub struct PollerGuard {
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PollerGuard {
    pub fn new(stopped: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self { stopped, handle }
    }

    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct SessionEntry {
    session: QrSession,
    poller: Option<PollerGuard>,
}

#[derive(Default)]
struct StoreInner {
    by_image: HashMap<String, SessionEntry>,
    image_by_sid: HashMap<String, String>,
}

/// One session per image, with a sid reverse index for inbound join signals.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` for its image. A displaced session has its poller
    /// cancelled and its sid unmapped before the replacement becomes
    /// visible, so nothing stale can resolve through the store afterwards.
    pub fn insert(&self, session: QrSession) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_image.remove(&session.image_id) {
            if let Some(poller) = previous.poller {
                poller.cancel();
            }
            inner.image_by_sid.remove(&previous.session.session_id);
        }
        inner
            .image_by_sid
            .insert(session.session_id.clone(), session.image_id.clone());
        inner.by_image.insert(
            session.image_id.clone(),
            SessionEntry {
                session,
                poller: None,
            },
        );
    }

    /// Attaches the fallback poller for `session_id`. If the session was
    /// displaced before the poller could be attached, the guard is cancelled
    /// on the spot.
    pub fn attach_poller(&self, session_id: &str, poller: PollerGuard) {
        let mut inner = self.inner.lock();
        let Some(image_id) = inner.image_by_sid.get(session_id).cloned() else {
            poller.cancel();
            return;
        };
        if let Some(entry) = inner.by_image.get_mut(&image_id) {
            if let Some(old) = entry.poller.replace(poller) {
                old.cancel();
            }
        }
    }

    pub fn remove_by_image(&self, image_id: &str) -> Option<QrSession> {
        let mut inner = self.inner.lock();
        let entry = inner.by_image.remove(image_id)?;
        if let Some(poller) = entry.poller {
            poller.cancel();
        }
        inner.image_by_sid.remove(&entry.session.session_id);
        Some(entry.session)
    }

    pub fn get_by_image(&self, image_id: &str) -> Option<QrSession> {
        self.inner
            .lock()
            .by_image
            .get(image_id)
            .map(|entry| entry.session.clone())
    }

    pub fn image_for_sid(&self, session_id: &str) -> Option<String> {
        self.inner.lock().image_by_sid.get(session_id).cloned()
    }

    /// Marks the session behind `session_id` connected, stopping its poller.
    /// Returns the image id plus whether this call made the transition;
    /// `None` when the sid no longer maps to a live session.
    pub fn mark_connected(&self, session_id: &str) -> Option<(String, bool)> {
        let mut inner = self.inner.lock();
        let image_id = inner.image_by_sid.get(session_id).cloned()?;
        let entry = inner.by_image.get_mut(&image_id)?;
        if entry.session.connected {
            return Some((image_id, false));
        }
        entry.session.connected = true;
        if let Some(poller) = entry.poller.take() {
            poller.cancel();
        }
        Some((image_id, true))
    }

    pub fn sessions(&self) -> Vec<QrSession> {
        self.inner
            .lock()
            .by_image
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Drops everything, cancelling all pollers. Used on shutdown and when
    /// the connectivity environment changes wholesale.
    pub fn clear(&self) -> Vec<QrSession> {
        let mut inner = self.inner.lock();
        inner.image_by_sid.clear();
        inner
            .by_image
            .drain()
            .map(|(_, entry)| {
                if let Some(poller) = entry.poller {
                    poller.cancel();
                }
                entry.session
            })
            .collect()
    }
}
