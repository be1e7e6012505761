/// Read-your-writes stickiness: sessions that wrote recently read from the primary
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Tracks which sessions are pinned to the primary and until when
#[derive(Clone)]
pub struct StickinessManager {
    sessions: Arc<RwLock<HashMap<String, Instant>>>,
    window: Duration,
}

impl StickinessManager {
    pub fn new(window: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Pin a session to the primary for the stickiness window.
    ///
    /// A repeated write extends the window. Expiry is a detached timer; an
    /// older timer never removes an entry a later write refreshed.
    pub async fn mark(&self, session_id: &str) {
        let expires_at = Instant::now() + self.window;
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.to_string(), expires_at);
        }

        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let mut sessions = sessions.write().await;
            if let Some(current) = sessions.get(&session_id) {
                if *current <= Instant::now() {
                    sessions.remove(&session_id);
                    tracing::trace!("Stickiness expired for session {}", session_id);
                }
            }
        });
    }

    /// True while the session's window is open
    pub async fn is_sticky(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).is_some()
    }

    /// Forget every pinned session, e.g. after a promotion
    pub async fn clear_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let cleared = sessions.len();
        sessions.clear();
        cleared
    }

    /// Get total sticky session count
    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        sessions.values().filter(|expires_at| **expires_at > now).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_expires() {
        let manager = StickinessManager::new(Duration::from_secs(30));
        manager.mark("user-42").await;
        assert!(manager.is_sticky("user-42").await);
        assert!(!manager.is_sticky("user-7").await);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(manager.is_sticky("user-42").await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!manager.is_sticky("user-42").await);
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_extends_window() {
        let manager = StickinessManager::new(Duration::from_secs(10));
        manager.mark("s1").await;
        tokio::time::sleep(Duration::from_secs(8)).await;
        manager.mark("s1").await;

        // First timer fires here but must not drop the refreshed entry
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(manager.is_sticky("s1").await);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!manager.is_sticky("s1").await);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let manager = StickinessManager::new(Duration::from_secs(30));
        manager.mark("a").await;
        manager.mark("b").await;
        assert_eq!(manager.count().await, 2);

        assert_eq!(manager.clear_all().await, 2);
        assert!(!manager.is_sticky("a").await);
        assert!(!manager.remove("b").await);
    }
}
