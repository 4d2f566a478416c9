use chrono::{DateTime, Duration, Utc};
use lumen_types::{ChatMessage, SessionContext, UserSessionState};
use serde::Serialize;

/// Where the learner is, as best we know it this turn
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub context: SessionContext,
    pub captured_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub from_message: bool,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

/// Session envelope attached to the user message, under `metadata.session`
pub fn message_session(message: &ChatMessage) -> Option<SessionContext> {
    let raw = message.metadata.get("session")?;
    let mut session: SessionContext = serde_json::from_value(raw.clone()).ok()?;
    if session.captured_at.is_none() {
        session.captured_at = Some(message.created_at);
    }
    (!session.is_empty()).then_some(session)
}

/// Prefer whichever of the message envelope and the stored row is fresher
pub fn merge_session(
    from_message: Option<SessionContext>,
    stored: Option<UserSessionState>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> SessionSnapshot {
    let stored = stored.map(|s| {
        let at = s.session.captured_at.unwrap_or(s.updated_at);
        (s.session, at)
    });
    let message = from_message.map(|s| {
        let at = s.captured_at.unwrap_or(now);
        (s, at)
    });

    let (context, captured_at, from_message) = match (message, stored) {
        (Some((m, m_at)), Some((s, s_at))) => {
            if s_at > m_at {
                (s, s_at, false)
            } else {
                (m, m_at, true)
            }
        }
        (Some((m, at)), None) => (m, at, true),
        (None, Some((s, at))) => (s, at, false),
        (None, None) => return SessionSnapshot::default(),
    };

    SessionSnapshot {
        stale: now - captured_at > stale_after,
        context,
        captured_at: Some(captured_at),
        from_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(node: Uuid, at: DateTime<Utc>) -> SessionContext {
        SessionContext {
            active_node_id: Some(node),
            captured_at: Some(at),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresher_store_wins() {
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let stored = UserSessionState {
            user_id: Uuid::new_v4(),
            session: ctx(b, now - Duration::seconds(5)),
            updated_at: now,
        };
        let snap = merge_session(
            Some(ctx(a, now - Duration::seconds(30))),
            Some(stored),
            now,
            Duration::seconds(90),
        );
        assert_eq!(snap.context.active_node_id, Some(b));
        assert!(!snap.stale);
        assert!(!snap.from_message);
    }

    #[test]
    fn test_old_snapshot_is_stale() {
        let now = Utc::now();
        let snap = merge_session(
            Some(ctx(Uuid::new_v4(), now - Duration::seconds(200))),
            None,
            now,
            Duration::seconds(90),
        );
        assert!(snap.stale);
        assert!(snap.from_message);
    }

    #[test]
    fn test_empty_when_nothing_known() {
        let snap = merge_session(None, None, Utc::now(), Duration::seconds(90));
        assert!(snap.is_empty());
        assert!(snap.captured_at.is_none());
    }
}
