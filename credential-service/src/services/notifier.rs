use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

/// Out-of-band delivery of MFA codes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_mfa_code(&self, user_id: Uuid, email: &str, code: &str) -> anyhow::Result<()>;
}

/// Logs the dispatch without the code. Used when no delivery channel is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_mfa_code(&self, user_id: Uuid, _email: &str, _code: &str) -> anyhow::Result<()> {
        tracing::info!(%user_id, "MFA code dispatched");
        Ok(())
    }
}

/// Captures codes for tests. Can be switched to fail every delivery.
#[derive(Debug, Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(Uuid, String)>>,
    failing: bool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn last_code_for(&self, user_id: Uuid) -> Option<String> {
        let sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.iter()
            .rev()
            .find(|(id, _)| *id == user_id)
            .map(|(_, code)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_mfa_code(&self, user_id: Uuid, _email: &str, code: &str) -> anyhow::Result<()> {
        if self.failing {
            anyhow::bail!("delivery channel unavailable");
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user_id, code.to_string()));
        Ok(())
    }
}
