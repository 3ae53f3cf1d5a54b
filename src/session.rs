use tokio::sync::Mutex;

/// Display name of the document the active index was built from.
#[derive(Debug, Default)]
pub struct SessionState {
    document: Mutex<Option<String>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_document(&self, name: impl Into<String>) {
        *self.document.lock().await = Some(name.into());
    }

    pub async fn document(&self) -> Option<String> {
        self.document.lock().await.clone()
    }

    pub async fn clear(&self) {
        *self.document.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_document_wins_until_cleared() {
        let session = SessionState::new();
        assert_eq!(session.document().await, None);

        session.set_document("a.pdf").await;
        session.set_document("b.pdf").await;
        assert_eq!(session.document().await.as_deref(), Some("b.pdf"));

        session.clear().await;
        assert_eq!(session.document().await, None);
    }
}
