//! Management API: `GET /5gmag-rt-management/v1/provisioning-sessions`.

use crate::engine::EngineState;

pub fn list_provisioning_session_ids(state: &EngineState) -> Vec<String> {
    state.store.list_session_ids()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::StubCertificateManager;
    use crate::config::Config;
    use crate::engine::Engine;
    use std::sync::Arc;

    #[tokio::test]
    async fn empty_store_lists_no_sessions() {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());
        let ids = handle.ask(|state| {
            let ids = list_provisioning_session_ids(state);
            async move { ids }
        }).await;
        assert!(ids.is_empty());
    }
}
