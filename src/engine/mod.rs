//! The single-threaded cooperative event loop.
//!
//! [`EngineState`] is the only place domain entities are mutated, and it is
//! only ever touched from inside a [`Job`] run by [`Engine::run`] — so no
//! two handlers ever observe it simultaneously and nothing needs a lock. A
//! `Job` that needs to suspend on I/O (an M3/PCF/BSF call or a certmgr
//! invocation) spawns a detached task holding no reference to
//! [`EngineState`] and submits a follow-up `Job` through the same queue when
//! the reply arrives.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cert_manager::CertificateManager;
use crate::config::Config;
use crate::pcf::{BsfCache, PcfSessions};
use crate::store::ProvisioningStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Job = Box<dyn for<'a> FnOnce(&'a mut EngineState) -> BoxFuture<'a, ()> + Send>;

/// Everything a [`Job`] may touch. Owned exclusively by the engine task.
pub struct EngineState {
    pub store: ProvisioningStore,
    pub config: Config,
    pub bsf_cache: BsfCache,
    pub pcf_sessions: PcfSessions,
    pub cert_manager: Arc<dyn CertificateManager>,
    pub http_client: reqwest::Client,
    pub handle: EngineHandle,
}

/// A cheaply-cloneable reference to the engine's job queue. Handlers (C2)
/// and spawned continuations use this to submit work; it never exposes
/// [`EngineState`] directly.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl EngineHandle {
    /// Queue a unit of work. `f` must do its state mutation synchronously
    /// (or via a future that resolves promptly); anything that must wait on
    /// external I/O should spawn a task and `submit` a follow-up instead of
    /// awaiting the I/O here, or it will head-of-line-block every other
    /// queued job.
    pub fn submit<F, Fut>(&self, f: F)
    where
        F: for<'a> FnOnce(&'a mut EngineState) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::new(move |state| Box::pin(f(state)));
        // The receiver only disappears when the engine itself has shut
        // down, at which point there is nothing left to notify.
        let _ = self.tx.send(job);
    }

    /// Convenience for request/reply style operations: runs `f` on the
    /// engine task and sends its result back through a oneshot channel.
    pub async fn ask<T, F, Fut>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut EngineState) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.submit(move |state| {
            let fut = f(state);
            async move {
                let result = fut.await;
                let _ = reply_tx.send(result);
            }
        });
        reply_rx.await.expect("engine task never drops a pending reply")
    }
}

pub struct Engine {
    state: EngineState,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Engine {
    pub fn new(
        config: Config,
        cert_manager: Arc<dyn CertificateManager>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx };
        let store = ProvisioningStore::new(&config);
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.outbound_timeout_seconds))
            .build()
            .expect("reqwest client config is static and valid");
        let state = EngineState {
            store,
            bsf_cache: BsfCache::default(),
            pcf_sessions: PcfSessions::default(),
            cert_manager,
            http_client,
            handle: handle.clone(),
            config,
        };
        (Self { state, rx }, handle)
    }

    /// Run the event loop to completion. Each job is awaited fully before
    /// the next is dequeued.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job(&mut self.state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::StubCertificateManager;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            let order_tx = order_tx.clone();
            handle.submit(move |_state| {
                let order_tx = order_tx.clone();
                async move {
                    let _ = order_tx.send(i);
                }
            });
        }
        drop(order_tx);

        let mut seen = Vec::new();
        while let Some(i) = order_rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn ask_returns_computed_value() {
        let (engine, handle) = Engine::new(Config::default(), Arc::new(StubCertificateManager::default()));
        tokio::spawn(engine.run());

        let ids = handle.ask(|state| {
            let ids = state.store.list_session_ids();
            async move { ids }
        }).await;
        assert!(ids.is_empty());
    }
}
