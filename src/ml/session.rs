//! Lazy, process-wide ownership of loaded background-removal models.
//!
//! A model is built the first time a request asks for it and then kept for
//! the life of the process. A failed build is kept too: every later caller
//! gets the same [`LoadError`] and nothing is retried.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::ml::engine::{ExecutionProvider, ModelKind};

/// A loaded, ready-to-run background-removal model.
pub trait BackgroundModel: Send + Sync {
    /// Removes the background of an encoded image and returns PNG bytes.
    fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>>;
}

/// Builds models. Called at most once per configuration by [`SessionManager`].
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        model: ModelKind,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn BackgroundModel>>;
}

#[derive(Debug, Clone, Error)]
#[error("model {model} ({provider}) could not be loaded: {reason}")]
pub struct LoadError {
    pub model: ModelKind,
    pub provider: ExecutionProvider,
    pub reason: String,
}

pub enum SessionState {
    Unloaded,
    Loaded(Arc<dyn BackgroundModel>),
    FailedPermanently(LoadError),
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loaded(_) => "loaded",
            SessionState::FailedPermanently(_) => "failed",
        }
    }
}

type SessionKey = (ModelKind, ExecutionProvider);
type SessionSlot = Arc<OnceCell<Result<Arc<dyn BackgroundModel>, LoadError>>>;

pub struct SessionManager {
    loader: Box<dyn ModelLoader>,
    slots: Mutex<HashMap<SessionKey, SessionSlot>>,
}

impl SessionManager {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the model for this configuration, loading it on first use.
    ///
    /// Concurrent first callers block on the same load and share its outcome.
    pub fn get_session(
        &self,
        model: ModelKind,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn BackgroundModel>, LoadError> {
        let slot = self.slot(model, provider);
        slot.get_or_init(|| self.load(model, provider)).clone()
    }

    /// Reports the current state without triggering a load.
    pub fn state(&self, model: ModelKind, provider: ExecutionProvider) -> SessionState {
        let slots = self.slots.lock();
        match slots.get(&(model, provider)).and_then(|slot| slot.get()) {
            None => SessionState::Unloaded,
            Some(Ok(session)) => SessionState::Loaded(Arc::clone(session)),
            Some(Err(e)) => SessionState::FailedPermanently(e.clone()),
        }
    }

    // The map lock is released before loading starts; only the slot's
    // OnceCell serializes the load itself.
    fn slot(&self, model: ModelKind, provider: ExecutionProvider) -> SessionSlot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry((model, provider)).or_default())
    }

    fn load(
        &self,
        model: ModelKind,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn BackgroundModel>, LoadError> {
        info!("Loading model {} on {}...", model, provider);
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(model, provider)));
        let reason = match outcome {
            Ok(Ok(session)) => {
                info!(
                    "Model {} loaded in {:.2}s",
                    model,
                    started.elapsed().as_secs_f32()
                );
                return Ok(session);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => "model loader panicked".to_string(),
        };

        error!("Failed to load model {}: {}", model, reason);
        error!("Requests needing {} will fail until the process restarts", model);
        Err(LoadError {
            model,
            provider,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct EchoModel;

    impl BackgroundModel for EchoModel {
        fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>> {
            Ok(image.to_vec())
        }
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct CountingLoader {
        attempts: Arc<AtomicUsize>,
        behavior: Behavior,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            let loader = Self {
                attempts: Arc::clone(&attempts),
                behavior,
                delay: Duration::ZERO,
            };
            (loader, attempts)
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(
            &self,
            _model: ModelKind,
            _provider: ExecutionProvider,
        ) -> Result<Arc<dyn BackgroundModel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            match self.behavior {
                Behavior::Succeed => Ok(Arc::new(EchoModel)),
                Behavior::Fail => Err(anyhow!("corrupt model file")),
                Behavior::Panic => panic!("out of memory"),
            }
        }
    }

    #[test]
    fn test_success_is_loaded_once() {
        let (loader, attempts) = CountingLoader::new(Behavior::Succeed);
        let manager = SessionManager::new(loader);

        let first = manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu).unwrap();
        let second = manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(first.remove_background(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_failure_is_permanent() {
        let (loader, attempts) = CountingLoader::new(Behavior::Fail);
        let manager = SessionManager::new(loader);

        for _ in 0..3 {
            let err = manager
                .get_session(ModelKind::U2netp, ExecutionProvider::Cpu)
                .err()
                .expect("load must fail");
            assert_eq!(err.model, ModelKind::U2netp);
            assert!(err.reason.contains("corrupt model file"));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_loader_becomes_load_error() {
        let (loader, attempts) = CountingLoader::new(Behavior::Panic);
        let manager = SessionManager::new(loader);

        let first = manager.get_session(ModelKind::U2net, ExecutionProvider::Cpu);
        let second = manager.get_session(ModelKind::U2net, ExecutionProvider::Cpu);

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_calls_share_one_load() {
        let (mut loader, attempts) = CountingLoader::new(Behavior::Succeed);
        loader.delay = Duration::from_millis(50);
        let manager = SessionManager::new(loader);

        let sessions: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[test]
    fn test_configurations_are_cached_separately() {
        let (loader, attempts) = CountingLoader::new(Behavior::Succeed);
        let manager = SessionManager::new(loader);

        manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu).unwrap();
        manager.get_session(ModelKind::U2net, ExecutionProvider::Cpu).unwrap();
        manager.get_session(ModelKind::U2netp, ExecutionProvider::Cuda).unwrap();
        manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu).unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_state_transitions() {
        let (loader, attempts) = CountingLoader::new(Behavior::Succeed);
        let manager = SessionManager::new(loader);

        let before = manager.state(ModelKind::U2netp, ExecutionProvider::Cpu);
        assert!(matches!(before, SessionState::Unloaded));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        manager.get_session(ModelKind::U2netp, ExecutionProvider::Cpu).unwrap();
        let after = manager.state(ModelKind::U2netp, ExecutionProvider::Cpu);
        assert_eq!(after.label(), "loaded");

        let (loader, _) = CountingLoader::new(Behavior::Fail);
        let manager = SessionManager::new(loader);
        let _ = manager.get_session(ModelKind::Silueta, ExecutionProvider::Cpu);
        match manager.state(ModelKind::Silueta, ExecutionProvider::Cpu) {
            SessionState::FailedPermanently(e) => assert!(e.to_string().contains("silueta")),
            other => panic!("unexpected state {}", other.label()),
        }
    }
}
