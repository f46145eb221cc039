use std::sync::{Arc, OnceLock};

use kiln_core::Generator;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::ApiError;

/// Shared router state. The generator slot is filled once by the background loader.
#[derive(Clone)]
pub struct AppState {
    generator: Arc<OnceLock<Result<Arc<Generator>, String>>>,
    permits: Arc<Semaphore>,
}

impl AppState {
    /// State for a server whose model is still loading.
    pub fn loading(max_concurrent_generations: usize) -> Self {
        Self {
            generator: Arc::new(OnceLock::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_generations.max(1))),
        }
    }

    pub fn ready(generator: Arc<Generator>, max_concurrent_generations: usize) -> Self {
        let state = Self::loading(max_concurrent_generations);
        state.set_generator(generator);
        state
    }

    pub fn set_generator(&self, generator: Arc<Generator>) {
        let _ = self.generator.set(Ok(generator));
    }

    pub fn set_load_error(&self, message: impl Into<String>) {
        let _ = self.generator.set(Err(message.into()));
    }

    pub fn generator(&self) -> Result<Arc<Generator>, ApiError> {
        match self.generator.get() {
            None => Err(ApiError::ModelLoading),
            Some(Ok(generator)) => Ok(Arc::clone(generator)),
            Some(Err(message)) => Err(ApiError::ModelUnavailable(message.clone())),
        }
    }

    pub fn load_error(&self) -> Option<&str> {
        match self.generator.get() {
            Some(Err(message)) => Some(message),
            _ => None,
        }
    }

    /// Waits for a generation slot.
    pub async fn admit(&self) -> Result<SemaphorePermit<'_>, ApiError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| ApiError::Generation("server is shutting down".to_string()))
    }
}
