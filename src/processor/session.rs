use crate::error::QueryError;
use crate::processor::job::{QueryRequest, QueryResult};
use crate::processor::worker::QueryService;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Issues queries on behalf of one consumer, where only the latest request matters.
///
/// Starting a query aborts the previous one; a caller still waiting on an older
/// query gets `QueryError::Superseded` instead of a stale result.
pub struct QuerySession {
    service: Arc<QueryService>,
    generation: AtomicU64,
    current: Mutex<Option<AbortHandle>>,
}

impl QuerySession {
    pub fn new(service: Arc<QueryService>) -> Self {
        Self {
            service,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<Arc<QueryResult>, QueryError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let service = self.service.clone();
        let handle = tokio::spawn(async move { service.query(request).await });
        if let Some(previous) = self.current.lock().replace(handle.abort_handle()) {
            previous.abort();
        }

        let outcome = handle.await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Discarding superseded query result");
            return Err(QueryError::Superseded);
        }

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(QueryError::Superseded),
            Err(e) => Err(QueryError::Internal(e.to_string())),
        }
    }

    /// Abort whatever is in flight.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(current) = self.current.lock().take() {
            current.abort();
        }
    }
}
