//! Thumbnail Queue (C10, spec §4.10). Single process-wide structure backing
//! user-facing batch thumbnail fetches for the active context, with a
//! per-backend concurrency/throttle profile.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tracing::instrument;

use crate::error::FlotillaError;
use crate::event_bus::Topic;
use crate::registry::ContextRegistry;
use crate::types::{ModelKind, ThumbnailRequest};

#[derive(Clone, Debug)]
pub enum ThumbnailResult {
    Success { thumbnail: String },
    Failure { message: String },
    Cancelled,
}

#[derive(Clone, Copy, Debug)]
struct ConcurrencyProfile {
    max_concurrent: usize,
    inter_request_delay: Duration,
}

fn profile_for(model_kind: Option<ModelKind>) -> ConcurrencyProfile {
    match model_kind {
        Some(ModelKind::Adventurer5m | ModelKind::Adventurer5mPro | ModelKind::Ad5x) => {
            ConcurrencyProfile { max_concurrent: 3, inter_request_delay: Duration::from_millis(50) }
        }
        _ => ConcurrencyProfile { max_concurrent: 1, inter_request_delay: Duration::from_millis(100) },
    }
}

#[derive(Default, Clone, Debug)]
pub struct QueueStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_process_ms: u64,
}

impl QueueStats {
    pub fn average_process_ms(&self) -> f64 {
        let denom = self.completed + self.failed;
        if denom == 0 {
            0.0
        } else {
            self.total_process_ms as f64 / denom as f64
        }
    }
}

#[derive(Clone, Debug)]
pub enum QueueEvent {
    ItemProcessed { file_name: String, process_ms: u64, queue_size: usize },
    QueueCompleted { stats: QueueStats },
}

struct State {
    queue: VecDeque<ThumbnailRequest>,
    processing: std::collections::HashSet<String>,
    pending: HashMap<String, Vec<oneshot::Sender<ThumbnailResult>>>,
    stats: QueueStats,
    is_processing: bool,
    is_cancelled: bool,
}

pub struct ThumbnailQueue {
    registry: Arc<ContextRegistry>,
    state: Mutex<State>,
    pub events: Topic<QueueEvent>,
}

impl ThumbnailQueue {
    pub fn new(registry: Arc<ContextRegistry>) -> Arc<Self> {
        Arc::new(ThumbnailQueue {
            registry,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                processing: Default::default(),
                pending: HashMap::new(),
                stats: QueueStats::default(),
                is_processing: false,
                is_cancelled: false,
            }),
            events: Topic::new(),
        })
    }

    pub async fn enqueue(self: &Arc<Self>, file_name: String, priority: i32) -> ThumbnailResult {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            let already_tracked =
                state.processing.contains(&file_name) || state.queue.iter().any(|i| i.file_name == file_name);
            state.pending.entry(file_name.clone()).or_default().push(tx);
            if !already_tracked {
                state.queue.push_back(ThumbnailRequest::new(file_name, priority));
                sort_queue(&mut state.queue);
            }
            if !state.is_processing {
                state.is_processing = true;
                state.is_cancelled = false;
                let queue = self.clone();
                tokio::spawn(async move { queue.run_cycle().await });
            }
        }
        rx.await.unwrap_or(ThumbnailResult::Cancelled)
    }

    pub async fn cancel_all(&self) {
        let mut state = self.state.lock().await;
        state.is_cancelled = true;
        state.queue.clear();
        state.stats.cancelled += (state.processing.len() + state.pending.len()) as u64;
        for (_, waiters) in state.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(ThumbnailResult::Cancelled);
            }
        }
    }

    pub async fn reset(&self) {
        self.cancel_all().await;
        let mut state = self.state.lock().await;
        state.stats = QueueStats::default();
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats.clone()
    }

    async fn run_cycle(self: Arc<Self>) {
        loop {
            let (should_continue, profile) = {
                let state = self.state.lock().await;
                if state.is_cancelled || (state.queue.is_empty() && state.processing.is_empty()) {
                    (false, None)
                } else {
                    let model_kind = self.active_model_kind().await;
                    (true, Some(profile_for(model_kind)))
                }
            };
            if !should_continue {
                break;
            }
            let profile = profile.unwrap();

            let dispatched = self.dispatch_batch(profile).await;
            if dispatched > 1 {
                sleep(profile.inter_request_delay).await;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let stats = {
            let mut state = self.state.lock().await;
            state.is_processing = false;
            state.stats.clone()
        };
        self.events.publish(QueueEvent::QueueCompleted { stats });
    }

    async fn active_model_kind(&self) -> Option<ModelKind> {
        let context_id = self.registry.active_context_id().await?;
        let backend = self.registry.get_backend(&context_id).await?;
        Some(backend.model_kind())
    }

    /// Pops up to `maxConcurrent - processing` items and dispatches each as
    /// its own task; returns how many were dispatched this round.
    async fn dispatch_batch(self: &Arc<Self>, profile: ConcurrencyProfile) -> usize {
        let mut dispatched = 0;
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.processing.len() >= profile.max_concurrent || state.queue.is_empty() {
                    None
                } else {
                    let item = state.queue.pop_front().unwrap();
                    state.processing.insert(item.file_name.clone());
                    Some(item)
                }
            };
            let Some(item) = next else { break };
            dispatched += 1;
            let queue = self.clone();
            tokio::spawn(async move { queue.process_item(item).await });
        }
        dispatched
    }

    #[instrument(skip(self), fields(file_name = %item.file_name))]
    async fn process_item(self: Arc<Self>, mut item: ThumbnailRequest) {
        let started = Instant::now();
        let outcome = self.fetch_thumbnail(&item.file_name).await;

        let requeue = match &outcome {
            Err(err) if item.retry_count < ThumbnailRequest::MAX_RETRIES => {
                Some(err.clone())
            }
            _ => None,
        };

        let process_ms = started.elapsed().as_millis() as u64;
        let mut state = self.state.lock().await;
        state.processing.remove(&item.file_name);
        state.stats.total_process_ms += process_ms;

        if state.is_cancelled {
            drop(state);
            return;
        }

        if let Some(_err) = requeue {
            item.retry_count += 1;
            state.queue.push_front(item.clone());
            drop(state);
            self.events.publish(QueueEvent::ItemProcessed {
                file_name: item.file_name,
                process_ms,
                queue_size: 0,
            });
            return;
        }

        let result = match outcome {
            Ok(Some(thumbnail)) => {
                state.stats.completed += 1;
                ThumbnailResult::Success { thumbnail: strip_data_uri_prefix(&thumbnail) }
            }
            Ok(None) => {
                state.stats.failed += 1;
                ThumbnailResult::Failure { message: "No thumbnail available".into() }
            }
            Err(err) => {
                state.stats.failed += 1;
                ThumbnailResult::Failure { message: err.to_string() }
            }
        };
        let queue_size = state.queue.len();
        let waiters = state.pending.remove(&item.file_name).unwrap_or_default();
        drop(state);

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        self.events.publish(QueueEvent::ItemProcessed {
            file_name: item.file_name,
            process_ms,
            queue_size,
        });
    }

    async fn fetch_thumbnail(&self, file_name: &str) -> Result<Option<String>, FlotillaError> {
        let Some(context_id) = self.registry.active_context_id().await else {
            return Err(FlotillaError::backend_not_ready("no active context"));
        };
        let Some(backend) = self.registry.get_backend(&context_id).await else {
            return Err(FlotillaError::backend_not_ready("backend not ready"));
        };
        backend.get_job_thumbnail(file_name).await.outcome
    }
}

impl Clone for ThumbnailResult {
    fn clone(&self) -> Self {
        match self {
            ThumbnailResult::Success { thumbnail } => ThumbnailResult::Success { thumbnail: thumbnail.clone() },
            ThumbnailResult::Failure { message } => ThumbnailResult::Failure { message: message.clone() },
            ThumbnailResult::Cancelled => ThumbnailResult::Cancelled,
        }
    }
}

fn sort_queue(queue: &mut VecDeque<ThumbnailRequest>) {
    let mut items: Vec<_> = queue.drain(..).collect();
    items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
    queue.extend(items);
}

fn strip_data_uri_prefix(thumbnail: &str) -> String {
    thumbnail
        .strip_prefix("data:image/png;base64,")
        .unwrap_or(thumbnail)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_data_uri_prefix_removes_known_prefix() {
        assert_eq!(strip_data_uri_prefix("data:image/png;base64,abcd"), "abcd");
        assert_eq!(strip_data_uri_prefix("abcd"), "abcd");
    }

    #[test]
    fn profile_for_legacy_is_serial_with_longer_delay() {
        let profile = profile_for(Some(ModelKind::GenericLegacy));
        assert_eq!(profile.max_concurrent, 1);
        assert_eq!(profile.inter_request_delay, Duration::from_millis(100));
    }

    #[test]
    fn profile_for_five_m_allows_concurrency() {
        let profile = profile_for(Some(ModelKind::Ad5x));
        assert_eq!(profile.max_concurrent, 3);
        assert_eq!(profile.inter_request_delay, Duration::from_millis(50));
    }

    #[test]
    fn average_process_ms_is_zero_with_no_completions() {
        assert_eq!(QueueStats::default().average_process_ms(), 0.0);
    }
}
