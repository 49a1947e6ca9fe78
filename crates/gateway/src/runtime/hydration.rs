//! History hydration: paged loading of a thread's messages.
//!
//! `thread/messages` answers the first page synchronously. When the thread
//! holds more than one page, a background task hydrates the rest into the
//! timeline (append mode, deduplicated by record id, capped), then announces
//! completion with a `thread/messages/page` notification. Cursor requests
//! (`before > 0`) bypass hydration and return the slice directly.

use std::sync::Arc;

use cb_domain::config::HydrationConfig;
use cb_domain::error::Result;
use cb_protocol::notify;
use cb_store::{MessageStore, ThreadMessage};

use crate::connections::registry::ConnectionRegistry;
use crate::runtime::pipeline::{EventPipeline, TimelineEntry};

pub struct Hydrator {
    messages: Arc<MessageStore>,
    pipeline: Arc<EventPipeline>,
    registry: Arc<ConnectionRegistry>,
    config: HydrationConfig,
}

/// Result of a `thread/messages` call.
pub struct PageResult {
    pub messages: Vec<ThreadMessage>,
    pub total: usize,
}

fn to_entry(message: &ThreadMessage) -> TimelineEntry {
    TimelineEntry {
        id: message.id.clone(),
        kind: message.role.clone(),
        payload: serde_json::json!({
            "text": message.text,
            "metadata": message.metadata,
            "seq": message.seq,
        }),
        at: message.created_at,
    }
}

impl Hydrator {
    pub fn new(
        messages: Arc<MessageStore>,
        pipeline: Arc<EventPipeline>,
        registry: Arc<ConnectionRegistry>,
        config: HydrationConfig,
    ) -> Self {
        Self {
            messages,
            pipeline,
            registry,
            config,
        }
    }

    /// Serve one page. A first-page request (`before == 0`) that does not
    /// cover the thread kicks off background hydration.
    pub fn get_page(&self, thread_id: &str, limit: usize, before: u64) -> Result<PageResult> {
        let limit = if limit == 0 {
            self.config.first_page_default
        } else {
            limit.min(self.config.first_page_max)
        };

        let page = self.messages.page(thread_id, limit, before)?;

        if before == 0 && page.total > page.messages.len() {
            self.spawn_hydration(thread_id, &page.messages, page.total);
        }

        Ok(PageResult {
            messages: page.messages,
            total: page.total,
        })
    }

    /// Load the remaining history into the timeline in the background.
    fn spawn_hydration(&self, thread_id: &str, first_page: &[ThreadMessage], total: usize) {
        // The first page becomes the timeline snapshot (replace mode); the
        // background pages append behind it.
        self.pipeline
            .replace_timeline(thread_id, first_page.iter().map(to_entry).collect());

        let mut cursor = first_page.iter().map(|m| m.seq).min().unwrap_or(0);
        let mut loaded = first_page.len();
        let cap = self.config.max_records;
        let page_size = self.config.page_size;

        let messages = self.messages.clone();
        let pipeline = self.pipeline.clone();
        let registry = self.registry.clone();
        let thread_id = thread_id.to_owned();

        tokio::spawn(async move {
            let mut pages = 1usize;
            while cursor > 1 && loaded < total.min(cap) {
                let batch = match messages.page(&thread_id, page_size, cursor) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(
                            thread_id = %thread_id,
                            error = %e,
                            "hydration read failed"
                        );
                        break;
                    }
                };
                if batch.messages.is_empty() {
                    break;
                }
                cursor = batch.messages.iter().map(|m| m.seq).min().unwrap_or(0);
                loaded += batch.messages.len();
                pages += 1;
                pipeline.append_hydrated(
                    &thread_id,
                    batch.messages.iter().map(to_entry).collect(),
                );
                // Yield between pages so a large backlog cannot starve the
                // event loop.
                tokio::task::yield_now().await;
            }

            tracing::debug!(
                thread_id = %thread_id,
                total,
                pages,
                loaded,
                "hydration complete"
            );
            registry.broadcast(&notify::thread_messages_page(&thread_id, total, pages));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_domain::config::AgentLaunchConfig;
    use cb_store::{AgentStatusStore, BindingStore};
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::runtime::manager::AgentManager;
    use crate::runtime::tracker::TurnTracker;

    struct Fixture {
        _dir: TempDir,
        hydrator: Hydrator,
        pipeline: Arc<EventPipeline>,
        registry: Arc<ConnectionRegistry>,
        messages: Arc<MessageStore>,
    }

    fn fixture(config: HydrationConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(10, 64, 8));
        let messages = Arc::new(MessageStore::new(dir.path()).unwrap());
        let pipeline = Arc::new(EventPipeline::new(
            registry.clone(),
            Arc::new(TurnTracker::new()),
            Arc::new(BindingStore::new(dir.path()).unwrap()),
            Arc::new(AgentStatusStore::new(dir.path()).unwrap()),
            Arc::new(AgentManager::new(AgentLaunchConfig::default())),
        ));
        let hydrator = Hydrator::new(
            messages.clone(),
            pipeline.clone(),
            registry.clone(),
            config,
        );
        Fixture {
            _dir: dir,
            hydrator,
            pipeline,
            registry,
            messages,
        }
    }

    fn seed(messages: &MessageStore, thread_id: &str, count: usize) {
        for i in 0..count {
            messages
                .append(thread_id, "user", &format!("m{i}"), serde_json::json!({}))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn limit_zero_defaults_and_large_limits_clamp() {
        let fx = fixture(HydrationConfig {
            first_page_default: 100,
            first_page_max: 500,
            page_size: 500,
            max_records: 20_000,
        });
        seed(&fx.messages, "t", 3);

        let page = fx.hydrator.get_page("t", 0, 0).unwrap();
        assert_eq!(page.messages.len(), 3);
        assert_eq!(page.total, 3);

        // limit > max clamps to max (observable with a small cap).
        let fx = fixture(HydrationConfig {
            first_page_default: 2,
            first_page_max: 4,
            page_size: 4,
            max_records: 20_000,
        });
        seed(&fx.messages, "t", 10);
        let page = fx.hydrator.get_page("t", 999, 0).unwrap();
        assert_eq!(page.messages.len(), 4);
    }

    #[tokio::test]
    async fn background_hydration_fills_timeline_and_notifies() {
        let fx = fixture(HydrationConfig {
            first_page_default: 5,
            first_page_max: 500,
            page_size: 4,
            max_records: 20_000,
        });
        seed(&fx.messages, "t", 12);
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        let page = fx.hydrator.get_page("t", 0, 0).unwrap();
        assert_eq!(page.messages.len(), 5);
        assert_eq!(page.messages[0].text, "m11"); // newest first

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("hydration notification")
            .unwrap();
        assert!(frame.contains("thread/messages/page"));
        assert!(frame.contains("\"totalCount\":12"));

        assert_eq!(fx.pipeline.timeline("t").len(), 12);
    }

    #[tokio::test]
    async fn cursor_requests_bypass_hydration() {
        let fx = fixture(HydrationConfig {
            first_page_default: 5,
            first_page_max: 500,
            page_size: 4,
            max_records: 20_000,
        });
        seed(&fx.messages, "t", 12);
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        let page = fx.hydrator.get_page("t", 5, 8).unwrap();
        assert_eq!(page.messages.len(), 5);
        assert_eq!(page.messages[0].text, "m6"); // seq 7 is newest below 8

        // No background task, no notification.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hydration_respects_record_cap() {
        let fx = fixture(HydrationConfig {
            first_page_default: 2,
            first_page_max: 500,
            page_size: 3,
            max_records: 6,
        });
        seed(&fx.messages, "t", 20);
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        fx.hydrator.get_page("t", 0, 0).unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("hydration notification")
            .unwrap();

        // 2 from the first page plus background pages until the cap.
        assert!(fx.pipeline.timeline("t").len() <= 8);
    }
}
