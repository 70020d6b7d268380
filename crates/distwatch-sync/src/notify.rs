//! Priority classification, cooldown suppression and delivery of monitoring notifications.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use distwatch_core::{
    ChangeType, DigestPeriod, MonitorStatus, MonitoringResult, NotificationEvent,
    NotificationQueue, Priority, TargetKind,
};
use distwatch_storage::{NotificationRepository, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Deterministic priority table. `None` means no notification.
pub fn classify(status: MonitorStatus, change_type: ChangeType, kind: TargetKind) -> Option<Priority> {
    match (status, change_type, kind) {
        (MonitorStatus::Unreachable, _, _) => Some(Priority::Critical),
        (MonitorStatus::Error, _, TargetKind::File) => Some(Priority::Medium),
        (MonitorStatus::Error, _, TargetKind::Url) => Some(Priority::High),
        (MonitorStatus::Changed, ChangeType::Structure, _) => Some(Priority::High),
        (MonitorStatus::Changed, _, _) => Some(Priority::Medium),
        (MonitorStatus::Ok, _, _) => None,
    }
}

/// Cooldown ledger key: one entry per (jurisdiction, urlType, status).
pub fn cooldown_key(result: &MonitoringResult) -> String {
    format!(
        "{}|{}|{}",
        result.jurisdiction_key,
        result.url_type,
        result.status.as_str()
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    pub period: DigestPeriod,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub events: Vec<NotificationEvent>,
}

impl Digest {
    pub fn render(period: DigestPeriod, events: Vec<NotificationEvent>, now: DateTime<Utc>) -> Self {
        let mut summary = format!(
            "[distwatch] {} digest {}: {} event(s)",
            period.as_str(),
            now.format("%Y-%m-%d"),
            events.len()
        );
        for event in &events {
            summary.push('\n');
            summary.push_str(&event_line(event));
        }
        Self {
            period,
            generated_at: now,
            summary,
            events,
        }
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "CRITICAL",
        Priority::High => "HIGH",
        Priority::Medium => "MEDIUM",
        Priority::Low => "LOW",
    }
}

fn event_line(event: &NotificationEvent) -> String {
    let result = &event.result;
    let detail = match (result.status, result.change_type) {
        (MonitorStatus::Changed, ChangeType::Structure) => "changed (structure)".to_string(),
        (MonitorStatus::Changed, _) => "changed (content)".to_string(),
        (status, _) => match &result.error_message {
            Some(message) => format!("{} - {message}", status.as_str()),
            None => status.as_str().to_string(),
        },
    };
    format!(
        "- {} {}/{}: {} ({})",
        priority_label(event.priority),
        event.jurisdiction_key,
        result.url_type,
        detail,
        result.location
    )
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered {status}")]
    Rejected { status: u16 },
    #[error("delivery unavailable: {0}")]
    Unavailable(String),
}

/// Transport for notifications; the dispatcher is agnostic to what sits behind it.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send_immediate(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
    async fn send_digest(&self, digest: &Digest) -> Result<(), DeliveryError>;
}

/// Emits notifications as structured log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_immediate(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        warn!(
            priority = priority_label(event.priority),
            jurisdiction = %event.jurisdiction_key,
            url_type = %event.result.url_type,
            status = event.result.status.as_str(),
            location = %event.result.location,
            error = event.result.error_message.as_deref().unwrap_or(""),
            "immediate notification"
        );
        Ok(())
    }

    async fn send_digest(&self, digest: &Digest) -> Result<(), DeliveryError> {
        info!(
            period = digest.period.as_str(),
            events = digest.events.len(),
            "{}",
            digest.summary
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Immediate { event: &'a NotificationEvent },
    Digest { digest: &'a Digest },
}

/// POSTs JSON payloads to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>, timeout: StdDuration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDelivery {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send_immediate(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.post(&WebhookPayload::Immediate { event }).await
    }

    async fn send_digest(&self, digest: &Digest) -> Result<(), DeliveryError> {
        self.post(&WebhookPayload::Digest { digest }).await
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{period} digest delivery via {channel} failed, {requeued} event(s) requeued: {source}")]
    Delivery {
        period: &'static str,
        channel: &'static str,
        requeued: usize,
        #[source]
        source: DeliveryError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub immediate_sent: usize,
    /// Critical events whose immediate delivery failed and that now wait for the daily digest.
    pub immediate_deferred: usize,
    pub queued: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestReport {
    pub period: DigestPeriod,
    pub delivered: usize,
}

pub struct NotificationDispatcher {
    queue: Arc<dyn NotificationRepository>,
    channel: Arc<dyn DeliveryChannel>,
    cooldown: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        queue: Arc<dyn NotificationRepository>,
        channel: Arc<dyn DeliveryChannel>,
        cooldown_hours: i64,
    ) -> Self {
        Self {
            queue,
            channel,
            cooldown: Duration::hours(cooldown_hours.max(0)),
        }
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    /// Classify each result, drop repeats inside the cooldown window, send CRITICAL events
    /// right away and buffer the rest for their digest.
    pub async fn dispatch(
        &self,
        results: &[MonitoringResult],
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        let mut immediate: Vec<NotificationEvent> = Vec::new();
        let cooldown = self.cooldown;

        self.queue
            .update_queue(&mut |queue: &mut NotificationQueue| {
                for result in results {
                    let Some(priority) =
                        classify(result.status, result.change_type, result.target_kind)
                    else {
                        continue;
                    };
                    let key = cooldown_key(result);
                    if let Some(last) = queue.sent_log.get(&key) {
                        if now - *last < cooldown {
                            report.suppressed += 1;
                            continue;
                        }
                    }
                    queue.sent_log.insert(key, now);
                    let event = NotificationEvent {
                        priority,
                        jurisdiction_key: result.jurisdiction_key.clone(),
                        result: result.clone(),
                        created_at: now,
                    };
                    if priority == Priority::Critical {
                        immediate.push(event);
                    } else {
                        queue.pending.entry(priority).or_default().push(event);
                        report.queued += 1;
                    }
                }
            })
            .await?;

        let mut deferred = Vec::new();
        for event in immediate {
            match self.channel.send_immediate(&event).await {
                Ok(()) => report.immediate_sent += 1,
                Err(err) => {
                    warn!(
                        jurisdiction = %event.jurisdiction_key,
                        url_type = %event.result.url_type,
                        channel = self.channel.name(),
                        error = %err,
                        "immediate delivery failed; deferring to daily digest"
                    );
                    deferred.push(event);
                }
            }
        }
        if !deferred.is_empty() {
            report.immediate_deferred = deferred.len();
            self.queue
                .update_queue(&mut |queue: &mut NotificationQueue| {
                    queue
                        .pending
                        .entry(Priority::Critical)
                        .or_default()
                        .extend(deferred.iter().cloned());
                })
                .await?;
        }

        info!(
            sent = report.immediate_sent,
            deferred = report.immediate_deferred,
            queued = report.queued,
            suppressed = report.suppressed,
            "notifications dispatched"
        );
        Ok(report)
    }

    /// Drain the buffers of `period`, render one summary and hand it to the channel. An empty
    /// buffer sends nothing; a failed delivery puts the drained events back in front.
    pub async fn send_digest(
        &self,
        period: DigestPeriod,
        now: DateTime<Utc>,
    ) -> Result<DigestReport, NotifyError> {
        let mut drained: Vec<NotificationEvent> = Vec::new();
        self.queue
            .update_queue(&mut |queue: &mut NotificationQueue| {
                for priority in period.priorities() {
                    if let Some(events) = queue.pending.remove(priority) {
                        drained.extend(events);
                    }
                }
            })
            .await?;

        if drained.is_empty() {
            info!(period = period.as_str(), "digest skipped; nothing pending");
            return Ok(DigestReport {
                period,
                delivered: 0,
            });
        }

        let digest = Digest::render(period, drained, now);
        match self.channel.send_digest(&digest).await {
            Ok(()) => {
                info!(
                    period = period.as_str(),
                    events = digest.events.len(),
                    channel = self.channel.name(),
                    "digest delivered"
                );
                Ok(DigestReport {
                    period,
                    delivered: digest.events.len(),
                })
            }
            Err(source) => {
                let events = digest.events;
                let requeued = events.len();
                self.queue
                    .update_queue(&mut |queue: &mut NotificationQueue| {
                        for event in events.iter().rev() {
                            let bucket = queue.pending.entry(event.priority).or_default();
                            bucket.insert(0, event.clone());
                        }
                    })
                    .await?;
                Err(NotifyError::Delivery {
                    period: period.as_str(),
                    channel: self.channel.name(),
                    requeued,
                    source,
                })
            }
        }
    }

    /// Drop cooldown entries that no longer suppress anything.
    pub async fn prune_cooldowns(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cooldown = self.cooldown;
        let mut removed = 0usize;
        self.queue
            .update_queue(&mut |queue: &mut NotificationQueue| {
                let before = queue.sent_log.len();
                queue.sent_log.retain(|_, last| now - *last < cooldown);
                removed = before - queue.sent_log.len();
            })
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use distwatch_storage::JsonRepository;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        fail: AtomicBool,
        immediate: Mutex<Vec<NotificationEvent>>,
        digests: Mutex<Vec<Digest>>,
    }

    #[async_trait]
    impl DeliveryChannel for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send_immediate(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::Unavailable("smtp down".into()));
            }
            self.immediate.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn send_digest(&self, digest: &Digest) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::Unavailable("smtp down".into()));
            }
            self.digests.lock().unwrap().push(digest.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 3, 0, 0).single().unwrap()
    }

    fn result(key: &str, url_type: &str, status: MonitorStatus, change: ChangeType, kind: TargetKind) -> MonitoringResult {
        MonitoringResult {
            jurisdiction_key: key.into(),
            url_type: url_type.into(),
            location: format!("https://{key}.example.go.kr/{url_type}"),
            target_kind: kind,
            status,
            change_type: change,
            previous_hash: None,
            current_hash: None,
            error_message: None,
            response_time_ms: 12,
            checked_at: now(),
        }
    }

    fn setup(dir: &std::path::Path, channel: Arc<Recorder>) -> (Arc<JsonRepository>, NotificationDispatcher) {
        let repo = Arc::new(JsonRepository::new(dir));
        let dispatcher = NotificationDispatcher::new(repo.clone(), channel, 24);
        (repo, dispatcher)
    }

    #[test]
    fn priority_table_is_total_and_deterministic() {
        use ChangeType::*;
        use MonitorStatus::*;
        use TargetKind::*;
        assert_eq!(classify(Unreachable, Unchanged, File), Some(Priority::Critical));
        assert_eq!(classify(Unreachable, Unchanged, Url), Some(Priority::Critical));
        assert_eq!(classify(Error, Unchanged, File), Some(Priority::Medium));
        assert_eq!(classify(Error, Unchanged, Url), Some(Priority::High));
        assert_eq!(classify(Changed, Structure, Url), Some(Priority::High));
        assert_eq!(classify(Changed, Content, Url), Some(Priority::Medium));
        assert_eq!(classify(Changed, Content, File), Some(Priority::Medium));
        assert_eq!(classify(Ok, Unchanged, Url), None);
        for _ in 0..3 {
            assert_eq!(classify(Changed, Structure, File), Some(Priority::High));
        }
    }

    #[tokio::test]
    async fn critical_goes_out_immediately_and_others_are_buffered() {
        let dir = tempdir().unwrap();
        let channel = Arc::new(Recorder::default());
        let (repo, dispatcher) = setup(dir.path(), channel.clone());

        let results = vec![
            result("jongno", "info", MonitorStatus::Unreachable, ChangeType::Unchanged, TargetKind::Url),
            result("jongno", "fee", MonitorStatus::Changed, ChangeType::Content, TargetKind::Url),
            result("jung", "system", MonitorStatus::Changed, ChangeType::Structure, TargetKind::Url),
            result("jung", "info", MonitorStatus::Ok, ChangeType::Unchanged, TargetKind::Url),
        ];
        let report = dispatcher.dispatch(&results, now()).await.unwrap();
        assert_eq!(report.immediate_sent, 1);
        assert_eq!(report.queued, 2);
        assert_eq!(channel.immediate.lock().unwrap().len(), 1);

        let queue = repo.load_queue().await.unwrap();
        assert_eq!(queue.pending[&Priority::High].len(), 1);
        assert_eq!(queue.pending[&Priority::Medium].len(), 1);
        assert!(queue.sent_log.contains_key("jongno|info|unreachable"));
    }

    #[tokio::test]
    async fn repeats_inside_cooldown_are_suppressed() {
        let dir = tempdir().unwrap();
        let channel = Arc::new(Recorder::default());
        let (_, dispatcher) = setup(dir.path(), channel.clone());
        let broken = [result("jongno", "info", MonitorStatus::Unreachable, ChangeType::Unchanged, TargetKind::Url)];

        dispatcher.dispatch(&broken, now()).await.unwrap();
        let again = dispatcher
            .dispatch(&broken, now() + Duration::hours(23))
            .await
            .unwrap();
        assert_eq!(again.suppressed, 1);
        let later = dispatcher
            .dispatch(&broken, now() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(later.immediate_sent, 1);
        assert_eq!(channel.immediate.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_immediate_delivery_lands_in_the_daily_digest() {
        let dir = tempdir().unwrap();
        let channel = Arc::new(Recorder::default());
        channel.fail.store(true, Ordering::SeqCst);
        let (_, dispatcher) = setup(dir.path(), channel.clone());

        let report = dispatcher
            .dispatch(
                &[result("jongno", "info", MonitorStatus::Unreachable, ChangeType::Unchanged, TargetKind::Url)],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.immediate_deferred, 1);

        channel.fail.store(false, Ordering::SeqCst);
        let digest = dispatcher.send_digest(DigestPeriod::Daily, now()).await.unwrap();
        assert_eq!(digest.delivered, 1);
        let digests = channel.digests.lock().unwrap();
        assert!(digests[0].summary.contains("CRITICAL jongno/info"));
    }

    #[tokio::test]
    async fn digest_drains_only_its_priorities_and_requeues_on_failure() {
        let dir = tempdir().unwrap();
        let channel = Arc::new(Recorder::default());
        let (repo, dispatcher) = setup(dir.path(), channel.clone());
        dispatcher
            .dispatch(
                &[
                    result("jongno", "fee", MonitorStatus::Changed, ChangeType::Content, TargetKind::Url),
                    result("jongno", "guide", MonitorStatus::Error, ChangeType::Unchanged, TargetKind::File),
                    result("jung", "info", MonitorStatus::Error, ChangeType::Unchanged, TargetKind::Url),
                ],
                now(),
            )
            .await
            .unwrap();

        channel.fail.store(true, Ordering::SeqCst);
        let err = dispatcher
            .send_digest(DigestPeriod::Weekly, now())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Delivery { requeued: 2, .. }));
        assert_eq!(repo.load_queue().await.unwrap().pending[&Priority::Medium].len(), 2);

        channel.fail.store(false, Ordering::SeqCst);
        let weekly = dispatcher.send_digest(DigestPeriod::Weekly, now()).await.unwrap();
        assert_eq!(weekly.delivered, 2);
        let queue = repo.load_queue().await.unwrap();
        assert!(queue.pending.get(&Priority::Medium).map_or(true, Vec::is_empty));
        assert_eq!(queue.pending[&Priority::High].len(), 1);

        let empty = dispatcher.send_digest(DigestPeriod::Weekly, now()).await.unwrap();
        assert_eq!(empty.delivered, 0);
        assert_eq!(channel.digests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_cooldowns_are_pruned() {
        let dir = tempdir().unwrap();
        let (repo, dispatcher) = setup(dir.path(), Arc::new(Recorder::default()));
        dispatcher
            .dispatch(
                &[result("jongno", "fee", MonitorStatus::Changed, ChangeType::Content, TargetKind::Url)],
                now(),
            )
            .await
            .unwrap();

        assert_eq!(dispatcher.prune_cooldowns(now() + Duration::hours(2)).await.unwrap(), 0);
        assert_eq!(dispatcher.prune_cooldowns(now() + Duration::hours(30)).await.unwrap(), 1);
        assert!(repo.load_queue().await.unwrap().sent_log.is_empty());
    }
}
