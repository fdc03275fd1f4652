use crate::config::SignalingConfig;
use crate::errors::LinkError;
use crate::signaling::message::{NegotiationMessage, Role};
use crate::signaling::relay::{RelaySubscription, RelayTransport};
use crate::types::JobId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A participant's membership in one job's signaling topic.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    job_id: JobId,
    role: Role,
    topic: String,
    subscription_id: u64,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<bytes::Bytes>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    left: AtomicBool,
}

impl ChannelHandle {
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.inner.topic)
            .field("role", &self.inner.role)
            .field("left", &self.is_left())
            .finish()
    }
}

/// Per-job relay channel for negotiation messages between exactly two
/// participants.
#[derive(Clone)]
pub struct SignalingChannel {
    relay: Arc<dyn RelayTransport>,
    config: SignalingConfig,
    joined: Arc<Mutex<HashMap<(JobId, Role), ChannelHandle>>>,
}

impl SignalingChannel {
    pub fn new(relay: Arc<dyn RelayTransport>, config: SignalingConfig) -> Self {
        Self {
            relay,
            config,
            joined: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn topic_for(&self, job_id: &JobId) -> String {
        format!("{}{}", self.config.topic_prefix, job_id)
    }

    /// Open or attach to the topic for `job_id`. Joining again with the same
    /// role returns the existing handle.
    pub async fn join(&self, job_id: &JobId, role: Role) -> Result<ChannelHandle, LinkError> {
        if let Some(existing) = self.lookup(job_id, role)? {
            log::debug!("Reusing channel {} for {}", existing.topic(), role);
            return Ok(existing);
        }

        let topic = self.topic_for(job_id);
        let RelaySubscription {
            id,
            topic,
            receiver,
        } = self.relay.subscribe(&topic).await?;

        let handle = ChannelHandle {
            inner: Arc::new(HandleInner {
                job_id: *job_id,
                role,
                topic,
                subscription_id: id,
                receiver: Mutex::new(Some(receiver)),
                listener: Mutex::new(None),
                left: AtomicBool::new(false),
            }),
        };

        let raced = {
            let mut joined = self.joined_map()?;
            match joined.get(&(*job_id, role)).filter(|h| !h.is_left()) {
                Some(existing) => Some(existing.clone()),
                None => {
                    joined.insert((*job_id, role), handle.clone());
                    None
                }
            }
        };
        if let Some(raced) = raced {
            // A concurrent join won; keep its subscription and drop ours.
            self.relay.unsubscribe(handle.topic(), id).await;
            return Ok(raced);
        }

        log::info!("Joined signaling channel {} as {}", handle.topic(), role);
        Ok(handle)
    }

    /// Fire-and-forget send to the other participant. Transient relay
    /// failures are retried a bounded number of times.
    pub async fn publish(
        &self,
        handle: &ChannelHandle,
        message: &NegotiationMessage,
    ) -> Result<(), LinkError> {
        if handle.is_left() {
            return Err(LinkError::ChannelUnavailable(format!(
                "channel {} already left",
                handle.topic()
            )));
        }

        let payload = message.encode()?;
        let mut attempt = 0;
        loop {
            match self.relay.publish(handle.topic(), payload.clone()).await {
                Ok(()) => {
                    log::debug!("Published {:?} on {}", message.kind, handle.topic());
                    return Ok(());
                }
                Err(e) if attempt < self.config.publish_retries => {
                    attempt += 1;
                    log::warn!(
                        "Publish on {} failed (attempt {}): {}",
                        handle.topic(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) => {
                    return Err(LinkError::ChannelUnavailable(format!(
                        "publish on {} failed: {}",
                        handle.topic(),
                        e
                    )))
                }
            }
        }
    }

    /// Deliver every message from the other participant to `callback`, in
    /// relay order. Our own echoed messages and messages for other jobs are
    /// dropped here; undecodable payloads are passed on as errors.
    pub fn on_message<F, Fut>(&self, handle: &ChannelHandle, mut callback: F) -> Result<(), LinkError>
    where
        F: FnMut(Result<NegotiationMessage, LinkError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if handle.is_left() {
            return Err(LinkError::ChannelUnavailable(format!(
                "channel {} already left",
                handle.topic()
            )));
        }

        let mut receiver = handle
            .inner
            .receiver
            .lock()
            .map_err(|_| LinkError::ChannelUnavailable("handle lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| {
                LinkError::ChannelUnavailable(format!(
                    "a listener is already registered on {}",
                    handle.topic()
                ))
            })?;

        let local_role = handle.role();
        let job_id = handle.job_id();
        let topic = handle.topic().to_string();
        let task = tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                match NegotiationMessage::decode(&payload) {
                    Ok(message) if message.sender == local_role => {
                        log::trace!("Dropping self-echo {:?} on {}", message.kind, topic);
                    }
                    Ok(message) if message.job_id != job_id => {
                        log::warn!(
                            "Dropping message for job {} received on {}",
                            message.job_id,
                            topic
                        );
                    }
                    other => callback(other).await,
                }
            }
            log::debug!("Listener on {} finished", topic);
        });

        if let Ok(mut listener) = handle.inner.listener.lock() {
            *listener = Some(task);
        }
        Ok(())
    }

    /// Release the subscription. Safe to call any number of times.
    pub async fn leave(&self, handle: &ChannelHandle) {
        if handle.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut listener) = handle.inner.listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
        if let Ok(mut receiver) = handle.inner.receiver.lock() {
            receiver.take();
        }
        if let Ok(mut joined) = self.joined.lock() {
            let key = (handle.job_id(), handle.role());
            let same = joined
                .get(&key)
                .is_some_and(|h| Arc::ptr_eq(&h.inner, &handle.inner));
            if same {
                joined.remove(&key);
            }
        }

        self.relay
            .unsubscribe(handle.topic(), handle.inner.subscription_id)
            .await;
        log::info!("Left signaling channel {} as {}", handle.topic(), handle.role());
    }

    fn lookup(&self, job_id: &JobId, role: Role) -> Result<Option<ChannelHandle>, LinkError> {
        Ok(self
            .joined_map()?
            .get(&(*job_id, role))
            .filter(|h| !h.is_left())
            .cloned())
    }

    fn joined_map(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(JobId, Role), ChannelHandle>>, LinkError> {
        self.joined
            .lock()
            .map_err(|_| LinkError::ChannelUnavailable("channel registry poisoned".to_string()))
    }
}
