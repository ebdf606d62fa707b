//! NATS-backed group layer for running several server processes against one
//! broker. Every group maps to the subject `<prefix>.<group>`; each joined
//! member gets its own subscription task feeding its inbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::task::JoinHandle;

use super::{GroupError, GroupEvent, GroupLayer, Member, MemberId};

pub const NATS_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lazily (re)connected NATS client.
pub struct NatsConnection {
    client: tokio::sync::Mutex<Option<async_nats::Client>>,
    url: String,
}

impl NatsConnection {
    pub fn new(url: String) -> Self {
        Self {
            client: tokio::sync::Mutex::new(None),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connect(&self) -> Result<(), async_nats::Error> {
        let mut client = self.client.lock().await;
        match async_nats::connect(&self.url).await {
            Ok(new_client) => {
                *client = Some(new_client);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_client(&self) -> Option<async_nats::Client> {
        self.client.lock().await.clone()
    }

    /// Keeps trying to connect until a client is available.
    pub fn spawn_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            loop {
                if connection.get_client().await.is_none() {
                    info!("NATS client not connected. Attempting to connect...");
                    match connection.connect().await {
                        Ok(_) => info!("Successfully connected to NATS server"),
                        Err(e) => error!(
                            "Failed to connect to NATS server: {}. Retrying in {:?}...",
                            e, NATS_RETRY_INTERVAL
                        ),
                    }
                }
                tokio::time::sleep(NATS_RETRY_INTERVAL).await;
            }
        })
    }
}

/// Group layer publishing JSON-encoded [`GroupEvent`]s over NATS.
pub struct NatsGroups {
    connection: Arc<NatsConnection>,
    subject_prefix: String,
    subscriptions: Mutex<HashMap<(String, MemberId), JoinHandle<()>>>,
}

impl NatsGroups {
    pub fn new(connection: Arc<NatsConnection>, subject_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            subject_prefix: subject_prefix.into(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn subject(&self, group: &str) -> String {
        format!("{}.{}", self.subject_prefix, group)
    }

    async fn client(&self) -> Result<async_nats::Client, GroupError> {
        self.connection
            .get_client()
            .await
            .ok_or(GroupError::Unavailable)
    }

    fn track(&self, key: (String, MemberId), task: JoinHandle<()>) -> Result<(), GroupError> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| GroupError::Backend("subscription table poisoned".to_string()))?;
        if let Some(previous) = subscriptions.insert(key, task) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl GroupLayer for NatsGroups {
    async fn join(&self, group: &str, member: &Member) -> Result<(), GroupError> {
        let client = self.client().await?;
        let subject = self.subject(group);
        let mut subscription = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| GroupError::Backend(e.to_string()))?;
        info!("Subscribed to NATS subject: {}", subject);

        let member_id = member.id();
        let member = member.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                match serde_json::from_slice::<GroupEvent>(&msg.payload) {
                    Ok(event) => {
                        if !member.deliver(event) {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable event on {}: {}", subject, e),
                }
            }
        });
        self.track((group.to_string(), member_id), task)
    }

    async fn leave(&self, group: &str, member: MemberId) -> Result<(), GroupError> {
        let task = self
            .subscriptions
            .lock()
            .map_err(|_| GroupError::Backend("subscription table poisoned".to_string()))?
            .remove(&(group.to_string(), member));
        if let Some(task) = task {
            // dropping the subscriber unsubscribes
            task.abort();
        }
        Ok(())
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), GroupError> {
        let client = self.client().await?;
        let payload = serde_json::to_vec(&event)?;
        client
            .publish(self.subject(group), payload.into())
            .await
            .map_err(|e| GroupError::Backend(e.to_string()))
    }
}
