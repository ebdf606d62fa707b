//! Per-user notification sockets and the push API collaborators use to reach
//! them.

use std::fmt::Display;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::groups::{user_group, GroupError, GroupEvent, GroupLayer, Member, MemberId};
use crate::identity::IdentityResolver;
use crate::signaling::protocol::{
    authorization_reply, decode_access, group_changed_notice, message_notice,
    notification_notice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Unsigned,
    /// Terminal while the socket stays open.
    Signed,
}

/// One user's notification socket.
pub struct PresenceHub {
    user_id: String,
    groups: Arc<dyn GroupLayer>,
    identity: Arc<dyn IdentityResolver>,
    group: String,
    member: Member,
    outgoing: mpsc::UnboundedSender<Value>,
    state: PresenceState,
    closed: bool,
}

impl PresenceHub {
    /// Joins `message_user-<user_id>` for the user id taken from the path.
    pub async fn connect(
        groups: Arc<dyn GroupLayer>,
        identity: Arc<dyn IdentityResolver>,
        user_id: &str,
        outgoing: mpsc::UnboundedSender<Value>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>), GroupError> {
        let (member, events) = Member::new();
        let group = user_group(user_id);
        groups.join(&group, &member).await?;
        debug!("Connection {} joined {}", member.id(), group);

        let hub = Self {
            user_id: user_id.to_string(),
            groups,
            identity,
            group,
            member,
            outgoing,
            state: PresenceState::Unsigned,
            closed: false,
        };
        Ok((hub, events))
    }

    /// User id taken from the socket path.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn member_id(&self) -> MemberId {
        self.member.id()
    }

    /// Handles `{access}` frames. Frames without a credential are ignored;
    /// every failure is reported the same way and keeps the socket open.
    pub async fn handle_text(&mut self, text: &str) {
        let Some(access) = decode_access(text) else {
            return;
        };
        match self.identity.resolve(&access).await {
            Ok(identity) if self.user_id.parse::<i64>() == Ok(identity.id) => {
                if self.state == PresenceState::Unsigned {
                    info!("User {} signed notification socket", identity.id);
                }
                self.state = PresenceState::Signed;
            }
            Ok(identity) => {
                debug!(
                    "Credential for user {} presented on socket of {}",
                    identity.id, self.user_id
                );
                self.send(authorization_reply(false));
            }
            Err(e) => {
                debug!("Rejected credential on socket of {}: {}", self.user_id, e);
                self.send(authorization_reply(false));
            }
        }
    }

    /// Forwards `emit_event` payloads once signed; everything else is dropped.
    pub fn handle_group_event(&self, event: GroupEvent) {
        if let GroupEvent::EmitEvent(data) = event {
            if self.state == PresenceState::Signed {
                self.send(data);
            }
        }
    }

    pub async fn disconnect(mut self) {
        self.closed = true;
        if let Err(e) = self.groups.leave(&self.group, self.member.id()).await {
            warn!("Failed to leave {}: {}", self.group, e);
        }
    }

    fn send(&self, value: Value) {
        if self.outgoing.send(value).is_err() {
            debug!("Notification client of {} is gone", self.user_id);
        }
    }
}

impl Drop for PresenceHub {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let groups = self.groups.clone();
        let group = self.group.clone();
        let member_id = self.member.id();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = groups.leave(&group, member_id).await {
                    warn!("Failed to leave {}: {}", group, e);
                }
            });
        }
    }
}

/// Push side of the notification sockets. Delivery is best-effort: failures
/// are logged and never reach the caller.
#[derive(Clone)]
pub struct Notifier {
    groups: Arc<dyn GroupLayer>,
}

impl Notifier {
    pub fn new(groups: Arc<dyn GroupLayer>) -> Self {
        Self { groups }
    }

    pub async fn send_message(&self, user_id: impl Display, message: Value) {
        self.emit(user_id, message_notice(message)).await
    }

    pub async fn send_group_changed_message(&self, user_id: impl Display, group_id: i64) {
        self.emit(user_id, group_changed_notice(group_id)).await
    }

    pub async fn send_notification(&self, user_id: impl Display, message: Value) {
        self.emit(user_id, notification_notice(message)).await
    }

    async fn emit(&self, user_id: impl Display, data: Value) {
        let group = user_group(&user_id.to_string());
        match self.groups.publish(&group, GroupEvent::EmitEvent(data)).await {
            Ok(()) => {}
            Err(GroupError::Unavailable) => debug!("No group layer; dropping push to {}", group),
            Err(e) => warn!("Push to {} failed: {}", group, e),
        }
    }
}
