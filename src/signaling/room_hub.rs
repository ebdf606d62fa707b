//! Per-connection room signaling actor.
//!
//! A hub joins the room's group on connect, binds a user once the client
//! authenticates, relays SDP/ICE/stream-status messages through the group and
//! filters group events by addressing rules before they reach its client.
//! Inbound messages for one connection are handled strictly in order.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::groups::{room_group, GroupError, GroupEvent, GroupLayer, Member, MemberId};
use crate::room::{Authentication, Participant, Room, RoomError, RoomRegistry, RoomService};
use crate::signaling::protocol::{
    authentication_reply, decode_room_message, error_reply, user_disconnected, Inbound,
    RoomRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoomState {
    /// In the group, no user bound yet.
    Connected,
    Authenticated { user_id: String },
    Closed,
}

pub struct RoomHub {
    service: RoomService,
    groups: Arc<dyn GroupLayer>,
    group: String,
    member: Member,
    outgoing: mpsc::UnboundedSender<Value>,
    state: RoomState,
}

impl RoomHub {
    /// Joins the room's group. The returned receiver yields the group events
    /// that must be passed to [`RoomHub::handle_group_event`].
    pub async fn connect(
        registry: &Arc<RoomRegistry>,
        groups: Arc<dyn GroupLayer>,
        room_name: &str,
        outgoing: mpsc::UnboundedSender<Value>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>), GroupError> {
        let (member, events) = Member::new();
        let group = room_group(room_name);
        groups.join(&group, &member).await?;
        debug!("Connection {} joined {}", member.id(), group);

        let hub = Self {
            service: registry.service(room_name),
            groups,
            group,
            member,
            outgoing,
            state: RoomState::Connected,
        };
        Ok((hub, events))
    }

    pub fn room_name(&self) -> &str {
        self.service.room_name()
    }

    pub fn member_id(&self) -> MemberId {
        self.member.id()
    }

    /// The user this connection acts as, once authenticated.
    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            RoomState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    /// Handles one text frame from the client. Unparseable frames and
    /// unknown types are ignored.
    pub async fn handle_text(&mut self, text: &str) {
        match decode_room_message(text) {
            Some(inbound) => self.handle_request(inbound).await,
            None => debug!("Ignoring undecodable frame in room {}", self.room_name()),
        }
    }

    pub async fn handle_request(&mut self, inbound: Inbound) {
        let Inbound { request, raw } = inbound;
        match request {
            RoomRequest::Authentication {
                password,
                user_id,
                username,
            } => self.authenticate(&password, user_id, username).await,
            RoomRequest::Unknown => {
                debug!("Ignoring unknown message type in room {}", self.room_name())
            }
            request => {
                let Some(bound) = self.user_id() else {
                    return;
                };
                let (actor, event) = match &request {
                    RoomRequest::NotifyParticipant { user_id, .. } => {
                        (user_id, GroupEvent::Emit(raw))
                    }
                    RoomRequest::SendSdp { sender, .. }
                    | RoomRequest::AnswerSdp { sender, .. }
                    | RoomRequest::SendCandidate { sender, .. } => {
                        (sender, GroupEvent::SendSdp(raw))
                    }
                    RoomRequest::StreamStatus { sender, .. } => {
                        (sender, GroupEvent::SendToOthers(raw))
                    }
                    RoomRequest::Authentication { .. } | RoomRequest::Unknown => return,
                };
                if actor != bound {
                    debug!(
                        "Connection bound to {} tried to act as {}; ignoring",
                        bound, actor
                    );
                    return;
                }
                if let Err(e) = self.groups.publish(&self.group, event).await {
                    warn!("Failed to publish to {}: {}", self.group, e);
                }
            }
        }
    }

    async fn authenticate(&mut self, password: &str, user_id: String, username: String) {
        match self.join_room(password, &user_id, &username).await {
            Ok(Some(mut room)) => {
                if let Some(previous) = self.user_id().filter(|bound| *bound != user_id) {
                    let previous = previous.to_string();
                    self.release_user(&previous).await;
                    room.leave(&previous);
                }
                let participants =
                    serde_json::to_value(&room.participants).unwrap_or(Value::Null);
                info!("User {} authenticated in room {}", user_id, self.room_name());
                self.state = RoomState::Authenticated { user_id };
                self.send(authentication_reply(true, participants));
            }
            Ok(None) | Err(RoomError::PasswordMismatch { .. }) => {
                debug!("Rejected password for room {}", self.room_name());
                self.send(authentication_reply(false, json!({})));
            }
            Err(e) => {
                warn!("Authentication in room {} failed: {}", self.room_name(), e);
                self.send(error_reply(e.code(), &e.to_string()));
            }
        }
    }

    /// Drops a user this connection no longer acts as, the same way a
    /// disconnect would.
    async fn release_user(&self, user_id: &str) {
        if let Err(e) = self.service.remove_participant(user_id).await {
            warn!("Could not remove {} from room {}: {}", user_id, self.room_name(), e);
        }
        let notice = GroupEvent::Emit(user_disconnected(user_id));
        if let Err(e) = self.groups.publish(&self.group, notice).await {
            warn!("Failed to announce departure of {}: {}", user_id, e);
        }
    }

    /// `Ok(None)` when the password is rejected.
    async fn join_room(
        &self,
        password: &str,
        user_id: &str,
        username: &str,
    ) -> Result<Option<Room>, RoomError> {
        match self.service.authenticate(password).await? {
            Authentication::Denied => return Ok(None),
            Authentication::Absent => {
                self.service.create_room(user_id, password).await?;
            }
            Authentication::Granted(_) => {}
        }
        let room = self
            .service
            .add_participant(Participant::new(user_id, username))
            .await?;
        Ok(Some(room))
    }

    /// Applies the addressing rule of a group event and forwards its payload
    /// to the client when it is addressed to this connection.
    pub fn handle_group_event(&self, event: GroupEvent) {
        match event {
            GroupEvent::Emit(data) => self.send(data),
            GroupEvent::SendSdp(data) => {
                if let Some(user_id) = self.user_id() {
                    if data.get("receiver").and_then(Value::as_str) == Some(user_id) {
                        self.send(data);
                    }
                }
            }
            GroupEvent::SendToOthers(data) => {
                if let Some(user_id) = self.user_id() {
                    if data.get("sender").and_then(Value::as_str) != Some(user_id) {
                        self.send(data);
                    }
                }
            }
            GroupEvent::EmitEvent(_) => {}
        }
    }

    /// Runs disconnect cleanup: participant removal and a `userdisconnected`
    /// broadcast when a user is bound, then leaves the group.
    pub async fn disconnect(mut self) {
        let user_id = self.take_user();
        cleanup(
            self.service.clone(),
            self.groups.clone(),
            self.group.clone(),
            self.member.id(),
            user_id,
        )
        .await;
    }

    fn take_user(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, RoomState::Closed) {
            RoomState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    fn send(&self, value: Value) {
        if self.outgoing.send(value).is_err() {
            debug!("Client of room {} is gone", self.room_name());
        }
    }
}

impl Drop for RoomHub {
    fn drop(&mut self) {
        if self.state == RoomState::Closed {
            return;
        }
        let user_id = self.take_user();
        let task = cleanup(
            self.service.clone(),
            self.groups.clone(),
            self.group.clone(),
            self.member.id(),
            user_id,
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => warn!("Room hub for {} dropped outside a runtime", self.group),
        }
    }
}

async fn cleanup(
    service: RoomService,
    groups: Arc<dyn GroupLayer>,
    group: String,
    member_id: MemberId,
    user_id: Option<String>,
) {
    if let Some(user_id) = user_id {
        if let Err(e) = service.remove_participant(&user_id).await {
            warn!(
                "Could not remove {} from room {}: {}",
                user_id,
                service.room_name(),
                e
            );
        }
        let notice = GroupEvent::Emit(user_disconnected(&user_id));
        if let Err(e) = groups.publish(&group, notice).await {
            warn!("Failed to announce disconnect of {}: {}", user_id, e);
        }
        info!("User {} disconnected from room {}", user_id, service.room_name());
    }
    if let Err(e) = groups.leave(&group, member_id).await {
        warn!("Failed to leave {}: {}", group, e);
    }
}
