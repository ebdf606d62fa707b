//! In-process group layer.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use log::debug;

use super::{GroupError, GroupEvent, GroupLayer, Member, MemberId};

type Groups = HashMap<String, HashMap<MemberId, Member>>;

/// Group table for a single server process.
#[derive(Default)]
pub struct LocalGroups {
    groups: RwLock<Groups>,
}

impl LocalGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.groups
            .read()
            .map(|groups| groups.get(group).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn poisoned<T>(_: T) -> GroupError {
        GroupError::Backend("group table poisoned".to_string())
    }
}

#[async_trait]
impl GroupLayer for LocalGroups {
    async fn join(&self, group: &str, member: &Member) -> Result<(), GroupError> {
        let mut groups = self.groups.write().map_err(Self::poisoned)?;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(member.id(), member.clone());
        Ok(())
    }

    async fn leave(&self, group: &str, member: MemberId) -> Result<(), GroupError> {
        let mut groups = self.groups.write().map_err(Self::poisoned)?;
        if let Some(members) = groups.get_mut(group) {
            members.remove(&member);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        Ok(())
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<(), GroupError> {
        let members: Vec<Member> = {
            let groups = self.groups.read().map_err(Self::poisoned)?;
            match groups.get(group) {
                Some(members) => members.values().cloned().collect(),
                None => return Ok(()),
            }
        };
        for member in members {
            if !member.deliver(event.clone()) {
                debug!("Member {} of {} is gone; skipping", member.id(), group);
            }
        }
        Ok(())
    }
}
