//! Roster of characters attached to a session.

use std::cmp::Ordering;

use crate::model::Toaster;
use crate::protocol::ToasterEvent;
use crate::session::session_topic;

/// Attachments of one session, at most one entry per character.
#[derive(Debug, Clone, Default)]
pub struct ToasterRoster {
    topic: Option<String>,
    toasters: Vec<Toaster>,
}

impl ToasterRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow `session_id`, or nothing. Switching sessions empties the roster.
    pub fn set_session(&mut self, session_id: Option<i64>) {
        let topic = session_id.map(session_topic);
        if topic != self.topic {
            self.topic = topic;
            self.toasters.clear();
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn len(&self) -> usize {
        self.toasters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toasters.is_empty()
    }

    pub fn get(&self, character_id: i64) -> Option<&Toaster> {
        self.toasters.iter().find(|t| t.character_id == character_id)
    }

    /// Replace everything with a listing fetched over REST.
    pub fn replace_all(&mut self, toasters: Vec<Toaster>) {
        self.toasters.clear();
        for toaster in toasters {
            self.upsert(toaster);
        }
    }

    /// Insert or replace by character id.
    pub fn upsert(&mut self, toaster: Toaster) {
        match self
            .toasters
            .iter_mut()
            .find(|t| t.character_id == toaster.character_id)
        {
            Some(existing) => *existing = toaster,
            None => self.toasters.push(toaster),
        }
    }

    pub fn remove(&mut self, character_id: i64) -> Option<Toaster> {
        let pos = self
            .toasters
            .iter()
            .position(|t| t.character_id == character_id)?;
        Some(self.toasters.remove(pos))
    }

    /// Apply one event. Returns whether the roster changed.
    pub fn handle(&mut self, event: &ToasterEvent) -> bool {
        if self.topic.as_deref() != Some(event.topic()) {
            return false;
        }
        match event {
            ToasterEvent::Attached { toaster, .. } => {
                if self.get(toaster.character_id) == Some(toaster) {
                    return false;
                }
                self.upsert(toaster.clone());
                true
            }
            ToasterEvent::Detached { character_id, .. } => self.remove(*character_id).is_some(),
            ToasterEvent::LocationUpdated {
                character_id,
                location,
                ..
            } => {
                let Some(t) = self.get_mut(*character_id) else {
                    return false;
                };
                if location.system_id.is_some() {
                    t.system_id = location.system_id;
                }
                if location.ship_type_id.is_some() {
                    t.ship_type_id = location.ship_type_id;
                }
                if location.ship_type_name.is_some() {
                    t.ship_type_name.clone_from(&location.ship_type_name);
                }
                if let Some(online) = location.online {
                    t.online = online;
                }
                if location.last_seen_at.is_some() {
                    t.last_seen_at = location.last_seen_at;
                }
                true
            }
            ToasterEvent::Updated {
                character_id,
                entosis_tier,
                ..
            } => match self.get_mut(*character_id) {
                Some(t) if t.entosis_tier != *entosis_tier => {
                    t.entosis_tier = *entosis_tier;
                    true
                }
                _ => false,
            },
        }
    }

    /// Online characters first, then by name (unnamed last), then by id.
    pub fn sorted(&self) -> Vec<Toaster> {
        let mut out = self.toasters.clone();
        out.sort_by(|a, b| {
            b.online
                .cmp(&a.online)
                .then_with(|| compare_names(a.name.as_deref(), b.name.as_deref()))
                .then_with(|| a.character_id.cmp(&b.character_id))
        });
        out
    }

    fn get_mut(&mut self, character_id: i64) -> Option<&mut Toaster> {
        self.toasters
            .iter_mut()
            .find(|t| t.character_id == character_id)
    }
}

fn compare_names(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntosisTier, OwnerUser};
    use crate::protocol::LocationUpdate;

    fn toaster(id: i64, name: &str, online: bool) -> Toaster {
        Toaster {
            character_id: id,
            name: Some(name.to_string()),
            portrait_url: None,
            alliance_id: None,
            alliance_icon_url: None,
            owner_user: OwnerUser { id: 1, display_name: None },
            entosis_tier: EntosisTier::T1,
            system_id: None,
            ship_type_id: None,
            ship_type_name: None,
            online,
            last_seen_at: None,
        }
    }

    fn roster() -> ToasterRoster {
        let mut roster = ToasterRoster::new();
        roster.set_session(Some(4));
        roster
    }

    fn attached(id: i64, name: &str) -> ToasterEvent {
        ToasterEvent::Attached {
            topic: "session.4".into(),
            toaster: toaster(id, name, true),
        }
    }

    #[test]
    fn test_attach_is_deduplicated() {
        let mut roster = roster();
        assert!(roster.handle(&attached(8, "Tosti")));
        assert!(!roster.handle(&attached(8, "Tosti")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_other_session_ignored() {
        let mut roster = roster();
        let event = ToasterEvent::Attached {
            topic: "session.5".into(),
            toaster: toaster(8, "Tosti", true),
        };
        assert!(!roster.handle(&event));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_location_merge_keeps_other_fields() {
        let mut roster = roster();
        roster.handle(&attached(8, "Tosti"));
        roster.handle(&ToasterEvent::LocationUpdated {
            topic: "session.4".into(),
            character_id: 8,
            location: LocationUpdate {
                system_id: Some(30_000_142),
                online: Some(false),
                ..Default::default()
            },
        });
        let t = roster.get(8).unwrap();
        assert_eq!(t.system_id, Some(30_000_142));
        assert!(!t.online);
        assert_eq!(t.name.as_deref(), Some("Tosti"));
    }

    #[test]
    fn test_tier_update_and_detach() {
        let mut roster = roster();
        roster.handle(&attached(8, "Tosti"));
        let update = ToasterEvent::Updated {
            topic: "session.4".into(),
            character_id: 8,
            entosis_tier: EntosisTier::T2,
        };
        assert!(roster.handle(&update));
        assert!(!roster.handle(&update));
        assert_eq!(roster.get(8).unwrap().entosis_tier, EntosisTier::T2);

        assert!(roster.handle(&ToasterEvent::Detached {
            topic: "session.4".into(),
            character_id: 8,
        }));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_sorted_online_first_then_name() {
        let mut roster = roster();
        roster.replace_all(vec![
            toaster(1, "zed", true),
            toaster(2, "Alpha", false),
            toaster(3, "bravo", true),
            toaster(3, "Bravo", true),
        ]);
        let names: Vec<_> = roster
            .sorted()
            .into_iter()
            .map(|t| t.name.unwrap())
            .collect();
        assert_eq!(names, vec!["Bravo", "zed", "Alpha"]);
    }

    #[test]
    fn test_switching_session_clears() {
        let mut roster = roster();
        roster.handle(&attached(8, "Tosti"));
        roster.set_session(Some(4));
        assert_eq!(roster.len(), 1);
        roster.set_session(Some(5));
        assert!(roster.is_empty());
        assert_eq!(roster.topic(), Some("session.5"));
    }
}
