//! Users' rosters as seen through the component (`jabber:iq:roster`).
//!
//! The component asks each roster user's server for their roster after every
//! connect, keeps the copy current from pushes, and can replace it wholesale
//! with an address book export by pushing the difference.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, warn};

use crate::address::Jid;
use crate::xmpp::{Element, Iq, IqType, NS_ROSTER};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster for {0} has not been received yet")]
    NotInitialized(Jid),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterItem {
    pub name: Option<String>,
    pub groups: BTreeSet<String>,
}

impl RosterItem {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

/// One user's roster, keyed by bare contact address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    items: BTreeMap<Jid, RosterItem>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, jid: Jid, item: RosterItem) -> Self {
        self.insert(jid, item);
        self
    }

    pub fn insert(&mut self, jid: Jid, item: RosterItem) {
        self.items.insert(jid.bare(), item);
    }

    pub fn remove(&mut self, jid: &Jid) -> Option<RosterItem> {
        self.items.remove(&jid.bare())
    }

    pub fn get(&self, jid: &Jid) -> Option<&RosterItem> {
        self.items.get(&jid.bare())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Jid, &RosterItem)> {
        self.items.iter()
    }

    /// Parse a `<query xmlns='jabber:iq:roster'/>` payload.
    ///
    /// Returns the roster of present items and the addresses marked
    /// `subscription='remove'`. Items with unparseable addresses are skipped.
    pub fn from_query(query: &Element) -> (Self, Vec<Jid>) {
        let mut roster = Self::new();
        let mut removed = Vec::new();

        for item in query.children().filter(|c| c.local_name() == "item") {
            let Some(jid) = item.attr("jid").and_then(|j| Jid::parse(j).ok()) else {
                warn!(jid = ?item.attr("jid"), "skipping roster item with bad address");
                continue;
            };

            if item.attr("subscription") == Some("remove") {
                removed.push(jid.bare());
                continue;
            }

            let groups = item
                .children()
                .filter(|c| c.local_name() == "group")
                .map(Element::text)
                .filter(|g| !g.is_empty())
                .collect();
            roster.insert(
                jid,
                RosterItem {
                    name: item.attr("name").map(str::to_string),
                    groups,
                },
            );
        }

        (roster, removed)
    }
}

fn item_element(jid: &Jid, item: Option<&RosterItem>) -> Element {
    let mut el = Element::new("item").with_attr("jid", jid.to_string());
    match item {
        Some(item) => {
            if let Some(name) = &item.name {
                el.set_attr("name", name.clone());
            }
            el.set_attr("subscription", "both");
            for group in &item.groups {
                el.push_child(Element::new("group").with_text(group.clone()));
            }
        }
        None => el.set_attr("subscription", "remove"),
    }
    el
}

fn push(component: &Jid, user: &Jid, jid: &Jid, item: Option<&RosterItem>) -> Iq {
    let query = Element::ns("query", NS_ROSTER).with_child(item_element(jid, item));
    Iq::new(IqType::Set, component.clone(), user.clone(), Some(query))
}

/// Rosters of every user the component manages.
#[derive(Debug, Default)]
pub struct RosterBook {
    rosters: HashMap<Jid, Roster>,
}

impl RosterBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &Jid) -> Option<&Roster> {
        self.rosters.get(&user.bare())
    }

    pub fn len(&self) -> usize {
        self.rosters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rosters.is_empty()
    }

    /// Forget everything; rosters are requested again after a reconnect.
    pub fn clear(&mut self) {
        self.rosters.clear();
    }

    /// Roster request to send to `user`.
    pub fn request(component: &Jid, user: &Jid) -> Iq {
        Iq::new(
            IqType::Get,
            component.clone(),
            user.bare(),
            Some(Element::ns("query", NS_ROSTER)),
        )
    }

    /// Store the full roster from a result. Returns the stored roster.
    pub fn ingest_result(&mut self, user: &Jid, query: &Element) -> &Roster {
        let (roster, _) = Roster::from_query(query);
        debug!(user = %user, items = roster.len(), "roster received");
        let slot = self.rosters.entry(user.bare()).or_default();
        *slot = roster;
        slot
    }

    /// Apply a roster push to a known roster.
    pub fn ingest_push(&mut self, user: &Jid, query: &Element) -> Result<&Roster, RosterError> {
        let roster = self
            .rosters
            .get_mut(&user.bare())
            .ok_or_else(|| RosterError::NotInitialized(user.bare()))?;

        let (changed, removed) = Roster::from_query(query);
        for (jid, item) in changed.items {
            roster.insert(jid, item);
        }
        for jid in &removed {
            roster.remove(jid);
        }
        Ok(roster)
    }

    /// Replace `user`'s roster with `roster`.
    ///
    /// Returns one set IQ per difference: added or changed items are pushed
    /// with `subscription='both'`, missing ones with `subscription='remove'`.
    pub fn replace(
        &mut self,
        component: &Jid,
        user: &Jid,
        roster: Roster,
    ) -> Result<Vec<Iq>, RosterError> {
        let current = self
            .rosters
            .get(&user.bare())
            .ok_or_else(|| RosterError::NotInitialized(user.bare()))?;

        let mut pushes = Vec::new();
        for (jid, item) in roster.iter() {
            if current.get(jid) != Some(item) {
                pushes.push(push(component, &user.bare(), jid, Some(item)));
            }
        }
        for (jid, _) in current.iter() {
            if roster.get(jid).is_none() {
                pushes.push(push(component, &user.bare(), jid, None));
            }
        }

        debug!(user = %user, changes = pushes.len(), "roster replaced");
        self.rosters.insert(user.bare(), roster);
        Ok(pushes)
    }
}
