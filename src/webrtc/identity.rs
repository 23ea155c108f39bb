//! SSRC to participant resolution
//!
//! The relay announces which participant owns each SSRC, one at a time as
//! streams start and in a batch for participants already present. Those
//! announcements race with media, so packets on an SSRC with no mapping yet
//! are attributed to [`Identity::Unknown`] until the mapping arrives.
//!
//! All state sits behind one lock: the route map and the selected screen
//! share are read and written together on the receive path.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::stream::StreamKind;
use crate::events::{EventBus, MediaEvent};

/// Stable participant identifier assigned by the application
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a packet belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(ParticipantId),
    /// SSRC not (yet) announced by the relay
    Unknown,
}

impl Identity {
    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            Identity::Known(id) => Some(id),
            Identity::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Identity::Unknown)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(id) => write!(f, "{}", id),
            Identity::Unknown => f.write_str("<unknown>"),
        }
    }
}

/// One relay-announced mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcMapping {
    pub ssrc: u32,
    pub participant: ParticipantId,
    /// Stream kind when the relay reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
}

/// Current route for an SSRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRoute {
    pub identity: Identity,
    pub kind: Option<StreamKind>,
}

/// What to do with inbound screen media for a given identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenDecision {
    /// Owner's share is the one being watched
    Selected,
    /// Owner is known and someone else (or nobody) is watched
    Unselected,
    /// Owner not resolved yet
    Unresolved,
}

#[derive(Debug, Default)]
struct IdentityState {
    routes: HashMap<u32, (ParticipantId, Option<StreamKind>)>,
    selected_screen: Option<ParticipantId>,
}

/// Session-scoped SSRC → participant table
pub struct StreamIdentityTable {
    state: Mutex<IdentityState>,
    events: Option<Arc<EventBus>>,
}

impl StreamIdentityTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdentityState::default()),
            events: None,
        }
    }

    /// Table that publishes resolution and selection events
    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(IdentityState::default()),
            events: Some(events),
        }
    }

    /// Apply one mapping. Returns true if the route changed.
    pub fn apply(&self, mapping: SsrcMapping) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let entry = (mapping.participant.clone(), mapping.kind);
            match state.routes.insert(mapping.ssrc, entry.clone()) {
                Some(previous) if previous == entry => false,
                Some(previous) => {
                    debug!(
                        "SSRC {} remapped from {} to {}",
                        mapping.ssrc, previous.0, mapping.participant
                    );
                    true
                }
                None => true,
            }
        };

        if changed {
            info!("SSRC {} resolved to {}", mapping.ssrc, mapping.participant);
            self.publish(MediaEvent::IdentityResolved {
                ssrc: mapping.ssrc,
                participant: mapping.participant,
            });
        }
        changed
    }

    /// Apply a batch (participants already present at join). Returns how
    /// many routes changed.
    pub fn apply_batch<I>(&self, mappings: I) -> usize
    where
        I: IntoIterator<Item = SsrcMapping>,
    {
        mappings.into_iter().filter(|m| self.apply(m.clone())).count()
    }

    /// Forget every route owned by a participant (they left)
    pub fn remove_participant(&self, participant: &ParticipantId) -> usize {
        let mut state = self.state.lock();
        let before = state.routes.len();
        state.routes.retain(|_, (owner, _)| owner != participant);
        let removed = before - state.routes.len();
        let was_selected = state.selected_screen.as_ref() == Some(participant);
        if was_selected {
            state.selected_screen = None;
        }
        drop(state);

        if was_selected {
            self.publish(MediaEvent::ScreenSelectionChanged { participant: None });
        }
        removed
    }

    /// Forget a single SSRC
    pub fn remove_ssrc(&self, ssrc: u32) -> bool {
        self.state.lock().routes.remove(&ssrc).is_some()
    }

    pub fn resolve(&self, ssrc: u32) -> Identity {
        self.route(ssrc).identity
    }

    pub fn route(&self, ssrc: u32) -> StreamRoute {
        match self.state.lock().routes.get(&ssrc) {
            Some((participant, kind)) => StreamRoute {
                identity: Identity::Known(participant.clone()),
                kind: *kind,
            },
            None => StreamRoute {
                identity: Identity::Unknown,
                kind: None,
            },
        }
    }

    /// Watch `participant`'s screen share, or nobody's
    pub fn select_screen(&self, participant: Option<ParticipantId>) {
        let changed = {
            let mut state = self.state.lock();
            if state.selected_screen == participant {
                false
            } else {
                state.selected_screen = participant.clone();
                true
            }
        };
        if changed {
            info!(
                "Screen selection: {}",
                participant.as_ref().map(|p| p.as_str()).unwrap_or("none")
            );
            self.publish(MediaEvent::ScreenSelectionChanged { participant });
        }
    }

    pub fn selected_screen(&self) -> Option<ParticipantId> {
        self.state.lock().selected_screen.clone()
    }

    /// Route plus screen decision under a single lock acquisition
    pub fn screen_decision(&self, ssrc: u32) -> (Identity, ScreenDecision) {
        let state = self.state.lock();
        match state.routes.get(&ssrc) {
            Some((participant, _)) => {
                let decision = if state.selected_screen.as_ref() == Some(participant) {
                    ScreenDecision::Selected
                } else {
                    ScreenDecision::Unselected
                };
                (Identity::Known(participant.clone()), decision)
            }
            None => (Identity::Unknown, ScreenDecision::Unresolved),
        }
    }

    pub fn is_screen_selected(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Known(id) => self.state.lock().selected_screen.as_ref() == Some(id),
            Identity::Unknown => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all routes and the selection (session torn down)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.routes.clear();
        state.selected_screen = None;
    }

    fn publish(&self, event: MediaEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

impl Default for StreamIdentityTable {
    fn default() -> Self {
        Self::new()
    }
}
