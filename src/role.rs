use std::collections::BTreeSet;
use std::fmt;

use crate::host::Participant;

/// Replication role, resolved once per session from roster data and never
/// re-evaluated. The design assumes at most one participant resolves to
/// Authority; if two qualify simultaneously both broadcast and replica state
/// oscillates between them — there is no election or arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Replica,
}

impl Role {
    pub fn is_authority(self) -> bool {
        matches!(self, Self::Authority)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authority => "authority",
            Self::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the local participant's role. `None` when the roster has no entry
/// for the local user yet.
pub fn resolve_role(participants: &[Participant], marker: &str) -> Option<Role> {
    let me = participants.iter().find(|p| p.is_me)?;
    if me.has_all_access(marker) {
        Some(Role::Authority)
    } else {
        Some(Role::Replica)
    }
}

/// User id of the Authority participant, if one is present in the roster.
pub fn authority_id(participants: &[Participant], marker: &str) -> Option<String> {
    participants
        .iter()
        .find(|p| p.has_all_access(marker))
        .map(|p| p.user_id.clone())
}

/// Connected peer ids, excluding the local participant. The Authority samples
/// this set on a fixed interval; any change triggers a full re-broadcast.
pub fn connected_peer_ids(participants: &[Participant]) -> BTreeSet<String> {
    participants
        .iter()
        .filter(|p| p.connected && !p.is_me)
        .map(|p| p.user_id.clone())
        .collect()
}
