//! Cross-room analytics rollups.
//!
//! Pure aggregation over room snapshots; the per-user counters themselves
//! are maintained incrementally by the writer loop.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use agora_types::models::{ReactionCounts, Room, RoomStatus, UserStats};

/// Counter sums across one scope (a room, or all rooms).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityTotals {
    pub posts: u64,
    pub stances: BTreeMap<String, u64>,
    pub reactions_given: ReactionCounts,
    pub note_edits: u64,
    pub facilitator_uses: u64,
    pub proposal_form_edits: u64,
    pub progress_check_uses: u64,
}

impl ActivityTotals {
    fn absorb(&mut self, stats: &UserStats) {
        self.posts += stats.posts;
        for (stance, n) in &stats.stances {
            *self.stances.entry(stance.clone()).or_default() += n;
        }
        self.reactions_given.add(&stats.reactions_given);
        self.note_edits += stats.note_edits;
        self.facilitator_uses += stats.facilitator_uses;
        self.proposal_form_edits += stats.proposal_form_edits;
        self.progress_check_uses += stats.progress_check_uses;
    }

    pub fn total_reactions(&self) -> u64 {
        self.reactions_given.agree + self.reactions_given.partial + self.reactions_given.disagree
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomReport {
    pub room_id: String,
    pub topic: String,
    pub status: RoomStatus,
    pub participant_count: u64,
    pub totals: ActivityTotals,
    pub users: BTreeMap<String, UserStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallReport {
    pub room_count: u64,
    pub active_rooms: u64,
    pub closed_rooms: u64,
    /// Distinct usernames across all rooms.
    pub participant_count: u64,
    pub totals: ActivityTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub rooms: Vec<RoomReport>,
    pub overall: OverallReport,
}

/// Roll the per-room analytics up into per-room and overall totals.
pub fn aggregate(rooms: &[Room]) -> AnalyticsReport {
    let mut reports = Vec::with_capacity(rooms.len());
    let mut participants: BTreeSet<&str> = BTreeSet::new();
    let mut overall_totals = ActivityTotals::default();
    let mut active = 0u64;
    let mut closed = 0u64;

    for room in rooms {
        match room.status {
            RoomStatus::Active => active += 1,
            RoomStatus::Closed => closed += 1,
        }

        let mut totals = ActivityTotals::default();
        for (username, stats) in &room.analytics.users {
            participants.insert(username);
            totals.absorb(stats);
            overall_totals.absorb(stats);
        }

        reports.push(RoomReport {
            room_id: room.room_id.clone(),
            topic: room.topic.clone(),
            status: room.status,
            participant_count: room.analytics.users.len() as u64,
            totals,
            users: room.analytics.users.clone(),
        });
    }

    let overall = OverallReport {
        room_count: rooms.len() as u64,
        active_rooms: active,
        closed_rooms: closed,
        participant_count: participants.len() as u64,
        totals: overall_totals,
    };

    AnalyticsReport { rooms: reports, overall }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::models::ReactionKind;

    fn room_with(room_id: &str, users: &[(&str, u64)]) -> Room {
        let mut room = Room::new(room_id, "t");
        for (name, posts) in users {
            room.analytics.ensure_user(name).posts = *posts;
        }
        room
    }

    #[test]
    fn participants_counted_once_across_rooms() {
        let rooms = vec![
            room_with("r1", &[("A", 2), ("B", 1)]),
            room_with("r2", &[("B", 3), ("C", 1)]),
        ];

        let report = aggregate(&rooms);
        assert_eq!(report.overall.participant_count, 3);
        assert_eq!(report.overall.totals.posts, 7);
        assert_eq!(report.rooms[0].participant_count, 2);
        assert_eq!(report.rooms[1].totals.posts, 4);
    }

    #[test]
    fn reaction_and_stance_sums() {
        let mut room = room_with("r1", &[("A", 1)]);
        {
            let stats = room.analytics.ensure_user("A");
            stats.reactions_given.increment(ReactionKind::Agree);
            stats.reactions_given.increment(ReactionKind::Disagree);
            stats.count_stance("opinion");
            stats.count_stance("opinion");
            stats.note_edits = 3;
        }

        let report = aggregate(&[room]);
        assert_eq!(report.rooms[0].totals.total_reactions(), 2);
        assert_eq!(report.rooms[0].totals.stances["opinion"], 2);
        assert_eq!(report.overall.totals.note_edits, 3);
    }

    #[test]
    fn empty_input_yields_zero_overall() {
        let report = aggregate(&[]);
        assert_eq!(report.overall.room_count, 0);
        assert_eq!(report.overall.participant_count, 0);
        assert!(report.rooms.is_empty());
    }

    #[test]
    fn room_status_split() {
        let mut open = room_with("r1", &[]);
        open.status = RoomStatus::Active;
        let mut done = room_with("r2", &[]);
        done.status = RoomStatus::Closed;

        let report = aggregate(&[open, done]);
        assert_eq!(report.overall.active_rooms, 1);
        assert_eq!(report.overall.closed_rooms, 1);
    }
}
