use crate::state::SequenceNumber;
use std::collections::{BTreeSet, HashMap};

/// A change in the local client's leadership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderTransition {
	Promoted,
	Demoted,
}

/// Tracks quorum membership and elects the oldest member as leader.
///
/// Members are ordered by the sequence number at which they joined, ties
/// broken by client id so that every client elects the same leader from the
/// same membership view. A tracker without a local client id (a detached
/// map) is never leader.
#[derive(Default)]
pub struct LeaderTracker {
	local: Option<String>,
	members: BTreeSet<(SequenceNumber, String)>,
	joined_at: HashMap<String, SequenceNumber>,
	leading: bool,
}

impl LeaderTracker {
	pub fn new(local: Option<String>) -> Self {
		Self {
			local,
			..Default::default()
		}
	}

	pub fn set_local(&mut self, client_id: String) {
		self.local = Some(client_id);
	}

	pub fn is_leader(&self) -> bool {
		self.leading
	}

	/// Records a member joining the quorum
	pub fn client_joined(
		&mut self,
		client_id: String,
		join_sequence_number: SequenceNumber,
	) -> Option<LeaderTransition> {
		if self.joined_at.contains_key(&client_id) {
			return None;
		}
		self.joined_at.insert(client_id.clone(), join_sequence_number);
		self.members.insert((join_sequence_number, client_id));
		self.recompute()
	}

	/// Records a member leaving the quorum
	pub fn client_left(&mut self, client_id: &str) -> Option<LeaderTransition> {
		let Some(join_sequence_number) = self.joined_at.remove(client_id) else {
			return None;
		};
		self.members.remove(&(join_sequence_number, client_id.to_string()));
		self.recompute()
	}

	fn recompute(&mut self) -> Option<LeaderTransition> {
		let leading_now = match (&self.local, self.members.iter().next()) {
			(Some(local), Some((_, oldest))) => local == oldest,
			_ => false,
		};
		if leading_now == self.leading {
			return None;
		}
		self.leading = leading_now;
		if leading_now {
			debug!("promoted to leader");
			Some(LeaderTransition::Promoted)
		} else {
			debug!("demoted from leader");
			Some(LeaderTransition::Demoted)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_oldest_member_leads() {
		let mut tracker = LeaderTracker::new(Some("b".to_string()));
		assert_eq!(tracker.client_joined("a".to_string(), 1), None);
		assert!(!tracker.is_leader());
		assert_eq!(tracker.client_joined("b".to_string(), 2), None);
		assert!(!tracker.is_leader());
		// The older member leaving promotes the local client
		assert_eq!(tracker.client_left("a"), Some(LeaderTransition::Promoted));
		assert!(tracker.is_leader());
	}

	#[test]
	fn test_rejoining_older_member_demotes() {
		let mut tracker = LeaderTracker::new(Some("b".to_string()));
		tracker.client_joined("b".to_string(), 2);
		assert!(tracker.is_leader());
		assert_eq!(tracker.client_joined("a".to_string(), 1), Some(LeaderTransition::Demoted));
		assert!(!tracker.is_leader());
	}

	#[test]
	fn test_detached_tracker_never_leads() {
		let mut tracker = LeaderTracker::new(None);
		assert_eq!(tracker.client_joined("a".to_string(), 1), None);
		assert!(!tracker.is_leader());
	}

	#[test]
	fn test_ties_break_by_client_id() {
		let mut a = LeaderTracker::new(Some("a".to_string()));
		let mut b = LeaderTracker::new(Some("b".to_string()));
		for tracker in [&mut a, &mut b] {
			tracker.client_joined("b".to_string(), 7);
			tracker.client_joined("a".to_string(), 7);
		}
		assert!(a.is_leader());
		assert!(!b.is_leader());
	}
}
