use crate::firestore::core::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch that could not be
    /// repaired locally.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch that the bloom filter already repaired.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

impl TargetPurpose {
    /// Label sent to the backend in the `addTarget` labels.
    pub fn goog_listen_tag(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// A target plus the metadata the client tracks for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last snapshot the backend sent for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target last had no limbo documents; query results
    /// at this version can be reused.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the backend reported at `resume_token`, sent back
    /// so it can answer with a bloom filter on mismatch.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume token and snapshot version; clears the expected count,
    /// which only applies to the previous token.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: Option<i32>) -> Self {
        self.expected_count = expected_count;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
