use crate::firestore::model::TargetId;

const RESERVED_BITS: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids from disjoint spaces: even ids for targets allocated
/// by the local store, odd ids for limbo resolution targets owned by the
/// sync engine.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache(after: TargetId) -> Self {
        Self::new(GeneratorId::TargetCache, after)
    }

    pub fn for_sync_engine() -> Self {
        // Limbo targets are never persisted, so numbering restarts each run.
        Self::new(GeneratorId::SyncEngine, -1)
    }

    fn new(generator_id: GeneratorId, after: TargetId) -> Self {
        let mut generator = Self {
            generator_id,
            next_id: 0,
        };
        generator.seek(after);
        generator
    }

    fn seek(&mut self, after: TargetId) {
        let generator = self.generator_id as TargetId;
        let mask = (1 << RESERVED_BITS) - 1;
        let mut next = (after & !mask) | generator;
        if next <= after {
            next += 1 << RESERVED_BITS;
        }
        self.next_id = next;
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }
}
