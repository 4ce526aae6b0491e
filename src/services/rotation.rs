//! Generational rotation planning.
//!
//! Successful undeleted backups are partitioned into per-generation buckets
//! (oldest first). Each tier evicts from its oldest end once it exceeds its
//! cap; evicted items are promoted into the next tier when they are spaced
//! at least that tier's period away from its newest member, and discarded
//! otherwise. The terminal tier always discards. Promoted items join the
//! next bucket within the same pass, so a single sweep can cascade them
//! further.

use crate::config::RotationRule;
use crate::models::backup::Backup;

#[derive(Debug)]
pub enum RotationAction {
    /// Persist the record with its bumped generation.
    Promote(Backup),
    /// Remove the stored artifact and stamp the record deleted.
    Discard(Backup),
}

/// Splits an ascending-by-`created_at` list into one bucket per tier.
/// Records whose generation exceeds the configured tier count land in the
/// terminal bucket.
pub fn bucketize(backups: Vec<Backup>, tiers: usize) -> Vec<Vec<Backup>> {
    let mut buckets = vec![Vec::new(); tiers];
    for backup in backups {
        let generation = (backup.generation.max(0) as usize).min(tiers - 1);
        buckets[generation].push(backup);
    }
    buckets
}

pub fn plan(mut buckets: Vec<Vec<Backup>>, tiers: &[RotationRule]) -> Vec<RotationAction> {
    let mut actions = Vec::new();
    let terminal = tiers.len() - 1;

    for generation in 0..tiers.len() {
        let cap = tiers[generation].preserve_at_most;
        if buckets[generation].len() <= cap {
            continue;
        }

        let over = buckets[generation].len() - cap;
        let evicted: Vec<Backup> = buckets[generation].drain(..over).collect();

        if generation == terminal {
            actions.extend(evicted.into_iter().map(RotationAction::Discard));
            continue;
        }

        for mut backup in evicted {
            let admitted = match buckets[generation + 1].last() {
                Some(newest) => backup
                    .created_at
                    .signed_duration_since(newest.created_at)
                    .to_std()
                    .map(|spacing| spacing >= tiers[generation + 1].period)
                    .unwrap_or(false),
                // an empty tier admits unconditionally
                None => true,
            };

            if admitted {
                backup.generation += 1;
                actions.push(RotationAction::Promote(backup.clone()));
                buckets[generation + 1].push(backup);
            } else {
                actions.push(RotationAction::Discard(backup));
            }
        }
    }

    actions
}
