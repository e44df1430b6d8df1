//! Ability cache: the precomputed `(group, model) -> priority-banded
//! weighted set of channel ids`, published through an `ArcSwap` snapshot.
//!
//! Readers never lock; the refresh task builds a whole new snapshot from the
//! store and swaps it in. Per-channel key cursors live outside the snapshot
//! so multi-key round-robin survives refreshes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mrelay_storage::{ChannelRow, ChannelStatus, Storage, StorageResult};
use rand::Rng;

#[derive(Debug, Clone)]
struct AbilityEntry {
    channel_id: i64,
    priority: i64,
    weight: i64,
}

#[derive(Default)]
struct Snapshot {
    channels: HashMap<i64, ChannelRow>,
    /// Sorted by priority descending per slot.
    slots: HashMap<(String, String), Vec<AbilityEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    NoMatch,
}

pub struct AbilityCache {
    snapshot: ArcSwap<Snapshot>,
    key_cursors: DashMap<i64, AtomicUsize>,
}

impl Default for AbilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AbilityCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            key_cursors: DashMap::new(),
        }
    }

    /// Rebuild the whole snapshot from the store and publish it. Runs on the
    /// configured interval and on channel mutation events.
    pub async fn refresh(&self, storage: &dyn Storage) -> StorageResult<()> {
        let channels = storage.load_channels().await?;
        let abilities = storage.load_abilities().await?;

        let channels: HashMap<i64, ChannelRow> = channels
            .into_iter()
            .map(|channel| (channel.id, channel))
            .collect();

        let mut slots: HashMap<(String, String), Vec<AbilityEntry>> = HashMap::new();
        for ability in abilities {
            if !ability.enabled {
                continue;
            }
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            if channel.status != ChannelStatus::Enabled {
                continue;
            }
            slots
                .entry((ability.group.clone(), ability.model.clone()))
                .or_default()
                .push(AbilityEntry {
                    channel_id: ability.channel_id,
                    priority: ability.priority,
                    weight: ability.weight,
                });
        }
        for entries in slots.values_mut() {
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        self.snapshot.store(std::sync::Arc::new(Snapshot { channels, slots }));
        Ok(())
    }

    pub fn get_by_id(&self, id: i64) -> Option<ChannelRow> {
        self.snapshot.load().channels.get(&id).cloned()
    }

    /// Drop a channel from routing immediately (auto-disable path); the next
    /// refresh rebuilds from the store anyway.
    pub fn remove_channel(&self, channel_id: i64) {
        self.snapshot.rcu(|current| {
            let mut channels = current.channels.clone();
            channels.remove(&channel_id);
            let mut slots = current.slots.clone();
            for entries in slots.values_mut() {
                entries.retain(|entry| entry.channel_id != channel_id);
            }
            std::sync::Arc::new(Snapshot { channels, slots })
        });
    }

    /// Pick a channel serving `(group, model)`.
    ///
    /// `retry_index` selects the priority band: 0 is the top band, `k` the
    /// k-th distinct lower priority. Past the last band the top band is
    /// retried minus already-tried channels. Within the band the pick is
    /// weighted random with `max(weight, 1)`.
    pub fn select(
        &self,
        group: &str,
        model: &str,
        retry_index: u32,
        tried: &HashSet<i64>,
    ) -> Result<ChannelRow, SelectError> {
        let snapshot = self.snapshot.load();
        let entries = snapshot
            .slots
            .get(&(group.to_string(), model.to_string()))
            .ok_or(SelectError::NoMatch)?;
        if entries.is_empty() {
            return Err(SelectError::NoMatch);
        }

        let mut bands: Vec<i64> = Vec::new();
        for entry in entries {
            if bands.last() != Some(&entry.priority) {
                bands.push(entry.priority);
            }
        }

        let band_priority = bands
            .get(retry_index as usize)
            .copied()
            .unwrap_or(bands[0]);

        let candidates: Vec<&AbilityEntry> = entries
            .iter()
            .filter(|entry| entry.priority == band_priority)
            .filter(|entry| !tried.contains(&entry.channel_id))
            .collect();
        if candidates.is_empty() {
            return Err(SelectError::NoMatch);
        }

        let weights: Vec<u64> = candidates
            .iter()
            .map(|entry| entry.weight.max(1) as u64)
            .collect();
        let index = pick_weighted(&weights);
        let channel_id = candidates[index].channel_id;
        snapshot
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or(SelectError::NoMatch)
    }

    /// Distinct models currently routable for a group, for `/v1/models`.
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut models: Vec<String> = snapshot
            .slots
            .keys()
            .filter(|(slot_group, _)| slot_group == group)
            .map(|(_, model)| model.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    }

    /// Round-robin cursor for a channel's newline-separated key list.
    pub fn next_key_index(&self, channel_id: i64, key_count: usize) -> usize {
        if key_count <= 1 {
            return 0;
        }
        let cursor = self
            .key_cursors
            .entry(channel_id)
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % key_count
    }
}

fn pick_weighted(weights: &[u64]) -> usize {
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return rand::rng().random_range(0..weights.len());
    }
    let mut roll = rand::rng().random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_pick_respects_bounds() {
        let weights = vec![1, 1, 1];
        for _ in 0..100 {
            assert!(pick_weighted(&weights) < 3);
        }
    }
}
