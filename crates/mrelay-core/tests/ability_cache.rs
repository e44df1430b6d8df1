use std::collections::{HashMap, HashSet};

use mrelay_core::AbilityCache;
use mrelay_storage::{
    ChannelRow, ChannelSetting, ChannelStatus, ChannelType, MemoryStorage, Storage,
};

fn channel(id: i64, priority: i64, weight: i64) -> ChannelRow {
    ChannelRow {
        id,
        kind: ChannelType::OpenAi,
        name: format!("channel-{id}"),
        key: format!("sk-{id}"),
        base_url: String::new(),
        models: vec!["gpt-4o".to_string()],
        groups: vec!["default".to_string()],
        model_mapping: HashMap::new(),
        status_code_mapping: None,
        priority,
        weight,
        status: ChannelStatus::Enabled,
        auto_ban: true,
        setting: ChannelSetting::default(),
    }
}

async fn cache_with(channels: Vec<ChannelRow>) -> AbilityCache {
    let storage = MemoryStorage::new();
    for entry in channels {
        storage.seed_channel(entry).await;
    }
    let cache = AbilityCache::new();
    cache.refresh(&storage).await.unwrap();
    cache
}

#[tokio::test]
async fn selection_only_returns_serving_channels() {
    let cache = cache_with(vec![channel(1, 0, 1), channel(2, 0, 1)]).await;
    let tried = HashSet::new();
    for _ in 0..50 {
        let picked = cache.select("default", "gpt-4o", 0, &tried).unwrap();
        assert!(picked.id == 1 || picked.id == 2);
    }
    assert!(cache.select("vip", "gpt-4o", 0, &tried).is_err());
    assert!(cache.select("default", "gpt-3.5-turbo", 0, &tried).is_err());
}

#[tokio::test]
async fn retry_index_walks_down_priority_bands() {
    let cache = cache_with(vec![channel(1, 10, 1), channel(2, 0, 1)]).await;
    let tried = HashSet::new();

    // Band 0 is the highest priority.
    for _ in 0..20 {
        assert_eq!(cache.select("default", "gpt-4o", 0, &tried).unwrap().id, 1);
    }
    // Band 1 is the next distinct priority.
    for _ in 0..20 {
        assert_eq!(cache.select("default", "gpt-4o", 1, &tried).unwrap().id, 2);
    }
}

#[tokio::test]
async fn retry_beyond_last_band_falls_back_to_top_minus_tried() {
    let cache = cache_with(vec![channel(1, 10, 1), channel(2, 10, 1), channel(3, 0, 1)]).await;
    let mut tried = HashSet::new();
    tried.insert(1_i64);

    // retry_index 5 exceeds the two bands; band 0 applies minus channel 1.
    for _ in 0..20 {
        assert_eq!(cache.select("default", "gpt-4o", 5, &tried).unwrap().id, 2);
    }
}

#[tokio::test]
async fn tried_channels_are_never_reselected() {
    let cache = cache_with(vec![channel(1, 0, 1), channel(2, 0, 1)]).await;
    let mut tried = HashSet::new();
    tried.insert(1_i64);
    for _ in 0..50 {
        assert_eq!(cache.select("default", "gpt-4o", 0, &tried).unwrap().id, 2);
    }
    tried.insert(2_i64);
    assert!(cache.select("default", "gpt-4o", 0, &tried).is_err());
}

#[tokio::test]
async fn weighted_selection_tracks_weights() {
    // weight 9 vs 1: expect roughly 90/10 over many picks.
    let cache = cache_with(vec![channel(1, 0, 9), channel(2, 0, 1)]).await;
    let tried = HashSet::new();
    let mut counts: HashMap<i64, u32> = HashMap::new();
    let rounds = 5_000;
    for _ in 0..rounds {
        let picked = cache.select("default", "gpt-4o", 0, &tried).unwrap();
        *counts.entry(picked.id).or_default() += 1;
    }
    let heavy = *counts.get(&1).unwrap_or(&0) as f64 / rounds as f64;
    assert!(
        (0.85..=0.95).contains(&heavy),
        "expected ~0.9 share for the heavy channel, got {heavy}"
    );
}

#[tokio::test]
async fn zero_weights_degenerate_to_uniform() {
    let cache = cache_with(vec![channel(1, 0, 0), channel(2, 0, 0)]).await;
    let tried = HashSet::new();
    let mut counts: HashMap<i64, u32> = HashMap::new();
    for _ in 0..2_000 {
        let picked = cache.select("default", "gpt-4o", 0, &tried).unwrap();
        *counts.entry(picked.id).or_default() += 1;
    }
    let share = *counts.get(&1).unwrap_or(&0) as f64 / 2_000.0;
    assert!((0.4..=0.6).contains(&share), "expected ~0.5, got {share}");
}

#[tokio::test]
async fn removed_channel_disappears_immediately() {
    let cache = cache_with(vec![channel(1, 0, 1)]).await;
    let tried = HashSet::new();
    assert!(cache.select("default", "gpt-4o", 0, &tried).is_ok());
    cache.remove_channel(1);
    assert!(cache.select("default", "gpt-4o", 0, &tried).is_err());
    assert!(cache.get_by_id(1).is_none());
}

#[tokio::test]
async fn disabled_channels_are_skipped_on_refresh() {
    let storage = MemoryStorage::new();
    storage.seed_channel(channel(1, 0, 1)).await;
    storage.seed_channel(channel(2, 0, 1)).await;
    storage
        .set_channel_status(1, ChannelStatus::AutoDisabled, "test")
        .await
        .unwrap();

    let cache = AbilityCache::new();
    cache.refresh(&storage).await.unwrap();
    let tried = HashSet::new();
    for _ in 0..20 {
        assert_eq!(cache.select("default", "gpt-4o", 0, &tried).unwrap().id, 2);
    }
}

#[tokio::test]
async fn key_cursor_round_robins() {
    let cache = cache_with(vec![channel(1, 0, 1)]).await;
    let first = cache.next_key_index(1, 3);
    let second = cache.next_key_index(1, 3);
    let third = cache.next_key_index(1, 3);
    let fourth = cache.next_key_index(1, 3);
    assert_eq!(
        vec![first, second, third, fourth],
        vec![0, 1, 2, 0]
    );
    // Single-key channels never touch the cursor.
    assert_eq!(cache.next_key_index(1, 1), 0);
}

#[tokio::test]
async fn models_listing_reflects_group() {
    let mut vip = channel(3, 0, 1);
    vip.groups = vec!["vip".to_string()];
    vip.models = vec!["gpt-4o".to_string(), "o1".to_string()];
    let cache = cache_with(vec![channel(1, 0, 1), vip]).await;
    assert_eq!(cache.models_for_group("default"), vec!["gpt-4o"]);
    assert_eq!(cache.models_for_group("vip"), vec!["gpt-4o", "o1"]);
}
