use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::event::{Event, EventType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub views: i64,
    pub completes: i64,
    pub likes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyDelta {
    pub views: i64,
    pub completes: i64,
    pub likes: i64,
    pub clicks: i64,
    pub impressions: i64,
    pub dwell_ms_sum: i64,
}

/// The aggregate rows an event contributes to. Every field is either an
/// increment or a max, so applying updates in any order converges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateUpdate {
    pub video_id: Uuid,
    pub last_event_at: DateTime<Utc>,
    pub day: NaiveDate,
    pub counters: CounterDelta,
    pub daily: DailyDelta,
}

/// Events without a video touch no aggregate rows.
pub fn aggregate_update(event: &Event) -> Option<AggregateUpdate> {
    let video_id = event.video_id?;

    let mut counters = CounterDelta::default();
    let mut daily = DailyDelta {
        dwell_ms_sum: event.dwell_ms.unwrap_or(0),
        ..Default::default()
    };

    match event.event_type {
        EventType::ViewStart => {
            counters.views = 1;
            daily.views = 1;
        }
        EventType::ViewComplete => {
            counters.completes = 1;
            daily.completes = 1;
        }
        EventType::Like => {
            counters.likes = 1;
            daily.likes = 1;
        }
        EventType::ClickResult => daily.clicks = 1,
        EventType::SearchQuery => daily.impressions = 1,
    }

    Some(AggregateUpdate {
        video_id,
        last_event_at: event.timestamp,
        day: event.timestamp.date_naive(),
        counters,
        daily,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VideoCounters {
    pub video_id: Uuid,
    pub views: i64,
    pub completes: i64,
    pub likes: i64,
    pub last_event_at: DateTime<Utc>,
}

impl VideoCounters {
    pub fn from_update(update: &AggregateUpdate) -> Self {
        VideoCounters {
            video_id: update.video_id,
            views: update.counters.views,
            completes: update.counters.completes,
            likes: update.counters.likes,
            last_event_at: update.last_event_at,
        }
    }

    pub fn apply(&mut self, update: &AggregateUpdate) {
        self.views += update.counters.views;
        self.completes += update.counters.completes;
        self.likes += update.counters.likes;
        self.last_event_at = self.last_event_at.max(update.last_event_at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VideoDaily {
    pub video_id: Uuid,
    pub day: NaiveDate,
    pub views: i64,
    pub completes: i64,
    pub likes: i64,
    pub clicks: i64,
    pub impressions: i64,
    pub dwell_ms_sum: i64,
}

impl VideoDaily {
    pub fn from_update(update: &AggregateUpdate) -> Self {
        VideoDaily {
            video_id: update.video_id,
            day: update.day,
            views: update.daily.views,
            completes: update.daily.completes,
            likes: update.daily.likes,
            clicks: update.daily.clicks,
            impressions: update.daily.impressions,
            dwell_ms_sum: update.daily.dwell_ms_sum,
        }
    }

    pub fn apply(&mut self, update: &AggregateUpdate) {
        self.views += update.daily.views;
        self.completes += update.daily.completes;
        self.likes += update.daily.likes;
        self.clicks += update.daily.clicks;
        self.impressions += update.daily.impressions;
        self.dwell_ms_sum = self.dwell_ms_sum.saturating_add(update.daily.dwell_ms_sum);
    }
}
