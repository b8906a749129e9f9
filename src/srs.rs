//! Nine-level spaced repetition scheduler.
//!
//! A correct answer moves a kanji up one level; an incorrect answer drops it
//! back to a coarser tier (see [`SrsLevel::demote`]). The time until the next
//! review depends only on the level the kanji lands on.

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::error::{Result, SrsError};
use crate::models::{ProgressRecord, ReviewEvent, ReviewResult, ReviewSubmission, SrsLevel};

impl SrsLevel {
    /// Level reached after a correct answer. Burned is terminal.
    pub fn progression(self) -> SrsLevel {
        match self {
            SrsLevel::Apprentice1 => SrsLevel::Apprentice2,
            SrsLevel::Apprentice2 => SrsLevel::Apprentice3,
            SrsLevel::Apprentice3 => SrsLevel::Apprentice4,
            SrsLevel::Apprentice4 => SrsLevel::Guru1,
            SrsLevel::Guru1 => SrsLevel::Guru2,
            SrsLevel::Guru2 => SrsLevel::Master,
            SrsLevel::Master => SrsLevel::Enlightened,
            SrsLevel::Enlightened => SrsLevel::Burned,
            SrsLevel::Burned => SrsLevel::Burned,
        }
    }

    /// Level reached after an incorrect answer.
    pub fn demote(self) -> SrsLevel {
        match self {
            SrsLevel::Apprentice1 | SrsLevel::Apprentice2 => SrsLevel::Apprentice1,
            SrsLevel::Apprentice3 | SrsLevel::Apprentice4 => SrsLevel::Apprentice2,
            SrsLevel::Guru1 | SrsLevel::Guru2 => SrsLevel::Apprentice3,
            SrsLevel::Master | SrsLevel::Enlightened | SrsLevel::Burned => SrsLevel::Guru1,
        }
    }

    /// Time until the next review for a kanji sitting at this level.
    pub fn interval(self) -> Duration {
        let hours = match self {
            SrsLevel::Apprentice1 => 4,
            SrsLevel::Apprentice2 => 8,
            SrsLevel::Apprentice3 => 23,
            SrsLevel::Apprentice4 => 47,
            SrsLevel::Guru1 => 168,
            SrsLevel::Guru2 => 336,
            SrsLevel::Master => 720,
            SrsLevel::Enlightened => 2160,
            SrsLevel::Burned => 8760,
        };
        Duration::hours(hours)
    }

    pub fn after(self, result: ReviewResult) -> SrsLevel {
        match result {
            ReviewResult::Correct => self.progression(),
            ReviewResult::Incorrect => self.demote(),
        }
    }
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage seen by [`submit_review`]. Implementations are expected to run the
/// whole find/update/append sequence inside one transaction.
pub trait ProgressStore {
    fn find(&self, user_id: i64, kanji_id: i64) -> Result<Option<ProgressRecord>>;
    fn update(&self, record: &ProgressRecord) -> Result<ProgressRecord>;
    fn append(&self, event: &ReviewEvent) -> Result<i64>;
}

/// Applies one review to `record`, returning the updated record and the
/// matching audit event. Pure: no storage, and `now` is supplied by the caller.
pub fn apply_review(
    record: &ProgressRecord,
    result: ReviewResult,
    response_time_ms: u32,
    now: DateTime<Utc>,
) -> (ProgressRecord, ReviewEvent) {
    let previous_level = record.level;
    let new_level = previous_level.after(result);

    let correct_streak = match result {
        ReviewResult::Correct => record.correct_streak + 1,
        ReviewResult::Incorrect => 0,
    };

    let updated = ProgressRecord {
        level: new_level,
        next_review_at: now + new_level.interval(),
        correct_streak,
        total_reviews: record.total_reviews + 1,
        last_reviewed_at: Some(now),
        ..record.clone()
    };

    let event = ReviewEvent {
        user_id: record.user_id,
        kanji_id: record.kanji_id,
        result,
        previous_level,
        new_level,
        response_time_ms,
        created_at: now,
    };

    (updated, event)
}

/// Read-modify-write for one review submission.
pub fn submit_review<S: ProgressStore + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    submission: &ReviewSubmission,
) -> Result<ProgressRecord> {
    let record = store
        .find(submission.user_id, submission.kanji_id)?
        .ok_or_else(|| {
            SrsError::NotFound(format!(
                "user {} / kanji {}",
                submission.user_id, submission.kanji_id
            ))
        })?;

    let now = clock.now();
    let (updated, event) = apply_review(
        &record,
        submission.result,
        submission.response_time_ms,
        now,
    );

    debug!(
        "review user={} kanji={} {}: {:?} -> {:?}",
        submission.user_id,
        submission.kanji_id,
        submission.result.as_str(),
        event.previous_level,
        event.new_level
    );

    let saved = store.update(&updated)?;
    store.append(&event)?;
    Ok(saved)
}
