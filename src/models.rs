use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrsError};

// The nine SRS stages, in review order. Stored as their index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SrsLevel {
    Apprentice1,
    Apprentice2,
    Apprentice3,
    Apprentice4,
    Guru1,
    Guru2,
    Master,
    Enlightened,
    Burned,
}

impl SrsLevel {
    pub const ALL: [SrsLevel; 9] = [
        SrsLevel::Apprentice1,
        SrsLevel::Apprentice2,
        SrsLevel::Apprentice3,
        SrsLevel::Apprentice4,
        SrsLevel::Guru1,
        SrsLevel::Guru2,
        SrsLevel::Master,
        SrsLevel::Enlightened,
        SrsLevel::Burned,
    ];

    pub fn index(&self) -> i64 {
        *self as i64
    }

    /// Decodes a stored level. Anything outside 0..=8 is a defect in the
    /// stored data and fails loudly.
    pub fn from_index(v: i64) -> Result<Self> {
        usize::try_from(v)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(SrsError::InvalidState(v))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SrsLevel::Apprentice1 => "Apprentice 1",
            SrsLevel::Apprentice2 => "Apprentice 2",
            SrsLevel::Apprentice3 => "Apprentice 3",
            SrsLevel::Apprentice4 => "Apprentice 4",
            SrsLevel::Guru1 => "Guru 1",
            SrsLevel::Guru2 => "Guru 2",
            SrsLevel::Master => "Master",
            SrsLevel::Enlightened => "Enlightened",
            SrsLevel::Burned => "Burned",
        }
    }

    // Coarse tier the level belongs to
    pub fn stage(&self) -> &'static str {
        match self {
            SrsLevel::Apprentice1
            | SrsLevel::Apprentice2
            | SrsLevel::Apprentice3
            | SrsLevel::Apprentice4 => "Apprentice",
            SrsLevel::Guru1 | SrsLevel::Guru2 => "Guru",
            SrsLevel::Master => "Master",
            SrsLevel::Enlightened => "Enlightened",
            SrsLevel::Burned => "Burned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewResult {
    Correct,
    Incorrect,
}

impl ReviewResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewResult::Correct => "correct",
            ReviewResult::Incorrect => "incorrect",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "correct" | "c" | "yes" | "y" | "pass" | "1" => Some(ReviewResult::Correct),
            "incorrect" | "i" | "no" | "n" | "fail" | "wrong" | "0" => {
                Some(ReviewResult::Incorrect)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// A catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kanji {
    pub id: i64,
    pub character: String,
    pub meanings: Vec<String>,
    pub onyomi: Vec<String>,
    pub kunyomi: Vec<String>,
    pub jlpt_level: Option<u8>,
    pub stroke_count: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl Kanji {
    pub fn meanings_label(&self) -> String {
        join_or_dash(&self.meanings)
    }

    pub fn jlpt_label(&self) -> String {
        match self.jlpt_level {
            Some(n) => format!("N{}", n),
            None => "-".to_string(),
        }
    }
}

/// Insert shape for the catalog, also the element type of JSON import files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKanji {
    pub character: String,
    pub meanings: Vec<String>,
    #[serde(default)]
    pub onyomi: Vec<String>,
    #[serde(default)]
    pub kunyomi: Vec<String>,
    #[serde(default)]
    pub jlpt_level: Option<u8>,
    #[serde(default)]
    pub stroke_count: Option<u8>,
}

impl NewKanji {
    pub fn validate(&self) -> Result<()> {
        let trimmed = self.character.trim();
        if trimmed.chars().count() != 1 {
            return Err(SrsError::InvalidInput(format!(
                "expected a single character, got '{}'",
                self.character
            )));
        }
        // Digits would be read back as kanji ids
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(SrsError::InvalidInput(format!(
                "'{}' is not a kanji; digits are reserved for ids",
                trimmed
            )));
        }
        if self.meanings.iter().all(|m| m.trim().is_empty()) {
            return Err(SrsError::InvalidInput(format!(
                "kanji '{}' needs at least one meaning",
                trimmed
            )));
        }
        if let Some(n) = self.jlpt_level {
            if !(1..=5).contains(&n) {
                return Err(SrsError::InvalidInput(format!(
                    "JLPT level must be between 1 and 5, got {}",
                    n
                )));
            }
        }
        Ok(())
    }
}

// Per-user, per-kanji scheduling state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: i64,
    pub user_id: i64,
    pub kanji_id: i64,
    pub level: SrsLevel,
    pub next_review_at: DateTime<Utc>,
    pub correct_streak: i64,
    pub total_reviews: i64,
    pub started_at: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// State of a kanji the user has just started studying: due immediately.
    pub fn initial(id: i64, user_id: i64, kanji_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            kanji_id,
            level: SrsLevel::Apprentice1,
            next_review_at: now,
            correct_streak: 0,
            total_reviews: 0,
            started_at: now,
            last_reviewed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at <= now
    }
}

// Append-only audit entry, one per submitted review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub user_id: i64,
    pub kanji_id: i64,
    pub result: ReviewResult,
    pub previous_level: SrsLevel,
    pub new_level: SrsLevel,
    pub response_time_ms: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub user_id: i64,
    pub kanji_id: i64,
    pub result: ReviewResult,
    pub response_time_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DueReview {
    pub kanji: Kanji,
    pub progress: ProgressRecord,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

pub fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
