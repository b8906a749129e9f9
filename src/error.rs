use thiserror::Error;

#[derive(Error, Debug)]
pub enum SrsError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No progress record exists for the user/kanji pair.
    #[error("No progress for {0}; start studying this kanji first")]
    NotFound(String),

    #[error("Kanji not found: {0}")]
    KanjiNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User {user_id} is already studying kanji {kanji_id}")]
    AlreadyStudying { user_id: i64, kanji_id: i64 },

    #[error("Kanji already exists: {0}")]
    Duplicate(String),

    /// A stored level outside the nine known stages. Always a defect.
    #[error("Invalid SRS level: {0}")]
    InvalidState(i64),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, SrsError>;
