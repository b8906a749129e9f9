use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;

use crate::error::{Result, SrsError};
use crate::models::{
    DueReview, Kanji, NewKanji, ProgressRecord, ReviewEvent, ReviewResult, ReviewSubmission,
    SrsLevel, User,
};
use crate::srs::{self, Clock, ProgressStore};

const KANJI_COLUMNS: &str = "k.id, k.character, k.meanings, k.onyomi, k.kunyomi, \
                             k.jlpt_level, k.stroke_count, k.created_at";

const PROGRESS_COLUMNS: &str = "p.id, p.user_id, p.kanji_id, p.level, p.next_review_at, \
                                p.correct_streak, p.total_reviews, p.started_at, p.last_reviewed_at";

// N5 first, kanji without a JLPT level last
const KANJI_ORDER: &str = "ORDER BY k.jlpt_level IS NULL, k.jlpt_level DESC, k.id";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kanji (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character TEXT NOT NULL UNIQUE,
                meanings TEXT NOT NULL DEFAULT '[]',
                onyomi TEXT NOT NULL DEFAULT '[]',
                kunyomi TEXT NOT NULL DEFAULT '[]',
                jlpt_level INTEGER CHECK(jlpt_level BETWEEN 1 AND 5),
                stroke_count INTEGER,
                created_at TEXT NOT NULL
            );

            -- One row per user and kanji being studied
            CREATE TABLE IF NOT EXISTS progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kanji_id INTEGER NOT NULL,
                level INTEGER NOT NULL DEFAULT 0,
                next_review_at TEXT NOT NULL,
                correct_streak INTEGER NOT NULL DEFAULT 0,
                total_reviews INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                last_reviewed_at TEXT,
                UNIQUE (user_id, kanji_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (kanji_id) REFERENCES kanji(id) ON DELETE CASCADE
            );

            -- Append-only review log
            CREATE TABLE IF NOT EXISTS review_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kanji_id INTEGER NOT NULL,
                result TEXT NOT NULL CHECK(result IN ('correct', 'incorrect')),
                previous_level INTEGER NOT NULL,
                new_level INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (kanji_id) REFERENCES kanji(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_progress_due ON progress(user_id, next_review_at);
            CREATE INDEX IF NOT EXISTS idx_kanji_jlpt ON kanji(jlpt_level);
            CREATE INDEX IF NOT EXISTS idx_review_events_item ON review_events(user_id, kanji_id);
            "#,
        )?;

        Ok(())
    }

    // User operations
    pub fn get_or_create_user(&self, name: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SrsError::InvalidInput("user name must not be empty".into()));
        }

        if let Some(user) = self.get_user_by_name(name)? {
            return Ok(user);
        }

        self.conn.execute(
            "INSERT INTO users (name, created_at) VALUES (?1, ?2)",
            params![name, fmt_ts(Utc::now())],
        )?;
        let id = self.conn.last_insert_rowid();
        info!("created user '{}' (id {})", name, id);

        self.get_user(id)?
            .ok_or_else(|| SrsError::UserNotFound(id.to_string()))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.query_user("SELECT id, name, created_at FROM users WHERE id = ?1", id)
    }

    pub fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.query_user("SELECT id, name, created_at FROM users WHERE name = ?1", name)
    }

    fn query_user<P: rusqlite::ToSql>(&self, sql: &str, key: P) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(sql, params![key], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()?;

        row.map(|(id, name, created_at)| -> Result<User> {
            Ok(User {
                id,
                name,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    // Kanji catalog operations
    pub fn add_kanji(&self, kanji: &NewKanji) -> Result<i64> {
        kanji.validate()?;
        let character = kanji.character.trim();

        if self.get_kanji_by_character(character)?.is_some() {
            return Err(SrsError::Duplicate(character.to_string()));
        }

        insert_kanji(&self.conn, kanji, Utc::now())?;
        let id = self.conn.last_insert_rowid();
        debug!("added kanji {} (id {})", character, id);
        Ok(id)
    }

    /// Adds every entry whose character is not in the catalog yet, all in one
    /// transaction. Returns `(added, skipped)`.
    pub fn import_kanji(&self, entries: &[NewKanji]) -> Result<(usize, usize)> {
        for entry in entries {
            entry.validate()?;
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let mut added = 0;
        let mut skipped = 0;

        for entry in entries {
            if insert_kanji(&tx, entry, now)? {
                added += 1;
            } else {
                warn!("skipping {}: already in catalog", entry.character.trim());
                skipped += 1;
            }
        }

        tx.commit()?;
        info!("imported {} kanji ({} skipped)", added, skipped);
        Ok((added, skipped))
    }

    pub fn get_kanji(&self, id: i64) -> Result<Option<Kanji>> {
        let sql = format!("SELECT {} FROM kanji k WHERE k.id = ?1", KANJI_COLUMNS);
        self.query_kanji(&sql, id)
    }

    pub fn get_kanji_by_character(&self, character: &str) -> Result<Option<Kanji>> {
        let sql = format!("SELECT {} FROM kanji k WHERE k.character = ?1", KANJI_COLUMNS);
        self.query_kanji(&sql, character.trim())
    }

    /// Resolves a CLI argument that is either a numeric id or the character itself.
    pub fn lookup_kanji(&self, key: &str) -> Result<Option<Kanji>> {
        match key.trim().parse::<i64>() {
            Ok(id) => self.get_kanji(id),
            Err(_) => self.get_kanji_by_character(key),
        }
    }

    fn query_kanji<P: rusqlite::ToSql>(&self, sql: &str, key: P) -> Result<Option<Kanji>> {
        let row = self
            .conn
            .query_row(sql, params![key], |row| KanjiRow::read(row, 0))
            .optional()?;
        row.map(KanjiRow::into_kanji).transpose()
    }

    pub fn list_kanji(&self, jlpt_filter: Option<u8>) -> Result<Vec<Kanji>> {
        let (query, params_vec): (String, Vec<Box<dyn rusqlite::ToSql>>) =
            if let Some(level) = jlpt_filter {
                (
                    format!(
                        "SELECT {} FROM kanji k WHERE k.jlpt_level = ?1 {}",
                        KANJI_COLUMNS, KANJI_ORDER
                    ),
                    vec![Box::new(level)],
                )
            } else {
                (
                    format!("SELECT {} FROM kanji k {}", KANJI_COLUMNS, KANJI_ORDER),
                    vec![],
                )
            };

        let mut stmt = self.conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| KanjiRow::read(row, 0))?;
        let kanji = rows
            .map(|r| r.map_err(SrsError::from).and_then(KanjiRow::into_kanji))
            .collect::<Result<Vec<_>>>()?;

        Ok(kanji)
    }

    pub fn delete_kanji(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM kanji WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Study lifecycle
    pub fn start_studying(
        &self,
        user_id: i64,
        kanji_id: i64,
        clock: &dyn Clock,
    ) -> Result<ProgressRecord> {
        if self.get_user(user_id)?.is_none() {
            return Err(SrsError::UserNotFound(user_id.to_string()));
        }
        if self.get_kanji(kanji_id)?.is_none() {
            return Err(SrsError::KanjiNotFound(kanji_id.to_string()));
        }
        if self.get_progress(user_id, kanji_id)?.is_some() {
            return Err(SrsError::AlreadyStudying { user_id, kanji_id });
        }

        let record = ProgressRecord::initial(0, user_id, kanji_id, clock.now());
        self.conn.execute(
            r#"
            INSERT INTO progress
                (user_id, kanji_id, level, next_review_at, correct_streak, total_reviews,
                 started_at, last_reviewed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.user_id,
                record.kanji_id,
                record.level.index(),
                fmt_ts(record.next_review_at),
                record.correct_streak,
                record.total_reviews,
                fmt_ts(record.started_at),
                record.last_reviewed_at.map(fmt_ts)
            ],
        )?;
        info!("user {} started kanji {}", user_id, kanji_id);

        self.get_progress(user_id, kanji_id)?
            .ok_or_else(|| SrsError::NotFound(format!("user {} / kanji {}", user_id, kanji_id)))
    }

    pub fn get_progress(&self, user_id: i64, kanji_id: i64) -> Result<Option<ProgressRecord>> {
        find_progress(&self.conn, user_id, kanji_id)
    }

    // Catalog kanji the user has not started yet
    pub fn list_lessons(
        &self,
        user_id: i64,
        jlpt_filter: Option<u8>,
        limit: Option<usize>,
    ) -> Result<Vec<Kanji>> {
        let jlpt_clause = if jlpt_filter.is_some() {
            "AND k.jlpt_level = ?3"
        } else {
            ""
        };
        let query = format!(
            r#"
            SELECT {}
            FROM kanji k
            WHERE NOT EXISTS (
                SELECT 1 FROM progress p WHERE p.kanji_id = k.id AND p.user_id = ?1
            )
            {}
            {}
            LIMIT ?2
            "#,
            KANJI_COLUMNS, jlpt_clause, KANJI_ORDER
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(user_id), Box::new(sql_limit(limit))];
        if let Some(level) = jlpt_filter {
            params_vec.push(Box::new(level));
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_refs.as_slice(), |row| KanjiRow::read(row, 0))?;
        let kanji = rows
            .map(|r| r.map_err(SrsError::from).and_then(KanjiRow::into_kanji))
            .collect::<Result<Vec<_>>>()?;

        Ok(kanji)
    }

    /// Reviews due at `now`, oldest first. Burned kanji are never listed; any
    /// other stored level, valid or not, is decoded and may fail.
    pub fn due_reviews(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<DueReview>> {
        let query = format!(
            r#"
            SELECT {}, {}
            FROM progress p
            JOIN kanji k ON k.id = p.kanji_id
            WHERE p.user_id = ?1
              AND p.next_review_at <= ?2
              AND p.level != ?3
            ORDER BY p.next_review_at ASC, p.level ASC
            LIMIT ?4
            "#,
            KANJI_COLUMNS, PROGRESS_COLUMNS
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![
                user_id,
                fmt_ts(now),
                SrsLevel::Burned.index(),
                sql_limit(limit)
            ],
            |row| Ok((KanjiRow::read(row, 0)?, ProgressRow::read(row, 8)?)),
        )?;

        let due = rows
            .map(|r| -> Result<DueReview> {
                let (kanji, progress) = r?;
                Ok(DueReview {
                    kanji: kanji.into_kanji()?,
                    progress: progress.into_record()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(due)
    }

    // Stochastic selection among due reviews
    pub fn next_review<R: Rng>(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Option<DueReview>> {
        let due = self.due_reviews(user_id, now, None)?;
        if due.is_empty() {
            return Ok(None);
        }

        let weights: Vec<f64> = due
            .iter()
            .map(|d| review_weight(&d.progress, now))
            .collect();
        let total_weight: f64 = weights.iter().sum();
        let mut random_point = rng.gen::<f64>() * total_weight;

        for (i, weight) in weights.iter().enumerate() {
            random_point -= weight;
            if random_point <= 0.0 {
                return Ok(due.into_iter().nth(i));
            }
        }

        // Fallback to the most overdue
        Ok(due.into_iter().next())
    }

    /// Runs one review through the scheduler inside a single `IMMEDIATE`
    /// transaction. Nothing is written unless both the progress update and the
    /// event append succeed.
    pub fn submit_review(
        &self,
        clock: &dyn Clock,
        submission: &ReviewSubmission,
    ) -> Result<ProgressRecord> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let store = ReviewTx { tx };

        let saved = srs::submit_review(&store, clock, submission)?;
        store.tx.commit()?;

        info!(
            "user {} reviewed kanji {}: {} -> {}",
            submission.user_id,
            submission.kanji_id,
            submission.result.as_str(),
            saved.level.label()
        );
        Ok(saved)
    }

    // Newest first
    pub fn review_history(
        &self,
        user_id: i64,
        kanji_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ReviewEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id, kanji_id, result, previous_level, new_level, response_time_ms, created_at
            FROM review_events
            WHERE user_id = ?1 AND kanji_id = ?2
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![user_id, kanji_id, sql_limit(limit)], |row| {
            Ok(EventRow {
                user_id: row.get(0)?,
                kanji_id: row.get(1)?,
                result: row.get(2)?,
                previous_level: row.get(3)?,
                new_level: row.get(4)?,
                response_time_ms: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;

        let events = rows
            .map(|r| r.map_err(SrsError::from).and_then(EventRow::into_event))
            .collect::<Result<Vec<_>>>()?;

        Ok(events)
    }
}

// Progress store bound to an open transaction
struct ReviewTx<'conn> {
    tx: Transaction<'conn>,
}

impl ProgressStore for ReviewTx<'_> {
    fn find(&self, user_id: i64, kanji_id: i64) -> Result<Option<ProgressRecord>> {
        find_progress(&self.tx, user_id, kanji_id)
    }

    fn update(&self, record: &ProgressRecord) -> Result<ProgressRecord> {
        let rows = self.tx.execute(
            r#"
            UPDATE progress
            SET level = ?1,
                next_review_at = ?2,
                correct_streak = ?3,
                total_reviews = ?4,
                last_reviewed_at = ?5
            WHERE id = ?6
            "#,
            params![
                record.level.index(),
                fmt_ts(record.next_review_at),
                record.correct_streak,
                record.total_reviews,
                record.last_reviewed_at.map(fmt_ts),
                record.id
            ],
        )?;

        if rows == 0 {
            return Err(SrsError::NotFound(format!("progress {}", record.id)));
        }

        find_progress(&self.tx, record.user_id, record.kanji_id)?
            .ok_or_else(|| SrsError::NotFound(format!("progress {}", record.id)))
    }

    fn append(&self, event: &ReviewEvent) -> Result<i64> {
        self.tx.execute(
            r#"
            INSERT INTO review_events
                (user_id, kanji_id, result, previous_level, new_level, response_time_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.user_id,
                event.kanji_id,
                event.result.as_str(),
                event.previous_level.index(),
                event.new_level.index(),
                event.response_time_ms,
                fmt_ts(event.created_at)
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }
}

fn find_progress(conn: &Connection, user_id: i64, kanji_id: i64) -> Result<Option<ProgressRecord>> {
    let sql = format!(
        "SELECT {} FROM progress p WHERE p.user_id = ?1 AND p.kanji_id = ?2",
        PROGRESS_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![user_id, kanji_id], |row| ProgressRow::read(row, 0))
        .optional()?;
    row.map(ProgressRow::into_record).transpose()
}

// Returns false when the character is already in the catalog
fn insert_kanji(conn: &Connection, kanji: &NewKanji, now: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        r#"
        INSERT OR IGNORE INTO kanji
            (character, meanings, onyomi, kunyomi, jlpt_level, stroke_count, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            kanji.character.trim(),
            serde_json::to_string(&clean_list(&kanji.meanings))?,
            serde_json::to_string(&clean_list(&kanji.onyomi))?,
            serde_json::to_string(&clean_list(&kanji.kunyomi))?,
            kanji.jlpt_level,
            kanji.stroke_count,
            fmt_ts(now)
        ],
    )?;
    Ok(rows > 0)
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// Overdue and low-level reviews are picked more often
fn review_weight(progress: &ProgressRecord, now: DateTime<Utc>) -> f64 {
    let overdue_hours = now
        .signed_duration_since(progress.next_review_at)
        .num_hours()
        .max(0) as f64
        + 1.0;
    let level_weight = (SrsLevel::ALL.len() as i64 - progress.level.index()) as f64;
    overdue_hours * level_weight
}

// SQLite treats a negative LIMIT as "no limit"
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|n| n as i64).unwrap_or(-1)
}

/// Fixed-width UTC timestamps, so string order is time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SrsError::InvalidTimestamp(s.to_string()))
}

struct KanjiRow {
    id: i64,
    character: String,
    meanings: String,
    onyomi: String,
    kunyomi: String,
    jlpt_level: Option<u8>,
    stroke_count: Option<u8>,
    created_at: String,
}

impl KanjiRow {
    fn read(row: &Row, base: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(base)?,
            character: row.get(base + 1)?,
            meanings: row.get(base + 2)?,
            onyomi: row.get(base + 3)?,
            kunyomi: row.get(base + 4)?,
            jlpt_level: row.get(base + 5)?,
            stroke_count: row.get(base + 6)?,
            created_at: row.get(base + 7)?,
        })
    }

    fn into_kanji(self) -> Result<Kanji> {
        Ok(Kanji {
            id: self.id,
            character: self.character,
            meanings: serde_json::from_str(&self.meanings)?,
            onyomi: serde_json::from_str(&self.onyomi)?,
            kunyomi: serde_json::from_str(&self.kunyomi)?,
            jlpt_level: self.jlpt_level,
            stroke_count: self.stroke_count,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// Raw progress columns; the level is decoded afterwards so that an unknown
// value surfaces as InvalidState rather than a conversion error.
struct ProgressRow {
    id: i64,
    user_id: i64,
    kanji_id: i64,
    level: i64,
    next_review_at: String,
    correct_streak: i64,
    total_reviews: i64,
    started_at: String,
    last_reviewed_at: Option<String>,
}

impl ProgressRow {
    fn read(row: &Row, base: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(base)?,
            user_id: row.get(base + 1)?,
            kanji_id: row.get(base + 2)?,
            level: row.get(base + 3)?,
            next_review_at: row.get(base + 4)?,
            correct_streak: row.get(base + 5)?,
            total_reviews: row.get(base + 6)?,
            started_at: row.get(base + 7)?,
            last_reviewed_at: row.get(base + 8)?,
        })
    }

    fn into_record(self) -> Result<ProgressRecord> {
        Ok(ProgressRecord {
            id: self.id,
            user_id: self.user_id,
            kanji_id: self.kanji_id,
            level: SrsLevel::from_index(self.level)?,
            next_review_at: parse_ts(&self.next_review_at)?,
            correct_streak: self.correct_streak,
            total_reviews: self.total_reviews,
            started_at: parse_ts(&self.started_at)?,
            last_reviewed_at: self.last_reviewed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct EventRow {
    user_id: i64,
    kanji_id: i64,
    result: String,
    previous_level: i64,
    new_level: i64,
    response_time_ms: u32,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<ReviewEvent> {
        let result = ReviewResult::from_str(&self.result).ok_or_else(|| {
            SrsError::InvalidInput(format!("unknown review result '{}'", self.result))
        })?;
        Ok(ReviewEvent {
            user_id: self.user_id,
            kanji_id: self.kanji_id,
            result,
            previous_level: SrsLevel::from_index(self.previous_level)?,
            new_level: SrsLevel::from_index(self.new_level)?,
            response_time_ms: self.response_time_ms,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srs::tests::{t0, FixedClock};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    fn new_kanji(character: &str, meaning: &str, jlpt: Option<u8>) -> NewKanji {
        NewKanji {
            character: character.to_string(),
            meanings: vec![meaning.to_string()],
            onyomi: vec![],
            kunyomi: vec![],
            jlpt_level: jlpt,
            stroke_count: None,
        }
    }

    // Database with one user studying 水 (started at t0)
    fn studying_db() -> (Database, i64, i64) {
        let db = setup_db();
        let user = db.get_or_create_user("alice").unwrap();
        let kanji_id = db.add_kanji(&new_kanji("水", "water", Some(5))).unwrap();
        db.start_studying(user.id, kanji_id, &FixedClock(t0()))
            .unwrap();
        (db, user.id, kanji_id)
    }

    fn set_level(db: &Database, user_id: i64, kanji_id: i64, level: SrsLevel, streak: i64) {
        db.conn
            .execute(
                "UPDATE progress SET level = ?1, correct_streak = ?2 WHERE user_id = ?3 AND kanji_id = ?4",
                params![level.index(), streak, user_id, kanji_id],
            )
            .unwrap();
    }

    fn submission(user_id: i64, kanji_id: i64, result: ReviewResult) -> ReviewSubmission {
        ReviewSubmission {
            user_id,
            kanji_id,
            result,
            response_time_ms: 1200,
        }
    }

    fn event_count(db: &Database) -> i64 {
        db.conn
            .query_row("SELECT COUNT(*) FROM review_events", [], |row| row.get(0))
            .unwrap()
    }

    mod init_tests {
        use super::*;

        #[test]
        fn init_creates_tables() {
            let db = setup_db();
            for table in ["users", "kanji", "progress", "review_events"] {
                let count: i64 = db
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })
                    .unwrap();
                assert_eq!(count, 0, "table {} should start empty", table);
            }
        }

        #[test]
        fn init_is_idempotent() {
            let db = setup_db();
            db.add_kanji(&new_kanji("火", "fire", None)).unwrap();
            db.init().unwrap();
            assert_eq!(db.list_kanji(None).unwrap().len(), 1);
        }
    }

    mod user_tests {
        use super::*;

        #[test]
        fn get_or_create_user_creates_once() {
            let db = setup_db();
            let first = db.get_or_create_user("alice").unwrap();
            let second = db.get_or_create_user(" alice ").unwrap();
            assert_eq!(first.id, second.id);
            assert_eq!(second.name, "alice");
        }

        #[test]
        fn get_or_create_user_rejects_empty_name() {
            let db = setup_db();
            assert!(matches!(
                db.get_or_create_user("  "),
                Err(SrsError::InvalidInput(_))
            ));
        }

        #[test]
        fn get_user_by_name_not_found() {
            let db = setup_db();
            assert!(db.get_user_by_name("nobody").unwrap().is_none());
        }
    }

    mod kanji_tests {
        use super::*;

        #[test]
        fn add_kanji_round_trips_fields() {
            let db = setup_db();
            let id = db
                .add_kanji(&NewKanji {
                    character: "日".to_string(),
                    meanings: vec!["day".to_string(), " sun ".to_string(), "".to_string()],
                    onyomi: vec!["ニチ".to_string(), "ジツ".to_string()],
                    kunyomi: vec!["ひ".to_string()],
                    jlpt_level: Some(5),
                    stroke_count: Some(4),
                })
                .unwrap();

            let kanji = db.get_kanji(id).unwrap().unwrap();
            assert_eq!(kanji.character, "日");
            assert_eq!(kanji.meanings, vec!["day", "sun"]);
            assert_eq!(kanji.onyomi, vec!["ニチ", "ジツ"]);
            assert_eq!(kanji.kunyomi, vec!["ひ"]);
            assert_eq!(kanji.jlpt_level, Some(5));
            assert_eq!(kanji.stroke_count, Some(4));
        }

        #[test]
        fn add_kanji_duplicate_fails() {
            let db = setup_db();
            db.add_kanji(&new_kanji("木", "tree", None)).unwrap();
            assert!(matches!(
                db.add_kanji(&new_kanji("木", "wood", None)),
                Err(SrsError::Duplicate(_))
            ));
        }

        #[test]
        fn add_kanji_rejects_invalid_entry() {
            let db = setup_db();
            assert!(matches!(
                db.add_kanji(&new_kanji("木木", "trees", None)),
                Err(SrsError::InvalidInput(_))
            ));
        }

        #[test]
        fn get_kanji_not_found() {
            let db = setup_db();
            assert!(db.get_kanji(999).unwrap().is_none());
        }

        #[test]
        fn lookup_kanji_by_id_or_character() {
            let db = setup_db();
            let id = db.add_kanji(&new_kanji("山", "mountain", Some(5))).unwrap();

            assert_eq!(db.lookup_kanji(&id.to_string()).unwrap().unwrap().id, id);
            assert_eq!(db.lookup_kanji("山").unwrap().unwrap().id, id);
            assert!(db.lookup_kanji("川").unwrap().is_none());
        }

        #[test]
        fn list_kanji_orders_by_jlpt() {
            let db = setup_db();
            db.add_kanji(&new_kanji("語", "language", Some(5))).unwrap();
            db.add_kanji(&new_kanji("鬱", "gloom", None)).unwrap();
            db.add_kanji(&new_kanji("政", "politics", Some(2))).unwrap();
            db.add_kanji(&new_kanji("一", "one", Some(5))).unwrap();

            let chars: Vec<String> = db
                .list_kanji(None)
                .unwrap()
                .into_iter()
                .map(|k| k.character)
                .collect();
            assert_eq!(chars, vec!["語", "一", "政", "鬱"]);
        }

        #[test]
        fn list_kanji_filters_by_jlpt() {
            let db = setup_db();
            db.add_kanji(&new_kanji("語", "language", Some(5))).unwrap();
            db.add_kanji(&new_kanji("政", "politics", Some(2))).unwrap();

            let n2 = db.list_kanji(Some(2)).unwrap();
            assert_eq!(n2.len(), 1);
            assert_eq!(n2[0].character, "政");
            assert!(db.list_kanji(Some(1)).unwrap().is_empty());
        }

        #[test]
        fn import_kanji_skips_existing() {
            let db = setup_db();
            db.add_kanji(&new_kanji("水", "water", Some(5))).unwrap();

            let (added, skipped) = db
                .import_kanji(&[
                    new_kanji("水", "water", Some(5)),
                    new_kanji("火", "fire", Some(5)),
                    new_kanji("金", "gold", Some(5)),
                ])
                .unwrap();

            assert_eq!((added, skipped), (2, 1));
            assert_eq!(db.list_kanji(None).unwrap().len(), 3);
        }

        #[test]
        fn import_kanji_invalid_entry_imports_nothing() {
            let db = setup_db();
            let result = db.import_kanji(&[
                new_kanji("火", "fire", Some(5)),
                new_kanji("火山", "volcano", None),
            ]);
            assert!(result.is_err());
            assert!(db.list_kanji(None).unwrap().is_empty());
        }

        #[test]
        fn delete_kanji_cascades_progress() {
            let (db, user_id, kanji_id) = studying_db();
            db.submit_review(
                &FixedClock(t0()),
                &submission(user_id, kanji_id, ReviewResult::Correct),
            )
            .unwrap();

            assert!(db.delete_kanji(kanji_id).unwrap());
            assert!(db.get_progress(user_id, kanji_id).unwrap().is_none());
            assert_eq!(event_count(&db), 0);
            assert!(!db.delete_kanji(kanji_id).unwrap());
        }
    }

    mod study_tests {
        use super::*;

        #[test]
        fn start_studying_creates_initial_record() {
            let (db, user_id, kanji_id) = studying_db();
            let record = db.get_progress(user_id, kanji_id).unwrap().unwrap();

            assert_eq!(record.level, SrsLevel::Apprentice1);
            assert_eq!(record.correct_streak, 0);
            assert_eq!(record.total_reviews, 0);
            assert_eq!(record.next_review_at, t0());
            assert_eq!(record.started_at, t0());
            assert!(record.last_reviewed_at.is_none());
        }

        #[test]
        fn start_studying_twice_fails() {
            let (db, user_id, kanji_id) = studying_db();
            assert!(matches!(
                db.start_studying(user_id, kanji_id, &FixedClock(t0())),
                Err(SrsError::AlreadyStudying { .. })
            ));
        }

        #[test]
        fn start_studying_unknown_kanji_fails() {
            let db = setup_db();
            let user = db.get_or_create_user("bob").unwrap();
            assert!(matches!(
                db.start_studying(user.id, 42, &FixedClock(t0())),
                Err(SrsError::KanjiNotFound(_))
            ));
        }

        #[test]
        fn start_studying_unknown_user_fails() {
            let db = setup_db();
            let kanji_id = db.add_kanji(&new_kanji("月", "moon", Some(5))).unwrap();
            assert!(matches!(
                db.start_studying(7, kanji_id, &FixedClock(t0())),
                Err(SrsError::UserNotFound(_))
            ));
        }

        #[test]
        fn progress_is_per_user() {
            let (db, _, kanji_id) = studying_db();
            let other = db.get_or_create_user("bob").unwrap();
            assert!(db.get_progress(other.id, kanji_id).unwrap().is_none());
            db.start_studying(other.id, kanji_id, &FixedClock(t0()))
                .unwrap();
        }

        #[test]
        fn list_lessons_excludes_started() {
            let (db, user_id, _) = studying_db();
            db.add_kanji(&new_kanji("火", "fire", Some(5))).unwrap();
            db.add_kanji(&new_kanji("政", "politics", Some(2))).unwrap();

            let lessons: Vec<String> = db
                .list_lessons(user_id, None, None)
                .unwrap()
                .into_iter()
                .map(|k| k.character)
                .collect();
            assert_eq!(lessons, vec!["火", "政"]);

            let n2 = db.list_lessons(user_id, Some(2), None).unwrap();
            assert_eq!(n2.len(), 1);

            let limited = db.list_lessons(user_id, None, Some(1)).unwrap();
            assert_eq!(limited.len(), 1);
            assert_eq!(limited[0].character, "火");
        }
    }

    mod due_tests {
        use super::*;

        #[test]
        fn new_record_is_due_immediately() {
            let (db, user_id, _) = studying_db();
            let due = db.due_reviews(user_id, t0(), None).unwrap();
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].kanji.character, "水");
        }

        #[test]
        fn reviewed_record_is_not_due_until_interval_passes() {
            let (db, user_id, kanji_id) = studying_db();
            db.submit_review(
                &FixedClock(t0()),
                &submission(user_id, kanji_id, ReviewResult::Correct),
            )
            .unwrap();

            let before = t0() + Duration::hours(8) - Duration::seconds(1);
            assert!(db.due_reviews(user_id, before, None).unwrap().is_empty());
            let at = t0() + Duration::hours(8);
            assert_eq!(db.due_reviews(user_id, at, None).unwrap().len(), 1);
        }

        #[test]
        fn burned_items_are_not_due() {
            let (db, user_id, kanji_id) = studying_db();
            set_level(&db, user_id, kanji_id, SrsLevel::Burned, 0);
            let far_future = t0() + Duration::days(3650);
            assert!(db.due_reviews(user_id, far_future, None).unwrap().is_empty());
        }

        #[test]
        fn due_reviews_ordered_oldest_first() {
            let (db, user_id, _) = studying_db();
            let later_id = db.add_kanji(&new_kanji("火", "fire", Some(5))).unwrap();
            db.start_studying(user_id, later_id, &FixedClock(t0() + Duration::hours(1)))
                .unwrap();

            let due = db
                .due_reviews(user_id, t0() + Duration::hours(2), None)
                .unwrap();
            let chars: Vec<&str> = due.iter().map(|d| d.kanji.character.as_str()).collect();
            assert_eq!(chars, vec!["水", "火"]);

            let limited = db
                .due_reviews(user_id, t0() + Duration::hours(2), Some(1))
                .unwrap();
            assert_eq!(limited.len(), 1);
        }

        #[test]
        fn next_review_empty() {
            let db = setup_db();
            let user = db.get_or_create_user("alice").unwrap();
            let mut rng = StdRng::seed_from_u64(7);
            assert!(db.next_review(user.id, t0(), &mut rng).unwrap().is_none());
        }

        #[test]
        fn next_review_picks_a_due_item() {
            let (db, user_id, _) = studying_db();
            let fire = db.add_kanji(&new_kanji("火", "fire", Some(5))).unwrap();
            db.start_studying(user_id, fire, &FixedClock(t0())).unwrap();
            let mut rng = StdRng::seed_from_u64(7);

            for _ in 0..10 {
                let next = db.next_review(user_id, t0(), &mut rng).unwrap().unwrap();
                assert!(["水", "火"].contains(&next.kanji.character.as_str()));
            }
        }

        #[test]
        fn review_weight_favours_overdue_and_low_levels() {
            let now = t0();
            let mut fresh = ProgressRecord::initial(1, 1, 1, now);
            assert_eq!(review_weight(&fresh, now), 9.0);

            fresh.next_review_at = now - Duration::hours(5);
            assert_eq!(review_weight(&fresh, now), 54.0);

            fresh.level = SrsLevel::Enlightened;
            assert_eq!(review_weight(&fresh, now), 12.0);

            fresh.next_review_at = now + Duration::hours(5);
            assert_eq!(review_weight(&fresh, now), 2.0);
        }
    }

    mod review_tests {
        use super::*;

        #[test]
        fn correct_from_apprentice1() {
            let (db, user_id, kanji_id) = studying_db();
            let clock = FixedClock(t0() + Duration::hours(1));

            let saved = db
                .submit_review(&clock, &submission(user_id, kanji_id, ReviewResult::Correct))
                .unwrap();

            assert_eq!(saved.level, SrsLevel::Apprentice2);
            assert_eq!(saved.correct_streak, 1);
            assert_eq!(saved.total_reviews, 1);
            assert_eq!(saved.next_review_at, clock.0 + Duration::hours(8));
            assert_eq!(saved.last_reviewed_at, Some(clock.0));
            assert_eq!(db.get_progress(user_id, kanji_id).unwrap().unwrap(), saved);
        }

        #[test]
        fn incorrect_from_guru2() {
            let (db, user_id, kanji_id) = studying_db();
            set_level(&db, user_id, kanji_id, SrsLevel::Guru2, 5);

            let saved = db
                .submit_review(
                    &FixedClock(t0()),
                    &submission(user_id, kanji_id, ReviewResult::Incorrect),
                )
                .unwrap();

            assert_eq!(saved.level, SrsLevel::Apprentice3);
            assert_eq!(saved.correct_streak, 0);
            assert_eq!(saved.total_reviews, 1);
            assert_eq!(saved.next_review_at, t0() + Duration::hours(23));
        }

        #[test]
        fn correct_from_enlightened_burns() {
            let (db, user_id, kanji_id) = studying_db();
            set_level(&db, user_id, kanji_id, SrsLevel::Enlightened, 6);

            let saved = db
                .submit_review(
                    &FixedClock(t0()),
                    &submission(user_id, kanji_id, ReviewResult::Correct),
                )
                .unwrap();

            assert_eq!(saved.level, SrsLevel::Burned);
            assert_eq!(saved.next_review_at, t0() + Duration::hours(8760));
        }

        #[test]
        fn correct_on_burned_stays_burned() {
            let (db, user_id, kanji_id) = studying_db();
            set_level(&db, user_id, kanji_id, SrsLevel::Burned, 7);
            let later = t0() + Duration::days(400);

            let saved = db
                .submit_review(
                    &FixedClock(later),
                    &submission(user_id, kanji_id, ReviewResult::Correct),
                )
                .unwrap();

            assert_eq!(saved.level, SrsLevel::Burned);
            assert_eq!(saved.next_review_at, later + Duration::hours(8760));
        }

        #[test]
        fn review_without_progress_is_not_found() {
            let db = setup_db();
            let user = db.get_or_create_user("alice").unwrap();
            let kanji_id = db.add_kanji(&new_kanji("火", "fire", Some(5))).unwrap();

            let err = db
                .submit_review(
                    &FixedClock(t0()),
                    &submission(user.id, kanji_id, ReviewResult::Correct),
                )
                .unwrap_err();

            assert!(matches!(err, SrsError::NotFound(_)));
            assert_eq!(event_count(&db), 0);
        }

        #[test]
        fn each_review_appends_one_event() {
            let (db, user_id, kanji_id) = studying_db();
            let clock = FixedClock(t0());

            db.submit_review(&clock, &submission(user_id, kanji_id, ReviewResult::Correct))
                .unwrap();
            db.submit_review(&clock, &submission(user_id, kanji_id, ReviewResult::Correct))
                .unwrap();
            let saved = db
                .submit_review(&clock, &submission(user_id, kanji_id, ReviewResult::Incorrect))
                .unwrap();

            assert_eq!(saved.level, SrsLevel::Apprentice2);
            assert_eq!(saved.total_reviews, 3);
            assert_eq!(event_count(&db), 3);
        }

        #[test]
        fn failed_event_append_leaves_progress_unchanged() {
            let (db, user_id, kanji_id) = studying_db();
            db.conn
                .execute_batch(
                    "CREATE TRIGGER reject_events BEFORE INSERT ON review_events
                     BEGIN SELECT RAISE(ABORT, 'event log unavailable'); END;",
                )
                .unwrap();

            let err = db
                .submit_review(
                    &FixedClock(t0()),
                    &submission(user_id, kanji_id, ReviewResult::Correct),
                )
                .unwrap_err();
            assert!(matches!(err, SrsError::Database(_)));

            let record = db.get_progress(user_id, kanji_id).unwrap().unwrap();
            assert_eq!(record.level, SrsLevel::Apprentice1);
            assert_eq!(record.total_reviews, 0);
            assert!(record.last_reviewed_at.is_none());

            // The rolled-back transaction must not block later reviews
            db.conn.execute_batch("DROP TRIGGER reject_events;").unwrap();
            let saved = db
                .submit_review(
                    &FixedClock(t0()),
                    &submission(user_id, kanji_id, ReviewResult::Correct),
                )
                .unwrap();
            assert_eq!(saved.level, SrsLevel::Apprentice2);
            assert_eq!(event_count(&db), 1);
        }

        #[test]
        fn stored_level_out_of_range_is_invalid_state() {
            let (db, user_id, kanji_id) = studying_db();
            db.conn
                .execute("UPDATE progress SET level = 42", [])
                .unwrap();

            assert!(matches!(
                db.get_progress(user_id, kanji_id),
                Err(SrsError::InvalidState(42))
            ));
            assert!(matches!(
                db.submit_review(
                    &FixedClock(t0()),
                    &submission(user_id, kanji_id, ReviewResult::Correct),
                ),
                Err(SrsError::InvalidState(42))
            ));
            assert_eq!(event_count(&db), 0);

            let tomorrow = t0() + Duration::days(1);
            assert!(matches!(
                db.due_reviews(user_id, tomorrow, None),
                Err(SrsError::InvalidState(42))
            ));
            let mut rng = StdRng::seed_from_u64(7);
            assert!(matches!(
                db.next_review(user_id, tomorrow, &mut rng),
                Err(SrsError::InvalidState(42))
            ));
        }

        #[test]
        fn negative_stored_level_is_not_hidden_from_due() {
            let (db, user_id, _) = studying_db();
            db.conn
                .execute("UPDATE progress SET level = -1", [])
                .unwrap();

            assert!(matches!(
                db.due_reviews(user_id, t0(), None),
                Err(SrsError::InvalidState(-1))
            ));
        }

        #[test]
        fn concurrent_submissions_are_serialized() {
            const THREADS: usize = 4;
            const REVIEWS_PER_THREAD: usize = 25;

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("kanji.db");

            let db = Database::open(&path).unwrap();
            db.init().unwrap();
            let user_id = db.get_or_create_user("alice").unwrap().id;
            let kanji_id = db.add_kanji(&new_kanji("水", "water", Some(5))).unwrap();
            db.start_studying(user_id, kanji_id, &FixedClock(t0()))
                .unwrap();

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let path = path.clone();
                    std::thread::spawn(move || {
                        let db = Database::open(&path).unwrap();
                        let clock = FixedClock(t0());
                        for _ in 0..REVIEWS_PER_THREAD {
                            db.submit_review(
                                &clock,
                                &submission(user_id, kanji_id, ReviewResult::Correct),
                            )
                            .unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            let expected = (THREADS * REVIEWS_PER_THREAD) as i64;
            let record = db.get_progress(user_id, kanji_id).unwrap().unwrap();
            assert_eq!(record.total_reviews, expected);
            assert_eq!(record.correct_streak, expected);
            assert_eq!(record.level, SrsLevel::Burned);
            assert_eq!(event_count(&db), expected);
        }

        #[test]
        fn review_history_newest_first() {
            let (db, user_id, kanji_id) = studying_db();
            db.submit_review(
                &FixedClock(t0()),
                &submission(user_id, kanji_id, ReviewResult::Correct),
            )
            .unwrap();
            db.submit_review(
                &FixedClock(t0() + Duration::hours(9)),
                &submission(user_id, kanji_id, ReviewResult::Incorrect),
            )
            .unwrap();

            let history = db.review_history(user_id, kanji_id, None).unwrap();
            assert_eq!(history.len(), 2);

            assert_eq!(history[0].result, ReviewResult::Incorrect);
            assert_eq!(history[0].previous_level, SrsLevel::Apprentice2);
            assert_eq!(history[0].new_level, SrsLevel::Apprentice1);
            assert_eq!(history[0].created_at, t0() + Duration::hours(9));

            assert_eq!(history[1].result, ReviewResult::Correct);
            assert_eq!(history[1].previous_level, SrsLevel::Apprentice1);
            assert_eq!(history[1].new_level, SrsLevel::Apprentice2);
            assert_eq!(history[1].response_time_ms, 1200);

            assert_eq!(db.review_history(user_id, kanji_id, Some(1)).unwrap().len(), 1);
        }
    }

    mod timestamp_tests {
        use super::*;
        use chrono::TimeZone;

        #[test]
        fn fmt_ts_is_fixed_width_utc() {
            let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
            assert_eq!(fmt_ts(ts), "2026-03-01T09:05:00.000Z");
        }

        #[test]
        fn parse_ts_round_trips() {
            let ts = t0();
            assert_eq!(parse_ts(&fmt_ts(ts)).unwrap(), ts);
        }

        #[test]
        fn parse_ts_rejects_garbage() {
            assert!(matches!(
                parse_ts("yesterday"),
                Err(SrsError::InvalidTimestamp(_))
            ));
        }
    }
}
