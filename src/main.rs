mod db;
mod error;
mod models;
mod srs;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use db::Database;
use error::{Result, SrsError};
use models::{
    join_or_dash, JsonOutput, Kanji, NewKanji, ProgressRecord, ReviewResult, ReviewSubmission,
    SrsLevel,
};
use srs::{Clock, SystemClock};

const DEFAULT_DB_NAME: &str = "kanji.db";
const DEFAULT_USER: &str = "default";

#[derive(Parser)]
#[command(name = "kanji")]
#[command(about = "Kanji flashcards with a nine-level spaced repetition schedule")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Study as this user (defaults to $KANJI_USER, then "default")
    #[arg(long, short, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage the kanji catalog
    #[command(subcommand)]
    Kanji(KanjiCommands),

    /// List kanji you have not started yet
    Lessons {
        /// Filter by JLPT level (1-5)
        #[arg(long)]
        jlpt: Option<u8>,

        /// Maximum number of kanji to show
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Start studying a kanji
    Start {
        /// Kanji ID or character
        kanji: String,
    },

    /// List reviews that are due now
    Due {
        /// Maximum number of reviews to show
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Pick the next due review (weighted random)
    Next,

    /// Submit a review answer
    Review {
        /// Kanji ID or character
        kanji: String,

        /// Answer result: correct/incorrect
        #[arg(long, short)]
        result: String,

        /// Time taken to answer, in milliseconds
        #[arg(long, short = 't', default_value_t = 0)]
        time_ms: u32,
    },

    /// Show SRS progress for a kanji
    Progress {
        /// Kanji ID or character
        kanji: String,
    },

    /// Show review history for a kanji
    History {
        /// Kanji ID or character
        kanji: String,

        /// Maximum number of reviews to show
        #[arg(long, short)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum KanjiCommands {
    /// Add a kanji to the catalog
    Add {
        /// The kanji character
        character: String,

        /// Comma-separated meanings
        #[arg(long, short)]
        meanings: String,

        /// Comma-separated on'yomi readings
        #[arg(long, short)]
        onyomi: Option<String>,

        /// Comma-separated kun'yomi readings
        #[arg(long, short)]
        kunyomi: Option<String>,

        /// JLPT level (1-5)
        #[arg(long, short)]
        jlpt: Option<u8>,

        /// Stroke count
        #[arg(long, short)]
        strokes: Option<u8>,
    },

    /// Import kanji from a JSON array file
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// List catalog kanji
    List {
        /// Filter by JLPT level (1-5)
        #[arg(long)]
        jlpt: Option<u8>,
    },

    /// Show kanji details
    Show {
        /// Kanji ID or character
        kanji: String,
    },

    /// Delete a kanji. Also removes every user's progress and review history for it
    Delete {
        /// Kanji ID
        id: i64,
    },
}

fn get_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("KANJI_DB") {
        return PathBuf::from(path);
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kanji-srs");

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

fn get_user_name(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("KANJI_USER").ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER.to_string())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let db_path = get_db_path();
    let db = Database::open(&db_path)?;
    let clock = SystemClock;
    let user_name = get_user_name(cli.user.as_deref());

    match cli.command {
        Commands::Init => {
            db.init()?;
            if cli.json {
                print_json(())?;
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::Kanji(kanji_cmd) => match kanji_cmd {
            KanjiCommands::Add {
                character,
                meanings,
                onyomi,
                kunyomi,
                jlpt,
                strokes,
            } => {
                let new = NewKanji {
                    character,
                    meanings: split_list(&meanings),
                    onyomi: onyomi.as_deref().map(split_list).unwrap_or_default(),
                    kunyomi: kunyomi.as_deref().map(split_list).unwrap_or_default(),
                    jlpt_level: jlpt,
                    stroke_count: strokes,
                };
                let id = db.add_kanji(&new)?;

                if cli.json {
                    print_json(serde_json::json!({ "id": id, "character": new.character.trim() }))?;
                } else {
                    println!("Added kanji {} with ID: {}", new.character.trim(), id);
                }
            }

            KanjiCommands::Import { file } => {
                let entries = load_import(&file)?;
                let (added, skipped) = db.import_kanji(&entries)?;

                if cli.json {
                    print_json(serde_json::json!({ "added": added, "skipped": skipped }))?;
                } else {
                    println!(
                        "Imported {} kanji from {} ({} already present).",
                        added,
                        file.display(),
                        skipped
                    );
                }
            }

            KanjiCommands::List { jlpt } => {
                let kanji = db.list_kanji(jlpt)?;
                if cli.json {
                    print_json(&kanji)?;
                } else if kanji.is_empty() {
                    println!("No kanji found.");
                } else {
                    print_kanji_table(&kanji);
                }
            }

            KanjiCommands::Show { kanji } => {
                let kanji = resolve_kanji(&db, &kanji)?;
                let user = db.get_user_by_name(&user_name)?;
                let progress = match &user {
                    Some(u) => db.get_progress(u.id, kanji.id)?,
                    None => None,
                };

                if cli.json {
                    print_json(serde_json::json!({ "kanji": kanji, "progress": progress }))?;
                } else {
                    print_kanji_details(&kanji);
                    if let Some(p) = progress {
                        println!();
                        println!("Level: {}", p.level.label());
                        println!("Next review: {}", review_status(&p, clock.now()));
                    }
                }
            }

            KanjiCommands::Delete { id } => {
                if db.delete_kanji(id)? {
                    if cli.json {
                        print_json(())?;
                    } else {
                        println!("Kanji {} deleted.", id);
                    }
                } else {
                    return Err(SrsError::KanjiNotFound(id.to_string()));
                }
            }
        },

        Commands::Lessons { jlpt, limit } => {
            let user = db.get_or_create_user(&user_name)?;
            let lessons = db.list_lessons(user.id, jlpt, limit)?;

            if cli.json {
                print_json(&lessons)?;
            } else if lessons.is_empty() {
                println!("No new kanji to learn. Add or import some first!");
            } else {
                print_kanji_table(&lessons);
                println!();
                println!("Begin one with:  kanji start <ID>");
            }
        }

        Commands::Start { kanji } => {
            let user = db.get_or_create_user(&user_name)?;
            let kanji = resolve_kanji(&db, &kanji)?;
            let progress = db.start_studying(user.id, kanji.id, &clock)?;

            if cli.json {
                print_json(&progress)?;
            } else {
                println!(
                    "{} started studying {} ({}). First review is due now.",
                    user.name,
                    kanji.character,
                    kanji.meanings_label()
                );
            }
        }

        Commands::Due { limit } => {
            let user = db.get_or_create_user(&user_name)?;
            let now = clock.now();
            let due = db.due_reviews(user.id, now, limit)?;

            if cli.json {
                print_json(&due)?;
            } else if due.is_empty() {
                println!("Nothing due. Come back later!");
            } else {
                println!("{:<5} {:<4} {:<14} {:<12} MEANINGS", "ID", "KANJI", "LEVEL", "DUE");
                println!("{}", "-".repeat(70));
                for d in due {
                    println!(
                        "{:<5} {:<4} {:<14} {:<12} {}",
                        d.kanji.id,
                        d.kanji.character,
                        d.progress.level.label(),
                        format_until(d.progress.next_review_at, now),
                        truncate(&d.kanji.meanings_label(), 32)
                    );
                }
            }
        }

        Commands::Next => {
            let user = db.get_or_create_user(&user_name)?;
            let mut rng = rand::thread_rng();

            if let Some(d) = db.next_review(user.id, clock.now(), &mut rng)? {
                if cli.json {
                    print_json(&d)?;
                } else {
                    println!("=== Next Review ===");
                    println!();
                    println!("Kanji: {} (ID: {})", d.kanji.character, d.kanji.id);
                    println!("Level: {}", d.progress.level.label());
                    println!(
                        "Streak: {}  Reviews: {}",
                        d.progress.correct_streak, d.progress.total_reviews
                    );
                    println!();
                    println!("After answering, record the result with:");
                    println!(
                        "  kanji review {} --result <correct|incorrect>",
                        d.kanji.id
                    );
                }
            } else if cli.json {
                print_json(())?;
            } else {
                println!("Nothing due. Come back later!");
            }
        }

        Commands::Review {
            kanji,
            result,
            time_ms,
        } => {
            let result = ReviewResult::from_str(&result).ok_or_else(|| {
                SrsError::InvalidInput(format!(
                    "Invalid result '{}'. Use: correct or incorrect",
                    result
                ))
            })?;
            let user = db.get_or_create_user(&user_name)?;
            let kanji = resolve_kanji(&db, &kanji)?;

            let saved = db.submit_review(
                &clock,
                &ReviewSubmission {
                    user_id: user.id,
                    kanji_id: kanji.id,
                    result,
                    response_time_ms: time_ms,
                },
            )?;

            if cli.json {
                print_json(&saved)?;
            } else {
                let previous = db
                    .review_history(user.id, kanji.id, Some(1))?
                    .into_iter()
                    .next()
                    .map(|e| e.previous_level.label())
                    .unwrap_or("-");
                println!(
                    "{} marked {}: {} -> {}",
                    kanji.character,
                    result.as_str(),
                    previous,
                    saved.level.label()
                );
                println!(
                    "Next review: {} ({})",
                    format_until(saved.next_review_at, clock.now()),
                    saved.next_review_at.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }

        Commands::Progress { kanji } => {
            let user = db.get_or_create_user(&user_name)?;
            let kanji = resolve_kanji(&db, &kanji)?;
            let progress = db.get_progress(user.id, kanji.id)?.ok_or_else(|| {
                SrsError::NotFound(format!("{} for user {}", kanji.character, user.name))
            })?;

            if cli.json {
                print_json(&progress)?;
            } else {
                println!("Kanji: {} ({})", kanji.character, kanji.meanings_label());
                println!(
                    "Level: {} ({})",
                    progress.level.label(),
                    progress.level.stage()
                );
                println!("Correct streak: {}", progress.correct_streak);
                println!("Total reviews: {}", progress.total_reviews);
                println!("Started: {}", progress.started_at.format("%Y-%m-%d"));
                if let Some(last) = progress.last_reviewed_at {
                    println!("Last reviewed: {}", last.format("%Y-%m-%d %H:%M UTC"));
                }
                println!("Next review: {}", review_status(&progress, clock.now()));
            }
        }

        Commands::History { kanji, limit } => {
            let user = db.get_or_create_user(&user_name)?;
            let kanji = resolve_kanji(&db, &kanji)?;
            let events = db.review_history(user.id, kanji.id, limit)?;

            if cli.json {
                print_json(&events)?;
            } else if events.is_empty() {
                println!("No reviews recorded for {}.", kanji.character);
            } else {
                println!(
                    "{:<18} {:<10} {:<30} TIME",
                    "WHEN", "RESULT", "TRANSITION"
                );
                println!("{}", "-".repeat(70));
                for e in events {
                    println!(
                        "{:<18} {:<10} {:<30} {:.1}s",
                        e.created_at.format("%Y-%m-%d %H:%M"),
                        e.result.as_str(),
                        format!("{} -> {}", e.previous_level.label(), e.new_level.label()),
                        e.response_time_ms as f64 / 1000.0
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(data: T) -> Result<()> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn resolve_kanji(db: &Database, key: &str) -> Result<Kanji> {
    db.lookup_kanji(key)?
        .ok_or_else(|| SrsError::KanjiNotFound(key.to_string()))
}

fn load_import(path: &Path) -> Result<Vec<NewKanji>> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<NewKanji> = serde_json::from_str(&content)?;
    Ok(entries)
}

fn print_kanji_table(kanji: &[Kanji]) {
    println!("{:<5} {:<4} {:<5} {:<40} READINGS", "ID", "KANJI", "JLPT", "MEANINGS");
    println!("{}", "-".repeat(75));
    for k in kanji {
        let readings: Vec<String> = k.onyomi.iter().chain(k.kunyomi.iter()).cloned().collect();
        println!(
            "{:<5} {:<4} {:<5} {:<40} {}",
            k.id,
            k.character,
            k.jlpt_label(),
            truncate(&k.meanings_label(), 38),
            join_or_dash(&readings)
        );
    }
}

fn print_kanji_details(kanji: &Kanji) {
    println!("Kanji: {}", kanji.character);
    println!("ID: {}", kanji.id);
    println!("Meanings: {}", kanji.meanings_label());
    println!("On'yomi: {}", join_or_dash(&kanji.onyomi));
    println!("Kun'yomi: {}", join_or_dash(&kanji.kunyomi));
    println!("JLPT: {}", kanji.jlpt_label());
    if let Some(strokes) = kanji.stroke_count {
        println!("Strokes: {}", strokes);
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

// Human-readable time until `when`
fn format_until(when: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = when.signed_duration_since(now);
    if diff.num_minutes() <= 0 {
        return "now".to_string();
    }

    let hours = diff.num_hours();
    if hours < 1 {
        format!("in {}m", diff.num_minutes())
    } else if hours < 48 {
        format!("in {}h", hours)
    } else if hours < 24 * 60 {
        format!("in {}d", hours / 24)
    } else if hours < 24 * 365 {
        format!("in {}mo", hours / (24 * 30))
    } else {
        format!("in {}y", hours / (24 * 365))
    }
}

fn review_status(progress: &ProgressRecord, now: DateTime<Utc>) -> String {
    if progress.level == SrsLevel::Burned {
        "burned (no longer scheduled)".to_string()
    } else if progress.is_due(now) {
        "due now".to_string()
    } else {
        format!("due {}", format_until(progress.next_review_at, now))
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
