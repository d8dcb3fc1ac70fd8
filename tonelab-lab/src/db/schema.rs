//! Database schema definitions
//!
//! `CREATE TABLE IF NOT EXISTS` statements applied in one transaction at
//! every startup, so migrations are idempotent. Timestamps are RFC 3339
//! TEXT; booleans are INTEGER 0/1; ids are UUID v4 TEXT.

use sqlx::SqlitePool;
use tonelab_common::Result;

/// Create all tables and indexes.
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS libraries (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            root_path TEXT NOT NULL UNIQUE,
            scan_interval TEXT NOT NULL DEFAULT '15m',
            read_only INTEGER NOT NULL DEFAULT 1,
            output_path TEXT,
            allowed_formats TEXT,
            last_scan_at TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_files (
            id TEXT PRIMARY KEY,
            library_id TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            filename TEXT NOT NULL,
            extension TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime TEXT NOT NULL,
            quick_hash TEXT,
            full_hash TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_msg TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (library_id, path)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_files_library ON media_files(library_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files(status)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            media_file_id TEXT NOT NULL UNIQUE REFERENCES media_files(id) ON DELETE CASCADE,
            duration REAL NOT NULL DEFAULT 0,
            codec TEXT NOT NULL DEFAULT '',
            sample_rate INTEGER NOT NULL DEFAULT 0,
            bit_depth INTEGER NOT NULL DEFAULT 0,
            channels INTEGER NOT NULL DEFAULT 0,
            bitrate INTEGER NOT NULL DEFAULT 0,
            title TEXT,
            artist TEXT,
            album TEXT,
            album_artist TEXT,
            track_number INTEGER,
            disc_number INTEGER,
            year INTEGER,
            genre TEXT,
            has_artwork INTEGER NOT NULL DEFAULT 0,
            artwork_width INTEGER,
            artwork_height INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_album ON tracks(album, album_artist)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_runs (
            id TEXT PRIMARY KEY,
            library_id TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'running',
            files_found INTEGER NOT NULL DEFAULT 0,
            files_new INTEGER NOT NULL DEFAULT 0,
            files_changed INTEGER NOT NULL DEFAULT 0,
            files_deleted INTEGER NOT NULL DEFAULT 0,
            files_failed INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            error_msg TEXT
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_runs_library ON scan_runs(library_id, started_at)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            version INTEGER NOT NULL DEFAULT 1,
            lossless_score REAL NOT NULL DEFAULT 0,
            lossless_status TEXT NOT NULL DEFAULT 'pass',
            integrity_ok INTEGER NOT NULL DEFAULT 1,
            decode_errors INTEGER NOT NULL DEFAULT 0,
            peak_level REAL NOT NULL DEFAULT 0,
            true_peak REAL NOT NULL DEFAULT 0,
            crest_factor REAL NOT NULL DEFAULT 0,
            clipped_samples INTEGER NOT NULL DEFAULT 0,
            dc_offset REAL NOT NULL DEFAULT 0,
            integrated_loudness REAL NOT NULL DEFAULT 0,
            loudness_range REAL NOT NULL DEFAULT 0,
            high_freq_cutoff REAL NOT NULL DEFAULT 0,
            spectral_rolloff REAL NOT NULL DEFAULT 0,
            phase_correlation REAL NOT NULL DEFAULT 0,
            issues_json TEXT NOT NULL DEFAULT '[]',
            stats_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_results_track ON analysis_results(track_id, version)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            width INTEGER,
            height INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_track ON artifacts(track_id, kind)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            payload_json TEXT,
            scheduled_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(job_type, status, scheduled_at, priority)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_target ON jobs(target_id, status)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS action_logs (
            id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            before_json TEXT NOT NULL DEFAULT '{}',
            after_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_action_logs_target ON action_logs(target_type, target_id)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            value_type TEXT NOT NULL DEFAULT 'string',
            category TEXT NOT NULL DEFAULT 'general',
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversion_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            codec TEXT NOT NULL,
            sample_rate INTEGER NOT NULL DEFAULT 0,
            bit_depth INTEGER NOT NULL DEFAULT 0,
            bitrate INTEGER NOT NULL DEFAULT 0,
            is_builtin INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Seed default settings and built-in conversion profiles. `INSERT OR
/// IGNORE` keeps operator edits intact across restarts.
pub async fn seed_defaults(pool: &SqlitePool) -> Result<()> {
    let now = chrono::Utc::now();

    let settings: &[(&str, &str, &str, &str)] = &[
        ("scan_interval", "15m", "string", "scanner"),
        ("worker_count", "4", "int", "scanner"),
        ("auto_scan_enabled", "true", "bool", "scanner"),
        ("analysis_max_duration_sec", "60", "int", "analysis"),
        ("notifications_enabled", "true", "bool", "notifications"),
        ("notify_scan_complete", "true", "bool", "notifications"),
        ("notify_issues_found", "true", "bool", "notifications"),
    ];

    for (key, value, value_type, category) in settings {
        sqlx::query(
            "INSERT OR IGNORE INTO settings (key, value, value_type, category, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(category)
        .bind(now)
        .execute(pool)
        .await?;
    }

    let profiles: &[(&str, &str, &str, &str, i32, i32, i32)] = &[
        (
            "redbook",
            "Red Book CD Quality",
            "16-bit/44.1kHz FLAC, standard CD quality",
            "flac",
            44100,
            16,
            0,
        ),
        (
            "portable-alac",
            "Portable ALAC",
            "16-bit/44.1kHz ALAC for maximum player compatibility",
            "alac",
            44100,
            16,
            0,
        ),
        (
            "aac-256",
            "AAC 256kbps",
            "High quality AAC for portable devices",
            "aac",
            44100,
            0,
            256_000,
        ),
    ];

    for (id, name, description, codec, sample_rate, bit_depth, bitrate) in profiles {
        sqlx::query(
            "INSERT OR IGNORE INTO conversion_profiles
             (id, name, description, codec, sample_rate, bit_depth, bitrate, is_builtin)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(codec)
        .bind(sample_rate)
        .bind(bit_depth)
        .bind(bitrate)
        .execute(pool)
        .await?;
    }

    Ok(())
}
