//! Track persistence
//!
//! Every track query joins `media_files` so callers always see the source
//! path and owning library alongside the audio metadata.

use crate::models::Track;
use chrono::Utc;
use sqlx::SqlitePool;
use tonelab_common::{Error, Result};
use uuid::Uuid;

const TRACK_COLUMNS: &str = "t.*, m.path AS path, m.library_id AS library_id";

/// Filters for [`list_tracks`]
#[derive(Debug, Clone, Default)]
pub struct TrackFilter {
    pub library_id: Option<String>,
    /// When true, only tracks whose latest analysis is not `pass`
    pub issues_only: bool,
    pub limit: i64,
    pub offset: i64,
}

pub async fn create_track(pool: &SqlitePool, track: &mut Track) -> Result<()> {
    track.id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO tracks
         (id, media_file_id, duration, codec, sample_rate, bit_depth, channels, bitrate,
          title, artist, album, album_artist, track_number, disc_number, year, genre,
          has_artwork, artwork_width, artwork_height, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&track.id)
    .bind(&track.media_file_id)
    .bind(track.duration)
    .bind(&track.codec)
    .bind(track.sample_rate)
    .bind(track.bit_depth)
    .bind(track.channels)
    .bind(track.bitrate)
    .bind(&track.title)
    .bind(&track.artist)
    .bind(&track.album)
    .bind(&track.album_artist)
    .bind(track.track_number)
    .bind(track.disc_number)
    .bind(track.year)
    .bind(&track.genre)
    .bind(track.has_artwork)
    .bind(track.artwork_width)
    .bind(track.artwork_height)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_track(pool: &SqlitePool, id: &str) -> Result<Track> {
    sqlx::query_as::<_, Track>(&format!(
        "SELECT {} FROM tracks t JOIN media_files m ON t.media_file_id = m.id WHERE t.id = ?",
        TRACK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("track {}", id)))
}

pub async fn get_track_by_media_file(
    pool: &SqlitePool,
    media_file_id: &str,
) -> Result<Option<Track>> {
    let track = sqlx::query_as::<_, Track>(&format!(
        "SELECT {} FROM tracks t JOIN media_files m ON t.media_file_id = m.id
         WHERE t.media_file_id = ?",
        TRACK_COLUMNS
    ))
    .bind(media_file_id)
    .fetch_optional(pool)
    .await?;
    Ok(track)
}

/// List tracks with the total count for pagination.
pub async fn list_tracks(pool: &SqlitePool, filter: &TrackFilter) -> Result<(Vec<Track>, i64)> {
    let mut where_clause = String::from("WHERE 1=1");
    if filter.library_id.is_some() {
        where_clause.push_str(" AND m.library_id = ?");
    }
    if filter.issues_only {
        where_clause.push_str(
            " AND EXISTS (SELECT 1 FROM analysis_results ar
               WHERE ar.track_id = t.id AND ar.lossless_status != 'pass'
               AND ar.version = (SELECT MAX(version) FROM analysis_results WHERE track_id = t.id))",
        );
    }

    let count_sql = format!(
        "SELECT COUNT(*) FROM tracks t JOIN media_files m ON t.media_file_id = m.id {}",
        where_clause
    );
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(library_id) = &filter.library_id {
        count_query = count_query.bind(library_id);
    }
    let total = count_query.fetch_one(pool).await?;

    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    let list_sql = format!(
        "SELECT {} FROM tracks t JOIN media_files m ON t.media_file_id = m.id {}
         ORDER BY t.album, t.disc_number, t.track_number LIMIT ? OFFSET ?",
        TRACK_COLUMNS, where_clause
    );
    let mut list_query = sqlx::query_as::<_, Track>(&list_sql);
    if let Some(library_id) = &filter.library_id {
        list_query = list_query.bind(library_id);
    }
    let tracks = list_query
        .bind(limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await?;

    Ok((tracks, total))
}

/// Tracks of one album in (disc, track, title) order, optionally
/// filtered by artist. Bulk metadata operations iterate this.
pub async fn list_tracks_by_album(
    pool: &SqlitePool,
    album: &str,
    artist: Option<&str>,
) -> Result<Vec<Track>> {
    let mut sql = format!(
        "SELECT {} FROM tracks t JOIN media_files m ON t.media_file_id = m.id
         WHERE t.album = ?",
        TRACK_COLUMNS
    );
    if artist.is_some() {
        sql.push_str(" AND t.artist = ?");
    }
    sql.push_str(" ORDER BY t.disc_number, t.track_number, t.title");

    let mut query = sqlx::query_as::<_, Track>(&sql).bind(album);
    if let Some(artist) = artist {
        query = query.bind(artist);
    }
    let tracks = query.fetch_all(pool).await?;
    Ok(tracks)
}

pub async fn update_track(pool: &SqlitePool, track: &Track) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tracks SET
             duration = ?, codec = ?, sample_rate = ?, bit_depth = ?, channels = ?, bitrate = ?,
             title = ?, artist = ?, album = ?, album_artist = ?, track_number = ?, disc_number = ?,
             year = ?, genre = ?, has_artwork = ?, artwork_width = ?, artwork_height = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(track.duration)
    .bind(&track.codec)
    .bind(track.sample_rate)
    .bind(track.bit_depth)
    .bind(track.channels)
    .bind(track.bitrate)
    .bind(&track.title)
    .bind(&track.artist)
    .bind(&track.album)
    .bind(&track.album_artist)
    .bind(track.track_number)
    .bind(track.disc_number)
    .bind(track.year)
    .bind(&track.genre)
    .bind(track.has_artwork)
    .bind(track.artwork_width)
    .bind(track.artwork_height)
    .bind(Utc::now())
    .bind(&track.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("track {}", track.id)));
    }
    Ok(())
}

/// Keep the artwork flag in sync with the presence of an `artwork`
/// artifact for this track.
pub async fn update_track_artwork_status(
    pool: &SqlitePool,
    track_id: &str,
    has_artwork: bool,
    width: Option<i32>,
    height: Option<i32>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tracks SET has_artwork = ?, artwork_width = ?, artwork_height = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(has_artwork)
    .bind(width)
    .bind(height)
    .bind(Utc::now())
    .bind(track_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("track {}", track_id)));
    }
    Ok(())
}
