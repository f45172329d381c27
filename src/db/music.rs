//! Queries for Spotify grants, listening history and playlists.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    timestamp, DbPool, Playlist, PlaylistKind, PlaylistRow, RankedTrack, RankedTrackRow,
    SpotifyToken, SpotifyTokenRow, StoreError, Track,
};

pub async fn spotify_token(
    pool: &DbPool,
    user_id: Uuid,
) -> Result<Option<SpotifyToken>, StoreError> {
    let row: Option<SpotifyTokenRow> = sqlx::query_as(
        r#"
        SELECT user_id, spotify_user_id, access_token, refresh_token, token_type, scope, expires_at
        FROM spotify_tokens WHERE user_id = ?
        "#,
    )
    .bind(user_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(SpotifyToken::try_from).transpose()
}

pub async fn upsert_spotify_token(pool: &DbPool, token: &SpotifyToken) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO spotify_tokens
            (user_id, spotify_user_id, access_token, refresh_token, token_type, scope, expires_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            spotify_user_id = excluded.spotify_user_id,
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            token_type = excluded.token_type,
            scope = excluded.scope,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(token.user_id.to_string())
    .bind(&token.spotify_user_id)
    .bind(&token.access_token)
    .bind(&token.refresh_token)
    .bind(&token.token_type)
    .bind(&token.scope)
    .bind(timestamp(token.expires_at))
    .bind(timestamp(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Store tracks and their play events in one transaction. Replayed events are
/// ignored. Returns how many new listens were recorded.
pub async fn record_plays(
    pool: &DbPool,
    user_id: Uuid,
    plays: &[(Track, DateTime<Utc>)],
) -> Result<u64, StoreError> {
    let mut tx = pool.begin().await?;
    let user = user_id.to_string();
    let mut recorded = 0;

    for (track, played_at) in plays {
        let artists = serde_json::to_string(&track.artists)
            .map_err(|e| StoreError::Corrupt(format!("track {} artists: {}", track.id, e)))?;
        sqlx::query(
            r#"
            INSERT INTO tracks (id, name, href, artists, image_url, uri)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                href = excluded.href,
                artists = excluded.artists,
                image_url = excluded.image_url,
                uri = excluded.uri
            "#,
        )
        .bind(&track.id)
        .bind(&track.name)
        .bind(&track.href)
        .bind(artists)
        .bind(&track.image_url)
        .bind(&track.uri)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO listens (user_id, track_id, played_at) VALUES (?, ?, ?)",
        )
        .bind(&user)
        .bind(&track.id)
        .bind(timestamp(*played_at))
        .execute(&mut *tx)
        .await?;
        recorded += result.rows_affected();
    }

    tx.commit().await?;
    Ok(recorded)
}

/// Most played tracks in `[start, end)`, ties broken by most recent play.
pub async fn top_tracks(
    pool: &DbPool,
    user_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: Option<u32>,
) -> Result<Vec<RankedTrack>, StoreError> {
    let rows: Vec<RankedTrackRow> = sqlx::query_as(
        r#"
        SELECT t.id, t.name, t.href, t.artists, t.image_url, t.uri, COUNT(*) AS plays
        FROM listens l
        JOIN tracks t ON t.id = l.track_id
        WHERE l.user_id = ? AND l.played_at >= ? AND l.played_at < ?
        GROUP BY t.id
        ORDER BY plays DESC, MAX(l.played_at) DESC, t.id
        LIMIT ?
        "#,
    )
    .bind(user_id.to_string())
    .bind(timestamp(start))
    .bind(timestamp(end))
    // SQLite treats a negative limit as unbounded
    .bind(limit.map(i64::from).unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(RankedTrack::try_from).collect()
}

/// Create a playlist holding `tracks` in the given order.
pub async fn create_playlist(
    pool: &DbPool,
    user_id: Uuid,
    name: &str,
    kind: PlaylistKind,
    tracks: &[RankedTrack],
) -> Result<Playlist, StoreError> {
    let playlist = Playlist {
        id: Uuid::new_v4(),
        user_id,
        name: name.to_string(),
        kind,
        spotify_id: None,
        spotify_url: None,
        created_at: Utc::now(),
    };
    let playlist_id = playlist.id.to_string();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO playlists (id, user_id, name, playlist_type, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&playlist_id)
    .bind(user_id.to_string())
    .bind(name)
    .bind(kind.as_str())
    .bind(timestamp(playlist.created_at))
    .execute(&mut *tx)
    .await?;

    for (position, entry) in tracks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO playlist_tracks (playlist_id, track_id, plays, position) VALUES (?, ?, ?, ?)",
        )
        .bind(&playlist_id)
        .bind(&entry.track.id)
        .bind(entry.plays)
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(playlist)
}

pub async fn user_playlists(pool: &DbPool, user_id: Uuid) -> Result<Vec<Playlist>, StoreError> {
    let rows: Vec<PlaylistRow> = sqlx::query_as(
        r#"
        SELECT id, user_id, name, playlist_type, spotify_id, spotify_url, created_at
        FROM playlists WHERE user_id = ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Playlist::try_from).collect()
}

/// A playlist, only if it belongs to `user_id`.
pub async fn user_playlist(
    pool: &DbPool,
    user_id: Uuid,
    playlist_id: Uuid,
) -> Result<Option<Playlist>, StoreError> {
    let row: Option<PlaylistRow> = sqlx::query_as(
        r#"
        SELECT id, user_id, name, playlist_type, spotify_id, spotify_url, created_at
        FROM playlists WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(playlist_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(Playlist::try_from).transpose()
}

pub async fn playlist_tracks(
    pool: &DbPool,
    playlist_id: Uuid,
) -> Result<Vec<RankedTrack>, StoreError> {
    let rows: Vec<RankedTrackRow> = sqlx::query_as(
        r#"
        SELECT t.id, t.name, t.href, t.artists, t.image_url, t.uri, pt.plays
        FROM playlist_tracks pt
        JOIN tracks t ON t.id = pt.track_id
        WHERE pt.playlist_id = ?
        ORDER BY pt.position
        "#,
    )
    .bind(playlist_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(RankedTrack::try_from).collect()
}

pub async fn set_playlist_spotify(
    pool: &DbPool,
    playlist_id: Uuid,
    spotify_id: &str,
    spotify_url: &str,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE playlists SET spotify_id = ?, spotify_url = ? WHERE id = ?")
        .bind(spotify_id)
        .bind(spotify_url)
        .bind(playlist_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
