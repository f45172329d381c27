//! When sweeps run.
//!
//! Two disciplines: a fixed interval (first run one period after start,
//! missed ticks skipped) and a calendar trigger that sleeps until the next
//! wall-clock occurrence in the configured zone. Both stop as soon as the
//! cancellation token fires. A sweep that is already running is left to
//! finish.

use chrono::{
    DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday,
};
use chrono::{LocalResult, TimeZone};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::sweep::{BatchOrchestrator, Sweep};
use crate::config::SchedulerConfig;
use crate::db::PlaylistKind;

/// Longest DST gap we step over when a local time does not exist
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// Map a wall-clock time in `tz` to an instant. Ambiguous times take the
/// earlier instant. Times inside a DST gap move to the first valid minute
/// after it. `None` within a day of the representable date range.
pub fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    // Offsets and gaps stay under a day, so this margin keeps the math in range
    naive.checked_sub_signed(Duration::days(1))?;
    naive.checked_add_signed(Duration::days(2))?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => {
            for minutes in 1..=MAX_GAP_MINUTES {
                let shifted = naive.checked_add_signed(Duration::minutes(minutes))?;
                if let Some(t) = tz.from_local_datetime(&shifted).earliest() {
                    return Some(t);
                }
            }
            Some(tz.from_utc_datetime(&naive))
        }
    }
}

/// Next `weekday` at `time` strictly after `now`.
pub fn next_weekly(now: DateTime<Tz>, weekday: Weekday, time: NaiveTime) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    let days_until =
        (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    let date = today.checked_add_days(Days::new(u64::from(days_until)))?;

    let candidate = resolve_local(&tz, date.and_time(time))?;
    if candidate > now {
        return Some(candidate);
    }
    resolve_local(&tz, date.checked_add_days(Days::new(7))?.and_time(time))
}

/// Next `day` of a month at `time` strictly after `now`. `None` when `day`
/// does not exist in the month, which config validation rules out.
pub fn next_monthly(now: DateTime<Tz>, day: u32, time: NaiveTime) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    let date = NaiveDate::from_ymd_opt(today.year(), today.month(), day)?;

    let candidate = resolve_local(&tz, date.and_time(time))?;
    if candidate > now {
        return Some(candidate);
    }
    let next = date.checked_add_months(Months::new(1))?;
    resolve_local(&tz, next.and_time(time))
}

/// First day of the period a playlist fired on `fire_date` covers.
pub fn playlist_start(kind: PlaylistKind, fire_date: NaiveDate) -> Option<NaiveDate> {
    match kind {
        PlaylistKind::Weekly => fire_date.checked_sub_days(Days::new(7)),
        PlaylistKind::Monthly => fire_date
            .with_day(1)?
            .checked_sub_months(Months::new(1)),
        PlaylistKind::Custom => None,
    }
}

/// Run `job` every `period`, starting one period from now.
pub async fn run_every<F, Fut>(
    name: &'static str,
    period: std::time::Duration,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(job = name, "Scheduler stopped");
                return;
            }
            _ = tick.tick() => {}
        }
        job().await;
    }
}

/// Run `job` at each instant produced by `next_fire`.
///
/// `next_fire` gets the later of the current time and the previous fire
/// time, so a clock running slightly behind never fires the same moment twice.
pub async fn run_at<N, F, Fut>(
    name: &'static str,
    tz: Tz,
    cancel: CancellationToken,
    mut next_fire: N,
    mut job: F,
) where
    N: FnMut(DateTime<Tz>) -> Option<DateTime<Tz>>,
    F: FnMut(DateTime<Tz>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut last_fire: Option<DateTime<Tz>> = None;

    loop {
        let now = Utc::now().with_timezone(&tz);
        let from = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(fire_at) = next_fire(from) else {
            tracing::error!(job = name, "Could not compute next run, scheduler stopped");
            return;
        };

        let wait = (fire_at - now).to_std().unwrap_or_default();
        tracing::info!(job = name, fire_at = %fire_at, "Next run scheduled");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(job = name, "Scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        job(fire_at).await;
        last_fire = Some(fire_at);
    }
}

async fn run_sweep(orchestrator: &BatchOrchestrator, sweep: Sweep) {
    match orchestrator.run(&sweep).await {
        Ok(report) => tracing::info!(
            sweep = %sweep,
            users = report.users,
            skipped = report.skipped,
            "Sweep finished"
        ),
        Err(e) => tracing::error!(sweep = %sweep, error = %e, "Sweep failed"),
    }
}

fn minutes(n: u64) -> std::time::Duration {
    std::time::Duration::from_secs(n.saturating_mul(60))
}

/// Spawn every enabled scheduler. The handles finish after `cancel` fires.
pub fn spawn_schedulers(
    orchestrator: Arc<BatchOrchestrator>,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let tz = config.tz()?;
    let mut handles = Vec::new();

    tracing::info!(
        token_refresh_minutes = config.token_refresh_minutes,
        track_sync_minutes = config.track_sync_minutes,
        timezone = %tz,
        "Starting schedulers"
    );

    let orch = orchestrator.clone();
    handles.push(tokio::spawn(run_every(
        "spotify-token-refresh",
        minutes(config.token_refresh_minutes),
        cancel.clone(),
        move || {
            let orch = orch.clone();
            async move { run_sweep(&orch, Sweep::RefreshSpotifyTokens).await }
        },
    )));

    let orch = orchestrator.clone();
    handles.push(tokio::spawn(run_every(
        "spotify-track-sync",
        minutes(config.track_sync_minutes),
        cancel.clone(),
        move || {
            let orch = orch.clone();
            async move { run_sweep(&orch, Sweep::SyncSpotifyTracks).await }
        },
    )));

    if config.weekly.enabled {
        let weekday = config.weekly.weekday;
        let time = config.weekly.time()?;
        handles.push(spawn_playlist_trigger(
            "weekly-playlists",
            PlaylistKind::Weekly,
            tz,
            orchestrator.clone(),
            cancel.clone(),
            move |now| next_weekly(now, weekday, time),
        ));
    }

    if config.monthly.enabled {
        let day = config.monthly.day;
        let time = config.monthly.time()?;
        handles.push(spawn_playlist_trigger(
            "monthly-playlists",
            PlaylistKind::Monthly,
            tz,
            orchestrator,
            cancel,
            move |now| next_monthly(now, day, time),
        ));
    }

    Ok(handles)
}

fn spawn_playlist_trigger<N>(
    name: &'static str,
    kind: PlaylistKind,
    tz: Tz,
    orchestrator: Arc<BatchOrchestrator>,
    cancel: CancellationToken,
    next_fire: N,
) -> JoinHandle<()>
where
    N: FnMut(DateTime<Tz>) -> Option<DateTime<Tz>> + Send + 'static,
{
    tokio::spawn(run_at(name, tz, cancel, next_fire, move |fire_at| {
        let orchestrator = orchestrator.clone();
        async move {
            let Some(start_date) = playlist_start(kind, fire_at.date_naive()) else {
                tracing::error!(job = name, fire_at = %fire_at, "No playlist period for fire date");
                return;
            };
            run_sweep(&orchestrator, Sweep::CreatePlaylists { kind, start_date }).await
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn five_pm() -> NaiveTime {
        NaiveTime::from_hms_opt(17, 0, 0).unwrap()
    }

    #[test]
    fn test_next_weekly_later_this_week() {
        // Wednesday
        let now = ny(2024, 10, 2, 9, 0);
        assert_eq!(
            next_weekly(now, Weekday::Fri, five_pm()),
            Some(ny(2024, 10, 4, 17, 0))
        );
    }

    #[test]
    fn test_next_weekly_hour_either_side_of_trigger() {
        // Friday 16:00 fires the same day
        let hour_before = ny(2024, 10, 4, 16, 0);
        assert_eq!(
            next_weekly(hour_before, Weekday::Fri, five_pm()),
            Some(ny(2024, 10, 4, 17, 0))
        );

        // Friday 18:00 waits a week
        let hour_after = ny(2024, 10, 4, 18, 0);
        assert_eq!(
            next_weekly(hour_after, Weekday::Fri, five_pm()),
            Some(ny(2024, 10, 11, 17, 0))
        );
    }

    #[test]
    fn test_next_weekly_same_day_before_and_after() {
        let friday_morning = ny(2024, 10, 4, 9, 0);
        assert_eq!(
            next_weekly(friday_morning, Weekday::Fri, five_pm()),
            Some(ny(2024, 10, 4, 17, 0))
        );

        // At or after the target rolls to next week
        let at_target = ny(2024, 10, 4, 17, 0);
        assert_eq!(
            next_weekly(at_target, Weekday::Fri, five_pm()),
            Some(ny(2024, 10, 11, 17, 0))
        );
        let one_second_before = at_target - Duration::seconds(1);
        assert_eq!(
            next_weekly(one_second_before, Weekday::Fri, five_pm()),
            Some(at_target)
        );
    }

    #[test]
    fn test_next_weekly_across_dst_change() {
        // Clocks fall back on Sunday 2024-11-03
        let now = ny(2024, 11, 1, 18, 0);
        let next = next_weekly(now, Weekday::Fri, five_pm()).unwrap();
        assert_eq!(next, ny(2024, 11, 8, 17, 0));
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 11, 8, 22, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_monthly() {
        let now = ny(2024, 10, 15, 12, 0);
        assert_eq!(next_monthly(now, 1, five_pm()), Some(ny(2024, 11, 1, 17, 0)));

        let first_morning = ny(2024, 11, 1, 8, 0);
        assert_eq!(
            next_monthly(first_morning, 1, five_pm()),
            Some(ny(2024, 11, 1, 17, 0))
        );

        let december = ny(2024, 12, 20, 8, 0);
        assert_eq!(next_monthly(december, 1, five_pm()), Some(ny(2025, 1, 1, 17, 0)));
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        // 02:30 does not exist on 2024-03-10 in New York
        let naive = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let resolved = resolve_local(&New_York, naive);
        assert_eq!(resolved, Some(ny(2024, 3, 10, 3, 0)));
    }

    #[test]
    fn test_ambiguous_time_takes_earliest() {
        // 01:30 happens twice on 2024-11-03
        let naive = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let resolved = resolve_local(&New_York, naive).unwrap();
        assert_eq!(
            resolved.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_resolve_local_at_edge_of_date_range() {
        assert_eq!(resolve_local(&New_York, NaiveDate::MAX.and_time(NaiveTime::MIN)), None);
        assert_eq!(resolve_local(&New_York, NaiveDate::MIN.and_time(NaiveTime::MIN)), None);
        assert_eq!(playlist_start(PlaylistKind::Weekly, NaiveDate::MIN), None);
    }

    #[test]
    fn test_playlist_start() {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(
            playlist_start(PlaylistKind::Weekly, date(2024, 10, 11)),
            Some(date(2024, 10, 4))
        );
        assert_eq!(
            playlist_start(PlaylistKind::Monthly, date(2024, 11, 1)),
            Some(date(2024, 10, 1))
        );
        assert_eq!(
            playlist_start(PlaylistKind::Monthly, date(2025, 1, 1)),
            Some(date(2024, 12, 1))
        );
        assert_eq!(playlist_start(PlaylistKind::Custom, date(2025, 1, 1)), None);
    }

    #[test]
    fn test_interval_minutes_saturate() {
        assert_eq!(minutes(10), std::time::Duration::from_secs(600));
        assert_eq!(
            minutes(u64::MAX),
            std::time::Duration::from_secs(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_run_every_repeats_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        let handle = tokio::spawn(run_every(
            "test",
            std::time::Duration::from_millis(10),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {} runs", seen);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_run_every_waits_one_period_first() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        let handle = tokio::spawn(run_every(
            "test",
            std::time::Duration::from_secs(3600),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_at_fires_and_stops_promptly() {
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let log = fired.clone();
        let handle = tokio::spawn(run_at(
            "test",
            New_York,
            cancel.clone(),
            |from: DateTime<Tz>| Some(from + Duration::milliseconds(15)),
            move |fire_at| {
                let log = log.clone();
                async move {
                    log.lock().push(fire_at);
                }
            },
        ));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let fired = fired.lock();
        assert!(fired.len() >= 2);
        assert!(fired.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_run_at_cancelled_while_sleeping() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_at(
            "test",
            New_York,
            cancel.clone(),
            |from: DateTime<Tz>| Some(from + Duration::days(6)),
            |_| async {},
        ));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
