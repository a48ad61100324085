//! Daily housekeeping.
//!
//! Two jobs run on fixed local times of day: stale detection flags
//! devices that stopped writing (it never deletes anything), and
//! orphan cleanup drops index entries whose twin records are gone.
//! The schedule strings use the six-field cron form from the
//! configuration; only the fixed `sec min hour * * *` subset is
//! recognized, which is all the defaults use.

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use std::convert::Infallible;
use tokio::{task::JoinHandle, time};
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;
use twin_api::{service, types::Error, Result};

/// A fixed local time of day, parsed from a `sec min hour * * *`
/// cron string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    sec: u32,
    min: u32,
    hour: u32,
}

impl Schedule {
    pub fn parse(s: &str) -> Result<Schedule> {
        let fields: Vec<&str> = s.split_whitespace().collect();

        let &[sec, min, hour, dom, month, dow] = fields.as_slice() else {
            return Err(Error::ConfigError(format!(
                "'{}' doesn't have six cron fields",
                s
            )));
        };

        if dom != "*" || month != "*" || dow != "*" {
            return Err(Error::ConfigError(format!(
                "'{}': only daily schedules ('sec min hour * * *') are \
		 recognized",
                s
            )));
        }

        let parse_field = |v: &str, max: u32, what: &str| {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n <= max)
                .ok_or_else(|| {
                    Error::ConfigError(format!(
                        "'{}' is not a valid {} field",
                        v, what
                    ))
                })
        };

        Ok(Schedule {
            sec: parse_field(sec, 59, "seconds")?,
            min: parse_field(min, 59, "minutes")?,
            hour: parse_field(hour, 23, "hours")?,
        })
    }

    /// The next local instant the schedule fires strictly after
    /// `now`. A time that doesn't exist on a given day (DST gap) is
    /// skipped to the next day.
    pub fn next_after(&self, now: DateTime<Local>) -> DateTime<Local> {
        let mut date = now.date_naive();

        loop {
            if let Some(naive) =
                date.and_hms_opt(self.hour, self.min, self.sec)
            {
                if let Some(at) =
                    Local.from_local_datetime(&naive).earliest()
                {
                    if at > now {
                        return at;
                    }
                }
            }

            date = match date.succ_opt() {
                Some(d) => d,
                None => return now + TimeDelta::days(1),
            }
        }
    }
}

async fn sleep_until_next(schedule: &Schedule) {
    let now = Local::now();
    let at = schedule.next_after(now);
    let wait = (at - now).to_std().unwrap_or_default();

    time::sleep(wait).await
}

// One stale-detection pass. Returns how many devices were flagged.

async fn scan_stale(
    chan: &service::RequestChan,
    threshold: TimeDelta,
) -> Result<usize> {
    let now = Utc::now();
    let mut stale = 0;

    for id in chan.indexed_devices().await? {
        match chan.last_activity(id.clone()).await? {
            Some(at) if now - at > threshold => {
                warn!(
                    "device {} has been silent since {}",
                    &id,
                    at.to_rfc3339()
                );
                stale += 1
            }
            _ => (),
        }
    }
    Ok(stale)
}

// One orphan-cleanup pass. Returns how many index entries were
// removed.

async fn clean_orphans(chan: &service::RequestChan) -> Result<usize> {
    let mut removed = 0;

    for id in chan.indexed_devices().await? {
        if chan.snapshot(id.clone()).await?.is_empty() {
            info!("dropping orphaned index entry {}", &id);
            chan.remove_from_index(id).await?;
            removed += 1
        }
    }
    Ok(removed)
}

/// Starts the daily stale-detection job. Flagged devices are only
/// reported; nothing is ever deleted on the operator's behalf.
pub fn start_stale_detection(
    schedule: Schedule,
    threshold_days: i64,
    chan: service::RequestChan,
) -> JoinHandle<Result<Infallible>> {
    let threshold = TimeDelta::days(threshold_days);

    tokio::spawn(
        async move {
            info!("starting");
            loop {
                sleep_until_next(&schedule).await;

                match scan_stale(&chan, threshold).await {
                    Ok(0) => info!("no stale devices"),
                    Ok(n) => warn!("{} stale devices", n),
                    Err(e) => warn!("scan failed: {}", &e),
                }
            }
        }
        .instrument(info_span!("stale")),
    )
}

/// Starts the daily orphan-cleanup job.
pub fn start_orphan_cleanup(
    schedule: Schedule,
    chan: service::RequestChan,
) -> JoinHandle<Result<Infallible>> {
    tokio::spawn(
        async move {
            info!("starting");
            loop {
                sleep_until_next(&schedule).await;

                match clean_orphans(&chan).await {
                    Ok(n) => info!("removed {} orphaned entries", n),
                    Err(e) => warn!("cleanup failed: {}", &e),
                }
            }
        }
        .instrument(info_span!("orphans")),
    )
}
