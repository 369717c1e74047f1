//! Market session gating
//!
//! Trading days and open/close times are local to a fixed UTC offset.
//! A close time earlier than the open time spans midnight.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, TimeZone, Utc, Weekday};

use crate::config::{parse_session_time, SessionConfig};

#[derive(Debug, Clone)]
pub struct MarketSession {
    always_open: bool,
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    days: Vec<Weekday>,
}

impl MarketSession {
    pub fn always_open() -> Self {
        Self {
            always_open: true,
            offset: Utc.fix(),
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            days: Vec::new(),
        }
    }

    pub fn from_config(cfg: &SessionConfig) -> Result<Self> {
        if cfg.always_open {
            return Ok(Self::always_open());
        }
        let offset = FixedOffset::east_opt(cfg.utc_offset_minutes * 60)
            .with_context(|| format!("Invalid UTC offset: {} minutes", cfg.utc_offset_minutes))?;
        let mut days = Vec::with_capacity(cfg.trading_days.len());
        for day in &cfg.trading_days {
            let weekday: Weekday = day
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid trading day: {}", day))?;
            days.push(weekday);
        }
        if days.is_empty() {
            bail!("session.trading_days must not be empty when the session is gated");
        }
        Ok(Self {
            always_open: false,
            offset,
            open: parse_session_time(&cfg.open_time)?,
            close: parse_session_time(&cfg.close_time)?,
            days,
        })
    }

    pub fn is_always_open(&self) -> bool {
        self.always_open
    }

    /// Whether scanning is allowed at `now_ms`
    pub fn is_open(&self, now_ms: i64) -> bool {
        if self.always_open {
            return true;
        }
        let Some(local) = self.local_time(now_ms) else {
            return false;
        };
        let time = local.time();
        if self.open <= self.close {
            self.days.contains(&local.weekday()) && time >= self.open && time < self.close
        } else {
            // Overnight session: the part after midnight belongs to the previous day
            if time >= self.open {
                self.days.contains(&local.weekday())
            } else if time < self.close {
                self.days.contains(&local.weekday().pred())
            } else {
                false
            }
        }
    }

    fn local_time(&self, now_ms: i64) -> Option<DateTime<FixedOffset>> {
        self.offset.timestamp_millis_opt(now_ms).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekday_session() -> MarketSession {
        MarketSession::from_config(&SessionConfig {
            always_open: false,
            utc_offset_minutes: -5 * 60,
            open_time: "09:30".into(),
            close_time: "16:00".into(),
            trading_days: vec!["Mon".into(), "Tue".into(), "Wed".into(), "Thu".into(), "Fri".into()],
        })
        .unwrap()
    }

    // 2024-01-03 is a Wednesday
    fn utc_ms(day: u32, hour: u32, minute: u32) -> i64 {
        chrono::Utc
            .with_ymd_and_hms(2024, 1, day, hour, minute, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn gated_by_local_hours() {
        let session = weekday_session();
        // 14:29 UTC = 09:29 local
        assert!(!session.is_open(utc_ms(3, 14, 29)));
        assert!(session.is_open(utc_ms(3, 14, 30)));
        assert!(session.is_open(utc_ms(3, 20, 59)));
        assert!(!session.is_open(utc_ms(3, 21, 0)));
    }

    #[test]
    fn closed_on_weekends() {
        let session = weekday_session();
        // Saturday 2024-01-06
        assert!(!session.is_open(utc_ms(6, 15, 0)));
        assert!(MarketSession::always_open().is_open(utc_ms(6, 15, 0)));
    }

    #[test]
    fn overnight_session_wraps_midnight() {
        let session = MarketSession::from_config(&SessionConfig {
            always_open: false,
            utc_offset_minutes: 0,
            open_time: "22:00".into(),
            close_time: "02:00".into(),
            trading_days: vec!["Fri".into()],
        })
        .unwrap();
        // Friday 2024-01-05 23:00 and Saturday 01:00 belong to Friday's session
        assert!(session.is_open(utc_ms(5, 23, 0)));
        assert!(session.is_open(utc_ms(6, 1, 0)));
        assert!(!session.is_open(utc_ms(6, 3, 0)));
        assert!(!session.is_open(utc_ms(4, 23, 0)));
    }

    #[test]
    fn rejects_bad_days() {
        let err = MarketSession::from_config(&SessionConfig {
            always_open: false,
            utc_offset_minutes: 0,
            open_time: "09:00".into(),
            close_time: "17:00".into(),
            trading_days: vec!["Funday".into()],
        });
        assert!(err.is_err());
    }
}
