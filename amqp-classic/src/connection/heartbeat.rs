//! Outgoing heartbeat timer
//!
//! The interval comes from `connection.tune`. Before tuning, or when the
//! broker and client agreed on no heartbeats, the timer stays silent.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    /// Yields once per negotiated heartbeat interval
    #[derive(Debug)]
    pub struct HeartBeat {
        period: Option<Duration>,
        #[pin]
        ticks: Option<IntervalStream>,
    }
}

impl HeartBeat {
    /// A timer that never fires
    pub fn never() -> Self {
        Self {
            period: None,
            ticks: None,
        }
    }

    /// Fires one `period` from now and then every `period`. A zero or
    /// missing period gives [`HeartBeat::never`].
    pub fn from_period(period: Option<Duration>) -> Self {
        let period = match period {
            Some(period) if !period.is_zero() => period,
            _ => return Self::never(),
        };
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        // A stalled engine sends one heartbeat, not a burst
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            period: Some(period),
            ticks: Some(IntervalStream::new(interval)),
        }
    }

    /// The interval in use, `None` when heartbeats are off
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl Stream for HeartBeat {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.project().ticks.as_pin_mut() {
            Some(ticks) => ticks.poll_next(cx),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::HeartBeat;

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_one_period_away() {
        let start = tokio::time::Instant::now();
        let mut heartbeat = HeartBeat::from_period(Some(Duration::from_secs(5)));
        assert_eq!(heartbeat.period(), Some(Duration::from_secs(5)));
        let tick = heartbeat.next().await.unwrap();
        assert_eq!(tick - start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_never_ticks() {
        let mut heartbeat = HeartBeat::from_period(Some(Duration::ZERO));
        assert_eq!(heartbeat.period(), None);
        let outcome = tokio::time::timeout(Duration::from_secs(60), heartbeat.next()).await;
        assert!(outcome.is_err());
    }
}
