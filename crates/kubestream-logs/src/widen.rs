//! Exponential backward widening shared by range search and backfill
//!
//! Both searches repeat "query a window, judge whether that was enough, double
//! the step and move back in time". They differ only in how the window moves,
//! captured by [`Widening`], and in the sufficiency check, supplied as a
//! [`WindowProbe`].

use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::ops::ControlFlow;

/// How a window moves back after an insufficient probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Widening {
    /// Keep `to` and push `from` back; every probe re-reads the newer part
    Growing,
    /// Move the whole window back; every probe only reads older time
    Sliding,
}

/// A `[from, to)` window that grows backwards by a doubling step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackwardWindow {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    step: TimeDelta,
    mode: Widening,
}

impl BackwardWindow {
    /// `[from, to)` growing backwards, first step `max(to - from, min_step)`
    pub fn growing(from: DateTime<Utc>, to: DateTime<Utc>, min_step: TimeDelta) -> Self {
        Self {
            from,
            to,
            step: (to - from).max(min_step),
            mode: Widening::Growing,
        }
    }

    /// `[to - span, to)` sliding backwards with a doubling span
    pub fn sliding(to: DateTime<Utc>, span: TimeDelta) -> Self {
        Self {
            from: to.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC),
            to,
            step: span,
            mode: Widening::Sliding,
        }
    }

    pub fn from(&self) -> DateTime<Utc> {
        self.from
    }

    pub fn to(&self) -> DateTime<Utc> {
        self.to
    }

    pub fn step(&self) -> TimeDelta {
        self.step
    }

    /// Move back one step; false once the window cannot move any further
    pub fn widen(&mut self) -> bool {
        if self.from == DateTime::<Utc>::MIN_UTC {
            return false;
        }

        match self.mode {
            Widening::Growing => {
                self.from = back(self.from, self.step);
                self.step = double(self.step);
            }
            Widening::Sliding => {
                self.to = self.from;
                self.step = double(self.step);
                self.from = back(self.to, self.step);
            }
        }
        true
    }
}

fn back(at: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    at.checked_sub_signed(step).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn double(step: TimeDelta) -> TimeDelta {
    step.checked_mul(2).unwrap_or(TimeDelta::MAX)
}

/// One query of a backward search
pub trait WindowProbe {
    type Error;

    /// Query `[from, to)`; `Break` ends the search
    fn probe(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Future<Output = Result<ControlFlow<()>, Self::Error>> + Send;
}

/// Probe `window` until the probe breaks or time runs out
///
/// Returns the number of times the window was widened.
pub async fn widen_backward<P>(mut window: BackwardWindow, probe: &mut P) -> Result<usize, P::Error>
where
    P: WindowProbe + Send,
{
    let mut widenings = 0;
    loop {
        if probe.probe(window.from(), window.to()).await?.is_break() {
            return Ok(widenings);
        }
        if !window.widen() {
            return Ok(widenings);
        }
        widenings += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_growing_uses_minimum_step() {
        let mut window = BackwardWindow::growing(at(0), at(1), TimeDelta::seconds(3));
        assert_eq!(window.step(), TimeDelta::seconds(3));

        window.widen();
        assert_eq!((window.from(), window.to()), (at(-3), at(1)));
        window.widen();
        assert_eq!((window.from(), window.to()), (at(-9), at(1)));
    }

    #[test]
    fn test_sliding_windows_are_adjacent() {
        let mut window = BackwardWindow::sliding(at(0), TimeDelta::seconds(10));
        assert_eq!((window.from(), window.to()), (at(-10), at(0)));

        window.widen();
        assert_eq!((window.from(), window.to()), (at(-30), at(-10)));
        window.widen();
        assert_eq!((window.from(), window.to()), (at(-70), at(-30)));
    }

    #[test]
    fn test_saturates_at_min_time() {
        let mut window =
            BackwardWindow::growing(DateTime::<Utc>::MIN_UTC, at(0), TimeDelta::seconds(3));
        assert!(!window.widen());
    }

    struct CountingProbe {
        probes: usize,
        stop_after: usize,
    }

    impl WindowProbe for CountingProbe {
        type Error = std::convert::Infallible;

        async fn probe(
            &mut self,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<ControlFlow<()>, Self::Error> {
            self.probes += 1;
            if self.probes >= self.stop_after {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    #[tokio::test]
    async fn test_widen_backward_counts_widenings() {
        let mut probe = CountingProbe {
            probes: 0,
            stop_after: 4,
        };
        let window = BackwardWindow::growing(at(0), at(5), TimeDelta::seconds(3));
        let widenings = widen_backward(window, &mut probe).await.unwrap();
        assert_eq!(probe.probes, 4);
        assert_eq!(widenings, 3);
    }
}
