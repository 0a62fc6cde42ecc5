//! Progress callback handed to the processing module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use transcode_worker_types::Response;

use super::sink::ResponseSink;

/// Overall total used when a request is split into stages.
pub const STAGE_TOTAL: u64 = 100;

/// Stands for "nothing reported yet".
const NO_POSITION: u64 = u64::MAX;

/// Sends a `Progress` response for every report, right away.
///
/// Repeated reports of the same position are dropped unless dedupe is turned
/// off; modules tend to report the same position many times in tight loops.
/// Clones, and the stages made from them, share the last reported position,
/// so a stage that starts where the previous one ended does not repeat it.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ResponseSink>,
    last_position: Arc<AtomicU64>,
    dedupe: bool,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = self.last_position.load(Ordering::Relaxed);
        f.debug_struct("ProgressReporter")
            .field("last_position", &(last != NO_POSITION).then_some(last))
            .field("dedupe", &self.dedupe)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            sink,
            last_position: Arc::new(AtomicU64::new(NO_POSITION)),
            dedupe: true,
        }
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn report(&self, current: u64, total: u64) {
        let previous = self.last_position.swap(current, Ordering::AcqRel);
        if self.dedupe && previous == current {
            return;
        }
        self.sink.post(Response::progress(current, total));
    }

    /// Reporter for one stage of a longer job. The stage's own
    /// `(current, total)` lands in `from..=to` of [`STAGE_TOTAL`].
    pub fn stage(&self, from: u64, to: u64) -> StageProgress {
        StageProgress {
            overall: self.clone(),
            from,
            to: to.max(from),
        }
    }
}

/// See [`ProgressReporter::stage`].
#[derive(Debug, Clone)]
pub struct StageProgress {
    overall: ProgressReporter,
    from: u64,
    to: u64,
}

impl StageProgress {
    pub fn report(&self, current: u64, total: u64) {
        let position = if total == 0 {
            self.from
        } else {
            let span = self.to - self.from;
            self.from
                .saturating_add(current.saturating_mul(span) / total)
        };
        self.overall.report(position, STAGE_TOTAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn reporter() -> (ProgressReporter, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressReporter::new(Arc::new(tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Response>) -> Vec<(u64, u64)> {
        let mut events = Vec::new();
        while let Ok(response) = rx.try_recv() {
            match response {
                Response::Progress(event) => events.push((event.current, event.total)),
                other => panic!("unexpected response {other:?}"),
            }
        }
        events
    }

    #[test]
    fn test_reports_in_order() {
        let (progress, mut rx) = reporter();
        progress.report(1, 2);
        progress.report(2, 2);
        assert_eq!(drain(&mut rx), vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_repeated_position_is_dropped() {
        let (progress, mut rx) = reporter();
        progress.report(5, 10);
        progress.report(5, 10);
        progress.report(6, 10);
        progress.report(5, 10);
        assert_eq!(drain(&mut rx), vec![(5, 10), (6, 10), (5, 10)]);
    }

    #[test]
    fn test_dedupe_can_be_disabled() {
        let (progress, mut rx) = reporter();
        let progress = progress.with_dedupe(false);
        progress.report(3, 4);
        progress.report(3, 4);
        assert_eq!(drain(&mut rx), vec![(3, 4), (3, 4)]);
    }

    #[test]
    fn test_stage_maps_into_range() {
        let (progress, mut rx) = reporter();
        let decode = progress.stage(0, 33);
        decode.report(0, 10);
        decode.report(5, 10);
        decode.report(10, 10);
        let resample = progress.stage(34, 67);
        resample.report(1, 2);
        assert_eq!(
            drain(&mut rx),
            vec![(0, 100), (16, 100), (33, 100), (50, 100)]
        );
    }

    #[test]
    fn test_next_stage_does_not_repeat_boundary() {
        let (progress, mut rx) = reporter();
        progress.stage(0, 33).report(1, 1);
        let encode = progress.stage(33, 100);
        encode.report(0, 4);
        encode.report(2, 4);
        // Reports through the parent see the stage's position too.
        progress.report(66, STAGE_TOTAL);
        assert_eq!(drain(&mut rx), vec![(33, 100), (66, 100)]);
    }

    #[test]
    fn test_stage_with_zero_total_reports_start() {
        let (progress, mut rx) = reporter();
        progress.stage(68, 85).report(3, 0);
        assert_eq!(drain(&mut rx), vec![(68, 100)]);
    }
}
