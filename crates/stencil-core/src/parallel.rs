// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Concurrency Primitives
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Nested parallel-for over a strided range and monotonic timers.
//!
//! The loop body receives `(start, stop, flat_worker_id)`. Chunking is
//! deterministic (`div_equally_*`), so worker ids are stable for a given
//! range and thread configuration; scratch vars are keyed by them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use stencil_types::error::StencilResult;
use stencil_types::idx::{ceil_div, div_equally_cumu_size_n};

/// Two-level thread budget: `outer` workers each running `inner` workers.
#[derive(Clone, Copy, Debug)]
pub struct ThreadCounts {
    pub outer: usize,
    pub inner: usize,
}

impl ThreadCounts {
    pub fn flat(n: usize) -> Self {
        ThreadCounts {
            outer: n.max(1),
            inner: 1,
        }
    }

    pub fn total(&self) -> usize {
        self.outer.max(1) * self.inner.max(1)
    }
}

/// Run `body(start, stop, worker)` over `[begin, end)` by `stride`.
///
/// Flat mode is chosen when the inner level is not configured or when
/// there are no more iterations than outer workers; otherwise the range
/// is split equally across outer workers, and each outer worker splits
/// its share across inner workers. The flat worker id is
/// `outer * inner_count + inner`. The call returns only after every
/// chunk has finished (a join barrier), propagating the first error.
pub fn parallel_for<F>(
    counts: ThreadCounts,
    begin: i64,
    end: i64,
    stride: i64,
    body: &F,
) -> StencilResult<()>
where
    F: Fn(i64, i64, usize) -> StencilResult<()> + Sync,
{
    if end <= begin {
        return Ok(());
    }
    debug_assert!(stride > 0);
    let niter = ceil_div(end - begin, stride);
    if niter == 1 {
        return body(begin, end, 0);
    }

    let nthr0 = counts.outer.max(1) as i64;
    let nthr1 = counts.inner.max(1) as i64;
    let nested = nthr1 > 1 && niter > nthr0;

    let first_err: Mutex<Option<stencil_types::error::StencilError>> = Mutex::new(None);
    let record = |e| {
        let mut slot = first_err.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(e);
        }
    };

    if !nested {
        // One level: split iterations equally across the whole budget.
        let nthr = (nthr0 * nthr1).min(niter);
        rayon::scope(|s| {
            for w in 0..nthr {
                let record = &record;
                s.spawn(move |_| {
                    let tbegin = begin + div_equally_cumu_size_n(niter, nthr, w - 1) * stride;
                    let tend = begin + div_equally_cumu_size_n(niter, nthr, w) * stride;
                    let tend = tend.min(end);
                    let mut i = tbegin;
                    while i < tend {
                        let stop = (i + stride).min(tend);
                        if let Err(e) = body(i, stop, w as usize) {
                            record(e);
                            return;
                        }
                        i += stride;
                    }
                });
            }
        });
    } else {
        rayon::scope(|s| {
            for w0 in 0..nthr0 {
                let record = &record;
                s.spawn(move |_| {
                    let obegin = begin + div_equally_cumu_size_n(niter, nthr0, w0 - 1) * stride;
                    let oend =
                        (begin + div_equally_cumu_size_n(niter, nthr0, w0) * stride).min(end);
                    if oend <= obegin {
                        return;
                    }
                    let oiter = ceil_div(oend - obegin, stride);
                    rayon::scope(|s1| {
                        for w1 in 0..nthr1.min(oiter) {
                            s1.spawn(move |_| {
                                let ibegin = obegin
                                    + div_equally_cumu_size_n(oiter, nthr1.min(oiter), w1 - 1)
                                        * stride;
                                let iend = (obegin
                                    + div_equally_cumu_size_n(oiter, nthr1.min(oiter), w1)
                                        * stride)
                                    .min(oend);
                                let worker = (w0 * nthr1 + w1) as usize;
                                let mut i = ibegin;
                                while i < iend {
                                    let stop = (i + stride).min(iend);
                                    if let Err(e) = body(i, stop, worker) {
                                        record(e);
                                        return;
                                    }
                                    i += stride;
                                }
                            });
                        }
                    });
                });
            }
        });
    }

    match first_err.into_inner().unwrap_or_else(|p| p.into_inner()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Accumulating monotonic wall-clock timer with nanosecond resolution.
/// `start`/`stop` may be called in pairs to accumulate; `elapsed_secs`
/// is non-destructive.
#[derive(Debug, Default)]
pub struct Timer {
    accumulated: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Timer::default()
    }

    pub fn start(&mut self) {
        debug_assert!(self.started.is_none(), "timer started twice");
        self.started = Some(Instant::now());
    }

    /// Stop and return the seconds of the interval just ended.
    pub fn stop(&mut self) -> f64 {
        match self.started.take() {
            Some(t0) => {
                let delta = t0.elapsed();
                self.accumulated += delta;
                delta.as_secs_f64()
            }
            None => 0.0,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let mut total = self.accumulated;
        if let Some(t0) = self.started {
            total += t0.elapsed();
        }
        total.as_secs_f64()
    }

    pub fn clear(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_parallel_for_covers_range_exactly_once() {
        let hits = AtomicI64::new(0);
        let sum = AtomicI64::new(0);
        parallel_for(ThreadCounts { outer: 3, inner: 2 }, 0, 100, 7, &|start,
                                                                        stop,
                                                                        _w| {
            for i in start..stop {
                hits.fetch_add(1, Ordering::Relaxed);
                sum.fetch_add(i, Ordering::Relaxed);
            }
            Ok(())
        })
        .expect("parallel_for");
        assert_eq!(hits.load(Ordering::Relaxed), 100);
        assert_eq!(sum.load(Ordering::Relaxed), (0..100).sum::<i64>());
    }

    #[test]
    fn test_parallel_for_chunks_follow_stride() {
        let spans = StdMutex::new(Vec::new());
        parallel_for(ThreadCounts::flat(4), 3, 20, 5, &|start, stop, w| {
            spans
                .lock()
                .expect("spans lock")
                .push((start, stop, w));
            Ok(())
        })
        .expect("parallel_for");
        let mut spans = spans.into_inner().expect("spans");
        spans.sort();
        // Range 3..20 by 5: chunks at 3, 8, 13, 18.
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].0, 3);
        assert_eq!(spans[3], (18, 20, spans[3].2));
        for (start, stop, _) in &spans {
            assert!(stop - start <= 5);
        }
    }

    #[test]
    fn test_parallel_for_worker_ids_within_budget() {
        let counts = ThreadCounts { outer: 2, inner: 3 };
        let max_id = AtomicI64::new(-1);
        parallel_for(counts, 0, 64, 1, &|_, _, w| {
            max_id.fetch_max(w as i64, Ordering::Relaxed);
            Ok(())
        })
        .expect("parallel_for");
        assert!(max_id.load(Ordering::Relaxed) < counts.total() as i64);
    }

    #[test]
    fn test_parallel_for_propagates_error() {
        let err = parallel_for(ThreadCounts::flat(2), 0, 10, 1, &|start, _, _| {
            if start == 5 {
                Err(stencil_types::error::StencilError::InternalInvariant(
                    "boom".to_string(),
                ))
            } else {
                Ok(())
            }
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_range_is_noop() {
        parallel_for(ThreadCounts::flat(4), 5, 5, 1, &|_, _, _| {
            panic!("must not be called")
        })
        .expect("empty range");
    }

    #[test]
    fn test_timer_accumulates() {
        let mut t = Timer::new();
        t.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let d1 = t.stop();
        assert!(d1 > 0.0);
        t.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.stop();
        assert!(t.elapsed_secs() >= d1);
        t.clear();
        assert_eq!(t.elapsed_secs(), 0.0);
    }
}
