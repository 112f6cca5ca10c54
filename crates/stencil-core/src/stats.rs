// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Run Statistics
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Work and timing counters accumulated by the run loop.

/// Counters for one pack or for the whole run.
#[derive(Clone, Debug, Default)]
pub struct WorkStats {
    pub num_steps: i64,
    pub num_points: i64,
    pub num_reads: i64,
    pub num_writes: i64,
    pub num_fp_ops: i64,
    pub run_secs: f64,
}

impl WorkStats {
    pub fn reads_per_sec(&self) -> f64 {
        rate(self.num_reads, self.run_secs)
    }
    pub fn writes_per_sec(&self) -> f64 {
        rate(self.num_writes, self.run_secs)
    }
    pub fn flops(&self) -> f64 {
        rate(self.num_fp_ops, self.run_secs)
    }
    pub fn points_per_sec(&self) -> f64 {
        rate(self.num_points * self.num_steps, self.run_secs)
    }
}

fn rate(n: i64, secs: f64) -> f64 {
    if secs > 0.0 {
        n as f64 / secs
    } else {
        0.0
    }
}

/// Snapshot returned by the context after stepping.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub overall: WorkStats,
    pub per_pack: Vec<(String, WorkStats)>,
    pub halo_secs: f64,
    pub wait_secs: f64,
    pub exterior_secs: f64,
    pub interior_secs: f64,
}

impl Stats {
    /// Multi-line human-readable report, one metric per line.
    pub fn summary(&self) -> String {
        let o = &self.overall;
        let compute = self.exterior_secs + self.interior_secs;
        let other = (o.run_secs - compute - self.halo_secs).max(0.0);
        let mut out = String::new();
        out.push_str(&format!("num-steps-done:           {}\n", o.num_steps));
        out.push_str(&format!("num-points-per-step:      {}\n", o.num_points));
        out.push_str(&format!("num-reads:                {}\n", o.num_reads));
        out.push_str(&format!("num-writes:               {}\n", o.num_writes));
        out.push_str(&format!("num-est-fp-ops:           {}\n", o.num_fp_ops));
        out.push_str(&format!("elapsed-time (sec):       {:.6}\n", o.run_secs));
        out.push_str(&format!("  compute (sec):          {:.6}\n", compute));
        out.push_str(&format!("    rank-exterior (sec):  {:.6}\n", self.exterior_secs));
        out.push_str(&format!("    rank-interior (sec):  {:.6}\n", self.interior_secs));
        out.push_str(&format!("  halo exchange (sec):    {:.6}\n", self.halo_secs));
        out.push_str(&format!("    transport waits (sec): {:.6}\n", self.wait_secs));
        out.push_str(&format!("  other (sec):            {:.6}\n", other));
        out.push_str(&format!("throughput (pts/sec):     {:.3e}\n", o.points_per_sec()));
        for (name, ps) in &self.per_pack {
            out.push_str(&format!(
                "pack '{name}': steps {}, reads {}, writes {}, est-fp-ops {}, secs {:.6}\n",
                ps.num_steps, ps.num_reads, ps.num_writes, ps.num_fp_ops, ps.run_secs
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_guard_zero_time() {
        let w = WorkStats {
            num_steps: 2,
            num_points: 100,
            num_reads: 500,
            num_writes: 200,
            num_fp_ops: 900,
            run_secs: 0.0,
        };
        assert_eq!(w.reads_per_sec(), 0.0);
        assert_eq!(w.points_per_sec(), 0.0);
    }

    #[test]
    fn test_summary_contains_pack_lines() {
        let mut s = Stats::default();
        s.overall.num_steps = 4;
        s.per_pack
            .push(("main".to_string(), WorkStats::default()));
        let text = s.summary();
        assert!(text.contains("num-steps-done:           4"));
        assert!(text.contains("pack 'main'"));
    }
}
