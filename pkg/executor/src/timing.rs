use pkg_types::job::PhaseTiming;
use std::time::Instant;

/// Records how long each executor phase took.
pub struct PhaseClock {
    started: Instant,
    last: Instant,
    phases: Vec<PhaseTiming>,
}

impl Default for PhaseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Close the current phase under `phase`; the next one starts now.
    pub fn mark(&mut self, phase: &str) {
        let now = Instant::now();
        self.phases.push(PhaseTiming {
            phase: phase.to_string(),
            ms: now.duration_since(self.last).as_millis() as u64,
        });
        self.last = now;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn phases(&self) -> &[PhaseTiming] {
        &self.phases
    }

    pub fn into_phases(self) -> Vec<PhaseTiming> {
        self.phases
    }
}
