use std::fmt::Write as _;

use web_time::{Duration, Instant};

use repose_runtime::{Applier, Composition, DrainReport, ScopeFlags, ScopeId};

pub mod changes;

pub use changes::*;

pub struct Hud {
    pub inspector_enabled: bool,
    pub hovered: Option<ScopeId>,
    drain_count: u64,
    last_drain: Option<Instant>,
    drain_ms_smooth: f32,
    pub metrics: Option<Metrics>,
}

impl Default for Hud {
    fn default() -> Self {
        Self::new()
    }
}

impl Hud {
    pub fn new() -> Self {
        Self {
            inspector_enabled: false,
            hovered: None,
            drain_count: 0,
            last_drain: None,
            drain_ms_smooth: 0.0,
            metrics: None,
        }
    }
    pub fn toggle_inspector(&mut self) {
        self.inspector_enabled = !self.inspector_enabled;
    }
    pub fn set_hovered(&mut self, scope: Option<ScopeId>) {
        self.hovered = scope;
    }

    pub fn drain_count(&self) -> u64 {
        self.drain_count
    }

    /// Smoothed drain duration in milliseconds.
    pub fn drain_ms(&self) -> f32 {
        self.drain_ms_smooth
    }

    /// Time since the previous recorded drain.
    pub fn since_last_drain(&self) -> Option<Duration> {
        self.last_drain.map(|at| at.elapsed())
    }

    pub fn record(&mut self, report: &DrainReport) {
        self.drain_count += 1;
        self.last_drain = Some(Instant::now());
        let ms = report.duration.as_secs_f32() * 1000.0;
        // simple EMA
        let a = 0.2;
        self.drain_ms_smooth = if self.drain_count == 1 {
            ms
        } else {
            (1.0 - a) * self.drain_ms_smooth + a * ms
        };
        self.metrics = Some(Metrics::from(report));
    }

    /// One-line summary of the recorded drains.
    pub fn overlay(&self) -> String {
        let mut lines = vec![
            format!("drain: {}", self.drain_count),
            format!("avg: {:.2} ms", self.drain_ms_smooth),
        ];
        if let Some(m) = &self.metrics {
            lines.push(format!("recomposed: {}", m.recomposed));
            lines.push(format!("ops: {}", m.applier_ops));
            if m.deferred > 0 {
                lines.push(format!("deferred: {}", m.deferred));
            }
            if m.effect_failures > 0 {
                lines.push(format!("effect failures: {}", m.effect_failures));
            }
        }
        if let Some(scope) = self.hovered {
            lines.push(format!("scope: {:?}", scope));
        }
        lines.join("  |  ")
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    pub drain_ms: f32,
    pub recomposed: usize,
    pub deferred: usize,
    pub applier_ops: usize,
    pub effect_failures: usize,
}

impl From<&DrainReport> for Metrics {
    fn from(report: &DrainReport) -> Self {
        Self {
            drain_ms: report.duration.as_secs_f32() * 1000.0,
            recomposed: report.recomposed.len(),
            deferred: report.deferred.len(),
            applier_ops: report.applier_ops,
            effect_failures: report.effect_failures.len(),
        }
    }
}

pub struct Inspector {
    pub hud: Hud,
}
impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

impl Inspector {
    pub fn new() -> Self {
        Self { hud: Hud::new() }
    }

    /// Records `report` and returns the overlay text while the inspector is on.
    pub fn frame(&mut self, report: &DrainReport) -> Option<String> {
        self.hud.record(report);
        self.hud.inspector_enabled.then(|| self.hud.overlay())
    }

    /// The scope tree of `composition`, one scope per line, indented by depth.
    pub fn scope_tree<N, A>(&self, composition: &Composition<N, A>) -> String
    where
        N: Clone + PartialEq + 'static,
        A: Applier<N>,
    {
        let mut out = String::new();
        for scope in composition.preorder() {
            let mut depth = 0;
            let mut parent = composition.parent_of(scope);
            while let Some(p) = parent {
                depth += 1;
                parent = composition.parent_of(p);
            }
            let marker = if self.hud.hovered == Some(scope) { "> " } else { "" };
            let skippable = composition
                .scope_flags(scope)
                .is_some_and(|flags| flags.contains(ScopeFlags::SKIPPABLE));
            let _ = writeln!(
                out,
                "{}{}{:?} {:?} runs={} reads={}{}",
                "  ".repeat(depth),
                marker,
                scope,
                composition.scope_state(scope),
                composition.recompositions(scope).unwrap_or(0),
                composition.recomposer().reads_of(scope).len(),
                if skippable { " skippable" } else { "" },
            );
        }
        out
    }
}
