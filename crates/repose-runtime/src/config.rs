use web_time::Duration;

/// Tuning knobs for a [`Recomposer`](crate::Recomposer).
#[derive(Clone, Debug)]
pub struct RecomposerConfig {
    /// Catch panics raised by composable bodies and turn them into
    /// [`ComposeError::Panicked`](crate::ComposeError::Panicked). When off,
    /// the panic unwinds out of the drain.
    pub catch_panics: bool,
    /// Drains slower than this are logged at `warn` level.
    pub slow_drain_threshold: Duration,
}

impl Default for RecomposerConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            slow_drain_threshold: Duration::from_millis(16),
        }
    }
}
