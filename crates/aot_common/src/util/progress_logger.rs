pub trait ProgressLogger {
    type Session: ProgressSession;
    fn start_session(self, total_count: Option<usize>) -> Self::Session;
}

pub trait ProgressSession {
    fn update(&mut self, progress: usize);

    /// Replaces the status text shown next to the progress indicator.
    fn note(&mut self, _status: &str) {}

    fn finish(self);
}
