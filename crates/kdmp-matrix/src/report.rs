#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    pub quiet: bool,
}

impl Reporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn progress(&self, msg: &str) {
        if self.quiet {
            return;
        }
        eprintln!("{msg}");
    }
}
