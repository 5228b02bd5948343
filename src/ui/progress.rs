use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::provider::ProgressSummary;
use crate::ui::icons::{BLOCKER, CHECK, CHECKPOINT, CROSS, PROGRESS, REGRESSION, SPARKLE, WARNING};

/// Terminal UI for a running session, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Task bar: done tasks out of the project total
/// - Turn bar: spinner with the current turn and what the driver is doing
pub struct SessionUi {
    multi: MultiProgress,
    task_bar: ProgressBar,
    turn_bar: ProgressBar,
    verbose: bool,
    turn: AtomicU32,
    max_turns: AtomicU32,
}

impl SessionUi {
    pub fn new(progress: &ProgressSummary, max_turns: u32, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let task_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let task_bar = multi.add(ProgressBar::new(progress.total as u64));
        task_bar.set_style(task_style);
        task_bar.set_prefix("Tasks");
        task_bar.set_position(progress.done as u64);

        let turn_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let turn_bar = multi.add(ProgressBar::new_spinner());
        turn_bar.set_style(turn_style);
        turn_bar.set_prefix(" Turn");

        Self {
            multi,
            task_bar,
            turn_bar,
            verbose,
            turn: AtomicU32::new(0),
            max_turns: AtomicU32::new(max_turns),
        }
    }

    /// Print via `MultiProgress`, falling back to stderr if the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn turn_label(&self) -> String {
        let max = self.max_turns.load(Ordering::SeqCst);
        let turn = self.turn.load(Ordering::SeqCst);
        if max == 0 {
            format!("{}", style(turn).cyan())
        } else {
            format!("{}/{}", style(turn).cyan(), max)
        }
    }

    pub fn start_turn(&self, turn: u32, task_id: &str, title: &str) {
        self.turn.store(turn, Ordering::SeqCst);
        self.task_bar
            .set_message(format!("{}: {}", style(task_id).yellow(), title));
        self.turn_bar.set_message(format!(
            "Turn {} {}",
            self.turn_label(),
            style("(running agent)").dim()
        ));
        self.turn_bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Short status for the spinner; echoed as a dim line in verbose mode.
    pub fn step(&self, msg: &str) {
        self.turn_bar.set_message(format!(
            "Turn {} {}",
            self.turn_label(),
            style(format!("({})", msg)).dim()
        ));
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(msg).dim()));
        }
    }

    pub fn turn_finished(&self, duration: Duration, criteria: &str) {
        self.turn_bar.disable_steady_tick();
        self.print_line(format!(
            "  {} Turn {} finished in {:.0}s ({})",
            PROGRESS,
            self.turn_label(),
            duration.as_secs_f64(),
            criteria
        ));
    }

    pub fn task_done(&self, task_id: &str, title: &str) {
        self.task_bar.inc(1);
        self.print_line(format!(
            "  {} {} {}",
            CHECK,
            style(task_id).green().bold(),
            title
        ));
    }

    pub fn blocked(&self, task_id: &str, reason: &str) {
        self.print_line(format!(
            "  {} {} blocked: {}",
            BLOCKER,
            style(task_id).yellow().bold(),
            reason
        ));
    }

    pub fn verifying(&self) {
        self.step("running regression suite");
    }

    pub fn regression(&self, passed: bool, test: Option<&str>) {
        if passed {
            self.print_line(format!("  {} Regression suite {}", REGRESSION, style("passing").green()));
        } else {
            self.print_line(format!(
                "  {} Regression {}: {}",
                REGRESSION,
                style("failing").red().bold(),
                test.unwrap_or("unknown check")
            ));
        }
    }

    pub fn checkpoint(&self, checkpoint: &Checkpoint) {
        self.print_line(format!(
            "  {} {} {}",
            CHECKPOINT,
            style(format!("Checkpoint ({})", checkpoint.kind)).magenta().bold(),
            checkpoint.reasons.join("; ")
        ));
    }

    pub fn warn(&self, msg: &str) {
        self.print_line(format!("  {} {}", WARNING, style(msg).yellow()));
    }

    pub fn error(&self, msg: &str) {
        self.print_line(format!("  {} {}", CROSS, style(msg).red()));
    }

    /// Stop both bars and print the closing line.
    pub fn finish(&self, summary: &str) {
        self.turn_bar.finish_and_clear();
        self.task_bar.finish_and_clear();
        println!("{} {}", SPARKLE, style(summary).bold());
    }
}
