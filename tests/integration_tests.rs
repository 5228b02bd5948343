//! Integration tests for the tether CLI
//!
//! These drive the binary against temporary project directories. `tether start`
//! needs a coding agent and is covered by the driver tests in the library.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const REQUIREMENTS: &str = r#"# Shop

## Product catalog page
Category: functional
Priority: 1

Lists every product with price and stock.

### Acceptance Criteria
- [ ] Catalog lists every product with its price
- [ ] Out-of-stock products show a sold out badge

## Shopping cart drawer
Priority: 2
Depends on: Product catalog page

### Acceptance Criteria
- Adding a product increments the cart badge

## Checkout confirmation email
Category: infrastructure

### Acceptance Criteria
1. Order confirmation email is sent within one minute
"#;

/// Helper to create a tether Command
fn tether() -> Command {
    cargo_bin_cmd!("tether")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write the requirements document and run `tether init --spec` on it
fn init_tether_project(dir: &TempDir) {
    fs::write(dir.path().join("requirements.md"), REQUIREMENTS).unwrap();
    tether()
        .current_dir(dir.path())
        .args(["init", "--spec", "requirements.md"])
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_tether_help() {
        tether()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("decide"));
    }

    #[test]
    fn test_tether_version() {
        tether().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        tether().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        fs::write(dir.path().join("requirements.md"), REQUIREMENTS).unwrap();

        tether()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .arg("--spec")
            .arg(dir.path().join("requirements.md"))
            .assert()
            .success();

        assert!(dir.path().join(".tether/project_state.json").exists());
    }
}

// =============================================================================
// Init
// =============================================================================

mod init {
    use super::*;

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();
        fs::write(dir.path().join("requirements.md"), REQUIREMENTS).unwrap();

        tether()
            .current_dir(dir.path())
            .args(["init", "--spec", "requirements.md"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized tether project with 3 task(s)"))
            .stdout(predicate::str::contains("Product catalog page"));

        assert!(dir.path().join(".tether").is_dir());
        assert!(dir.path().join(".tether/tether.toml").exists());
        assert!(dir.path().join(".tether/project_state.json").exists());
        assert!(dir.path().join(".tether/logs").is_dir());
        assert!(dir.path().join(".tether/state").is_dir());
    }

    #[test]
    fn test_init_twice_does_not_reimport() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["init", "--spec", "requirements.md"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Project already initialized"));

        tether()
            .current_dir(dir.path())
            .arg("tasks")
            .assert()
            .success()
            .stdout(predicate::str::contains("3 task(s)"));
    }

    #[test]
    fn test_init_missing_spec_fails() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .args(["init", "--spec", "nope.md"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read requirements document"));

        assert!(!dir.path().join(".tether/project_state.json").exists());
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".tether")).unwrap();
        fs::write(
            dir.path().join(".tether/tether.toml"),
            "[session]\nregression_command = \"make check\"\n",
        )
        .unwrap();

        init_tether_project(&dir);

        let content = fs::read_to_string(dir.path().join(".tether/tether.toml")).unwrap();
        assert!(content.contains("make check"));
    }
}

// =============================================================================
// Status / Tasks / Logs
// =============================================================================

mod views {
    use super::*;

    #[test]
    fn test_status_uninitialized() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Not initialized"));
    }

    #[test]
    fn test_status_initialized() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Provider: file"))
            .stdout(predicate::str::contains("Regression:"))
            .stdout(predicate::str::contains("Not initialized").not());
    }

    #[test]
    fn test_tasks_lists_imported_features() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .arg("tasks")
            .assert()
            .success()
            .stdout(predicate::str::contains("Product catalog page"))
            .stdout(predicate::str::contains("Shopping cart drawer"))
            .stdout(predicate::str::contains("Checkout confirmation email"));
    }

    #[test]
    fn test_tasks_category_filter() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["tasks", "--category", "infrastructure"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Checkout confirmation email"))
            .stdout(predicate::str::contains("Product catalog page").not())
            .stdout(predicate::str::contains("1 task(s)"));
    }

    #[test]
    fn test_tasks_status_filter_no_match() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["tasks", "--status", "done"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks match."));
    }

    #[test]
    fn test_tasks_invalid_status_fails() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["tasks", "--status", "finished"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid status"));
    }

    #[test]
    fn test_tasks_requires_init() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .arg("tasks")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Project not initialized"));
    }

    #[test]
    fn test_logs_without_files() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .arg("logs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No log files"));
    }

    #[test]
    fn test_logs_sessions_empty() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["logs", "--sessions"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sessions recorded yet."));
    }
}

// =============================================================================
// Stop / Decide
// =============================================================================

mod control {
    use super::*;

    #[test]
    fn test_stop_requires_init() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .arg("stop")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Project not initialized"));
    }

    #[test]
    fn test_stop_writes_stop_file() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .arg("stop")
            .assert()
            .success()
            .stdout(predicate::str::contains("Stop requested"));

        assert!(dir.path().join(".tether/stop").exists());
    }

    #[test]
    fn test_decide_without_waiting_checkpoint_fails() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["decide", "continue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No checkpoint is waiting"));

        assert!(!dir.path().join(".tether/decision.json").exists());
    }

    #[test]
    fn test_decide_redirect_needs_note() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["decide", "redirect"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--note"));
    }

    #[test]
    fn test_decide_unknown_resolution_fails() {
        let dir = create_temp_project();
        init_tether_project(&dir);

        tether()
            .current_dir(dir.path())
            .args(["decide", "maybe"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration."))
            .stdout(predicate::str::contains("[state_provider]"))
            .stdout(predicate::str::contains("mode = \"interactive\""));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created tether.toml"));

        assert!(dir.path().join(".tether/tether.toml").exists());

        tether()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_shows_toml_content() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".tether")).unwrap();
        fs::write(
            dir.path().join(".tether/tether.toml"),
            r#"
[session]
regression_command = "make check"

[execution]
mode = "supervised"
"#,
        )
        .unwrap();

        tether()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("make check"))
            .stdout(predicate::str::contains("mode = \"supervised\""));
    }

    #[test]
    fn test_config_validate_default() {
        let dir = create_temp_project();

        tether()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Validating configuration"));
    }

    #[test]
    fn test_config_invalid_toml_fails() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".tether")).unwrap();
        fs::write(
            dir.path().join(".tether/tether.toml"),
            "[execution]\nmode = \"reckless\"\n",
        )
        .unwrap();

        tether()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }
}
