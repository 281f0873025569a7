pub mod clean;
pub mod completions;
pub mod install;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use pollapo_core::{CoreError, ResolutionEventKind};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_AUTH_ERROR: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn event_label(kind: ResolutionEventKind) -> String {
    match kind {
        ResolutionEventKind::CacheHit => Style::new().dim().apply_to("cached").to_string(),
        ResolutionEventKind::LockedHashReused => {
            Style::new().blue().apply_to("locked").to_string()
        }
        ResolutionEventKind::HashCheckedAndUpdated => {
            Style::new().yellow().apply_to("checked").to_string()
        }
        ResolutionEventKind::Downloaded => {
            Style::new().green().apply_to("downloaded").to_string()
        }
    }
}

/// Render an engine error with the prefix `exit_code_for` keys on.
pub fn describe(err: &CoreError) -> String {
    let msg = err.to_string();
    if err.is_manifest_error() && !msg.starts_with("manifest error:") {
        format!("manifest error: {msg}")
    } else if err.is_store_error() && !msg.starts_with("store error:") {
        format!("store error: {msg}")
    } else {
        msg
    }
}

pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("manifest error:")
        || msg.starts_with("failed to parse manifest")
        || msg.starts_with("failed to read manifest")
    {
        EXIT_MANIFEST_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("cache lock:") {
        EXIT_STORE_ERROR
    } else if msg.starts_with("authentication failed") {
        EXIT_AUTH_ERROR
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollapo_schema::ManifestError;
    use pollapo_store::StoreError;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn event_labels_keep_their_text() {
        assert!(event_label(ResolutionEventKind::CacheHit).contains("cached"));
        assert!(event_label(ResolutionEventKind::LockedHashReused).contains("locked"));
        assert!(event_label(ResolutionEventKind::HashCheckedAndUpdated).contains("checked"));
        assert!(event_label(ResolutionEventKind::Downloaded).contains("downloaded"));
    }

    #[test]
    fn manifest_errors_exit_with_manifest_code() {
        let err = CoreError::Manifest(ManifestError::InvalidDependency {
            input: "nope".to_owned(),
            reason: "missing '@'".to_owned(),
        });
        assert_eq!(exit_code_for(&describe(&err)), EXIT_MANIFEST_ERROR);

        let nested = CoreError::ManifestParse {
            dep: "a/b@v1".parse().unwrap(),
            source: ManifestError::InvalidDependency {
                input: "x".to_owned(),
                reason: "bad".to_owned(),
            },
        };
        assert_eq!(exit_code_for(&describe(&nested)), EXIT_MANIFEST_ERROR);
    }

    #[test]
    fn store_errors_exit_with_store_code() {
        let err = CoreError::CacheWrite {
            dep: "a/b@v1".parse().unwrap(),
            source: StoreError::InvalidPath("x".to_owned()),
        };
        assert_eq!(exit_code_for(&describe(&err)), EXIT_STORE_ERROR);
    }

    #[test]
    fn auth_errors_exit_with_auth_code() {
        let err = CoreError::AuthenticationFailed("Bad credentials".to_owned());
        assert_eq!(exit_code_for(&describe(&err)), EXIT_AUTH_ERROR);
    }

    #[test]
    fn other_errors_are_generic_failures() {
        assert_eq!(exit_code_for(&describe(&CoreError::Cancelled)), EXIT_FAILURE);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_MANIFEST_ERROR,
            EXIT_STORE_ERROR,
            EXIT_AUTH_ERROR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn spinner_fail_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
