//! Integration Test: Clock Discipline
//!
//! Every timeout, backoff and window in the delivery core reads time through
//! `Clock`, so tests can pause or drive it. Production code outside
//! `clock.rs` must not read the monotonic clock or sleep directly.

use architectural_enforcement::{code_part, production_sources, workspace_path};

const FORBIDDEN: &[(&str, &str)] = &[
    ("Instant::now(", "monotonic clock read"),
    ("thread::sleep(", "blocking sleep"),
    ("tokio::time::sleep(", "runtime sleep"),
    ("time::sleep(", "runtime sleep"),
    ("sleep_until(", "runtime sleep"),
];

fn find_clock_violations() -> (usize, Vec<String>) {
    let files = production_sources(&workspace_path("courier/core/src"));
    let scanned = files.len();
    let mut violations = Vec::new();

    for file in files {
        if file.path.file_name().and_then(|n| n.to_str()) == Some("clock.rs") {
            continue;
        }
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if let Some((_, what)) = FORBIDDEN.iter().find(|(needle, _)| code.contains(needle)) {
                violations.push(format!(
                    "{}:{} - {}: {}",
                    file.path.display(),
                    idx + 1,
                    what,
                    line.trim()
                ));
            }
        }
    }

    (scanned, violations)
}

#[test]
fn test_time_only_through_clock() {
    let (scanned, violations) = find_clock_violations();
    assert!(scanned > 0, "no source files found under courier/core/src");

    if !violations.is_empty() {
        eprintln!("\nDirect time access found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse the injected Clock (now / sleep) instead.");

        panic!(
            "\nFound {} clock violation(s) in production code.",
            violations.len()
        );
    }
}
