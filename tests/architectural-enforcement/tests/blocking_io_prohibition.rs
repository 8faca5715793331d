//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in the core and the daemon must not use
//! blocking file, network or process I/O. Non-async helpers (config loading,
//! socket file housekeeping before a listener binds) are allowed.

use architectural_enforcement::{
    code_part, is_in_async_function, production_sources, workspace_path,
};

const FORBIDDEN: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::os::unix::net::", "Blocking socket I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
];

fn find_blocking_io_violations() -> (usize, Vec<String>) {
    let mut scanned = 0;
    let mut violations = Vec::new();

    for dir in ["courier/core/src", "courier/daemon/src"] {
        let files = production_sources(&workspace_path(dir));
        scanned += files.len();

        for file in files {
            for (idx, line) in file.lines.iter().enumerate() {
                let code = code_part(line);
                let Some((_, what)) = FORBIDDEN.iter().find(|(needle, _)| code.contains(needle))
                else {
                    continue;
                };
                if is_in_async_function(&file.lines, idx) {
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
    }

    (scanned, violations)
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let (scanned, violations) = find_blocking_io_violations();
    assert!(scanned > 0, "no source files found");

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O inside async functions:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs / tokio::net, or move the call before the runtime work.");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}
