//! Integration Test: Blocking I/O Prohibition
//!
//! Async functions must not block the runtime. Synchronous helpers, such as
//! config loading before the runtime starts, may use `std::fs`.

use architectural_enforcement::production_files;

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::io::stdin()", "Blocking stdin"),
    ("thread::sleep(", "Blocking sleep"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_files() {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);
            for (pattern, what) in BLOCKING_CALLS {
                if code.contains(pattern) && file.in_async_fn(idx) {
                    violations.push(file.violation(idx, what));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use tokio::fs, tokio::net, tokio::io or move the call out of async code");
        panic!("Found {} blocking I/O violation(s)", violations.len());
    }
}

#[test]
fn test_no_blocking_http_client_anywhere() {
    let offenders: Vec<String> = production_files()
        .iter()
        .flat_map(|file| {
            (0..file.lines.len())
                .filter(|&idx| file.code(idx).contains("reqwest::blocking"))
                .map(|idx| file.violation(idx, "Blocking HTTP client"))
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(offenders.is_empty(), "{offenders:#?}");
}
