//! Integration Test: Sleep Prohibition
//!
//! Production code waits on events, acks and timeouts, never on the clock.
//! The exceptions are retry backoff and the teardown grace timer.

use architectural_enforcement::production_files;

/// Functions allowed to sleep: reconnect backoff and teardown grace
const ALLOWED_SLEEPERS: &[&str] = &["recover", "schedule_teardown"];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_files() {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);

            if code.contains("thread::sleep(") {
                violations.push(file.violation(idx, "Thread sleep"));
                continue;
            }

            if code.contains("::sleep(") || code.contains(".sleep(") {
                let allowed = file
                    .enclosing_fn_name(idx)
                    .is_some_and(|name| ALLOWED_SLEEPERS.contains(&name));
                if !allowed {
                    violations.push(file.violation(idx, "Sleep outside backoff"));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait on a channel, an ack or tokio::time::timeout instead");
        panic!("Found {} sleep violation(s)", violations.len());
    }
}
